//! Line protocol over a real TCP socket.

mod common;

use common::harness;
use dualspec::command::{CommandDone, CommandKind, DonePayload};
use dualspec::error::ERROR_CODE_BASE;
use dualspec::server::{self, Reply};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("Failed to write");
        self.writer.write_all(b"\n").await.expect("Failed to write");
    }

    async fn reply(&mut self) -> Reply {
        let line = self
            .lines
            .next_line()
            .await
            .expect("Failed to read")
            .expect("Server closed the connection");
        serde_json::from_str(&line).expect("Reply is not JSON")
    }

    /// Read acknowledgements until the final response.
    async fn done(&mut self) -> (usize, Reply) {
        let mut acks = 0;
        loop {
            match self.reply().await {
                Reply::Ack(_) => acks += 1,
                other => return (acks, other),
            }
        }
    }
}

fn expect_done(reply: Reply) -> CommandDone {
    match reply {
        Reply::Done(done) => done,
        other => panic!("expected a done line, got {other:?}"),
    }
}

#[tokio::test]
async fn test_commands_over_tcp() {
    let h = harness();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().expect("No local address");
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(server::serve(listener, h.dispatcher.clone(), async move {
        let _ = stop_rx.await;
    }));

    let mut client = Client::connect(addr).await;

    client.send(r#"{"command":"GET_STATUS"}"#).await;
    let (_, reply) = client.done().await;
    let done = expect_done(reply);
    assert!(done.successful);
    assert_eq!(done.command, CommandKind::GetStatus);
    assert!(matches!(done.payload, DonePayload::Status(ref s) if s.arms.len() == 2));

    client.send("not json at all").await;
    match client.reply().await {
        Reply::Rejected { error_code, .. } => assert_eq!(error_code, ERROR_CODE_BASE + 3),
        other => panic!("expected a rejection, got {other:?}"),
    }

    // The connection survives a bad line.
    client
        .send(r#"{"command":"CONFIG","arm":"BLUE","config":{"id":"tcp","resolution":"high","detector":{"x_bin":2,"y_bin":2}}}"#)
        .await;
    let (acks, reply) = client.done().await;
    let done = expect_done(reply);
    assert!(done.successful, "{done:?}");
    assert!(acks >= 1);
    assert_eq!(h.ctx().arms.snapshot(dualspec::arm::Arm::Blue).config_name, "tcp");

    stop_tx.send(()).expect("Server already stopped");
    server.await.expect("Server task panicked").expect("Server failed");
}

#[tokio::test]
async fn test_abort_from_second_connection() {
    let h = harness();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().expect("No local address");
    tokio::spawn(server::serve(listener, h.dispatcher.clone(), std::future::pending()));

    let mut observer = Client::connect(addr).await;
    let mut controller = Client::connect(addr).await;

    observer
        .send(r#"{"command":"DARK","arm":"RED","exposure_length_ms":3600000}"#)
        .await;
    // The first ack means the command owns the arm.
    assert!(matches!(observer.reply().await, Reply::Ack(_)));
    // Let the exposure start so the CCD abort has something to interrupt.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    controller.send(r#"{"command":"ABORT","arm":"RED"}"#).await;
    let (_, reply) = controller.done().await;
    assert!(matches!(reply, Reply::Done(ref d) if d.successful), "{reply:?}");

    let (_, reply) = observer.done().await;
    let done = expect_done(reply);
    assert!(!done.successful);
    assert_eq!(done.error_code, ERROR_CODE_BASE + CommandKind::Dark.aborted_offset());
}
