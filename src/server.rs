//! Newline-delimited JSON front end.
//!
//! Each accepted connection gets its own task. Every line a client sends is
//! one [`Command`]; the server answers with zero or more `ack` lines followed
//! by exactly one `done` line, then reads the next command. Commands on one
//! connection run one at a time, so an ABORT for a running command has to
//! arrive on another connection.
//!
//! ```text
//! > {"command":"BIAS","arm":"RED"}
//! < {"type":"ack","command":"BIAS","time_to_complete_ms":15000}
//! < {"type":"done","command":"BIAS","error_code":0,...}
//! ```

use crate::command::{AckSender, Acknowledgement, Command, CommandDone};
use crate::dispatcher::CommandDispatcher;
use crate::error::{ERROR_CODE_BASE, PARSE_OFFSET};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One line sent to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// Intermediate acknowledgement.
    Ack(Acknowledgement),
    /// Final response.
    Done(CommandDone),
    /// The line was not a command.
    Rejected {
        /// Error code.
        error_code: i32,
        /// Parse error.
        error_message: String,
    },
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &Reply) -> io::Result<()> {
    let mut line = serde_json::to_string(reply).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn handle_connection(stream: TcpStream, dispatcher: CommandDispatcher) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command: Command = match serde_json::from_str(&line) {
            Ok(command) => command,
            Err(e) => {
                debug!(error = %e, "Unparseable command line");
                let reply = Reply::Rejected {
                    error_code: ERROR_CODE_BASE + PARSE_OFFSET,
                    error_message: format!("unparseable command: {e}"),
                };
                write_reply(&mut writer, &reply).await?;
                continue;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let acks = AckSender::new(command.kind(), tx);
        let submit = dispatcher.submit(command, acks);
        tokio::pin!(submit);
        let done = loop {
            tokio::select! {
                done = &mut submit => break done,
                Some(ack) = rx.recv() => write_reply(&mut writer, &Reply::Ack(ack)).await?,
            }
        };
        while let Ok(ack) = rx.try_recv() {
            write_reply(&mut writer, &Reply::Ack(ack)).await?;
        }
        write_reply(&mut writer, &Reply::Done(done)).await?;
    }
    Ok(())
}

/// Accept connections on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, dispatcher: CommandDispatcher, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()>,
{
    info!(address = %listener.local_addr()?, "Accepting commands");
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down command server");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Client connected");
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, dispatcher).await {
                            warn!(%peer, error = %e, "Connection closed with error");
                        }
                        debug!(%peer, "Client disconnected");
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }
}
