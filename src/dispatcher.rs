//! Command dispatch.
//!
//! [`CommandDispatcher::submit`] is the single entry point for commands. It
//! occupies the target arm (unless the command is interrupt-class), runs the
//! handler on its own task, and turns whatever comes back (a result, an
//! error, or a panic) into a [`CommandDone`].
//!
//! The arm claim moves into the handler task. The arm therefore stays busy
//! until the handler has actually finished, even if the caller of `submit`
//! stops waiting (e.g. the client disconnects).

use crate::cancel::AbortToken;
use crate::command::{AckSender, Command, CommandDone};
use crate::context::ServerContext;
use crate::error::{CommandError, ERROR_CODE_BASE};
use crate::handlers::{self, CommandRun};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Routes commands to handlers and owns arm occupancy.
#[derive(Clone)]
pub struct CommandDispatcher {
    ctx: Arc<ServerContext>,
}

impl CommandDispatcher {
    /// Create a dispatcher over `ctx`.
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Whether `command` could start right now.
    pub fn command_can_be_run(&self, command: &Command) -> bool {
        self.ctx.arms.command_can_be_run(command)
    }

    /// Run `command` to completion. Acknowledgements go to `acks`.
    pub async fn submit(&self, command: Command, acks: AckSender) -> CommandDone {
        let kind = command.kind();
        let arm = command.arm();
        let received_at = Utc::now();

        let (claim, abort) = if kind.is_interrupt() {
            (None, AbortToken::new())
        } else {
            match self.ctx.arms.claim(&command) {
                Ok(claim) => {
                    let abort = claim.abort_token().clone();
                    (Some(claim), abort)
                }
                Err(err) => {
                    warn!(%arm, command = %kind, error = %err, "Command rejected");
                    return CommandDone::failure(kind, &err);
                }
            }
        };
        let ticket = claim.as_ref().map(|c| c.id());
        info!(%arm, command = %kind, ?ticket, "Command started");

        let run = CommandRun {
            ctx: Arc::clone(&self.ctx),
            kind,
            arm,
            abort,
            acks,
            received_at,
        };
        let task = tokio::spawn(async move {
            let _claim = claim;
            handlers::execute(run, command).await
        });

        let done = match task.await {
            Ok(done) => done,
            Err(join_error) => {
                let reason = if join_error.is_panic() {
                    "handler panicked"
                } else {
                    "handler task was cancelled"
                };
                error!(%arm, command = %kind, ?ticket, "{reason}");
                CommandDone::failure(kind, &CommandError::Internal(reason.to_string()))
            }
        };

        let elapsed_ms = (Utc::now() - received_at).num_milliseconds();
        if done.successful {
            info!(%arm, command = %kind, ?ticket, elapsed_ms, "Command completed");
        } else if done.error_code == ERROR_CODE_BASE + kind.aborted_offset() {
            warn!(%arm, command = %kind, ?ticket, elapsed_ms, message = %done.error_message, "Command aborted");
        } else {
            error!(
                %arm,
                command = %kind,
                ?ticket,
                elapsed_ms,
                error_code = done.error_code,
                message = %done.error_message,
                "Command failed"
            );
        }
        done
    }
}
