//! Command handlers.
//!
//! Each command kind has one async handler function taking a [`CommandRun`]
//! and its payload, and returning the command-specific [`DonePayload`].
//! [`execute`] is the dispatch table from [`Command`] to handler.
//!
//! Handlers own their cleanup: lamp handles are released and the autoguider
//! is stopped on every exit path before the error is returned. Abort is
//! observed through [`CommandRun::checkpoint`] and surfaces as
//! [`CommandError::Aborted`], travelling the same path as any other failure.

mod abort;
mod config;
mod day_calibrate;
mod expose;
mod lampflat;
mod lampfocus;
mod multrun;
mod single;
mod status;

pub use config::compute_geometry;

use crate::arm::Arm;
use crate::cancel::AbortToken;
use crate::command::{AckSender, Command, CommandDone, CommandKind, DonePayload};
use crate::config::ArmConfig;
use crate::context::ServerContext;
use crate::error::{CommandError, HandlerResult};
use crate::frames::FrameNamer;
use crate::hardware::{CcdController, FocusStage};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// One command invocation's view of the server.
pub struct CommandRun {
    /// Shared context.
    pub ctx: Arc<ServerContext>,
    /// Command kind.
    pub kind: CommandKind,
    /// Target arm.
    pub arm: Arm,
    /// Cancellation token.
    pub abort: AbortToken,
    /// Acknowledgement channel.
    pub acks: AckSender,
    /// When the dispatcher received the command.
    pub received_at: DateTime<Utc>,
}

impl CommandRun {
    /// Abort checkpoint.
    pub fn checkpoint(&self) -> HandlerResult<()> {
        self.abort.check()
    }

    /// Tell the client how much longer the command expects to take.
    pub fn ack(&self, remaining: Duration) {
        self.acks.send(remaining);
    }

    /// Offset of this command's "illegal arm" error.
    fn illegal_arm_offset(&self) -> i32 {
        self.kind.code_range_start() + 1
    }

    /// Reject commands that do not name RED or BLUE.
    pub fn require_arm(&self) -> HandlerResult<()> {
        if self.arm.is_physical() {
            Ok(())
        } else {
            Err(CommandError::validation(
                self.illegal_arm_offset(),
                format!("{} needs a RED or BLUE arm, got {}", self.kind, self.arm),
            ))
        }
    }

    fn missing(&self, what: &str) -> CommandError {
        CommandError::Internal(format!("no {what} for arm {}", self.arm))
    }

    /// Configuration section of the target arm.
    pub fn arm_config(&self) -> HandlerResult<&ArmConfig> {
        self.ctx.config.arm(self.arm).ok_or_else(|| self.missing("configuration"))
    }

    /// CCD controller of the target arm.
    pub fn ccd(&self) -> HandlerResult<&Arc<dyn CcdController>> {
        self.ctx.hardware.ccd(self.arm).ok_or_else(|| self.missing("CCD"))
    }

    /// Focus stage of the target arm.
    pub fn focus_stage(&self) -> HandlerResult<&Arc<dyn FocusStage>> {
        self.ctx.hardware.focus(self.arm).ok_or_else(|| self.missing("focus stage"))
    }

    /// Frame namer of the target arm.
    pub fn frames(&self) -> HandlerResult<&FrameNamer> {
        self.ctx.frames(self.arm).ok_or_else(|| self.missing("frame namer"))
    }
}

async fn dispatch(run: &CommandRun, command: Command) -> HandlerResult<DonePayload> {
    match command {
        Command::Config(c) => config::handle(run, c).await,
        Command::Multrun(c) => multrun::handle(run, c).await,
        Command::Bias(c) => single::bias(run, c).await,
        Command::Dark(c) => single::dark(run, c).await,
        Command::Arc(c) => single::arc(run, c).await,
        Command::LampFlat(c) => lampflat::handle(run, c).await,
        Command::LampFocus(c) => lampfocus::handle(run, c).await,
        Command::DayCalibrate(c) => day_calibrate::handle(run, c).await,
        Command::GetStatus(c) => status::handle(run, c).await,
        Command::Abort(c) => abort::handle(run, c).await,
    }
}

/// Run `command`'s handler and fold the outcome into its final response.
pub async fn execute(run: CommandRun, command: Command) -> CommandDone {
    let kind = command.kind();
    match dispatch(&run, command).await {
        Ok(payload) => CommandDone::success(kind, payload),
        Err(err) => CommandDone::failure(kind, &err),
    }
}
