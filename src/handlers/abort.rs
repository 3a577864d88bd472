//! ABORT: signal the command running on one arm, or on both.

use super::CommandRun;
use crate::arm::Arm;
use crate::command::{AbortCommand, DonePayload};
use crate::error::HandlerResult;
use tracing::{info, warn};

const ABORT_REASON: &str = "ABORT command";

pub(super) async fn handle(run: &CommandRun, command: AbortCommand) -> HandlerResult<DonePayload> {
    let targets: Vec<Arm> = match command.arm {
        Some(arm) if arm.is_physical() => vec![arm],
        _ => Arm::PHYSICAL.to_vec(),
    };

    let mut aborted = Vec::new();
    for arm in targets {
        let Some(running) = run.ctx.arms.abort(arm, ABORT_REASON) else {
            continue;
        };
        info!(%arm, command = %running, "Abort signalled");
        aborted.push(arm);
        // Wake a handler blocked in a long exposure.
        if let Some(ccd) = run.ctx.hardware.ccd(arm) {
            if let Err(err) = ccd.abort().await {
                warn!(%arm, error = %format!("{err:#}"), "CCD abort failed");
            }
        }
    }
    Ok(DonePayload::Aborted { arms: aborted })
}
