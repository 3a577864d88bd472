//! LAMPFLAT: one flat-field exposure with a lamp lit.

use super::expose;
use super::CommandRun;
use crate::command::{DonePayload, LampFlatCommand};
use crate::error::{CommandError, HandlerResult};
use crate::hardware::LampSet;
use tracing::info;

const BAD_LAMP: i32 = 2302;
const NOT_CONFIGURED: i32 = 2303;
const ILLEGAL_EXPOSURE: i32 = 2304;
const EXPOSURE_TOO_LONG: i32 = 2305;

pub(super) async fn handle(run: &CommandRun, command: LampFlatCommand) -> HandlerResult<DonePayload> {
    run.require_arm()?;
    let defaults = &run.arm_config()?.lamp_flat;
    let spec = command.lamp.as_deref().unwrap_or(&defaults.lamp);
    let lamps = LampSet::parse(spec).ok_or_else(|| CommandError::validation(BAD_LAMP, format!("bad lamp '{spec}'")))?;

    let exposure = match command.exposure_length_ms {
        Some(0) => {
            return Err(CommandError::validation(ILLEGAL_EXPOSURE, "LAMPFLAT exposure must be positive"));
        }
        Some(ms) => expose::checked_exposure(run, ms, EXPOSURE_TOO_LONG)?,
        None => {
            let resolution = run.ctx.arms.configuration(run.arm).resolution.ok_or_else(|| {
                CommandError::validation(NOT_CONFIGURED, "no exposure given and the arm has not been configured")
            })?;
            expose::default_flat_exposure(run, resolution)?
        }
    };
    run.ack(expose::lamp_flat_cost(run, exposure) + run.ctx.config.timing.reduction);

    let frame = expose::lamp_flat(run, lamps, exposure).await?;
    info!(arm = %run.arm, filename = %frame.display(), lamp = %spec, "Lamp flat taken");
    let frames = vec![frame];
    let report = expose::reduce_frames(run, frames.clone(), &frames).await?;
    Ok(DonePayload::Frames(report))
}
