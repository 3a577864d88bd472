//! Single-frame commands: BIAS, DARK and ARC.

use super::expose::{self, begin_multrun, take_bias, take_frame};
use super::CommandRun;
use crate::command::{ArcCommand, BiasCommand, DarkCommand, DonePayload};
use crate::error::{CommandError, HandlerResult};
use crate::frames::ExposureCode;
use crate::hardware::{LampSet, ShutterMode};
use std::time::Duration;
use tracing::info;

const DARK_ILLEGAL_EXPOSURE: i32 = 1402;
const DARK_EXPOSURE_TOO_LONG: i32 = 1403;
const ARC_BAD_LAMP: i32 = 1502;
const ARC_ILLEGAL_EXPOSURE: i32 = 1503;
const ARC_EXPOSURE_TOO_LONG: i32 = 1504;

pub(super) async fn bias(run: &CommandRun, _command: BiasCommand) -> HandlerResult<DonePayload> {
    run.require_arm()?;
    let timing = &run.ctx.config.timing;
    run.ack(timing.frame_cost(Duration::ZERO) + timing.reduction);

    begin_multrun(run, ExposureCode::Bias)?;
    let no_lamp = run.ctx.lamps.acquire_no_lamp(run.arm, &run.abort).await?;
    let frame = take_bias(run).await;
    no_lamp.release().await;
    let frame = frame?;

    info!(arm = %run.arm, filename = %frame.display(), "Bias taken");
    let frames = vec![frame];
    let report = expose::reduce_frames(run, frames.clone(), &frames).await?;
    Ok(DonePayload::Frames(report))
}

pub(super) async fn dark(run: &CommandRun, command: DarkCommand) -> HandlerResult<DonePayload> {
    run.require_arm()?;
    if command.exposure_length_ms == 0 {
        return Err(CommandError::validation(DARK_ILLEGAL_EXPOSURE, "DARK exposure must be positive"));
    }
    let exposure = expose::checked_exposure(run, command.exposure_length_ms, DARK_EXPOSURE_TOO_LONG)?;
    let timing = &run.ctx.config.timing;
    run.ack(timing.frame_cost(exposure) + timing.reduction);

    begin_multrun(run, ExposureCode::Dark)?;
    let no_lamp = run.ctx.lamps.acquire_no_lamp(run.arm, &run.abort).await?;
    let frame = take_frame(run, ShutterMode::Closed, exposure, "DARK").await;
    no_lamp.release().await;
    let frame = frame?;

    info!(arm = %run.arm, filename = %frame.display(), "Dark taken");
    let frames = vec![frame];
    let report = expose::reduce_frames(run, frames.clone(), &frames).await?;
    Ok(DonePayload::Frames(report))
}

pub(super) async fn arc(run: &CommandRun, command: ArcCommand) -> HandlerResult<DonePayload> {
    run.require_arm()?;
    let lamps = LampSet::parse(&command.lamp)
        .ok_or_else(|| CommandError::validation(ARC_BAD_LAMP, format!("bad lamp '{}'", command.lamp)))?;
    if command.exposure_length_ms == 0 {
        return Err(CommandError::validation(ARC_ILLEGAL_EXPOSURE, "ARC exposure must be positive"));
    }
    let exposure = expose::checked_exposure(run, command.exposure_length_ms, ARC_EXPOSURE_TOO_LONG)?;
    let timing = &run.ctx.config.timing;
    run.ack(timing.frame_cost(exposure) + timing.reduction);

    begin_multrun(run, ExposureCode::Arc)?;
    let lamp = run.ctx.lamps.acquire_lamp(run.arm, lamps, &run.abort).await?;
    let frame = take_frame(run, ShutterMode::Open, exposure, "ARC").await;
    lamp.release().await;
    let frame = frame?;

    info!(arm = %run.arm, filename = %frame.display(), lamp = %command.lamp, "Arc taken");
    let frames = vec![frame];
    let report = expose::reduce_frames(run, frames.clone(), &frames).await?;
    Ok(DonePayload::Frames(report))
}
