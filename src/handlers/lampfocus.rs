//! LAMPFOCUS: fixed-step focus scan under a lamp.
//!
//! The focus stage steps through `start..=end` taking one lamp exposure per
//! position. A second pass reduces every frame; the position with the
//! smallest measured seeing is reported as best. The stage is returned to
//! its nominal setpoint whether or not the scan succeeded.

use super::expose::{self, begin_multrun, take_frame};
use super::CommandRun;
use crate::command::{DonePayload, FocusPoint, FocusReport, LampFocusCommand};
use crate::error::{CommandError, HandlerResult};
use crate::frames::ExposureCode;
use crate::hardware::{LampSet, ShutterMode};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

const ILLEGAL_RANGE: i32 = 2402;
const BAD_LAMP: i32 = 2403;
const ILLEGAL_EXPOSURE: i32 = 2404;
const FOCUS_MOVE_FAILED: i32 = 2405;
const FOCUS_RESTORE_FAILED: i32 = 2406;
const NOT_CONFIGURED: i32 = 2407;
const EXPOSURE_TOO_LONG: i32 = 2408;

const MAX_POSITIONS: usize = 100;

/// Positions `start, start + step, ...` up to and including `end`.
fn scan_positions(start: f64, end: f64, step: f64) -> HandlerResult<Vec<f64>> {
    if !(step > 0.0) || !start.is_finite() || !end.is_finite() || end < start {
        return Err(CommandError::validation(
            ILLEGAL_RANGE,
            format!("illegal focus range {start}..{end} step {step}"),
        ));
    }
    let steps = ((end - start) / step + 1e-9).floor();
    if steps >= MAX_POSITIONS as f64 {
        return Err(CommandError::validation(
            ILLEGAL_RANGE,
            format!("focus range {start}..{end} step {step} exceeds {MAX_POSITIONS} positions"),
        ));
    }
    Ok((0..=steps as usize).map(|n| start + step * n as f64).collect())
}

async fn scan(
    run: &CommandRun,
    positions: &[f64],
    lamps: LampSet,
    exposure: Duration,
    point_cost: Duration,
    reduction: Duration,
) -> HandlerResult<Vec<(f64, PathBuf)>> {
    let stage = run.focus_stage()?;
    begin_multrun(run, ExposureCode::Focus)?;
    let lamp = run.ctx.lamps.acquire_lamp(run.arm, lamps, &run.abort).await?;

    let mut frames = Vec::with_capacity(positions.len());
    let mut outcome = Ok(());
    for (n, &position) in positions.iter().enumerate() {
        if let Err(err) = run.checkpoint() {
            outcome = Err(err);
            break;
        }
        if let Err(err) = stage.move_absolute(position).await {
            outcome = Err(CommandError::hardware(FOCUS_MOVE_FAILED, "focus stage", err));
            break;
        }
        match take_frame(run, ShutterMode::Open, exposure, "LAMPFOCUS").await {
            Ok(frame) => frames.push((position, frame)),
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
        let remaining = positions.len() - n - 1;
        run.ctx.arms.set_exposure_progress(run.arm, (n + 1) as u32, positions.len() as u32);
        run.ack(point_cost.saturating_mul(remaining as u32).saturating_add(reduction));
    }

    lamp.release().await;
    outcome.map(|()| frames)
}

async fn measure(run: &CommandRun, frames: Vec<(f64, PathBuf)>) -> HandlerResult<Vec<FocusPoint>> {
    let mut points = Vec::with_capacity(frames.len());
    for (n, (position, filename)) in frames.iter().enumerate() {
        run.checkpoint()?;
        let reduced = expose::reduce(run, filename).await?;
        points.push(FocusPoint {
            position: *position,
            filename: filename.display().to_string(),
            seeing: reduced.seeing,
        });
        run.ack(run.ctx.config.timing.reduction * (frames.len() - n - 1) as u32);
    }
    Ok(points)
}

pub(super) async fn handle(run: &CommandRun, command: LampFocusCommand) -> HandlerResult<DonePayload> {
    run.require_arm()?;
    let settings = run.arm_config()?;
    let range = &settings.lamp_focus;
    let positions = scan_positions(
        command.start.unwrap_or(range.start),
        command.end.unwrap_or(range.end),
        command.step.unwrap_or(range.step),
    )?;
    let spec = command.lamp.as_deref().unwrap_or(&range.lamp);
    let lamps = LampSet::parse(spec).ok_or_else(|| CommandError::validation(BAD_LAMP, format!("bad lamp '{spec}'")))?;
    if command.exposure_length_ms == 0 {
        return Err(CommandError::validation(ILLEGAL_EXPOSURE, "LAMPFOCUS exposure must be positive"));
    }
    let exposure = expose::checked_exposure(run, command.exposure_length_ms, EXPOSURE_TOO_LONG)?;
    let resolution = run.ctx.arms.configuration(run.arm).resolution.ok_or_else(|| {
        CommandError::validation(NOT_CONFIGURED, "arm has no configured resolution to restore focus to")
    })?;
    let nominal = settings.focus.for_resolution(resolution);

    let timing = &run.ctx.config.timing;
    let point_cost = timing.focus_move.saturating_add(timing.frame_cost(exposure));
    let reduction = timing.reduction * positions.len() as u32;
    run.ack(
        point_cost
            .saturating_mul(positions.len() as u32)
            .saturating_add(reduction)
            .saturating_add(timing.focus_move),
    );
    info!(arm = %run.arm, positions = positions.len(), lamp = %spec, "Focus scan started");

    let points = match scan(run, &positions, lamps, exposure, point_cost, reduction).await {
        Ok(frames) => measure(run, frames).await,
        Err(err) => Err(err),
    };

    let restored = run.focus_stage()?.move_absolute(nominal).await;
    let points = match (points, restored) {
        (Ok(points), Ok(())) => points,
        (Ok(_), Err(err)) => return Err(CommandError::hardware(FOCUS_RESTORE_FAILED, "focus stage", err)),
        (Err(err), Ok(())) => return Err(err),
        (Err(err), Err(restore)) => {
            warn!(arm = %run.arm, error = %format!("{restore:#}"), "Focus restore after failed scan also failed");
            return Err(err);
        }
    };

    let best_position = points
        .iter()
        .filter_map(|p| p.seeing.map(|s| (p.position, s)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(position, _)| position);
    info!(arm = %run.arm, ?best_position, "Focus scan complete");
    Ok(DonePayload::Focus(FocusReport { points, best_position }))
}
