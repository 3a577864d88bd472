//! MULTRUN: a sequence of science exposures.

use super::expose::{self, begin_multrun, take_frame};
use super::CommandRun;
use crate::command::{DonePayload, MultrunCommand};
use crate::error::{CommandError, HandlerResult};
use crate::frames::ExposureCode;
use crate::hardware::{LampSet, ShutterMode};
use crate::state::ArmConfiguration;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const ILLEGAL_COUNT: i32 = 1202;
const NOT_CONFIGURED: i32 = 1203;
const BAD_FLAT_LAMP: i32 = 1204;
const ILLEGAL_EXPOSURE: i32 = 1205;
const TOO_MANY_FRAMES: i32 = 1206;

struct FlatPlan {
    lamps: LampSet,
    exposure: Duration,
}

fn flat_plan(run: &CommandRun, configuration: &ArmConfiguration) -> HandlerResult<Option<FlatPlan>> {
    if !(configuration.calibrate_before || configuration.calibrate_after) {
        return Ok(None);
    }
    let Some(resolution) = configuration.resolution else {
        return Err(CommandError::validation(
            NOT_CONFIGURED,
            "calibrate before/after needs a configured resolution",
        ));
    };
    let defaults = &run.arm_config()?.lamp_flat;
    let lamps = LampSet::parse(&defaults.lamp)
        .ok_or_else(|| CommandError::validation(BAD_FLAT_LAMP, format!("bad lamp '{}'", defaults.lamp)))?;
    Ok(Some(FlatPlan {
        lamps,
        exposure: expose::default_flat_exposure(run, resolution)?,
    }))
}

/// Fold mirror, autoguider and the exposure loop. Runs under the no-lamp
/// assertion; the autoguider is stopped before returning.
async fn science(run: &CommandRun, command: &MultrunCommand, exposure: Duration, tail: Duration) -> HandlerResult<Vec<PathBuf>> {
    let telescope = &run.ctx.config.telescope;
    if telescope.move_fold_on_multrun {
        expose::move_fold(run).await?;
    }
    run.checkpoint()?;

    let guiding = telescope.autoguide_on_multrun && !command.standard;
    if guiding {
        expose::start_autoguider(run).await?;
    }

    let obstype = if command.standard { "STANDARD" } else { "EXPOSE" };
    let frame_cost = run.ctx.config.timing.frame_cost(exposure);
    let mut frames = Vec::with_capacity(command.count as usize);
    let mut outcome = Ok(());
    for n in 1..=command.count {
        match take_frame(run, ShutterMode::Open, exposure, obstype).await {
            Ok(frame) => frames.push(frame),
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
        run.ctx.arms.set_exposure_progress(run.arm, n, command.count);
        run.ack(frame_cost.saturating_mul(command.count - n).saturating_add(tail));
    }

    if guiding {
        expose::stop_autoguider(run).await;
    }
    outcome.map(|()| frames)
}

pub(super) async fn handle(run: &CommandRun, command: MultrunCommand) -> HandlerResult<DonePayload> {
    run.require_arm()?;
    if command.count == 0 {
        return Err(CommandError::validation(ILLEGAL_COUNT, "MULTRUN count must be at least 1"));
    }
    let timing = &run.ctx.config.timing;
    if command.count > timing.max_frames {
        return Err(CommandError::validation(
            TOO_MANY_FRAMES,
            format!("MULTRUN count {} exceeds the limit of {}", command.count, timing.max_frames),
        ));
    }
    let exposure = expose::checked_exposure(run, command.exposure_length_ms, ILLEGAL_EXPOSURE)?;
    let configuration = run.ctx.arms.configuration(run.arm);
    let flat = flat_plan(run, &configuration)?;

    let flat_cost = flat.as_ref().map_or(Duration::ZERO, |f| expose::lamp_flat_cost(run, f.exposure));
    let reduction = timing.reduction.saturating_mul(command.count);
    let after = if configuration.calibrate_after { flat_cost } else { Duration::ZERO };
    let before = if configuration.calibrate_before { flat_cost } else { Duration::ZERO };
    let science_cost = timing.frame_cost(exposure).saturating_mul(command.count);
    run.ack(
        before
            .saturating_add(timing.fold_move)
            .saturating_add(science_cost)
            .saturating_add(after)
            .saturating_add(reduction),
    );

    let mut filenames = Vec::new();
    if let (true, Some(flat)) = (configuration.calibrate_before, &flat) {
        filenames.push(expose::lamp_flat(run, flat.lamps.clone(), flat.exposure).await?);
    }

    run.checkpoint()?;
    let multrun = begin_multrun(run, ExposureCode::Exposure)?;
    info!(arm = %run.arm, multrun, count = command.count, exposure_ms = command.exposure_length_ms, "MULTRUN started");
    let no_lamp = run.ctx.lamps.acquire_no_lamp(run.arm, &run.abort).await?;
    let science = science(run, &command, exposure, after.saturating_add(reduction)).await;
    no_lamp.release().await;
    let science = science?;
    filenames.extend(science.iter().cloned());

    if let (true, Some(flat)) = (configuration.calibrate_after, &flat) {
        run.checkpoint()?;
        filenames.push(expose::lamp_flat(run, flat.lamps.clone(), flat.exposure).await?);
    }

    let report = expose::reduce_frames(run, filenames, &science).await?;
    Ok(DonePayload::Frames(report))
}
