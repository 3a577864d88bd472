//! Building blocks shared by the frame-producing commands.

use super::CommandRun;
use crate::command::{FramesReport, ReductionSummary, Resolution};
use crate::error::{CommandError, HandlerResult};
use crate::frames::ExposureCode;
use crate::hardware::{CcdController, ExposureRequest, FrameMetadata, LampSet, ReducedFrame, ShutterMode};
use crate::locks::SharedResource;
use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const NUMBERING_FAILED: i32 = 1101;
const EXPOSE_FAILED: i32 = 1103;
const BIAS_FAILED: i32 = 1104;
const FOLD_FAILED: i32 = 1105;
const AUTOGUIDER_FAILED: i32 = 1106;
const REDUCTION_FAILED: i32 = 1107;

/// Exposure length from a command's milliseconds, rejecting anything above
/// the configured ceiling with `offset`.
pub(super) fn checked_exposure(run: &CommandRun, exposure_ms: u64, offset: i32) -> HandlerResult<Duration> {
    let exposure = Duration::from_millis(exposure_ms);
    let ceiling = run.ctx.config.timing.max_exposure;
    if exposure > ceiling {
        return Err(CommandError::validation(
            offset,
            format!(
                "{} exposure of {exposure_ms} ms exceeds the {} ms limit",
                run.kind,
                ceiling.as_millis()
            ),
        ));
    }
    Ok(exposure)
}

/// Start a new multrun of `code` frames on the run's arm.
pub(super) fn begin_multrun(run: &CommandRun, code: ExposureCode) -> HandlerResult<i64> {
    run.frames()?
        .begin_multrun(code, Utc::now())
        .map_err(|e| CommandError::persistence(NUMBERING_FAILED, e))
}

async fn metadata(run: &CommandRun, obstype: &str, exposure: Duration) -> HandlerResult<FrameMetadata> {
    let configuration = run.ctx.arms.configuration(run.arm);
    let mut metadata = FrameMetadata::default();
    match run.ctx.hardware.telescope.fits_headers().await {
        Ok(headers) => metadata.keywords.extend(headers),
        Err(err) => warn!(arm = %run.arm, error = %format!("{err:#}"), "Telescope headers unavailable"),
    }
    metadata
        .set("INSTRUME", run.arm.to_string())
        .set("OBSTYPE", obstype)
        .set("EXPTIME", exposure.as_secs_f64())
        .set("CONFNAME", &configuration.name)
        .set("CONFIGID", run.ctx.arms.config_id(run.arm))
        .set("GRATING", configuration.resolution.map_or("UNKNOWN".to_string(), |r| r.to_string()))
        .set("MULTRUN", run.frames()?.multrun())
        .set("DATE-OBS", Utc::now().to_rfc3339());
    Ok(metadata)
}

/// Drive a CCD readout to completion. If the run is aborted while the readout
/// is in flight the controller is told to abort, however early the abort
/// landed, and the readout's own result is returned.
async fn abortable(
    run: &CommandRun,
    ccd: &Arc<dyn CcdController>,
    readout: impl Future<Output = anyhow::Result<()>>,
) -> anyhow::Result<()> {
    tokio::pin!(readout);
    tokio::select! {
        biased;
        result = &mut readout => result,
        () = run.abort.aborted() => {
            if let Err(err) = ccd.abort().await {
                warn!(arm = %run.arm, error = %format!("{err:#}"), "CCD abort failed");
            }
            readout.await
        }
    }
}

/// Expose one frame into the next filename of the current multrun.
pub(super) async fn take_frame(
    run: &CommandRun,
    shutter: ShutterMode,
    exposure: Duration,
    obstype: &str,
) -> HandlerResult<PathBuf> {
    run.checkpoint()?;
    let request = ExposureRequest {
        shutter,
        exposure,
        filename: run.frames()?.next_frame(),
        metadata: metadata(run, obstype, exposure).await?,
    };
    let ccd = run.ccd()?;
    if let Err(err) = abortable(run, ccd, ccd.expose(&request)).await {
        // An ABORT also aborts the exposure; report that as a cancellation.
        run.checkpoint()?;
        return Err(CommandError::hardware(EXPOSE_FAILED, "CCD", err));
    }
    run.ctx.arms.set_exposure_filename(run.arm, &request.filename);
    debug!(arm = %run.arm, filename = %request.filename.display(), "Frame written");
    Ok(request.filename)
}

/// Read out one bias frame.
pub(super) async fn take_bias(run: &CommandRun) -> HandlerResult<PathBuf> {
    run.checkpoint()?;
    let filename = run.frames()?.next_frame();
    let metadata = metadata(run, "BIAS", Duration::ZERO).await?;
    let ccd = run.ccd()?;
    if let Err(err) = abortable(run, ccd, ccd.bias(&filename, &metadata)).await {
        run.checkpoint()?;
        return Err(CommandError::hardware(BIAS_FAILED, "CCD", err));
    }
    run.ctx.arms.set_exposure_filename(run.arm, &filename);
    debug!(arm = %run.arm, filename = %filename.display(), "Bias written");
    Ok(filename)
}

/// Move the fold mirror to the run's arm.
pub(super) async fn move_fold(run: &CommandRun) -> HandlerResult<()> {
    let position = run.arm_config()?.fold_position;
    let telescope = &run.ctx.hardware.telescope;
    run.ctx
        .locks
        .with_lock(SharedResource::FoldMirror, telescope.move_fold(position))
        .await
        .map_err(|e| CommandError::hardware(FOLD_FAILED, "telescope", e))?;
    debug!(arm = %run.arm, position, "Fold mirror in position");
    Ok(())
}

/// Start the autoguider.
pub(super) async fn start_autoguider(run: &CommandRun) -> HandlerResult<()> {
    run.ctx
        .hardware
        .telescope
        .autoguider_start()
        .await
        .map_err(|e| CommandError::hardware(AUTOGUIDER_FAILED, "autoguider", e))
}

/// Stop the autoguider. Failures are logged; this runs on cleanup paths.
pub(super) async fn stop_autoguider(run: &CommandRun) {
    if let Err(err) = run.ctx.hardware.telescope.autoguider_stop().await {
        warn!(arm = %run.arm, error = %format!("{err:#}"), "Autoguider stop failed");
    }
}

/// Submit one frame to the reduction pipeline.
pub(super) async fn reduce(run: &CommandRun, filename: &Path) -> HandlerResult<ReducedFrame> {
    run.ctx
        .hardware
        .pipeline
        .reduce(run.arm, filename)
        .await
        .map_err(|e| CommandError::hardware(REDUCTION_FAILED, "pipeline", e))
}

/// Reduce `to_reduce` and report every frame in `filenames`.
pub(super) async fn reduce_frames(
    run: &CommandRun,
    filenames: Vec<PathBuf>,
    to_reduce: &[PathBuf],
) -> HandlerResult<FramesReport> {
    let mut reduced = Vec::with_capacity(to_reduce.len());
    for (n, filename) in to_reduce.iter().enumerate() {
        run.checkpoint()?;
        reduced.push(reduce(run, filename).await?);
        run.ack(run.ctx.config.timing.reduction * (to_reduce.len() - n - 1) as u32);
    }
    let mean_counts = if reduced.is_empty() {
        None
    } else {
        Some(reduced.iter().map(|r| r.counts).sum::<f64>() / reduced.len() as f64)
    };
    Ok(FramesReport {
        filenames: filenames.iter().map(|f| f.display().to_string()).collect(),
        reduced: reduced.last().map(|r| ReductionSummary {
            filename: r.filename.display().to_string(),
            counts: r.counts,
            seeing: r.seeing,
            saturated: r.saturated,
        }),
        mean_counts,
    })
}

/// Time a lamp flat of `exposure` takes, excluding reduction.
pub(super) fn lamp_flat_cost(run: &CommandRun, exposure: Duration) -> Duration {
    run.ctx.config.timing.frame_cost(exposure)
}

/// Default lamp-flat exposure of the run's arm at `resolution`.
pub(super) fn default_flat_exposure(run: &CommandRun, resolution: Resolution) -> HandlerResult<Duration> {
    Ok(run.arm_config()?.lamp_flat.exposure(resolution))
}

/// Take one lamp flat with `lamps` lit. The lamps are switched off before
/// this returns, whatever the outcome.
pub(super) async fn lamp_flat(run: &CommandRun, lamps: LampSet, exposure: Duration) -> HandlerResult<PathBuf> {
    begin_multrun(run, ExposureCode::LampFlat)?;
    let handle = run.ctx.lamps.acquire_lamp(run.arm, lamps, &run.abort).await?;
    let frame = take_frame(run, ShutterMode::Open, exposure, "LAMPFLAT").await;
    handle.release().await;
    frame
}
