//! DAY_CALIBRATE: time-budgeted bias and dark calibrations.
//!
//! Planning lives in [`crate::calibration`]; this module executes the
//! entries the planner accepts, persists their last-run times, and asks the
//! pipeline for a master bias over the bias frames taken.

use super::expose::{begin_multrun, take_bias, take_frame};
use super::CommandRun;
use crate::calibration::{self, CalibrationType, CatalogEntry, Decision, LastRunStore};
use crate::command::{CalibrationReport, CalibrationRun, DayCalibrateCommand, DonePayload};
use crate::error::{CommandError, HandlerResult};
use crate::frames::ExposureCode;
use crate::hardware::{CcdGeometry, ShutterMode};
use chrono::{DateTime, TimeDelta, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

const ILLEGAL_BUDGET: i32 = 2502;
const STORE_LOAD_FAILED: i32 = 2503;
const GEOMETRY_FAILED: i32 = 2504;
const STORE_SAVE_FAILED: i32 = 2506;
const MASTER_BIAS_FAILED: i32 = 2507;

fn deadline(run: &CommandRun, command: &DayCalibrateCommand) -> DateTime<Utc> {
    let budget = i64::try_from(command.time_to_complete_ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::MAX);
    run.received_at.checked_add_signed(budget).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

async fn load_catalog(run: &CommandRun) -> HandlerResult<Vec<CatalogEntry>> {
    let settings = &run.ctx.config.day_calibrate;
    let mut catalog = calibration::load_catalog(&settings.catalog);
    let _store = run.ctx.calibration_store.lock().await;
    let store = LastRunStore::load(run.ctx.config.resolve(&settings.state_file), settings.key_prefix.clone())
        .map_err(|e| CommandError::persistence(STORE_LOAD_FAILED, e))?;
    calibration::add_saved_state(&mut catalog, &store, run.arm)
        .map_err(|e| CommandError::persistence(STORE_LOAD_FAILED, e))?;
    Ok(catalog)
}

async fn configure(run: &CommandRun, binning: u32) -> HandlerResult<()> {
    let ccd = &run.arm_config()?.ccd;
    if !ccd.enabled {
        debug!(arm = %run.arm, "CCD disabled; geometry not sent");
        return Ok(());
    }
    let geometry = CcdGeometry::full_frame(ccd.columns, ccd.rows, binning, binning, ccd.amplifier);
    run.ccd()?
        .setup_geometry(&geometry)
        .await
        .map_err(|e| CommandError::hardware(GEOMETRY_FAILED, "CCD", e))?;
    // The stored CONFIG no longer describes the detector.
    run.ctx.arms.invalidate_configuration(run.arm);
    Ok(())
}

async fn take_entry_frames(run: &CommandRun, entry: &CatalogEntry, estimated: Duration) -> HandlerResult<Vec<PathBuf>> {
    let code = match entry.kind {
        CalibrationType::Bias => ExposureCode::Bias,
        CalibrationType::Dark => ExposureCode::Dark,
    };
    begin_multrun(run, code)?;
    let per_frame = estimated / entry.count;
    let no_lamp = run.ctx.lamps.acquire_no_lamp(run.arm, &run.abort).await?;
    let mut frames = Vec::with_capacity(entry.count as usize);
    let mut outcome = Ok(());
    for n in 1..=entry.count {
        let frame = match entry.kind {
            CalibrationType::Bias => take_bias(run).await,
            CalibrationType::Dark => take_frame(run, ShutterMode::Closed, entry.exposure, "DARK").await,
        };
        match frame {
            Ok(frame) => frames.push(frame),
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
        run.ctx.arms.set_exposure_progress(run.arm, n, entry.count);
        run.ack(per_frame * (entry.count - n));
    }
    no_lamp.release().await;
    outcome.map(|()| frames)
}

async fn record_run(run: &CommandRun, entry: &mut CatalogEntry, at: DateTime<Utc>) -> HandlerResult<()> {
    let settings = &run.ctx.config.day_calibrate;
    let _store = run.ctx.calibration_store.lock().await;
    calibration::record_run(
        &run.ctx.config.resolve(&settings.state_file),
        &settings.key_prefix,
        run.arm,
        entry,
        at,
    )
    .map_err(|e| CommandError::persistence(STORE_SAVE_FAILED, e))
}

pub(super) async fn handle(run: &CommandRun, command: DayCalibrateCommand) -> HandlerResult<DonePayload> {
    run.require_arm()?;
    if command.time_to_complete_ms == 0 {
        return Err(CommandError::validation(ILLEGAL_BUDGET, "DAY_CALIBRATE needs a non-zero time budget"));
    }
    let deadline = deadline(run, &command);
    let readout = run.ctx.config.timing.readout_overhead;
    let mut catalog = load_catalog(run).await?;
    run.ack(Duration::from_millis(command.time_to_complete_ms));
    info!(arm = %run.arm, entries = catalog.len(), %deadline, "DAY_CALIBRATE started");

    let mut report = CalibrationReport::default();
    let mut bias_frames = Vec::new();
    for entry in catalog.iter_mut() {
        run.checkpoint()?;
        let now = Utc::now();
        let estimated = match calibration::plan_entry(entry, now, deadline, readout) {
            Decision::Run { estimated } => estimated,
            Decision::Skip(reason) => {
                debug!(arm = %run.arm, kind = %entry.kind, binning = entry.binning, ?reason, "Calibration skipped");
                report.skipped += 1;
                continue;
            }
        };
        run.ack(estimated);
        info!(arm = %run.arm, kind = %entry.kind, binning = entry.binning, count = entry.count, "Calibration running");

        configure(run, entry.binning).await?;
        run.checkpoint()?;
        let frames = take_entry_frames(run, entry, estimated).await?;
        record_run(run, entry, now).await?;

        if entry.kind == CalibrationType::Bias {
            bias_frames.extend(frames.iter().cloned());
        }
        report.completed.push(CalibrationRun {
            kind: entry.kind,
            binning: entry.binning,
            exposure_ms: u64::try_from(entry.exposure.as_millis()).unwrap_or(u64::MAX),
            filenames: frames.iter().map(|f| f.display().to_string()).collect(),
        });
    }

    if !bias_frames.is_empty() {
        run.checkpoint()?;
        let master = run
            .ctx
            .hardware
            .pipeline
            .make_master_bias(run.arm, &bias_frames)
            .await
            .map_err(|e| CommandError::hardware(MASTER_BIAS_FAILED, "pipeline", e))?;
        report.master_bias = Some(master.display().to_string());
    }

    info!(
        arm = %run.arm,
        completed = report.completed.len(),
        skipped = report.skipped,
        "DAY_CALIBRATE complete"
    );
    Ok(DonePayload::Calibration(report))
}
