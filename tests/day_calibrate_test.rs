//! DAY_CALIBRATE planning and execution.

mod common;

use chrono::{TimeDelta, Utc};
use common::{config_command, harness_with, Harness};
use dualspec::arm::Arm;
use dualspec::calibration::{CalibrationType, CatalogEntry, LastRunStore};
use dualspec::command::{CalibrationReport, Command, DayCalibrateCommand, DonePayload};
use dualspec::config::{CatalogSpec, ServerConfig};
use dualspec::error::ERROR_CODE_BASE;
use dualspec::hardware::mock::{Fault, HardwareEvent};
use dualspec::state::UNKNOWN_CONFIG;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

fn bias_spec(binning: u32, count: u32) -> CatalogSpec {
    CatalogSpec {
        kind: CalibrationType::Bias,
        binning,
        frequency: HOUR,
        count,
        exposure: Duration::ZERO,
    }
}

fn dark_spec(binning: u32, count: u32, exposure: Duration) -> CatalogSpec {
    CatalogSpec {
        kind: CalibrationType::Dark,
        binning,
        frequency: HOUR,
        count,
        exposure,
    }
}

fn harness_with_catalog(catalog: Vec<CatalogSpec>) -> Harness {
    let mut config = ServerConfig::default();
    config.day_calibrate.catalog = catalog;
    harness_with(config)
}

fn day_calibrate(arm: Arm, budget_ms: u64) -> Command {
    Command::DayCalibrate(DayCalibrateCommand {
        arm,
        time_to_complete_ms: budget_ms,
    })
}

fn report(payload: DonePayload) -> CalibrationReport {
    match payload {
        DonePayload::Calibration(report) => report,
        other => panic!("expected a calibration report, got {other:?}"),
    }
}

fn store(h: &Harness) -> LastRunStore {
    let ctx = h.ctx();
    LastRunStore::load(
        ctx.config.resolve(&ctx.config.day_calibrate.state_file),
        ctx.config.day_calibrate.key_prefix.clone(),
    )
    .expect("Failed to load last-run store")
}

#[tokio::test(start_paused = true)]
async fn test_recent_entry_is_skipped() {
    let spec = bias_spec(1, 3);
    let h = harness_with_catalog(vec![spec.clone()]);

    let entry = CatalogEntry::from_spec(&spec);
    assert_eq!(
        entry.store_key("dualspec.day_calibrate", Arm::Red),
        "dualspec.day_calibrate.red.BIAS.1.0.3"
    );
    let mut saved = store(&h);
    saved.set_last_run(&entry, Arm::Red, Utc::now() - TimeDelta::minutes(30));
    saved.save().expect("Failed to save store");

    let done = h.run(day_calibrate(Arm::Red, 3_600_000)).await;

    assert!(done.successful, "{done:?}");
    let report = report(done.payload);
    assert!(report.completed.is_empty());
    assert_eq!(report.skipped, 1);
    assert!(report.master_bias.is_none());
    assert_eq!(h.rig.count(|e| matches!(e, HardwareEvent::Bias { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn test_entry_that_would_overrun_is_skipped() {
    let h = harness_with_catalog(vec![dark_spec(1, 2, Duration::from_secs(60))]);

    let done = h.run(day_calibrate(Arm::Blue, 100_000)).await;

    assert!(done.successful, "{done:?}");
    let report = report(done.payload);
    assert!(report.completed.is_empty());
    assert_eq!(report.skipped, 1);
    assert_eq!(h.rig.count(|e| matches!(e, HardwareEvent::Exposure { .. })), 0);
    assert_eq!(h.rig.count(|e| matches!(e, HardwareEvent::Geometry { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn test_runs_catalog_and_records_last_run() {
    let h = harness_with_catalog(vec![
        bias_spec(1, 2),
        dark_spec(2, 1, Duration::from_secs(10)),
    ]);
    let configured = h.run(config_command(Arm::Red, 1, 1, Vec::new())).await;
    assert!(configured.successful);
    let before = Utc::now();

    let done = h.run(day_calibrate(Arm::Red, 3_600_000)).await;

    assert!(done.successful, "{done:?}");
    let report = report(done.payload);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.completed.len(), 2);
    assert_eq!(report.completed[0].kind, CalibrationType::Bias);
    assert_eq!(report.completed[0].filenames.len(), 2);
    assert_eq!(report.completed[1].kind, CalibrationType::Dark);
    assert_eq!(report.completed[1].exposure_ms, 10_000);
    assert_eq!(report.master_bias.as_deref(), Some("r_master_bias.fits"));

    assert_eq!(h.rig.count(|e| matches!(e, HardwareEvent::Bias { arm: Arm::Red, .. })), 2);
    assert!(h.rig.events().contains(&HardwareEvent::MasterBias { arm: Arm::Red, frames: 2 }));
    assert!(h
        .rig
        .events()
        .iter()
        .any(|e| matches!(e, HardwareEvent::Geometry { arm: Arm::Red, geometry } if geometry.x_bin == 2)));

    // Full-frame calibration geometry replaces the CONFIG geometry.
    assert_eq!(h.ctx().arms.snapshot(Arm::Red).config_name, UNKNOWN_CONFIG);

    let saved = store(&h);
    for spec in [bias_spec(1, 2), dark_spec(2, 1, Duration::from_secs(10))] {
        let entry = CatalogEntry::from_spec(&spec);
        let last = saved
            .last_run(&entry, Arm::Red)
            .expect("Malformed store")
            .expect("No last run recorded");
        assert!(last >= before - TimeDelta::seconds(1));
        assert!(saved.last_run(&entry, Arm::Blue).expect("Malformed store").is_none());
    }

    // A second run straight away has nothing to do.
    let done = h.run(day_calibrate(Arm::Red, 3_600_000)).await;
    let report = self::report(done.payload);
    assert!(report.completed.is_empty());
    assert_eq!(report.skipped, 2);
}

#[tokio::test(start_paused = true)]
async fn test_frame_failure_stops_run() {
    let h = harness_with_catalog(vec![bias_spec(1, 2), bias_spec(2, 2)]);
    h.rig.inject(Fault::Expose(Arm::Blue));

    let done = h.run(day_calibrate(Arm::Blue, 3_600_000)).await;

    assert!(!done.successful);
    assert_eq!(done.error_code, ERROR_CODE_BASE + 1104);
    assert_eq!(h.rig.count(|e| matches!(e, HardwareEvent::Geometry { .. })), 1);
    assert_eq!(h.rig.count(|e| matches!(e, HardwareEvent::MasterBias { .. })), 0);
    let entry = CatalogEntry::from_spec(&bias_spec(1, 2));
    assert!(store(&h).last_run(&entry, Arm::Blue).expect("Malformed store").is_none());
    assert!(h.ctx().lamps.holder().is_none());
    assert!(h.ctx().arms.current(Arm::Blue).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unwritable_store_fails_run() {
    let h = harness_with_catalog(vec![bias_spec(1, 1)]);
    std::fs::create_dir(h.dir.path().join("day_calibrate.properties.tmp")).expect("Failed to block store");

    let done = h.run(day_calibrate(Arm::Red, 3_600_000)).await;

    assert!(!done.successful);
    assert_eq!(done.error_code, ERROR_CODE_BASE + 2506);
    assert_eq!(h.rig.count(|e| matches!(e, HardwareEvent::Bias { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_budget_is_rejected() {
    let h = harness_with_catalog(vec![bias_spec(1, 1)]);
    let done = h.run(day_calibrate(Arm::Red, 0)).await;
    assert_eq!(done.error_code, ERROR_CODE_BASE + 2502);
    assert!(h.rig.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_abort_stops_calibration() {
    let h = harness_with_catalog(vec![dark_spec(1, 3, Duration::from_secs(600))]);
    let running = h.spawn(day_calibrate(Arm::Red, 10 * 3_600_000));
    tokio::time::sleep(Duration::from_secs(5)).await;

    let abort = h
        .run(Command::Abort(dualspec::command::AbortCommand { arm: Some(Arm::Red) }))
        .await;
    assert!(abort.successful);

    let done = running.await.expect("DAY_CALIBRATE task panicked");
    assert!(!done.successful);
    assert_eq!(done.error_code, ERROR_CODE_BASE + 2599);
    let entry = CatalogEntry::from_spec(&dark_spec(1, 3, Duration::from_secs(600)));
    assert!(store(&h).last_run(&entry, Arm::Red).expect("Malformed store").is_none());
}
