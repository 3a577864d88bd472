//! CONFIG: detector geometry, grating, focus stage and telescope focus offset.
//!
//! The sequence is all-or-nothing from the client's point of view: the first
//! failing step ends the command and nothing after it is attempted. There are
//! abort checkpoints around every hardware call.

use super::CommandRun;
use crate::command::{ConfigCommand, DetectorConfig, DonePayload, SpectrographConfig};
use crate::config::{ArmConfig, CcdSettings};
use crate::error::{CommandError, HandlerResult};
use crate::hardware::{CcdGeometry, CcdWindow};
use crate::locks::SharedResource;
use crate::state::ArmConfiguration;
use tracing::{debug, info};

const MISSING_PAYLOAD: i32 = 800;
const ILLEGAL_WINDOW: i32 = 802;
const UNKNOWN_FILTER: i32 = 803;
const GEOMETRY_FAILED: i32 = 804;
const GRATING_FAILED: i32 = 805;
const FOCUS_STAGE_FAILED: i32 = 806;
const ILLEGAL_BINNING: i32 = 807;
const BINNING_WINDOW_CONFLICT: i32 = 808;
const FOCUS_OFFSET_FAILED: i32 = 809;
const CONFIG_ID_FAILED: i32 = 810;

const MAX_WINDOWS: usize = 4;

/// Readout geometry for `detector` on a CCD described by `ccd`.
///
/// Binning must be at least 1 on both axes, and binning above 1 cannot be
/// combined with active windows.
pub fn compute_geometry(ccd: &CcdSettings, detector: &DetectorConfig) -> HandlerResult<CcdGeometry> {
    if detector.x_bin < 1 || detector.y_bin < 1 {
        return Err(CommandError::validation(
            ILLEGAL_BINNING,
            format!("illegal binning {}x{}", detector.x_bin, detector.y_bin),
        ));
    }
    let window_flags = detector.window_flags();
    if window_flags > 0 && (detector.x_bin > 1 || detector.y_bin > 1) {
        return Err(CommandError::validation(
            BINNING_WINDOW_CONFLICT,
            format!(
                "binning {}x{} cannot be combined with windowing",
                detector.x_bin, detector.y_bin
            ),
        ));
    }
    if detector.windows.len() > MAX_WINDOWS {
        return Err(CommandError::validation(
            ILLEGAL_WINDOW,
            format!("at most {MAX_WINDOWS} windows, got {}", detector.windows.len()),
        ));
    }

    let mut windows = Vec::new();
    for (n, window) in detector.windows.iter().enumerate().filter(|(_, w)| w.active) {
        if window.x_end < window.x_start
            || window.y_end < window.y_start
            || window.x_end >= ccd.columns
            || window.y_end >= ccd.rows
        {
            return Err(CommandError::validation(
                ILLEGAL_WINDOW,
                format!("window {n} is outside the {}x{} detector", ccd.columns, ccd.rows),
            ));
        }
        windows.push(CcdWindow {
            x_start: window.x_start,
            y_start: window.y_start,
            x_end: window.x_end,
            y_end: window.y_end,
        });
    }

    // Both bins are >= 1 here.
    let x_bin = detector.x_bin.unsigned_abs();
    let y_bin = detector.y_bin.unsigned_abs();
    let mut geometry = CcdGeometry::full_frame(ccd.columns, ccd.rows, x_bin, y_bin, ccd.amplifier);
    geometry.window_flags = window_flags;
    geometry.windows = windows;
    Ok(geometry)
}

fn focus_offset(settings: &ArmConfig, config: &SpectrographConfig) -> HandlerResult<f64> {
    config.filters.iter().try_fold(0.0, |sum, filter| {
        settings
            .filter_offsets
            .get(filter)
            .map(|offset| sum + offset)
            .ok_or_else(|| CommandError::validation(UNKNOWN_FILTER, format!("unknown filter '{filter}'")))
    })
}

pub(super) async fn handle(run: &CommandRun, command: ConfigCommand) -> HandlerResult<DonePayload> {
    let Some(config) = command.config else {
        return Err(CommandError::validation(MISSING_PAYLOAD, "CONFIG carries no configuration"));
    };
    run.require_arm()?;
    let arm = run.arm;
    let settings = run.arm_config()?;
    let ctx = &run.ctx;

    let geometry = compute_geometry(&settings.ccd, &config.detector)?;
    let offset = focus_offset(settings, &config)?;
    let setpoint = settings.focus.for_resolution(config.resolution);
    run.ack(ctx.config.timing.config_overhead);

    run.checkpoint()?;
    if settings.ccd.enabled {
        run.ccd()?
            .setup_geometry(&geometry)
            .await
            .map_err(|e| CommandError::hardware(GEOMETRY_FAILED, "CCD", e))?;
        debug!(%arm, columns = geometry.columns, rows = geometry.rows, "Geometry set");
    } else {
        debug!(%arm, "CCD disabled; geometry not sent");
    }

    run.checkpoint()?;
    ctx.hardware
        .plc
        .set_grating(arm, config.resolution)
        .await
        .map_err(|e| CommandError::hardware(GRATING_FAILED, "PLC", e))?;

    run.checkpoint()?;
    run.focus_stage()?
        .move_absolute(setpoint)
        .await
        .map_err(|e| CommandError::hardware(FOCUS_STAGE_FAILED, "focus stage", e))?;

    run.checkpoint()?;
    let telescope = &ctx.hardware.telescope;
    ctx.locks
        .with_lock(SharedResource::FocusOffset, telescope.offset_focus(offset))
        .await
        .map_err(|e| CommandError::hardware(FOCUS_OFFSET_FAILED, "telescope", e))?;

    run.checkpoint()?;
    let config_id = ctx
        .arms
        .increment_config_id(arm)
        .ok_or_else(|| CommandError::Internal(format!("no config-id counter for {arm}")))?
        .map_err(|e| CommandError::persistence(CONFIG_ID_FAILED, e))?;

    ctx.arms.set_configuration(
        arm,
        ArmConfiguration {
            name: config.id.clone(),
            resolution: Some(config.resolution),
            calibrate_before: config.calibrate_before,
            calibrate_after: config.calibrate_after,
        },
    );
    info!(%arm, config = %config.id, config_id, resolution = %config.resolution, "Arm configured");
    Ok(DonePayload::Config {
        config_id,
        config_name: config.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Window;
    use crate::hardware::Amplifier;

    fn detector(x_bin: i32, y_bin: i32, windows: Vec<Window>) -> DetectorConfig {
        DetectorConfig { x_bin, y_bin, windows }
    }

    fn window(active: bool) -> Window {
        Window {
            x_start: 100,
            y_start: 100,
            x_end: 199,
            y_end: 199,
            active,
        }
    }

    fn offset_of(result: HandlerResult<CcdGeometry>) -> Option<i32> {
        match result {
            Err(CommandError::Validation { offset, .. }) => Some(offset),
            _ => None,
        }
    }

    #[test]
    fn test_binning_validation_grid() {
        let ccd = CcdSettings::default();
        for x_bin in -1..=4 {
            for y_bin in -1..=4 {
                for active in [false, true] {
                    let result = compute_geometry(&ccd, &detector(x_bin, y_bin, vec![window(active)]));
                    let expected = if x_bin < 1 || y_bin < 1 {
                        Some(ILLEGAL_BINNING)
                    } else if active && (x_bin > 1 || y_bin > 1) {
                        Some(BINNING_WINDOW_CONFLICT)
                    } else {
                        None
                    };
                    assert_eq!(offset_of(result), expected, "bin {x_bin}x{y_bin} active={active}");
                }
            }
        }
    }

    #[test]
    fn test_geometry_from_binning() {
        let ccd = CcdSettings {
            amplifier: Amplifier::Both,
            ..CcdSettings::default()
        };
        let geometry = compute_geometry(&ccd, &detector(2, 2, vec![window(false)])).unwrap();
        assert_eq!((geometry.columns, geometry.rows), (1024, 1024));
        assert_eq!(geometry.window_flags, 0);
        assert!(geometry.windows.is_empty());
    }

    #[test]
    fn test_windows_are_bounds_checked() {
        let ccd = CcdSettings::default();
        let mut outside = window(true);
        outside.x_end = ccd.columns;
        assert_eq!(
            offset_of(compute_geometry(&ccd, &detector(1, 1, vec![outside]))),
            Some(ILLEGAL_WINDOW)
        );
        let geometry = compute_geometry(&ccd, &detector(1, 1, vec![window(false), window(true)])).unwrap();
        assert_eq!(geometry.window_flags, 0b10);
        assert_eq!(geometry.windows.len(), 1);
    }
}
