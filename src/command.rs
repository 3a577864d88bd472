//! Command and response model.
//!
//! Inbound commands are a tagged union keyed by the `command` field; the
//! dispatcher maps each variant onto its handler. Every command produces zero
//! or more [`Acknowledgement`]s carrying a fresh time-to-complete estimate,
//! followed by exactly one [`CommandDone`].

use crate::arm::Arm;
use crate::error::CommandError;
use crate::state::ArmSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Discriminant of [`Command`], used for dispatch, busy tracking and error
/// code ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Detector geometry, grating and focus setup.
    #[serde(rename = "CONFIG")]
    Config,
    /// Sequence of science exposures.
    #[serde(rename = "MULTRUN")]
    Multrun,
    /// Single zero-length readout.
    #[serde(rename = "BIAS")]
    Bias,
    /// Single shutter-closed exposure.
    #[serde(rename = "DARK")]
    Dark,
    /// Single exposure with a named lamp on.
    #[serde(rename = "ARC")]
    Arc,
    /// Lamp flat-field exposure.
    #[serde(rename = "LAMPFLAT")]
    LampFlat,
    /// Focus-stage scan with lamp exposures.
    #[serde(rename = "LAMPFOCUS")]
    LampFocus,
    /// Time-budgeted batch of bias/dark calibrations.
    #[serde(rename = "DAY_CALIBRATE")]
    DayCalibrate,
    /// Status snapshot.
    #[serde(rename = "GET_STATUS")]
    GetStatus,
    /// Cancel the command running on an arm.
    #[serde(rename = "ABORT")]
    Abort,
}

impl CommandKind {
    /// Interrupt-class commands may run while another command occupies the
    /// arm and never occupy the arm slot themselves.
    pub fn is_interrupt(self) -> bool {
        matches!(self, CommandKind::Abort | CommandKind::GetStatus)
    }

    /// Wire name of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Config => "CONFIG",
            CommandKind::Multrun => "MULTRUN",
            CommandKind::Bias => "BIAS",
            CommandKind::Dark => "DARK",
            CommandKind::Arc => "ARC",
            CommandKind::LampFlat => "LAMPFLAT",
            CommandKind::LampFocus => "LAMPFOCUS",
            CommandKind::DayCalibrate => "DAY_CALIBRATE",
            CommandKind::GetStatus => "GET_STATUS",
            CommandKind::Abort => "ABORT",
        }
    }

    /// First offset of the error-code range reserved for this command.
    pub fn code_range_start(self) -> i32 {
        match self {
            CommandKind::Abort => 400,
            CommandKind::Config => 800,
            CommandKind::Multrun => 1200,
            CommandKind::Bias => 1300,
            CommandKind::Dark => 1400,
            CommandKind::Arc => 1500,
            CommandKind::LampFlat => 2300,
            CommandKind::LampFocus => 2400,
            CommandKind::DayCalibrate => 2500,
            CommandKind::GetStatus => 2600,
        }
    }

    /// Offset reported when this command is canceled.
    pub fn aborted_offset(self) -> i32 {
        self.code_range_start() + 99
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grating resolution mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// High-resolution grating.
    High,
    /// Low-resolution grating.
    Low,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::High => write!(f, "high"),
            Resolution::Low => write!(f, "low"),
        }
    }
}

/// A CCD readout window in unbinned pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// First column (inclusive).
    pub x_start: u32,
    /// First row (inclusive).
    pub y_start: u32,
    /// Last column (inclusive).
    pub x_end: u32,
    /// Last row (inclusive).
    pub y_end: u32,
    /// Whether the window is read out.
    #[serde(default)]
    pub active: bool,
}

/// Detector part of a configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Column binning.
    pub x_bin: i32,
    /// Row binning.
    pub y_bin: i32,
    /// Up to four readout windows.
    #[serde(default)]
    pub windows: Vec<Window>,
}

impl DetectorConfig {
    /// Bitmask of active windows (bit `n` set when window `n` is active).
    pub fn window_flags(&self) -> u32 {
        self.windows
            .iter()
            .take(4)
            .enumerate()
            .filter(|(_, w)| w.active)
            .fold(0, |flags, (n, _)| flags | (1 << n))
    }
}

/// Optical configuration of one arm, as carried by CONFIG.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpectrographConfig {
    /// Configuration name, copied into frame metadata.
    pub id: String,
    /// Grating resolution.
    pub resolution: Resolution,
    /// Detector binning and windows.
    pub detector: DetectorConfig,
    /// Filters in the beam; their optical thicknesses set the telescope
    /// focus offset.
    #[serde(default)]
    pub filters: Vec<String>,
    /// Take a lamp flat before each MULTRUN.
    #[serde(default)]
    pub calibrate_before: bool,
    /// Take a lamp flat after each MULTRUN.
    #[serde(default)]
    pub calibrate_after: bool,
}

/// CONFIG payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigCommand {
    /// Target arm.
    pub arm: Arm,
    /// The configuration; a missing payload is rejected.
    #[serde(default)]
    pub config: Option<SpectrographConfig>,
}

/// MULTRUN payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultrunCommand {
    /// Target arm.
    pub arm: Arm,
    /// Exposure length of each frame.
    pub exposure_length_ms: u64,
    /// Number of frames.
    pub count: u32,
    /// Standard-star observation; skips autoguiding.
    #[serde(default)]
    pub standard: bool,
}

/// BIAS payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BiasCommand {
    /// Target arm.
    pub arm: Arm,
}

/// DARK payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DarkCommand {
    /// Target arm.
    pub arm: Arm,
    /// Exposure length.
    pub exposure_length_ms: u64,
}

/// ARC payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArcCommand {
    /// Target arm.
    pub arm: Arm,
    /// Lamp specification, e.g. `"Xe"` or `"Ne,Xe"`.
    pub lamp: String,
    /// Exposure length.
    pub exposure_length_ms: u64,
}

/// LAMPFLAT payload. Missing fields fall back to the arm's configured
/// defaults for the current resolution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LampFlatCommand {
    /// Target arm.
    pub arm: Arm,
    /// Lamp specification override.
    #[serde(default)]
    pub lamp: Option<String>,
    /// Exposure length override.
    #[serde(default)]
    pub exposure_length_ms: Option<u64>,
}

/// LAMPFOCUS payload. Missing range fields fall back to the arm's configured
/// focus scan.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LampFocusCommand {
    /// Target arm.
    pub arm: Arm,
    /// Lamp specification override.
    #[serde(default)]
    pub lamp: Option<String>,
    /// Exposure length at each focus position.
    pub exposure_length_ms: u64,
    /// First focus position.
    #[serde(default)]
    pub start: Option<f64>,
    /// Last focus position.
    #[serde(default)]
    pub end: Option<f64>,
    /// Step between positions.
    #[serde(default)]
    pub step: Option<f64>,
}

/// DAY_CALIBRATE payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DayCalibrateCommand {
    /// Target arm.
    pub arm: Arm,
    /// Wall-clock budget; the deadline is receipt time plus this.
    pub time_to_complete_ms: u64,
}

/// GET_STATUS payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetStatusCommand {
    /// Also query device readings: CCD temperature, focus position, PLC
    /// faults and lamp states.
    #[serde(default)]
    pub hardware: bool,
}

/// ABORT payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AbortCommand {
    /// Arm to abort; absent or `NONE` aborts both.
    #[serde(default)]
    pub arm: Option<Arm>,
}

/// Inbound command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    /// CONFIG.
    #[serde(rename = "CONFIG")]
    Config(ConfigCommand),
    /// MULTRUN.
    #[serde(rename = "MULTRUN")]
    Multrun(MultrunCommand),
    /// BIAS.
    #[serde(rename = "BIAS")]
    Bias(BiasCommand),
    /// DARK.
    #[serde(rename = "DARK")]
    Dark(DarkCommand),
    /// ARC.
    #[serde(rename = "ARC")]
    Arc(ArcCommand),
    /// LAMPFLAT.
    #[serde(rename = "LAMPFLAT")]
    LampFlat(LampFlatCommand),
    /// LAMPFOCUS.
    #[serde(rename = "LAMPFOCUS")]
    LampFocus(LampFocusCommand),
    /// DAY_CALIBRATE.
    #[serde(rename = "DAY_CALIBRATE")]
    DayCalibrate(DayCalibrateCommand),
    /// GET_STATUS.
    #[serde(rename = "GET_STATUS")]
    GetStatus(GetStatusCommand),
    /// ABORT.
    #[serde(rename = "ABORT")]
    Abort(AbortCommand),
}

impl Command {
    /// Discriminant.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Config(_) => CommandKind::Config,
            Command::Multrun(_) => CommandKind::Multrun,
            Command::Bias(_) => CommandKind::Bias,
            Command::Dark(_) => CommandKind::Dark,
            Command::Arc(_) => CommandKind::Arc,
            Command::LampFlat(_) => CommandKind::LampFlat,
            Command::LampFocus(_) => CommandKind::LampFocus,
            Command::DayCalibrate(_) => CommandKind::DayCalibrate,
            Command::GetStatus(_) => CommandKind::GetStatus,
            Command::Abort(_) => CommandKind::Abort,
        }
    }

    /// Arm whose slot the command occupies. Commands without an arm
    /// resolve to [`Arm::None`].
    pub fn arm(&self) -> Arm {
        match self {
            Command::Config(c) => c.arm,
            Command::Multrun(c) => c.arm,
            Command::Bias(c) => c.arm,
            Command::Dark(c) => c.arm,
            Command::Arc(c) => c.arm,
            Command::LampFlat(c) => c.arm,
            Command::LampFocus(c) => c.arm,
            Command::DayCalibrate(c) => c.arm,
            Command::GetStatus(_) => Arm::None,
            Command::Abort(c) => c.arm.unwrap_or_default(),
        }
    }
}

/// Intermediate response: the command is alive and expects to need this
/// much longer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    /// Command being acknowledged.
    pub command: CommandKind,
    /// Estimated remaining time.
    pub time_to_complete_ms: u64,
}

/// Outbound half of the acknowledgement channel for one command.
#[derive(Clone, Debug)]
pub struct AckSender {
    command: CommandKind,
    tx: Option<mpsc::UnboundedSender<Acknowledgement>>,
}

impl AckSender {
    /// Forward acknowledgements to `tx`.
    pub fn new(command: CommandKind, tx: mpsc::UnboundedSender<Acknowledgement>) -> Self {
        Self {
            command,
            tx: Some(tx),
        }
    }

    /// Drop all acknowledgements.
    pub fn discard(command: CommandKind) -> Self {
        Self { command, tx: None }
    }

    /// Emit an acknowledgement with `remaining` time to complete. A client
    /// that went away is not an error for the command.
    pub fn send(&self, remaining: Duration) {
        let Some(tx) = &self.tx else {
            return;
        };
        let ack = Acknowledgement {
            command: self.command,
            time_to_complete_ms: u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
        };
        if tx.send(ack).is_err() {
            debug!(command = %self.command, "Acknowledgement receiver dropped");
        }
    }
}

/// Reduction quality numbers for one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReductionSummary {
    /// Reduced frame filename.
    pub filename: String,
    /// Mean counts.
    pub counts: f64,
    /// Seeing in arcseconds, when the pipeline could measure it.
    pub seeing: Option<f64>,
    /// Whether any pixel saturated.
    pub saturated: bool,
}

/// Result of a frame-producing command.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FramesReport {
    /// Raw frame filenames in acquisition order.
    pub filenames: Vec<String>,
    /// Reduction of the last frame, when reduction succeeded.
    pub reduced: Option<ReductionSummary>,
    /// Mean counts over all reduced frames.
    pub mean_counts: Option<f64>,
}

/// One point of a focus scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FocusPoint {
    /// Focus-stage position.
    pub position: f64,
    /// Raw frame filename.
    pub filename: String,
    /// Measured seeing, if any.
    pub seeing: Option<f64>,
}

/// Result of LAMPFOCUS.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FocusReport {
    /// Scan points in acquisition order.
    pub points: Vec<FocusPoint>,
    /// Position with the smallest seeing.
    pub best_position: Option<f64>,
}

/// One executed DAY_CALIBRATE catalog entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRun {
    /// `BIAS` or `DARK`.
    pub kind: crate::calibration::CalibrationType,
    /// Binning used.
    pub binning: u32,
    /// Exposure length.
    pub exposure_ms: u64,
    /// Frames taken.
    pub filenames: Vec<String>,
}

/// Result of DAY_CALIBRATE.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Entries executed, in catalog order.
    pub completed: Vec<CalibrationRun>,
    /// Number of catalog entries skipped.
    pub skipped: u32,
    /// Master bias built from this run's bias frames.
    pub master_bias: Option<String>,
}

/// Lamp arbiter record as reported by GET_STATUS.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LampStatus {
    /// Arm holding lamp rights.
    pub arm: Arm,
    /// Active lamps; empty for a no-lamp assertion.
    pub lamps: Vec<String>,
}

/// Hardware readings for one arm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArmHardwareStatus {
    /// Arm.
    pub arm: Arm,
    /// CCD temperature in degrees C.
    pub ccd_temperature: Option<f64>,
    /// Focus-stage position.
    pub focus_position: Option<f64>,
}

/// Result of GET_STATUS.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Per-arm command and configuration state.
    pub arms: Vec<ArmSnapshot>,
    /// Lamp arbiter holder.
    pub lamp: Option<LampStatus>,
    /// Hardware readings, when requested.
    pub hardware: Vec<ArmHardwareStatus>,
    /// PLC fault bitmask, when hardware readings were requested and the PLC
    /// answered.
    pub plc_fault_status: Option<u32>,
    /// Lamps the bank reports lit, when hardware readings were requested.
    pub lamps_lit: Vec<String>,
}

/// Command-specific result fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonePayload {
    /// No extra fields.
    Empty,
    /// CONFIG result.
    Config {
        /// Config id after the increment.
        config_id: i64,
        /// Stored configuration name.
        config_name: String,
    },
    /// Frame-producing command result.
    Frames(FramesReport),
    /// LAMPFOCUS result.
    Focus(FocusReport),
    /// DAY_CALIBRATE result.
    Calibration(CalibrationReport),
    /// GET_STATUS result.
    Status(StatusReport),
    /// ABORT result: arms whose running command was signalled.
    Aborted {
        /// Signalled arms.
        arms: Vec<Arm>,
    },
}

/// Final response to a command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandDone {
    /// Command being answered.
    pub command: CommandKind,
    /// 0 on success.
    pub error_code: i32,
    /// Empty on success.
    pub error_message: String,
    /// True only on full completion.
    pub successful: bool,
    /// Command-specific fields.
    pub payload: DonePayload,
}

impl CommandDone {
    /// Successful completion.
    pub fn success(command: CommandKind, payload: DonePayload) -> Self {
        Self {
            command,
            error_code: 0,
            error_message: String::new(),
            successful: true,
            payload,
        }
    }

    /// Failed, conflicting or canceled completion.
    pub fn failure(command: CommandKind, error: &CommandError) -> Self {
        Self {
            command,
            error_code: error.code(command),
            error_message: error.to_string(),
            successful: false,
            payload: DonePayload::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let json = r#"{"command":"MULTRUN","arm":"RED","exposure_length_ms":1000,"count":3}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.kind(), CommandKind::Multrun);
        assert_eq!(cmd.arm(), Arm::Red);
        match cmd {
            Command::Multrun(m) => {
                assert_eq!(m.count, 3);
                assert!(!m.standard);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_abort_without_arm_resolves_to_none() {
        let cmd: Command = serde_json::from_str(r#"{"command":"ABORT"}"#).unwrap();
        assert_eq!(cmd.arm(), Arm::None);
        assert!(cmd.kind().is_interrupt());
    }

    #[test]
    fn test_window_flags() {
        let detector = DetectorConfig {
            x_bin: 1,
            y_bin: 1,
            windows: vec![
                Window { x_start: 0, y_start: 0, x_end: 9, y_end: 9, active: false },
                Window { x_start: 0, y_start: 0, x_end: 9, y_end: 9, active: true },
            ],
        };
        assert_eq!(detector.window_flags(), 0b10);
    }

    #[test]
    fn test_code_ranges_do_not_overlap() {
        let kinds = [
            CommandKind::Config,
            CommandKind::Multrun,
            CommandKind::Bias,
            CommandKind::Dark,
            CommandKind::Arc,
            CommandKind::LampFlat,
            CommandKind::LampFocus,
            CommandKind::DayCalibrate,
            CommandKind::GetStatus,
            CommandKind::Abort,
        ];
        let mut starts: Vec<i32> = kinds.iter().map(|k| k.code_range_start()).collect();
        starts.sort_unstable();
        assert!(starts.windows(2).all(|w| w[1] - w[0] >= 100));
    }

    #[tokio::test]
    async fn test_ack_sender_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let acks = AckSender::new(CommandKind::Multrun, tx);
        drop(rx);
        acks.send(Duration::from_secs(1));
    }
}
