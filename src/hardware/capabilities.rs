//! Capability interfaces to the spectrograph hardware.
//!
//! Each device family is a narrow async trait. Vendor protocol drivers (CCD
//! DSP, PLC fieldbus, serial focus stages, the telescope link) implement them
//! outside this crate; [`super::mock`] provides simulated implementations.
//! All traits require `Send + Sync` so devices can be shared as
//! `Arc<dyn Trait>` between the two arms' command tasks.
//!
//! Failures are reported as `anyhow::Error` carrying the native device error;
//! command handlers fold them into their own error codes.

use crate::arm::Arm;
use crate::command::Resolution;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CCD output amplifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Amplifier {
    /// Left serial register output.
    Left,
    /// Right serial register output.
    Right,
    /// Both outputs; the image must be deinterlaced.
    Both,
}

/// Deinterlace mode implied by the amplifier choice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deinterlace {
    /// Single readout; no reordering.
    Single,
    /// Dual readout split along the serial register.
    SplitSerial,
}

impl Amplifier {
    /// Deinterlace mode the controller needs for this amplifier.
    pub fn deinterlace(self) -> Deinterlace {
        match self {
            Amplifier::Both => Deinterlace::SplitSerial,
            Amplifier::Left | Amplifier::Right => Deinterlace::Single,
        }
    }
}

/// Readout window in unbinned pixel coordinates, as sent to the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcdWindow {
    /// First column.
    pub x_start: u32,
    /// First row.
    pub y_start: u32,
    /// Last column.
    pub x_end: u32,
    /// Last row.
    pub y_end: u32,
}

/// Everything `setup_geometry` pushes to the controller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcdGeometry {
    /// Binned columns.
    pub columns: u32,
    /// Binned rows.
    pub rows: u32,
    /// Column binning.
    pub x_bin: u32,
    /// Row binning.
    pub y_bin: u32,
    /// Output amplifier.
    pub amplifier: Amplifier,
    /// Deinterlace mode.
    pub deinterlace: Deinterlace,
    /// Bitmask of active windows.
    pub window_flags: u32,
    /// Active windows, in flag order.
    pub windows: Vec<CcdWindow>,
}

impl CcdGeometry {
    /// Full-frame geometry at the given binning.
    pub fn full_frame(columns: u32, rows: u32, x_bin: u32, y_bin: u32, amplifier: Amplifier) -> Self {
        Self {
            columns: columns / x_bin.max(1),
            rows: rows / y_bin.max(1),
            x_bin,
            y_bin,
            amplifier,
            deinterlace: amplifier.deinterlace(),
            window_flags: 0,
            windows: Vec::new(),
        }
    }
}

/// Whether the shutter opens during an exposure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutterMode {
    /// Shutter opens (science, arc, flat).
    Open,
    /// Shutter stays closed (dark).
    Closed,
}

/// Header keywords attached to a frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Keyword to value.
    pub keywords: BTreeMap<String, String>,
}

impl FrameMetadata {
    /// Set a keyword, replacing any previous value.
    pub fn set(&mut self, keyword: &str, value: impl ToString) -> &mut Self {
        self.keywords.insert(keyword.to_string(), value.to_string());
        self
    }

    /// Value of `keyword`.
    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.keywords.get(keyword).map(String::as_str)
    }
}

/// One exposure request.
#[derive(Clone, Debug, PartialEq)]
pub struct ExposureRequest {
    /// Shutter behaviour.
    pub shutter: ShutterMode,
    /// Exposure length.
    pub exposure: Duration,
    /// Output file.
    pub filename: PathBuf,
    /// Header keywords.
    pub metadata: FrameMetadata,
}

/// A normalised set of lamp names, e.g. `"Xe,Ne"`.
///
/// Names are trimmed, sorted and de-duplicated so that two specifications of
/// the same lamps compare equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LampSet(Vec<String>);

impl LampSet {
    /// Parse a comma or whitespace separated list; `None` when it names no
    /// lamp.
    pub fn parse(spec: &str) -> Option<Self> {
        let mut names: Vec<String> = spec
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        if names.is_empty() {
            None
        } else {
            Some(Self(names))
        }
    }

    /// Lamp names in sorted order.
    pub fn names(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for LampSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

/// Quality numbers returned by the reduction pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReducedFrame {
    /// Reduced output file.
    pub filename: PathBuf,
    /// Mean counts.
    pub counts: f64,
    /// Seeing in arcseconds, if measurable.
    pub seeing: Option<f64>,
    /// Whether any pixel saturated.
    pub saturated: bool,
}

/// One arm's CCD controller.
#[async_trait]
pub trait CcdController: Send + Sync {
    /// Push readout geometry.
    async fn setup_geometry(&self, geometry: &CcdGeometry) -> Result<()>;
    /// Expose and read out into `request.filename`.
    async fn expose(&self, request: &ExposureRequest) -> Result<()>;
    /// Zero-length readout into `filename`.
    async fn bias(&self, filename: &Path, metadata: &FrameMetadata) -> Result<()>;
    /// Abort an exposure in progress.
    async fn abort(&self) -> Result<()>;
    /// Detector temperature in degrees C.
    async fn temperature(&self) -> Result<f64>;
}

/// Grating/shutter PLC shared by both arms.
#[async_trait]
pub trait Plc: Send + Sync {
    /// Move `arm`'s grating; returns once the mechanism is in position.
    async fn set_grating(&self, arm: Arm, resolution: Resolution) -> Result<()>;
    /// Fault bitmask (0 = healthy).
    async fn fault_status(&self) -> Result<u32>;
}

/// Calibration lamp bank shared by both arms.
#[async_trait]
pub trait LampController: Send + Sync {
    /// Switch the named lamps on.
    async fn turn_on(&self, lamps: &LampSet) -> Result<()>;
    /// Switch the named lamps off.
    async fn turn_off(&self, lamps: &LampSet) -> Result<()>;
    /// Whether `lamp` is currently lit.
    async fn is_on(&self, lamp: &str) -> Result<bool>;
}

/// One arm's focus stage.
#[async_trait]
pub trait FocusStage: Send + Sync {
    /// Move to an absolute position.
    async fn move_absolute(&self, position: f64) -> Result<()>;
    /// Current position.
    async fn position(&self) -> Result<f64>;
}

/// Telescope (ISS) requests used by the spectrograph.
#[async_trait]
pub trait Telescope: Send + Sync {
    /// MOVE_FOLD to a port.
    async fn move_fold(&self, position: i32) -> Result<()>;
    /// OFFSET_FOCUS by `offset` mm.
    async fn offset_focus(&self, offset: f64) -> Result<()>;
    /// AG_START.
    async fn autoguider_start(&self) -> Result<()>;
    /// AG_STOP.
    async fn autoguider_stop(&self) -> Result<()>;
    /// GET_FITS: telescope header keywords.
    async fn fits_headers(&self) -> Result<BTreeMap<String, String>>;
}

/// External data-reduction pipeline.
#[async_trait]
pub trait ReductionPipeline: Send + Sync {
    /// Reduce one raw frame.
    async fn reduce(&self, arm: Arm, filename: &Path) -> Result<ReducedFrame>;
    /// Combine bias frames into a master bias.
    async fn make_master_bias(&self, arm: Arm, frames: &[PathBuf]) -> Result<PathBuf>;
}
