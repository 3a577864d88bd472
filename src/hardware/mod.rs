//! Hardware gateway: capability traits plus the bundle of devices a server
//! instance drives.

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    Amplifier, CcdController, CcdGeometry, CcdWindow, Deinterlace, ExposureRequest, FocusStage,
    FrameMetadata, LampController, LampSet, Plc, ReducedFrame, ReductionPipeline, ShutterMode,
    Telescope,
};

use crate::arm::{Arm, ArmPair};
use std::sync::Arc;

/// Every device the server talks to. Per-arm devices are held in an
/// [`ArmPair`]; the PLC, lamp bank, telescope and pipeline are shared.
#[derive(Clone)]
pub struct Hardware {
    /// CCD controller per arm.
    pub ccd: ArmPair<Arc<dyn CcdController>>,
    /// Focus stage per arm.
    pub focus: ArmPair<Arc<dyn FocusStage>>,
    /// Grating/shutter PLC.
    pub plc: Arc<dyn Plc>,
    /// Calibration lamp bank.
    pub lamps: Arc<dyn LampController>,
    /// Telescope interface.
    pub telescope: Arc<dyn Telescope>,
    /// Reduction pipeline.
    pub pipeline: Arc<dyn ReductionPipeline>,
}

impl Hardware {
    /// CCD controller of `arm`.
    pub fn ccd(&self, arm: Arm) -> Option<&Arc<dyn CcdController>> {
        self.ccd.get(arm)
    }

    /// Focus stage of `arm`.
    pub fn focus(&self, arm: Arm) -> Option<&Arc<dyn FocusStage>> {
        self.focus.get(arm)
    }
}
