//! Shared server context.
//!
//! One [`ServerContext`] is built at startup and handed (behind an `Arc`) to
//! the dispatcher and, through it, to every handler invocation.

use crate::arm::{Arm, ArmPair};
use crate::config::ServerConfig;
use crate::error::PersistError;
use crate::frames::FrameNamer;
use crate::hardware::Hardware;
use crate::lamp::LampArbiter;
use crate::locks::ResourceLocks;
use crate::state::ArmState;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Everything a handler needs.
pub struct ServerContext {
    /// Loaded configuration.
    pub config: Arc<ServerConfig>,
    /// Per-arm command and configuration state.
    pub arms: Arc<ArmState>,
    /// Fold-mirror and focus-offset locks.
    pub locks: ResourceLocks,
    /// Lamp arbitration.
    pub lamps: Arc<LampArbiter>,
    /// Device bundle.
    pub hardware: Hardware,
    /// Frame naming per arm.
    pub frames: ArmPair<FrameNamer>,
    /// Serialises load/modify/save of the DAY_CALIBRATE store.
    pub calibration_store: Mutex<()>,
}

impl ServerContext {
    /// Load persisted state and wire up shared components.
    pub fn new(config: ServerConfig, hardware: Hardware) -> Result<Self, PersistError> {
        let arms = Arc::new(ArmState::load(&config)?);
        let frames = config.arms.try_map_ref(|arm, settings| {
            FrameNamer::load(arm, &config.server.data_dir, config.resolve(&settings.multrun_file))
        })?;
        let lamps = Arc::new(LampArbiter::new(
            Arc::clone(&hardware.lamps),
            config.timing.abort_poll_interval,
        ));
        Ok(Self {
            config: Arc::new(config),
            arms,
            locks: ResourceLocks::new(),
            lamps,
            hardware,
            frames,
            calibration_store: Mutex::new(()),
        })
    }

    /// Frame namer of `arm`.
    pub fn frames(&self, arm: Arm) -> Option<&FrameNamer> {
        self.frames.get(arm)
    }
}
