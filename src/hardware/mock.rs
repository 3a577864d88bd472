//! Mock Hardware Implementations
//!
//! Provides simulated devices for running the server and its tests without
//! the spectrograph. All mock devices use async-safe operations
//! (tokio::time::sleep, not std::thread::sleep).
//!
//! Devices built from one [`MockRig`] share its event log, fault table and
//! lamp state, so a test can assert on the exact hardware sequence a command
//! produced and inject a failure into any single call.
//!
//! # Performance Characteristics
//!
//! - MockCcd: exposure length plus `readout`, abortable
//! - MockFocusStage: 1 mm/sec motion speed
//! - MockPlc / MockTelescope: fixed `mechanism` / `telescope` latency

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::arm::{Arm, ArmPair};
use crate::command::Resolution;
use crate::hardware::capabilities::{
    CcdController, CcdGeometry, ExposureRequest, FocusStage, FrameMetadata, LampController, LampSet,
    Plc, ReducedFrame, ReductionPipeline, ShutterMode, Telescope,
};
use crate::hardware::Hardware;

/// One recorded hardware call.
#[derive(Clone, Debug, PartialEq)]
pub enum HardwareEvent {
    /// `setup_geometry`.
    Geometry {
        /// Arm.
        arm: Arm,
        /// Geometry pushed.
        geometry: CcdGeometry,
    },
    /// `expose` completed.
    Exposure {
        /// Arm.
        arm: Arm,
        /// Output file.
        filename: PathBuf,
        /// Shutter mode.
        shutter: ShutterMode,
        /// Exposure length.
        exposure: Duration,
    },
    /// `bias` completed.
    Bias {
        /// Arm.
        arm: Arm,
        /// Output file.
        filename: PathBuf,
    },
    /// CCD abort requested.
    CcdAbort(Arm),
    /// Grating moved.
    Grating {
        /// Arm.
        arm: Arm,
        /// Resolution.
        resolution: Resolution,
    },
    /// Focus stage moved.
    FocusMove {
        /// Arm.
        arm: Arm,
        /// Target position.
        position: f64,
    },
    /// Lamps switched on.
    LampOn(LampSet),
    /// Lamps switched off.
    LampOff(LampSet),
    /// Fold mirror moved.
    FoldMove(i32),
    /// Telescope focus offset.
    FocusOffset(f64),
    /// Autoguider started.
    AutoguiderStart,
    /// Autoguider stopped.
    AutoguiderStop,
    /// Frame reduced.
    Reduce {
        /// Arm.
        arm: Arm,
        /// Raw frame.
        filename: PathBuf,
    },
    /// Master bias built.
    MasterBias {
        /// Arm.
        arm: Arm,
        /// Number of input frames.
        frames: usize,
    },
}

/// A call that should fail the next time (and every time) it is made.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fault {
    /// `setup_geometry` on an arm.
    Geometry(Arm),
    /// `expose` / `bias` on an arm.
    Expose(Arm),
    /// `set_grating` for an arm.
    Grating(Arm),
    /// Focus-stage moves on an arm.
    Focus(Arm),
    /// Lamp on.
    LampOn,
    /// Lamp off.
    LampOff,
    /// Fold-mirror move.
    FoldMove,
    /// Telescope focus offset.
    FocusOffset,
    /// Autoguider start.
    AutoguiderStart,
    /// Frame reduction.
    Reduce,
    /// Master bias.
    MasterBias,
}

/// Latencies of the simulated devices.
#[derive(Clone, Debug)]
pub struct MockTiming {
    /// CCD readout after each exposure.
    pub readout: Duration,
    /// PLC mechanism moves.
    pub mechanism: Duration,
    /// Telescope requests.
    pub telescope: Duration,
    /// Focus-stage speed in mm/sec.
    pub focus_speed_mm_per_sec: f64,
}

impl Default for MockTiming {
    fn default() -> Self {
        Self {
            readout: Duration::from_millis(500),
            mechanism: Duration::from_millis(200),
            telescope: Duration::from_millis(100),
            focus_speed_mm_per_sec: 1.0,
        }
    }
}

#[derive(Default)]
struct RigState {
    events: Vec<HardwareEvent>,
    faults: HashSet<Fault>,
    lit: BTreeSet<String>,
    focus: HashMap<Arm, f64>,
    frame_focus: HashMap<PathBuf, f64>,
}

/// Shared state of a set of simulated devices.
#[derive(Clone)]
pub struct MockRig {
    state: Arc<Mutex<RigState>>,
    timing: MockTiming,
    best_focus: f64,
}

impl Default for MockRig {
    fn default() -> Self {
        Self::new(MockTiming::default())
    }
}

impl MockRig {
    /// Create a rig with the given latencies. Focus stages start at 1.0 mm,
    /// which is also where simulated seeing is best.
    pub fn new(timing: MockTiming) -> Self {
        Self {
            state: Arc::new(Mutex::new(RigState::default())),
            timing,
            best_focus: 1.0,
        }
    }

    /// Build a device bundle sharing this rig.
    pub fn hardware(&self) -> Hardware {
        let ccd = ArmPair::new(Arm::Red, Arm::Blue).map(|_, arm| {
            Arc::new(MockCcd::new(arm, self.clone())) as Arc<dyn CcdController>
        });
        let focus = ArmPair::new(Arm::Red, Arm::Blue).map(|_, arm| {
            Arc::new(MockFocusStage::new(arm, self.clone())) as Arc<dyn FocusStage>
        });
        Hardware {
            ccd,
            focus,
            plc: Arc::new(MockPlc { rig: self.clone() }),
            lamps: Arc::new(MockLamps { rig: self.clone() }),
            telescope: Arc::new(MockTelescope { rig: self.clone() }),
            pipeline: Arc::new(MockPipeline { rig: self.clone() }),
        }
    }

    /// Make every subsequent call matching `fault` fail.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.insert(fault);
    }

    /// Remove an injected fault.
    pub fn clear(&self, fault: Fault) {
        self.state.lock().faults.remove(&fault);
    }

    /// All recorded calls in order.
    pub fn events(&self) -> Vec<HardwareEvent> {
        self.state.lock().events.clone()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&HardwareEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| pred(e)).count()
    }

    /// Lamps currently lit.
    pub fn lit_lamps(&self) -> Vec<String> {
        self.state.lock().lit.iter().cloned().collect()
    }

    fn record(&self, event: HardwareEvent) {
        debug!(?event, "Mock hardware call");
        self.state.lock().events.push(event);
    }

    fn check(&self, fault: Fault) -> Result<()> {
        if self.state.lock().faults.contains(&fault) {
            bail!("simulated fault: {fault:?}");
        }
        Ok(())
    }
}

// =============================================================================
// MockCcd - Simulated CCD controller
// =============================================================================

/// Simulated CCD controller for one arm.
pub struct MockCcd {
    arm: Arm,
    rig: MockRig,
    abort: Notify,
}

impl MockCcd {
    /// Create a controller for `arm` on `rig`.
    pub fn new(arm: Arm, rig: MockRig) -> Self {
        Self {
            arm,
            rig,
            abort: Notify::new(),
        }
    }

    async fn integrate(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = sleep(duration) => Ok(()),
            _ = self.abort.notified() => bail!("{} exposure aborted", self.arm),
        }
    }
}

#[async_trait]
impl CcdController for MockCcd {
    async fn setup_geometry(&self, geometry: &CcdGeometry) -> Result<()> {
        self.rig.check(Fault::Geometry(self.arm))?;
        sleep(Duration::from_millis(10)).await;
        self.rig.record(HardwareEvent::Geometry {
            arm: self.arm,
            geometry: geometry.clone(),
        });
        Ok(())
    }

    async fn expose(&self, request: &ExposureRequest) -> Result<()> {
        self.rig.check(Fault::Expose(self.arm))?;
        self.integrate(request.exposure.saturating_add(self.rig.timing.readout)).await?;
        {
            let mut state = self.rig.state.lock();
            if let Some(position) = state.focus.get(&self.arm).copied() {
                state.frame_focus.insert(request.filename.clone(), position);
            }
        }
        self.rig.record(HardwareEvent::Exposure {
            arm: self.arm,
            filename: request.filename.clone(),
            shutter: request.shutter,
            exposure: request.exposure,
        });
        Ok(())
    }

    async fn bias(&self, filename: &Path, _metadata: &FrameMetadata) -> Result<()> {
        self.rig.check(Fault::Expose(self.arm))?;
        self.integrate(self.rig.timing.readout).await?;
        self.rig.record(HardwareEvent::Bias {
            arm: self.arm,
            filename: filename.to_path_buf(),
        });
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.rig.record(HardwareEvent::CcdAbort(self.arm));
        self.abort.notify_waiters();
        Ok(())
    }

    async fn temperature(&self) -> Result<f64> {
        Ok(-110.0)
    }
}

// =============================================================================
// MockFocusStage - Simulated focus stage
// =============================================================================

/// Simulated focus stage with speed-limited motion.
pub struct MockFocusStage {
    arm: Arm,
    rig: MockRig,
}

impl MockFocusStage {
    /// Create a stage for `arm` on `rig`, parked at the best-focus position.
    pub fn new(arm: Arm, rig: MockRig) -> Self {
        rig.state.lock().focus.insert(arm, rig.best_focus);
        Self { arm, rig }
    }
}

#[async_trait]
impl FocusStage for MockFocusStage {
    async fn move_absolute(&self, position: f64) -> Result<()> {
        self.rig.check(Fault::Focus(self.arm))?;
        let current = self.position().await?;
        let distance = (position - current).abs();
        let delay = Duration::from_secs_f64(distance / self.rig.timing.focus_speed_mm_per_sec);

        // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
        sleep(delay).await;

        self.rig.state.lock().focus.insert(self.arm, position);
        self.rig.record(HardwareEvent::FocusMove {
            arm: self.arm,
            position,
        });
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(self
            .rig
            .state
            .lock()
            .focus
            .get(&self.arm)
            .copied()
            .unwrap_or_default())
    }
}

// =============================================================================
// Shared devices
// =============================================================================

struct MockPlc {
    rig: MockRig,
}

#[async_trait]
impl Plc for MockPlc {
    async fn set_grating(&self, arm: Arm, resolution: Resolution) -> Result<()> {
        self.rig.check(Fault::Grating(arm))?;
        sleep(self.rig.timing.mechanism).await;
        self.rig.record(HardwareEvent::Grating { arm, resolution });
        Ok(())
    }

    async fn fault_status(&self) -> Result<u32> {
        Ok(0)
    }
}

struct MockLamps {
    rig: MockRig,
}

#[async_trait]
impl LampController for MockLamps {
    async fn turn_on(&self, lamps: &LampSet) -> Result<()> {
        self.rig.check(Fault::LampOn)?;
        sleep(self.rig.timing.mechanism).await;
        self.rig.state.lock().lit.extend(lamps.names().iter().cloned());
        self.rig.record(HardwareEvent::LampOn(lamps.clone()));
        Ok(())
    }

    async fn turn_off(&self, lamps: &LampSet) -> Result<()> {
        self.rig.check(Fault::LampOff)?;
        {
            let mut state = self.rig.state.lock();
            for name in lamps.names() {
                state.lit.remove(name);
            }
        }
        self.rig.record(HardwareEvent::LampOff(lamps.clone()));
        Ok(())
    }

    async fn is_on(&self, lamp: &str) -> Result<bool> {
        Ok(self.rig.state.lock().lit.contains(lamp))
    }
}

struct MockTelescope {
    rig: MockRig,
}

#[async_trait]
impl Telescope for MockTelescope {
    async fn move_fold(&self, position: i32) -> Result<()> {
        self.rig.check(Fault::FoldMove)?;
        sleep(self.rig.timing.telescope).await;
        self.rig.record(HardwareEvent::FoldMove(position));
        Ok(())
    }

    async fn offset_focus(&self, offset: f64) -> Result<()> {
        self.rig.check(Fault::FocusOffset)?;
        sleep(self.rig.timing.telescope).await;
        self.rig.record(HardwareEvent::FocusOffset(offset));
        Ok(())
    }

    async fn autoguider_start(&self) -> Result<()> {
        self.rig.check(Fault::AutoguiderStart)?;
        sleep(self.rig.timing.telescope).await;
        self.rig.record(HardwareEvent::AutoguiderStart);
        Ok(())
    }

    async fn autoguider_stop(&self) -> Result<()> {
        self.rig.record(HardwareEvent::AutoguiderStop);
        Ok(())
    }

    async fn fits_headers(&self) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::from([
            ("TELESCOP".to_string(), "Simulated".to_string()),
            ("AIRMASS".to_string(), "1.0".to_string()),
        ]))
    }
}

struct MockPipeline {
    rig: MockRig,
}

#[async_trait]
impl ReductionPipeline for MockPipeline {
    async fn reduce(&self, arm: Arm, filename: &Path) -> Result<ReducedFrame> {
        self.rig.check(Fault::Reduce)?;
        let focus = self.rig.state.lock().frame_focus.get(filename).copied();
        self.rig.record(HardwareEvent::Reduce {
            arm,
            filename: filename.to_path_buf(),
        });
        let stem = filename
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(ReducedFrame {
            filename: filename.with_file_name(format!("{}_reduced.fits", stem.trim_end_matches("_0"))),
            counts: 1000.0,
            seeing: focus.map(|p| 1.0 + (p - self.rig.best_focus).abs()),
            saturated: false,
        })
    }

    async fn make_master_bias(&self, arm: Arm, frames: &[PathBuf]) -> Result<PathBuf> {
        self.rig.check(Fault::MasterBias)?;
        self.rig.record(HardwareEvent::MasterBias {
            arm,
            frames: frames.len(),
        });
        Ok(PathBuf::from(format!("{}_master_bias.fits", arm.instrument_code())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_lamps_track_physical_state() {
        let rig = MockRig::default();
        let hardware = rig.hardware();
        let lamps = LampSet::parse("Xe,Ne").unwrap();
        hardware.lamps.turn_on(&lamps).await.unwrap();
        assert_eq!(rig.lit_lamps(), vec!["Ne".to_string(), "Xe".to_string()]);
        hardware.lamps.turn_off(&lamps).await.unwrap();
        assert!(rig.lit_lamps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_fault_fails_call() {
        let rig = MockRig::default();
        let hardware = rig.hardware();
        rig.inject(Fault::Grating(Arm::Blue));
        assert!(hardware.plc.set_grating(Arm::Blue, Resolution::Low).await.is_err());
        assert!(hardware.plc.set_grating(Arm::Red, Resolution::Low).await.is_ok());
        rig.clear(Fault::Grating(Arm::Blue));
        assert!(hardware.plc.set_grating(Arm::Blue, Resolution::Low).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_stage_moves() {
        let rig = MockRig::default();
        let hardware = rig.hardware();
        let stage = hardware.focus(Arm::Red).unwrap();
        stage.move_absolute(2.5).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 2.5);
        assert_eq!(
            rig.count(|e| matches!(e, HardwareEvent::FocusMove { arm: Arm::Red, .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_seeing_follows_focus() {
        let rig = MockRig::default();
        let hardware = rig.hardware();
        let ccd = hardware.ccd(Arm::Red).unwrap();
        hardware.focus(Arm::Red).unwrap().move_absolute(1.5).await.unwrap();
        let request = ExposureRequest {
            shutter: ShutterMode::Open,
            exposure: Duration::from_secs(1),
            filename: PathBuf::from("r_f_1.fits"),
            metadata: FrameMetadata::default(),
        };
        ccd.expose(&request).await.unwrap();
        let reduced = hardware.pipeline.reduce(Arm::Red, &request.filename).await.unwrap();
        assert_eq!(reduced.seeing, Some(1.5));
    }
}
