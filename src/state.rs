//! Per-arm command and configuration state.
//!
//! [`ArmState`] records which command owns each arm, its progress, and what
//! the last CONFIG left behind. Occupying an arm yields an [`ArmClaim`]; the
//! slot is cleared when the claim is dropped, so every exit path of a
//! handler (success, error, abort, panic) frees the arm.

use crate::arm::{Arm, ArmPair, PerArm};
use crate::cancel::AbortToken;
use crate::command::{Command, CommandKind, Resolution};
use crate::config::ServerConfig;
use crate::error::{CommandError, HandlerResult, PersistError};
use crate::persist::PersistentCounter;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Configuration name before the first CONFIG.
pub const UNKNOWN_CONFIG: &str = "UNKNOWN";

/// The command currently occupying an arm.
#[derive(Clone, Debug)]
pub struct CommandTicket {
    /// Unique id of this invocation.
    pub id: Uuid,
    /// Command kind.
    pub kind: CommandKind,
    /// When the command was claimed.
    pub started_at: DateTime<Utc>,
    /// Cancellation handle used by ABORT.
    pub abort: AbortToken,
}

/// What the last CONFIG stored for an arm.
#[derive(Clone, Debug, PartialEq)]
pub struct ArmConfiguration {
    /// Configuration name.
    pub name: String,
    /// Grating resolution, once configured.
    pub resolution: Option<Resolution>,
    /// Lamp flat before MULTRUN.
    pub calibrate_before: bool,
    /// Lamp flat after MULTRUN.
    pub calibrate_after: bool,
}

impl Default for ArmConfiguration {
    fn default() -> Self {
        Self {
            name: UNKNOWN_CONFIG.to_string(),
            resolution: None,
            calibrate_before: false,
            calibrate_after: false,
        }
    }
}

#[derive(Debug, Default)]
struct ArmSlot {
    current: Option<CommandTicket>,
    exposure_count: u32,
    exposure_number: u32,
    exposure_filename: Option<String>,
    configuration: ArmConfiguration,
}

/// Serializable view of one arm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArmSnapshot {
    /// Arm.
    pub arm: Arm,
    /// Command occupying the arm.
    pub current_command: Option<CommandKind>,
    /// When it started.
    pub command_started_at: Option<DateTime<Utc>>,
    /// Frames planned by the current (or last) command.
    pub exposure_count: u32,
    /// Frames taken so far.
    pub exposure_number: u32,
    /// Last frame written.
    pub exposure_filename: Option<String>,
    /// Persisted config id.
    pub config_id: i64,
    /// Configuration name.
    pub config_name: String,
    /// Grating resolution.
    pub resolution: Option<Resolution>,
    /// Lamp flat before MULTRUN.
    pub calibrate_before: bool,
    /// Lamp flat after MULTRUN.
    pub calibrate_after: bool,
}

/// Shared per-arm state.
#[derive(Debug)]
pub struct ArmState {
    slots: Mutex<PerArm<ArmSlot>>,
    config_ids: ArmPair<PersistentCounter>,
}

impl ArmState {
    /// Create state around already-loaded config-id counters.
    pub fn new(config_ids: ArmPair<PersistentCounter>) -> Self {
        Self {
            slots: Mutex::new(PerArm::default()),
            config_ids,
        }
    }

    /// Load the config-id counters named in `config`.
    pub fn load(config: &ServerConfig) -> Result<Self, PersistError> {
        let config_ids = config
            .arms
            .try_map_ref(|_, arm| PersistentCounter::load(config.resolve(&arm.config_id_file)))?;
        Ok(Self::new(config_ids))
    }

    /// Whether `command` may start now: interrupts always may, anything
    /// else only when its arm is idle.
    pub fn command_can_be_run(&self, command: &Command) -> bool {
        command.kind().is_interrupt() || self.slots.lock()[command.arm()].current.is_none()
    }

    /// Occupy the arm `command` targets. Checking and recording happen under
    /// one lock, so two submissions cannot both win.
    pub fn claim(self: &Arc<Self>, command: &Command) -> HandlerResult<ArmClaim> {
        let arm = command.arm();
        let kind = command.kind();
        let mut slots = self.slots.lock();
        let slot = &mut slots[arm];
        if let Some(running) = &slot.current {
            return Err(CommandError::Conflict {
                arm,
                running: running.kind,
            });
        }
        let ticket = CommandTicket {
            id: Uuid::new_v4(),
            kind,
            started_at: Utc::now(),
            abort: AbortToken::new(),
        };
        debug!(%arm, command = %kind, ticket = %ticket.id, "Arm claimed");
        let claim = ArmClaim {
            state: Arc::clone(self),
            arm,
            kind,
            id: ticket.id,
            abort: ticket.abort.clone(),
        };
        slot.current = Some(ticket);
        slot.exposure_count = 0;
        slot.exposure_number = 0;
        Ok(claim)
    }

    fn release(&self, arm: Arm, id: Uuid) {
        let mut slots = self.slots.lock();
        let slot = &mut slots[arm];
        if slot.current.as_ref().is_some_and(|t| t.id == id) {
            slot.current = None;
            debug!(%arm, ticket = %id, "Arm released");
        }
    }

    /// Command occupying `arm`.
    pub fn current(&self, arm: Arm) -> Option<CommandTicket> {
        self.slots.lock()[arm].current.clone()
    }

    /// Signal the command occupying `arm`. Returns its kind, or `None` when
    /// the arm was idle.
    pub fn abort(&self, arm: Arm, reason: &str) -> Option<CommandKind> {
        let slots = self.slots.lock();
        let ticket = slots[arm].current.as_ref()?;
        ticket.abort.abort(reason);
        Some(ticket.kind)
    }

    /// Record frame progress.
    pub fn set_exposure_progress(&self, arm: Arm, number: u32, count: u32) {
        let mut slots = self.slots.lock();
        slots[arm].exposure_number = number;
        slots[arm].exposure_count = count;
    }

    /// Record the last frame written.
    pub fn set_exposure_filename(&self, arm: Arm, filename: &Path) {
        self.slots.lock()[arm].exposure_filename = Some(filename.display().to_string());
    }

    /// What the last CONFIG stored.
    pub fn configuration(&self, arm: Arm) -> ArmConfiguration {
        self.slots.lock()[arm].configuration.clone()
    }

    /// Store a completed CONFIG.
    pub fn set_configuration(&self, arm: Arm, configuration: ArmConfiguration) {
        self.slots.lock()[arm].configuration = configuration;
    }

    /// Forget the configuration name after something else changed the
    /// detector geometry. Resolution and calibrate flags are kept.
    pub fn invalidate_configuration(&self, arm: Arm) {
        self.slots.lock()[arm].configuration.name = UNKNOWN_CONFIG.to_string();
    }

    /// Increment and persist the config id of `arm`.
    pub fn increment_config_id(&self, arm: Arm) -> Option<Result<i64, PersistError>> {
        self.config_ids.get(arm).map(PersistentCounter::increment)
    }

    /// Persisted config id of `arm` (0 for [`Arm::None`]).
    pub fn config_id(&self, arm: Arm) -> i64 {
        self.config_ids.get(arm).map_or(0, PersistentCounter::get)
    }

    /// Status view of `arm`.
    pub fn snapshot(&self, arm: Arm) -> ArmSnapshot {
        let config_id = self.config_id(arm);
        let slots = self.slots.lock();
        let slot = &slots[arm];
        ArmSnapshot {
            arm,
            current_command: slot.current.as_ref().map(|t| t.kind),
            command_started_at: slot.current.as_ref().map(|t| t.started_at),
            exposure_count: slot.exposure_count,
            exposure_number: slot.exposure_number,
            exposure_filename: slot.exposure_filename.clone(),
            config_id,
            config_name: slot.configuration.name.clone(),
            resolution: slot.configuration.resolution,
            calibrate_before: slot.configuration.calibrate_before,
            calibrate_after: slot.configuration.calibrate_after,
        }
    }
}

/// Occupancy of one arm slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct ArmClaim {
    state: Arc<ArmState>,
    arm: Arm,
    kind: CommandKind,
    id: Uuid,
    abort: AbortToken,
}

impl ArmClaim {
    /// Arm held.
    pub fn arm(&self) -> Arm {
        self.arm
    }

    /// Command kind holding it.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Ticket id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Token ABORT signals for this command.
    pub fn abort_token(&self) -> &AbortToken {
        &self.abort
    }
}

impl Drop for ArmClaim {
    fn drop(&mut self) {
        self.state.release(self.arm, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{AbortCommand, GetStatusCommand, MultrunCommand};

    fn state() -> (tempfile::TempDir, Arc<ArmState>) {
        let dir = tempfile::tempdir().unwrap();
        let counters = ArmPair::new(
            PersistentCounter::load(dir.path().join("red.config_id")).unwrap(),
            PersistentCounter::load(dir.path().join("blue.config_id")).unwrap(),
        );
        (dir, Arc::new(ArmState::new(counters)))
    }

    fn multrun(arm: Arm) -> Command {
        Command::Multrun(MultrunCommand {
            arm,
            exposure_length_ms: 1000,
            count: 1,
            standard: false,
        })
    }

    #[test]
    fn test_busy_arm_rejects_non_interrupts() {
        let (_dir, state) = state();
        let claim = state.claim(&multrun(Arm::Red)).unwrap();
        assert!(!state.command_can_be_run(&multrun(Arm::Red)));
        assert!(state.command_can_be_run(&multrun(Arm::Blue)));
        assert!(state.command_can_be_run(&Command::Abort(AbortCommand { arm: Some(Arm::Red) })));
        assert!(state.command_can_be_run(&Command::GetStatus(GetStatusCommand::default())));
        assert!(matches!(
            state.claim(&multrun(Arm::Red)),
            Err(CommandError::Conflict { arm: Arm::Red, running: CommandKind::Multrun })
        ));
        drop(claim);
        assert!(state.command_can_be_run(&multrun(Arm::Red)));
        assert!(state.current(Arm::Red).is_none());
    }

    #[test]
    fn test_abort_signals_current_token() {
        let (_dir, state) = state();
        let claim = state.claim(&multrun(Arm::Blue)).unwrap();
        assert_eq!(state.abort(Arm::Red, "nothing running"), None);
        assert_eq!(state.abort(Arm::Blue, "operator"), Some(CommandKind::Multrun));
        assert!(claim.abort_token().is_aborted());
    }

    #[test]
    fn test_config_id_and_snapshot() {
        let (_dir, state) = state();
        assert_eq!(state.snapshot(Arm::Red).config_name, UNKNOWN_CONFIG);
        assert_eq!(state.increment_config_id(Arm::Red).unwrap().unwrap(), 1);
        assert!(state.increment_config_id(Arm::None).is_none());
        state.set_configuration(
            Arm::Red,
            ArmConfiguration {
                name: "red-low".to_string(),
                resolution: Some(Resolution::Low),
                calibrate_before: true,
                calibrate_after: false,
            },
        );
        let snapshot = state.snapshot(Arm::Red);
        assert_eq!(snapshot.config_id, 1);
        assert_eq!(snapshot.config_name, "red-low");
        assert!(snapshot.calibrate_before);

        state.invalidate_configuration(Arm::Red);
        assert_eq!(state.configuration(Arm::Red).name, UNKNOWN_CONFIG);
        assert_eq!(state.configuration(Arm::Red).resolution, Some(Resolution::Low));
    }
}
