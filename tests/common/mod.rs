//! Shared setup for the integration tests.

#![allow(dead_code)]

use dualspec::arm::Arm;
use dualspec::command::{
    AckSender, Command, CommandDone, ConfigCommand, DetectorConfig, MultrunCommand, Resolution,
    SpectrographConfig, Window,
};
use dualspec::config::ServerConfig;
use dualspec::context::ServerContext;
use dualspec::dispatcher::CommandDispatcher;
use dualspec::hardware::mock::MockRig;
use dualspec::hardware::Hardware;
use std::sync::Arc;
use tempfile::TempDir;

/// A dispatcher on a simulated rig with state in a temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub rig: MockRig,
    pub dispatcher: CommandDispatcher,
}

impl Harness {
    /// Shared context.
    pub fn ctx(&self) -> &Arc<ServerContext> {
        self.dispatcher.context()
    }

    /// Submit `command`, discarding acknowledgements.
    pub async fn run(&self, command: Command) -> CommandDone {
        let acks = AckSender::discard(command.kind());
        self.dispatcher.submit(command, acks).await
    }

    /// Submit `command` on a separate task.
    pub fn spawn(&self, command: Command) -> tokio::task::JoinHandle<CommandDone> {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let acks = AckSender::discard(command.kind());
            dispatcher.submit(command, acks).await
        })
    }
}

/// Harness with default configuration.
pub fn harness() -> Harness {
    harness_with(ServerConfig::default())
}

/// Harness with `config`; its data directory is replaced by a temporary one.
pub fn harness_with(config: ServerConfig) -> Harness {
    let rig = MockRig::default();
    let hardware = rig.hardware();
    harness_on(config, rig, hardware)
}

/// Harness with a caller-assembled device bundle.
pub fn harness_on(mut config: ServerConfig, rig: MockRig, hardware: Hardware) -> Harness {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    config.server.data_dir = dir.path().to_path_buf();
    let ctx = ServerContext::new(config, hardware).expect("Failed to create context");
    Harness {
        dir,
        rig,
        dispatcher: CommandDispatcher::new(Arc::new(ctx)),
    }
}

/// CONFIG with the given binning and windows.
pub fn config_command(arm: Arm, x_bin: i32, y_bin: i32, windows: Vec<Window>) -> Command {
    Command::Config(ConfigCommand {
        arm,
        config: Some(SpectrographConfig {
            id: format!("{}-test", arm.key()),
            resolution: Resolution::Low,
            detector: DetectorConfig { x_bin, y_bin, windows },
            filters: Vec::new(),
            calibrate_before: false,
            calibrate_after: false,
        }),
    })
}

/// MULTRUN of `count` frames of `exposure_ms`.
pub fn multrun(arm: Arm, exposure_ms: u64, count: u32) -> Command {
    Command::Multrun(MultrunCommand {
        arm,
        exposure_length_ms: exposure_ms,
        count,
        standard: false,
    })
}
