//! GET_STATUS.

use super::CommandRun;
use crate::arm::Arm;
use crate::command::{ArmHardwareStatus, DonePayload, GetStatusCommand, StatusReport};
use crate::error::HandlerResult;
use futures::future::join_all;
use tracing::warn;

async fn hardware_status(run: &CommandRun, arm: Arm) -> ArmHardwareStatus {
    let hardware = &run.ctx.hardware;
    let ccd_temperature = match hardware.ccd(arm) {
        Some(ccd) => ccd
            .temperature()
            .await
            .map_err(|err| warn!(%arm, error = %format!("{err:#}"), "CCD temperature unavailable"))
            .ok(),
        None => None,
    };
    let focus_position = match hardware.focus(arm) {
        Some(stage) => stage
            .position()
            .await
            .map_err(|err| warn!(%arm, error = %format!("{err:#}"), "Focus position unavailable"))
            .ok(),
        None => None,
    };
    ArmHardwareStatus {
        arm,
        ccd_temperature,
        focus_position,
    }
}

async fn plc_fault_status(run: &CommandRun) -> Option<u32> {
    run.ctx
        .hardware
        .plc
        .fault_status()
        .await
        .map_err(|err| warn!(error = %format!("{err:#}"), "PLC fault status unavailable"))
        .ok()
}

/// Names from the configured bank that the lamp controller reports lit.
async fn lamps_lit(run: &CommandRun) -> Vec<String> {
    let lamps = &run.ctx.hardware.lamps;
    let names = &run.ctx.config.lamp_bank.names;
    let states = join_all(names.iter().map(|name| lamps.is_on(name))).await;
    names
        .iter()
        .zip(states)
        .filter_map(|(name, state)| match state {
            Ok(lit) => lit.then(|| name.clone()),
            Err(err) => {
                warn!(lamp = %name, error = %format!("{err:#}"), "Lamp state unavailable");
                None
            }
        })
        .collect()
}

pub(super) async fn handle(run: &CommandRun, command: GetStatusCommand) -> HandlerResult<DonePayload> {
    let arms = Arm::PHYSICAL.iter().map(|&arm| run.ctx.arms.snapshot(arm)).collect();
    let mut report = StatusReport {
        arms,
        lamp: run.ctx.lamps.holder(),
        ..Default::default()
    };
    if command.hardware {
        let (hardware, plc, lit) = futures::join!(
            join_all(Arm::PHYSICAL.iter().map(|&arm| hardware_status(run, arm))),
            plc_fault_status(run),
            lamps_lit(run),
        );
        report.hardware = hardware;
        report.plc_fault_status = plc;
        report.lamps_lit = lit;
    }
    Ok(DonePayload::Status(report))
}
