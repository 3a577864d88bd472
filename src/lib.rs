//! Core library for the dual-arm spectrograph control server.
//!
//! The server accepts commands for two independently operating arms (RED and
//! BLUE) and drives their CCDs, focus stages and gratings, plus the hardware
//! the arms share: the calibration lamp bank, the telescope fold mirror and
//! the telescope focus offset.
//!
//! - [`dispatcher`] occupies an arm per command and contains handler failures
//! - [`state`] tracks which command owns each arm
//! - [`locks`] and [`lamp`] arbitrate the shared hardware
//! - [`handlers`] implement the commands
//! - [`calibration`] plans DAY_CALIBRATE within its time budget
//! - [`hardware`] defines the device capability traits and a simulated rig

pub mod arm;
pub mod calibration;
pub mod cancel;
pub mod command;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod frames;
pub mod handlers;
pub mod hardware;
pub mod lamp;
pub mod locks;
pub mod persist;
pub mod server;
pub mod state;
