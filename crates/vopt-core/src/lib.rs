#![forbid(unsafe_code)]
//! VOpt engine core: the thread/zone model, data-vio state machines,
//! admin orchestration, and the host-facing device.

pub mod admin;
pub mod config;
pub mod device;
pub mod engine;
pub mod packer;
pub mod read_only;
pub mod super_block;
pub mod vio;

pub use admin::{suspend_phases, AdminOperation, AdminState, AdminStateMachine, SuspendPhase};
pub use config::{DeviceConfig, ThreadCountConfig};
pub use device::{ControlOp, ControlReply, VoptDevice};
pub use engine::{Engine, EngineStats, StatsSnapshot};
pub use read_only::{ReadOnlyListener, ReadOnlyNotifier};
pub use super_block::{
    FormatParams, SuperBlock, SUPER_VERSION_CURRENT, SUPER_VERSION_MAXIMUM, SUPER_VERSION_MINIMUM,
};
pub use vio::{Completion, DataVio, IoReply, VioOperation};
