pub mod command;
pub mod config;
pub mod humidity;
pub mod topics;
pub mod transition;
pub mod types;

pub use command::{CommandError, CommandSender, CommandType, DeviceCommand};
pub use config::{CommandMapping, RuntimeConfig, SharedMapping, TransitionConfig};
pub use topics::*;
pub use transition::HumidifierController;
pub use types::{HumidifierState, HumidifierStatePayload, HumidifierStatus, RawActive, TransitionPhase};
