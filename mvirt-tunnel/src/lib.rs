pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod inspector;
pub mod status;
pub mod store;
pub mod test_util;
pub mod tunnel;
pub mod validation;

pub use engine::{DeleteOutcome, TunnelEngine};
pub use error::TunnelError;
pub use tunnel::{TargetStatus, TunnelDescriptor, TunnelFields, TunnelKind, TunnelStatus};
