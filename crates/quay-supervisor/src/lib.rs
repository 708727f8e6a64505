//! Uniform supervision fabric for the protocol daemons.

pub mod supervisor;

pub use supervisor::error::{SupervisorError, SupervisorErrorKind, SupervisorResult};
pub use supervisor::events::{EventHub, EventStream};
pub use supervisor::health::{spawn_health_loop, HealthConfig};
pub use supervisor::process::DaemonProcess;
pub use supervisor::registry::SupervisorRegistry;
pub use supervisor::state::{StartDisposition, StateCell};
pub use supervisor::supervisor::Supervisor;
pub use supervisor::types::*;
