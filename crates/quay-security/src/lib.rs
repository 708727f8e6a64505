//! Failed-login telemetry and the IP-block engine.

pub mod security;

pub use security::error::{SecurityError, SecurityErrorKind, SecurityResult};
pub use security::service::{spawn_sweeper, FailedLoginService};
pub use security::store::SecurityStore;
pub use security::types::*;
