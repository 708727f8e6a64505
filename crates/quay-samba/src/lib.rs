//! Samba AD domain controller supervision.

pub mod samba;

pub use samba::supervisor::{SambaConfig, SambaSupervisor};
pub use samba::tool::SambaTool;
pub use samba::types::*;
