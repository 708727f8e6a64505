//! Asterisk manager (AMI) protocol client and supervisor.

pub mod ami;

pub use ami::client::AmiClient;
pub use ami::protocol::{AmiCodec, AmiMessage};
pub use ami::supervisor::AsteriskSupervisor;
pub use ami::types::{AmiConfig, AsteriskCommand, PeerEntry};
