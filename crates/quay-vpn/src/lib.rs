//! VPN stack supervision: WireGuard, OpenVPN, PPTP, and L2TP.

pub mod vpn;

pub use vpn::chap::{ChapSupervisor, ChapSupervisorConfig};
pub use vpn::error::{VpnError, VpnErrorKind, VpnResult};
pub use vpn::openvpn::{OpenVpnConfig, OpenVpnSupervisor};
pub use vpn::store::VpnStore;
pub use vpn::types::*;
pub use vpn::wireguard::{WireGuardConfig, WireGuardSupervisor};
