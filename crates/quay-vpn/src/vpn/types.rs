//! VPN entity types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VpnProtocol {
    WireGuard,
    OpenVpn,
    Pptp,
    L2tp,
}

impl VpnProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            VpnProtocol::WireGuard => "wireguard",
            VpnProtocol::OpenVpn => "openvpn",
            VpnProtocol::Pptp => "pptp",
            VpnProtocol::L2tp => "l2tp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "wireguard" => Some(VpnProtocol::WireGuard),
            "openvpn" => Some(VpnProtocol::OpenVpn),
            "pptp" => Some(VpnProtocol::Pptp),
            "l2tp" => Some(VpnProtocol::L2tp),
            _ => None,
        }
    }
}

/// A WireGuard peer. The private key is generated at creation, handed to
/// the caller once inside the rendered client config, and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireGuardPeer {
    pub id: String,
    pub name: String,
    pub principal: Option<String>,
    /// base64, unique within the protocol.
    pub public_key: String,
    pub allowed_ips: String,
    /// Server-side secret; present only when the peer was created with
    /// a preshared key.
    #[serde(skip_serializing, default)]
    pub preshared_key: Option<String>,
    pub enabled: bool,
    pub created_at: i64,
}

/// An issued OpenVPN client certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenVpnCert {
    pub id: String,
    /// Unique within the protocol.
    pub common_name: String,
    pub serial: String,
    /// Validity end, epoch millis.
    pub not_after: i64,
    pub revoked: bool,
    pub created_at: i64,
}

/// A PPTP or L2TP account projected into chap-secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapAccount {
    pub id: String,
    pub protocol: VpnProtocol,
    /// Unique per protocol.
    pub username: String,
    #[serde(skip_serializing, default)]
    pub secret: String,
    pub enabled: bool,
    pub created_at: i64,
}

/// One live tunnel. Open while `disconnected_at` is unset; byte counters
/// are monotonic while open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnConnection {
    pub id: String,
    pub principal: Option<String>,
    pub protocol: VpnProtocol,
    pub client_ip: String,
    pub connected_at: i64,
    pub disconnected_at: Option<i64>,
    pub bytes_rx: i64,
    pub bytes_tx: i64,
}
