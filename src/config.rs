//! Boot configuration.
//!
//! YAML file plus environment overrides. Secret material can be injected
//! through `VPN_`-prefixed variables (the legacy prefix predates the
//! product rename and stays for compatibility with existing installs).

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },
    #[error("config file {path} is malformed: {source}")]
    Malformed {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthSection,
    pub security: SecuritySection,
    pub audit: AuditSection,
    pub gateway: GatewaySection,
    pub supervisors: SupervisorsSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthSection::default(),
            security: SecuritySection::default(),
            audit: AuditSection::default(),
            gateway: GatewaySection::default(),
            supervisors: SupervisorsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// `production` or `development`; controls log defaults only.
    pub mode: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            mode: "production".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/quaynas/quaynas.db".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSection {
    pub jwt_secret: String,
    pub access_ttl_mins: i64,
    pub refresh_ttl_days: i64,
    pub min_verify_ms: u64,
    pub pending_ttl_mins: i64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            access_ttl_mins: 15,
            refresh_ttl_days: 14,
            min_verify_ms: 250,
            pending_ttl_mins: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecuritySection {
    pub max_attempts: u32,
    pub window_mins: u64,
    pub block_mins: u64,
    pub cleanup_mins: u64,
    pub retention_days: u32,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_mins: 15,
            block_mins: 15,
            cleanup_mins: 60,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditSection {
    pub buffer: usize,
    pub retention_days: u32,
    /// Optional mirror file for the structured access log.
    pub log_path: Option<String>,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            buffer: 1024,
            retention_days: 90,
            log_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySection {
    pub request_timeout_secs: u64,
    pub cors_origins: Vec<String>,
    pub rate_limit_per_minute: u32,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            cors_origins: Vec::new(),
            rate_limit_per_minute: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorsSection {
    pub samba: SambaSection,
    pub asterisk: AsteriskSection,
    pub wireguard: WireGuardSection,
    pub openvpn: OpenVpnSection,
    pub pptp: ChapSection,
    pub l2tp: L2tpSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SambaSection {
    pub enabled: bool,
    /// Boot aborts (exit 3) when a mandatory supervisor fails to start.
    pub mandatory: bool,
    pub manage_process: bool,
    pub program: String,
    pub tool_program: String,
}

impl Default for SambaSection {
    fn default() -> Self {
        Self {
            enabled: false,
            mandatory: false,
            manage_process: true,
            program: "samba".into(),
            tool_program: "samba-tool".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AsteriskSection {
    pub enabled: bool,
    pub mandatory: bool,
    pub manage_process: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
}

impl Default for AsteriskSection {
    fn default() -> Self {
        Self {
            enabled: false,
            mandatory: false,
            manage_process: true,
            host: "127.0.0.1".into(),
            port: 5038,
            username: "quaynas".into(),
            secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WireGuardSection {
    pub enabled: bool,
    pub mandatory: bool,
    pub interface: String,
    pub listen_port: u16,
    pub address: String,
    pub endpoint: String,
    pub dns: Option<String>,
    pub config_path: String,
    pub private_key_path: String,
}

impl Default for WireGuardSection {
    fn default() -> Self {
        Self {
            enabled: false,
            mandatory: false,
            interface: "wg0".into(),
            listen_port: 51820,
            address: "10.8.0.1/24".into(),
            endpoint: String::new(),
            dns: None,
            config_path: "/etc/wireguard/wg0.conf".into(),
            private_key_path: "/etc/wireguard/wg0.key".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenVpnSection {
    pub enabled: bool,
    pub mandatory: bool,
    pub manage_process: bool,
    pub mgmt_host: String,
    pub mgmt_port: u16,
    pub ca_program: String,
}

impl Default for OpenVpnSection {
    fn default() -> Self {
        Self {
            enabled: false,
            mandatory: false,
            manage_process: true,
            mgmt_host: "127.0.0.1".into(),
            mgmt_port: 7505,
            ca_program: "easyrsa".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChapSection {
    pub enabled: bool,
    pub mandatory: bool,
    pub manage_process: bool,
    pub secrets_path: String,
}

impl Default for ChapSection {
    fn default() -> Self {
        Self {
            enabled: false,
            mandatory: false,
            manage_process: true,
            secrets_path: "/etc/ppp/chap-secrets".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct L2tpSection {
    pub enabled: bool,
    pub mandatory: bool,
    pub manage_process: bool,
    pub secrets_path: String,
    /// IPsec preshared key; normally injected via `VPN_L2TP_PSK`.
    pub psk: String,
}

impl Default for L2tpSection {
    fn default() -> Self {
        Self {
            enabled: false,
            mandatory: false,
            manage_process: true,
            secrets_path: "/etc/ppp/chap-secrets".into(),
            psk: String::new(),
        }
    }
}

impl AppConfig {
    /// Load from a YAML file (optional) and apply environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::Unreadable {
                        path: path.to_string(),
                        source,
                    }
                })?;
                serde_yaml::from_str(&raw).map_err(|source| ConfigError::Malformed {
                    path: path.to_string(),
                    source,
                })?
            }
            None => AppConfig::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        if let Some(host) = env("VPN_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env("VPN_SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(path) = env("VPN_DB_PATH") {
            self.database.path = path;
        }
        if let Some(secret) = env("VPN_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(psk) = env("VPN_L2TP_PSK") {
            self.supervisors.l2tp.psk = psk;
        }
        if let Some(secret) = env("VPN_AMI_SECRET") {
            self.supervisors.asterisk.secret = secret;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.len() < 16 {
            return Err(ConfigError::Invalid(
                "auth.jwt_secret must be set (at least 16 characters); \
                 use the config file or VPN_JWT_SECRET"
                    .into(),
            ));
        }
        if self.supervisors.l2tp.enabled && self.supervisors.l2tp.psk.is_empty() {
            return Err(ConfigError::Invalid(
                "supervisors.l2tp.psk must be set when l2tp is enabled \
                 (config file or VPN_L2TP_PSK)"
                    .into(),
            ));
        }
        if self.security.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "security.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
