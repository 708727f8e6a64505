//! Failed-attempt and IP-block records.

use serde::{Deserialize, Serialize};

/// One failed login attempt, append-only during the retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub id: String,
    pub username: String,
    pub ip: String,
    pub user_agent: Option<String>,
    /// Why the attempt failed (`bad_password`, `unknown_user`,
    /// `ip_blocked`, `bad_2fa_code`, ...).
    pub reason: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Set once the attempt was counted into a block.
    pub blocked: bool,
    pub blocked_at: Option<i64>,
}

/// An active or historical block for one source address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpBlock {
    pub id: String,
    pub ip: String,
    pub reason: String,
    pub attempt_count: i64,
    pub created_at: i64,
    pub expires_at: i64,
    pub active: bool,
    pub permanent: bool,
}

impl IpBlock {
    /// Seconds until a non-permanent block lapses (0 when already past).
    pub fn retry_after_secs(&self, now_ms: i64) -> i64 {
        if self.permanent {
            return i64::MAX;
        }
        ((self.expires_at - now_ms).max(0)) / 1000
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Failures within `window_secs` that trigger a block.
    pub max_attempts: u32,
    /// Sliding window over which attempts are counted, by timestamp.
    pub window_secs: u64,
    /// Lifetime of a non-permanent block.
    pub block_secs: u64,
    /// Background sweep period.
    pub cleanup_secs: u64,
    /// Failed-attempt retention.
    pub retention_days: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_secs: 15 * 60,
            block_secs: 15 * 60,
            cleanup_secs: 3600,
            retention_days: 30,
        }
    }
}
