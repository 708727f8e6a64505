//! Core primitives shared by every QuayNAS crate.
//!
//! Everything time- or entropy-shaped funnels through here so the rest of
//! the platform can be driven by a fake clock and a deterministic id
//! source in tests.

pub mod clock;
pub mod ids;
pub mod metrics;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{new_id, random_secret, random_token};
pub use metrics::{Metrics, MetricsSnapshot};
