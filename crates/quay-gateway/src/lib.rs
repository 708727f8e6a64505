//! HTTP/WebSocket gateway.

pub mod gateway;

pub use gateway::error::{ApiError, ApiResult};
pub use gateway::routes::build_router;
pub use gateway::state::{AppState, GatewayConfig};
pub use gateway::stores::{
    AlertRule, AlertStore, GroupStore, PluginEntry, PluginStore, TaskDef, TaskStore,
};
