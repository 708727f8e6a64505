//! Directory-service settings. The bind password is write-only: it is
//! accepted on PUT and never echoed back.

use crate::gateway::error::{ok, ApiResult};
use crate::gateway::extract::AdminUser;
use crate::gateway::state::AppState;
use axum::extract::State;
use axum::Json;
use quay_auth::DirectoryConfig;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryConfigRequest {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub base_dn: String,
    pub bind_dn: String,
    /// Absent means "keep the stored one".
    #[serde(default)]
    pub bind_password: Option<String>,
    pub user_filter: String,
    pub group_filter: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub skip_verify: bool,
}

fn redacted(config: &DirectoryConfig) -> Value {
    json!({
        "enabled": config.enabled,
        "host": config.host,
        "port": config.port,
        "baseDn": config.base_dn,
        "bindDn": config.bind_dn,
        "bindPasswordSet": !config.bind_password_enc.is_empty(),
        "userFilter": config.user_filter,
        "groupFilter": config.group_filter,
        "useTls": config.use_tls,
        "skipVerify": config.skip_verify,
    })
}

pub async fn get_config(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<Json<Value>> {
    let config = state.auth.directory().snapshot().await;
    Ok(ok(redacted(&config)))
}

pub async fn put_config(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(body): Json<DirectoryConfigRequest>,
) -> ApiResult<Json<Value>> {
    let new_config = DirectoryConfig {
        enabled: body.enabled,
        host: body.host,
        port: body.port,
        base_dn: body.base_dn,
        bind_dn: body.bind_dn,
        bind_password_enc: String::new(),
        user_filter: body.user_filter,
        group_filter: body.group_filter,
        use_tls: body.use_tls,
        skip_verify: body.skip_verify,
    };
    state
        .auth
        .directory()
        .update_config(new_config, body.bind_password.as_deref())
        .await?;
    let config = state.auth.directory().snapshot().await;
    Ok(ok(redacted(&config)))
}

pub async fn test_bind(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<Json<Value>> {
    state.auth.directory().test_bind().await?;
    Ok(ok(json!({ "bound": true })))
}
