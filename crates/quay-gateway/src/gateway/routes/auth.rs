//! Login, second-factor step, token rotation, logout, identity.

use crate::gateway::error::{ok, ApiError, ApiResult};
use crate::gateway::extract::{AuthUser, RealIp};
use crate::gateway::state::AppState;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use quay_auth::{FailureReason, LoginOutcome};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwoFactorRequest {
    pub pending_token: String,
    /// Cross-checked against the pending token's principal when present.
    #[serde(default)]
    pub user_id: Option<i64>,
    pub code: String,
    #[serde(default)]
    pub is_backup_code: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn outcome_to_response(outcome: LoginOutcome) -> ApiResult<Json<Value>> {
    match outcome {
        LoginOutcome::Success { tokens, principal } => Ok(ok(json!({
            "accessToken": tokens.access_token,
            "refreshToken": tokens.refresh_token,
            "expiresIn": tokens.expires_in,
            "user": principal,
        }))),
        LoginOutcome::RequiresTwoFactor {
            pending_token,
            principal_id,
        } => Ok(ok(json!({
            "requires2FA": true,
            "userId": principal_id,
            "pendingToken": pending_token,
        }))),
        LoginOutcome::Failure {
            reason,
            retry_after_secs,
        } => Err(match reason {
            FailureReason::Blocked => ApiError::blocked(retry_after_secs.unwrap_or(0)),
            FailureReason::DirectoryUnavailable => {
                ApiError::downstream("Directory service unavailable")
            }
            // Everything else is one opaque 401.
            _ => ApiError::unauthorized("Invalid credentials"),
        }),
    }
}

pub async fn login(
    State(state): State<AppState>,
    RealIp(ip): RealIp,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Json<Value>> {
    if !state.rate_limiter.check(
        &ip,
        state.clock.now_millis(),
        state.config.rate_limit_per_minute,
    ) {
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "Too many login requests",
        ));
    }
    let outcome = state
        .auth
        .login(&body.username, &body.password, &ip, user_agent(&headers).as_deref())
        .await?;
    outcome_to_response(outcome)
}

pub async fn login_2fa(
    State(state): State<AppState>,
    RealIp(ip): RealIp,
    headers: HeaderMap,
    Json(body): Json<TwoFactorRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .auth
        .verify_2fa(
            &body.pending_token,
            &body.code,
            body.is_backup_code,
            &ip,
            user_agent(&headers).as_deref(),
        )
        .await?;
    if let (Some(expected), LoginOutcome::Success { principal, .. }) = (body.user_id, &outcome) {
        if principal.id != expected {
            return Err(ApiError::unauthorized("Invalid credentials"));
        }
    }
    outcome_to_response(outcome)
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> ApiResult<Json<Value>> {
    let (tokens, principal) = state.auth.refresh(&body.refresh_token).await?;
    Ok(ok(json!({
        "accessToken": tokens.access_token,
        "refreshToken": tokens.refresh_token,
        "expiresIn": tokens.expires_in,
        "user": principal,
    })))
}

pub async fn logout(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(body): Json<RefreshRequest>,
) -> ApiResult<Json<Value>> {
    state.auth.logout(&body.refresh_token).await?;
    Ok(ok(json!({ "loggedOut": true })))
}

pub async fn me(State(state): State<AppState>, user: AuthUser) -> ApiResult<Json<Value>> {
    let principal = state
        .auth
        .principals()
        .get_by_id(user.principal_id())
        .await?
        .ok_or_else(|| ApiError::unauthorized("Principal no longer exists"))?;
    Ok(ok(principal.to_info()))
}
