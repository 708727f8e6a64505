//! Request extractors: real client ip, authenticated principal, admin
//! gate.

use crate::gateway::error::ApiError;
use crate::gateway::state::AppState;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use quay_auth::{Claims, Role};

/// Client address after forwarding-header resolution; inserted by the
/// real-ip middleware.
#[derive(Debug, Clone)]
pub struct RealIp(pub String);

#[async_trait]
impl FromRequestParts<AppState> for RealIp {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RealIp>()
            .cloned()
            .ok_or_else(ApiError::internal)
    }
}

/// Per-request id; inserted by the request-id middleware and carried into
/// audit records.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// A caller with a valid access token.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl AuthUser {
    pub fn username(&self) -> &str {
        &self.0.username
    }

    pub fn principal_id(&self) -> i64 {
        self.0.sub
    }

    pub fn is_admin(&self) -> bool {
        self.0.role.is_admin()
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;
        let claims = state
            .auth
            .verify_access(&token)
            .map_err(|_| ApiError::unauthorized("Invalid or expired token"))?;
        Ok(AuthUser(claims))
    }
}

/// An authenticated administrator; every wide-blast mutation takes this.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

impl std::ops::Deref for AdminUser {
    type Target = AuthUser;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if user.0.role != Role::Admin {
            return Err(ApiError::forbidden("Administrator role required"));
        }
        Ok(AdminUser(user))
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let token = header.strip_prefix("Bearer ").or_else(|| header.strip_prefix("bearer "))?;
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
