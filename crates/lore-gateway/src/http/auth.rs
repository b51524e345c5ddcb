use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::app::AppState;
use crate::auth::{issue_token, CurrentUser};
use crate::envelope::{ApiError, ApiResult};
use lore_store::users::verify_password;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct UserDetail {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: String,
    pub status: i64,
    pub created_at: String,
}

impl From<lore_store::types::User> for UserDetail {
    fn from(user: lore_store::types::User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            role: user.role,
            status: user.status,
            created_at: user.created_at,
        }
    }
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<UserDetail>> {
    let user = state
        .users
        .create(&req.username, &req.email, &req.password)
        .map_err(|e| match e {
            lore_store::StoreError::Precondition(m) => ApiError::bad_request(m),
            lore_store::StoreError::Validation(m) => ApiError::bad_request(m),
            other => other.into(),
        })?;
    info!(username = %user.username, "user registered");
    Ok(Json(user.into()))
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub user: UserDetail,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let user = state
        .users
        .get_by_username(&req.username)?
        .ok_or_else(|| ApiError::unauthorized("invalid username or password"))?;

    if !verify_password(&req.password, &user.password_hash) {
        return Err(ApiError::unauthorized("invalid username or password"));
    }
    if user.status != 1 {
        return Err(ApiError::forbidden("user account is disabled"));
    }

    let token = issue_token(
        &state.config.security.jwt_secret,
        state.config.security.jwt_expire_hours,
        &user,
    )?;
    info!(username = %user.username, "user logged in");
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer",
        user: user.into(),
    }))
}

pub async fn me(CurrentUser(user): CurrentUser) -> Json<UserDetail> {
    Json(user.into())
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<TokenResponse>> {
    let token = issue_token(
        &state.config.security.jwt_secret,
        state.config.security.jwt_expire_hours,
        &user,
    )?;
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer",
        user: user.into(),
    }))
}
