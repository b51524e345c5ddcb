use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::app::AppState;
use crate::auth::AdminUser;
use crate::envelope::ApiResult;
use crate::http::auth::UserDetail;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<UserDetail>>> {
    let users = state.users.list(query.skip, query.limit.min(100))?;
    Ok(Json(users.into_iter().map(Into::into).collect()))
}
