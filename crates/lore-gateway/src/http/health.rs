use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::app::AppState;

/// GET /health — process liveness.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /health/es — inverted index health. 503 when unreachable or running
/// on the degraded (standard) analyzer.
pub async fn health_es(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let reachable = state.index.health().await.is_ok();
    let degraded = state.index.is_degraded();

    if reachable && !degraded {
        (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "analyzer": "ik_max_word" })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": if reachable { "degraded" } else { "unreachable" },
                "analyzer": if degraded { "standard" } else { "ik_max_word" },
            })),
        )
    }
}
