use crate::server::AppState;
use axum::routing::post;
use axum::{Extension, Json};
use fl_gateway::MessageGateway;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct SendRequest {
    recipient: String,
    message: String,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/fareline/messages/send", post(send_message))
}

#[tracing::instrument(level = "info", skip_all)]
async fn send_message(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<SendRequest>,
) -> Json<serde_json::Value> {
    if let Err(e) = state.gateway.send_text(&req.recipient, &req.message).await {
        return Json(serde_json::json!({ "status": "error", "error": e.to_string() }));
    }
    Json(serde_json::json!({ "status": "ok" }))
}
