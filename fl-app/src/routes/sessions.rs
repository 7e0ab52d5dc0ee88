use crate::server::AppState;
use crate::session::SessionSummary;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/fareline/sessions", get(list_sessions))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_sessions(Extension(state): Extension<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.list())
}
