use crate::dispatch::IngestReceipt;
use crate::server::AppState;
use axum::routing::post;
use axum::{Extension, Json};
use fl_gateway::GatewayEnvelope;
use std::sync::Arc;

const WEBHOOK_GATEWAY_ID: &str = "webhook";

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/fareline/events", post(post_event))
}

/// Push-model ingestion: the same normalize/admit/enqueue path the poll
/// loop uses, so a gateway may deliver by webhook without risking double
/// processing.
#[tracing::instrument(level = "info", skip_all)]
async fn post_event(
    Extension(state): Extension<Arc<AppState>>,
    Json(envelope): Json<GatewayEnvelope>,
) -> Json<IngestReceipt> {
    let receipt = state
        .dispatcher
        .ingest_envelope(WEBHOOK_GATEWAY_ID, &envelope)
        .await;
    Json(receipt)
}
