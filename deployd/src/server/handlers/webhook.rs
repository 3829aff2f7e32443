//! Public GitHub webhook endpoint

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use tracing::info;

use deploy_api::WebhookResponse;

use crate::errors::DeploydError;
use crate::github::webhook::{EVENT_HEADER, SIGNATURE_HEADER};
use crate::server::state::ServerState;

/// Webhook handler. Authenticated by the delivery signature, not a caller token.
pub async fn webhook_handler(
    State(state): State<Arc<ServerState>>,
    Path(repo_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, DeploydError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let delivery = header("x-github-delivery").unwrap_or("-");
    info!(repo_id = %repo_id, delivery, event = header(EVENT_HEADER), "webhook received");

    let outcome = state
        .webhooks
        .handle(&repo_id, header(EVENT_HEADER), header(SIGNATURE_HEADER), &body)?;
    Ok(Json(outcome.into()))
}
