//! Caller authentication for project-scoped routes

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path},
    http::{header, request::Parts},
};
use tracing::debug;

use crate::authn::caller_token::CallerClaims;
use crate::errors::DeploydError;
use crate::server::state::ServerState;

/// A verified caller allowed to operate on the `project_id` in the path
#[derive(Debug, Clone)]
pub struct ProjectCaller {
    pub claims: CallerClaims,
    pub project_id: String,
}

fn bearer_token(parts: &Parts) -> Result<&str, DeploydError> {
    let value = parts
        .headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| DeploydError::AuthError("Missing Authorization header".to_string()))?
        .to_str()
        .map_err(|_| DeploydError::AuthError("Malformed Authorization header".to_string()))?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| DeploydError::AuthError("Expected a Bearer token".to_string()))
}

impl FromRequestParts<Arc<ServerState>> for ProjectCaller {
    type Rejection = DeploydError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<ServerState>) -> Result<Self, Self::Rejection> {
        let claims = state.verifier.verify(bearer_token(parts)?)?;

        let Path(params) = Path::<HashMap<String, String>>::from_request_parts(parts, state)
            .await
            .map_err(|e| DeploydError::ValidationError(e.body_text()))?;
        let project_id = params
            .get("project_id")
            .cloned()
            .ok_or_else(|| DeploydError::ValidationError("Missing project_id".to_string()))?;

        claims.authorize(&project_id)?;
        debug!(sub = %claims.sub, project_id, "caller authorized");
        Ok(Self { claims, project_id })
    }
}
