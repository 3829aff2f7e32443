//! SSH key handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use deploy_api::{CreateSshKeyRequest, ListResponse, MessageResponse, UpdateSshKeyRequest};

use crate::errors::DeploydError;
use crate::models::ssh_key::SshKeyResponse;
use crate::server::auth::ProjectCaller;
use crate::server::state::ServerState;

pub async fn list_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
) -> Result<Json<ListResponse<SshKeyResponse>>, DeploydError> {
    Ok(Json(ListResponse::new(state.ssh_keys.list(&caller.project_id)?)))
}

pub async fn create_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateSshKeyRequest>,
) -> Result<(StatusCode, Json<SshKeyResponse>), DeploydError> {
    let key = state.ssh_keys.create(&caller.project_id, request)?;
    Ok((StatusCode::CREATED, Json(key)))
}

pub async fn get_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, key_id)): Path<(String, String)>,
) -> Result<Json<SshKeyResponse>, DeploydError> {
    Ok(Json(state.ssh_keys.get(&caller.project_id, &key_id)?))
}

pub async fn update_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, key_id)): Path<(String, String)>,
    Json(request): Json<UpdateSshKeyRequest>,
) -> Result<Json<SshKeyResponse>, DeploydError> {
    Ok(Json(state.ssh_keys.update(&caller.project_id, &key_id, request)?))
}

pub async fn delete_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, key_id)): Path<(String, String)>,
) -> Result<Json<MessageResponse>, DeploydError> {
    state.ssh_keys.delete(&caller.project_id, &key_id)?;
    Ok(Json(MessageResponse::new(format!("SSH key {} deleted", key_id))))
}
