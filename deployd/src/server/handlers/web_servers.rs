//! Web server handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use deploy_api::{
    ConnectionTestResponse, CreateWebServerRequest, DistributeKeyRequest, DistributeKeyResponse,
    ListResponse, MessageResponse, UpdateWebServerRequest,
};

use crate::errors::DeploydError;
use crate::models::web_server::WebServer;
use crate::server::auth::ProjectCaller;
use crate::server::state::ServerState;

pub async fn list_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
) -> Result<Json<ListResponse<WebServer>>, DeploydError> {
    Ok(Json(ListResponse::new(state.web_servers.list(&caller.project_id)?)))
}

pub async fn create_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateWebServerRequest>,
) -> Result<(StatusCode, Json<WebServer>), DeploydError> {
    let server = state.web_servers.create(&caller.project_id, request)?;
    Ok((StatusCode::CREATED, Json(server)))
}

pub async fn get_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, server_id)): Path<(String, String)>,
) -> Result<Json<WebServer>, DeploydError> {
    Ok(Json(state.web_servers.get(&caller.project_id, &server_id)?))
}

pub async fn update_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, server_id)): Path<(String, String)>,
    Json(request): Json<UpdateWebServerRequest>,
) -> Result<Json<WebServer>, DeploydError> {
    Ok(Json(state.web_servers.update(&caller.project_id, &server_id, request)?))
}

pub async fn delete_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, server_id)): Path<(String, String)>,
) -> Result<Json<MessageResponse>, DeploydError> {
    state.web_servers.delete(&caller.project_id, &server_id)?;
    Ok(Json(MessageResponse::new(format!("Web server {} deleted", server_id))))
}

/// Connection test handler. Reachability is reported in the body, not the status.
pub async fn test_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, server_id)): Path<(String, String)>,
) -> Result<Json<ConnectionTestResponse>, DeploydError> {
    Ok(Json(state.web_servers.test_connection(&caller.project_id, &server_id).await?))
}

pub async fn distribute_key_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, server_id)): Path<(String, String)>,
    Json(request): Json<DistributeKeyRequest>,
) -> Result<Json<DistributeKeyResponse>, DeploydError> {
    Ok(Json(
        state
            .web_servers
            .distribute_key(&caller.project_id, &server_id, request)
            .await?,
    ))
}
