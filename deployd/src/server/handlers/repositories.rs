//! GitHub repository handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use deploy_api::{
    CreateRepositoryRequest, DeployPendingRequest, ListResponse, MessageResponse,
    RepositoryAccessResponse, SyncResponse, UpdateRepositoryRequest, WebhookInfoResponse,
};

use crate::errors::DeploydError;
use crate::models::analysis::RepositoryAnalysis;
use crate::models::deployment::Deployment;
use crate::models::repository::{RepositoryCreated, RepositoryResponse};
use crate::server::auth::ProjectCaller;
use crate::server::state::ServerState;

type RepoPath = Path<(String, String)>;

pub async fn list_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
) -> Result<Json<ListResponse<RepositoryResponse>>, DeploydError> {
    Ok(Json(ListResponse::new(state.repositories.list(&caller.project_id)?)))
}

pub async fn create_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateRepositoryRequest>,
) -> Result<(StatusCode, Json<RepositoryCreated>), DeploydError> {
    let created = state.repositories.create(&caller.project_id, request)?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, repo_id)): RepoPath,
) -> Result<Json<RepositoryResponse>, DeploydError> {
    Ok(Json(state.repositories.get(&caller.project_id, &repo_id)?))
}

pub async fn update_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, repo_id)): RepoPath,
    Json(request): Json<UpdateRepositoryRequest>,
) -> Result<Json<RepositoryResponse>, DeploydError> {
    Ok(Json(state.repositories.update(&caller.project_id, &repo_id, request)?))
}

pub async fn delete_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, repo_id)): RepoPath,
) -> Result<Json<MessageResponse>, DeploydError> {
    state.repositories.delete(&caller.project_id, &repo_id)?;
    Ok(Json(MessageResponse::new(format!("Repository {} deleted", repo_id))))
}

pub async fn sync_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, repo_id)): RepoPath,
) -> Result<Json<SyncResponse>, DeploydError> {
    Ok(Json(state.repositories.sync(&caller.project_id, &repo_id).await?))
}

pub async fn webhook_info_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, repo_id)): RepoPath,
) -> Result<Json<WebhookInfoResponse>, DeploydError> {
    Ok(Json(state.repositories.webhook_info(&caller.project_id, &repo_id)?))
}

pub async fn analysis_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, repo_id)): RepoPath,
) -> Result<Json<RepositoryAnalysis>, DeploydError> {
    Ok(Json(state.repositories.analysis(&caller.project_id, &repo_id)?))
}

pub async fn analyze_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, repo_id)): RepoPath,
) -> Result<Json<RepositoryAnalysis>, DeploydError> {
    Ok(Json(state.repositories.analyze(&caller.project_id, &repo_id).await?))
}

pub async fn reanalyze_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, repo_id)): RepoPath,
) -> Result<Json<RepositoryAnalysis>, DeploydError> {
    Ok(Json(state.repositories.reanalyze(&caller.project_id, &repo_id).await?))
}

pub async fn test_access_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, repo_id)): RepoPath,
) -> Result<Json<RepositoryAccessResponse>, DeploydError> {
    Ok(Json(state.repositories.test_access(&caller.project_id, &repo_id).await?))
}

/// Deploy the pending-update marker. The body is optional.
pub async fn deploy_pending_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, repo_id)): RepoPath,
    request: Option<Json<DeployPendingRequest>>,
) -> Result<(StatusCode, Json<Deployment>), DeploydError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let deployment = state
        .deployments
        .deploy_pending(&caller.project_id, &repo_id, request)?;
    Ok((StatusCode::ACCEPTED, Json(deployment)))
}
