//! Deployment handlers

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{stream, Stream, StreamExt};
use tokio::sync::watch;

use deploy_api::{
    CreateDeploymentRequest, DeploymentListQuery, ListResponse, LogsQuery, MessageResponse,
    PortCheckRequest, PortCheckResponse,
};

use crate::deploy::manager::{DeploymentManager, DeploymentStatusReport, DEFAULT_LOG_PAGE};
use crate::errors::DeploydError;
use crate::models::deployment::{Deployment, LogLine, LogPage, LogStream};
use crate::server::auth::ProjectCaller;
use crate::server::state::ServerState;

const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(500);

type DeploymentPath = Path<(String, String)>;

pub async fn list_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Query(query): Query<DeploymentListQuery>,
) -> Result<Json<ListResponse<Deployment>>, DeploydError> {
    Ok(Json(ListResponse::new(state.deployments.list(&caller.project_id, &query)?)))
}

/// Create a pending deployment. It is not run until executed.
pub async fn create_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<Deployment>), DeploydError> {
    let deployment = state.deployments.create(&caller.project_id, request)?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

pub async fn get_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, deployment_id)): DeploymentPath,
) -> Result<Json<Deployment>, DeploydError> {
    Ok(Json(state.deployments.get(&caller.project_id, &deployment_id)?))
}

pub async fn status_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, deployment_id)): DeploymentPath,
) -> Result<Json<DeploymentStatusReport>, DeploydError> {
    Ok(Json(state.deployments.status(&caller.project_id, &deployment_id)?))
}

pub async fn execute_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, deployment_id)): DeploymentPath,
) -> Result<(StatusCode, Json<Deployment>), DeploydError> {
    let deployment = state.deployments.execute(&caller.project_id, &deployment_id)?;
    Ok((StatusCode::ACCEPTED, Json(deployment)))
}

pub async fn delete_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, deployment_id)): DeploymentPath,
) -> Result<Json<MessageResponse>, DeploydError> {
    let deleted = state.deployments.delete(&caller.project_id, &deployment_id)?;
    Ok(Json(MessageResponse::new(format!(
        "Deployment {} ({}) deleted",
        deleted.id, deleted.status
    ))))
}

pub async fn logs_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, deployment_id)): DeploymentPath,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogPage>, DeploydError> {
    Ok(Json(state.deployments.logs(
        &caller.project_id,
        &deployment_id,
        query.after,
        query.limit,
    )?))
}

fn line_event(line: &LogLine) -> Event {
    let stream = match line.stream {
        LogStream::Stdout => "stdout",
        LogStream::Stderr => "stderr",
        LogStream::System => "system",
    };
    Event::default()
        .id(line.seq.to_string())
        .event(stream)
        .data(line.line.replace(['\r', '\n'], " "))
}

/// Tail the log until the deployment is terminal and drained, or the
/// server is stopping.
///
/// Every event id is the line cursor so `Last-Event-ID` resumes a dropped
/// stream. A final `end` event carries the terminal status.
fn tail(
    manager: Arc<DeploymentManager>,
    stopping: watch::Receiver<bool>,
    project_id: String,
    deployment_id: String,
    after: u64,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some(after), move |cursor| {
        let manager = manager.clone();
        let project_id = project_id.clone();
        let deployment_id = deployment_id.clone();
        let stopping = stopping.clone();
        async move {
            let mut cursor = cursor?;
            loop {
                match manager.logs(&project_id, &deployment_id, Some(cursor), Some(DEFAULT_LOG_PAGE)) {
                    Ok(page) if page.complete => {
                        let mut events: Vec<Event> = page.lines.iter().map(line_event).collect();
                        events.push(Event::default().event("end").data(page.status.as_str()));
                        return Some((events, None));
                    }
                    Ok(page) if !page.lines.is_empty() => {
                        let events = page.lines.iter().map(line_event).collect();
                        return Some((events, Some(page.next_cursor)));
                    }
                    Ok(page) => cursor = page.next_cursor,
                    Err(e) => {
                        return Some((vec![Event::default().event("error").data(e.to_string())], None));
                    }
                }
                if *stopping.borrow() {
                    return None;
                }
                tokio::time::sleep(STREAM_POLL_INTERVAL).await;
            }
        }
    })
    .flat_map(|events| stream::iter(events.into_iter().map(Ok)))
}

pub async fn stream_logs_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Path((_, deployment_id)): DeploymentPath,
    Query(query): Query<LogsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, DeploydError> {
    // existence and project check up front, so a bad id is a 404 not an empty stream
    state.deployments.get(&caller.project_id, &deployment_id)?;

    let resume = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let after = resume.or(query.after).unwrap_or(0);

    let events = tail(
        state.deployments.clone(),
        state.stopping.clone(),
        caller.project_id,
        deployment_id,
        after,
    );
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub async fn check_port_handler(
    caller: ProjectCaller,
    State(state): State<Arc<ServerState>>,
    Json(request): Json<PortCheckRequest>,
) -> Result<Json<PortCheckResponse>, DeploydError> {
    Ok(Json(state.deployments.check_port(&caller.project_id, &request).await?))
}
