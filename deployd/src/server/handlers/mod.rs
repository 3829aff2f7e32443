//! HTTP request handlers

pub mod deployments;
pub mod repositories;
pub mod ssh_keys;
pub mod web_servers;
pub mod webhook;

use axum::{response::IntoResponse, Json};

use deploy_api::{HealthResponse, VersionResponse};

use crate::utils::build_info;

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deployd".to_string(),
        version: build_info().version.to_string(),
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let info = build_info();
    Json(VersionResponse {
        version: info.version.to_string(),
        git_hash: info.commit.to_string(),
        build_time: info.built_at.to_string(),
    })
}
