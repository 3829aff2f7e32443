//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::DeploydError;
use crate::server::handlers::{
    deployments, health_handler, repositories, ssh_keys, version_handler, web_servers, webhook,
};
use crate::server::state::ServerState;

/// Routes scoped to one project; every handler authorizes the caller for it
fn project_routes() -> Router<Arc<ServerState>> {
    Router::new()
        // SSH keys
        .route("/ssh-keys", get(ssh_keys::list_handler).post(ssh_keys::create_handler))
        .route(
            "/ssh-keys/{key_id}",
            get(ssh_keys::get_handler)
                .put(ssh_keys::update_handler)
                .delete(ssh_keys::delete_handler),
        )
        // Web servers
        .route("/web-servers", get(web_servers::list_handler).post(web_servers::create_handler))
        .route(
            "/web-servers/{server_id}",
            get(web_servers::get_handler)
                .put(web_servers::update_handler)
                .delete(web_servers::delete_handler),
        )
        .route("/web-servers/{server_id}/test", post(web_servers::test_handler))
        .route(
            "/web-servers/{server_id}/distribute-key",
            post(web_servers::distribute_key_handler),
        )
        // Repositories
        .route(
            "/github-repositories",
            get(repositories::list_handler).post(repositories::create_handler),
        )
        .route(
            "/github-repositories/{repo_id}",
            get(repositories::get_handler)
                .put(repositories::update_handler)
                .delete(repositories::delete_handler),
        )
        .route("/github-repositories/{repo_id}/sync", post(repositories::sync_handler))
        .route("/github-repositories/{repo_id}/webhook", get(repositories::webhook_info_handler))
        .route("/github-repositories/{repo_id}/analysis", get(repositories::analysis_handler))
        .route("/github-repositories/{repo_id}/analyze", post(repositories::analyze_handler))
        .route("/github-repositories/{repo_id}/reanalyze", post(repositories::reanalyze_handler))
        .route("/github-repositories/{repo_id}/test-access", get(repositories::test_access_handler))
        .route(
            "/github-repositories/{repo_id}/deploy-pending",
            post(repositories::deploy_pending_handler),
        )
        // Deployments
        .route(
            "/deployments",
            get(deployments::list_handler).post(deployments::create_handler),
        )
        .route("/deployments/check-port", post(deployments::check_port_handler))
        .route(
            "/deployments/{deployment_id}",
            get(deployments::get_handler).delete(deployments::delete_handler),
        )
        .route("/deployments/{deployment_id}/execute", post(deployments::execute_handler))
        .route("/deployments/{deployment_id}/logs", get(deployments::logs_handler))
        .route("/deployments/{deployment_id}/logs/stream", get(deployments::stream_logs_handler))
        .route("/deployments/{deployment_id}/status", get(deployments::status_handler))
}

/// Build the full router
pub fn router(api_prefix: &str, state: Arc<ServerState>) -> Router {
    let api_prefix = api_prefix.trim_end_matches('/');
    let api = Router::new()
        .nest("/projects/{project_id}", project_routes())
        .route("/deploy/webhook/{repo_id}", post(webhook::webhook_handler));

    let app = Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler));
    let app = if api_prefix.is_empty() {
        app.merge(api)
    } else {
        app.nest(api_prefix, api)
    };

    app
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), DeploydError>>, DeploydError> {
    let app = router(&options.api_prefix, state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DeploydError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| DeploydError::ServerError(e.to_string()))
    });

    Ok(handle)
}
