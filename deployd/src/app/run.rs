//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::DeploydError;
use crate::server::serve::serve;
use crate::workers::{deployer, lease_sweeper};

/// Run the orchestrator until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DeploydError> {
    info!("Initializing deployd...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start deployd: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), DeploydError> {
    let (app_state, queue_rx) = AppState::init(options).await?;
    let app_state = Arc::new(app_state);

    init_deployer_worker(
        options.deployer.clone(),
        app_state.clone(),
        queue_rx,
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_lease_sweeper(
        options.lease_sweeper.clone(),
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_http_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await?;
    Ok(())
}

fn init_deployer_worker(
    options: deployer::Options,
    app_state: Arc<AppState>,
    queue_rx: mpsc::UnboundedReceiver<String>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeploydError> {
    info!("Initializing deployer worker...");

    let executor = app_state.executor.clone();
    let store = app_state.store.clone();

    let deployer_handle = tokio::spawn(async move {
        deployer::run(
            &options,
            executor,
            store,
            queue_rx,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_deployer_worker_handle(deployer_handle)
}

fn init_lease_sweeper(
    options: lease_sweeper::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeploydError> {
    info!("Initializing lease sweeper...");

    let store = app_state.store.clone();

    let sweeper_handle = tokio::spawn(async move {
        lease_sweeper::run(
            &options,
            &store,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_lease_sweeper_handle(sweeper_handle)
}

async fn init_http_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeploydError> {
    info!("Initializing HTTP server...");

    let server_state = app_state.server_state(shutdown_manager.stopping());

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_http_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    stopping_tx: watch::Sender<bool>,
    lifecycle_options: LifecycleOptions,
    http_server_handle: Option<JoinHandle<Result<(), DeploydError>>>,
    deployer_worker_handle: Option<JoinHandle<()>>,
    lease_sweeper_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            stopping_tx: watch::Sender::new(false),
            lifecycle_options,
            http_server_handle: None,
            deployer_worker_handle: None,
            lease_sweeper_handle: None,
        }
    }

    pub fn stopping(&self) -> watch::Receiver<bool> {
        self.stopping_tx.subscribe()
    }

    pub fn with_deployer_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeploydError> {
        if self.deployer_worker_handle.is_some() {
            return Err(DeploydError::ShutdownError("deployer_handle already set".to_string()));
        }
        self.deployer_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_lease_sweeper_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeploydError> {
        if self.lease_sweeper_handle.is_some() {
            return Err(DeploydError::ShutdownError("lease_sweeper_handle already set".to_string()));
        }
        self.lease_sweeper_handle = Some(handle);
        Ok(())
    }

    pub fn with_http_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), DeploydError>>,
    ) -> Result<(), DeploydError> {
        if self.http_server_handle.is_some() {
            return Err(DeploydError::ShutdownError("server_handle already set".to_string()));
        }
        self.http_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), DeploydError> {
        let _ = self.shutdown_tx.send(());
        self.stopping_tx.send_replace(true);

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), DeploydError> {
        info!("Shutting down deployd...");

        // 1. HTTP server: stop taking new work
        if let Some(handle) = self.http_server_handle.take() {
            handle.await.map_err(|e| DeploydError::ShutdownError(e.to_string()))??;
        }

        // 2. Lease sweeper
        if let Some(handle) = self.lease_sweeper_handle.take() {
            handle.await.map_err(|e| DeploydError::ShutdownError(e.to_string()))?;
        }

        // 3. Deployer worker, which drains in-flight deployments
        if let Some(handle) = self.deployer_worker_handle.take() {
            handle.await.map_err(|e| DeploydError::ShutdownError(e.to_string()))?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
