//! Deployment executor
//!
//! Runs one pending deployment to a terminal state: lease, connect, fetch,
//! build, port guard, restart, activation. Every failure is recorded on the
//! deployment and in its log rather than returned to whoever triggered it.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use tracing::{error, info, warn};

use crate::credentials::cipher::CredentialCipher;
use crate::deploy::commands::{self, FetchAuth};
use crate::deploy::fsm::{DeploymentEvent, DeploymentStatus};
use crate::deploy::lease::{LeaseGuard, LeaseManager};
use crate::deploy::log_pump::{self, LogSink};
use crate::deploy::port_guard;
use crate::deploy::remote::{resolve_target, RemoteCommand, RemoteShell, ShellConnector};
use crate::errors::DeploydError;
use crate::models::deployment::{Deployment, DeploymentFailure};
use crate::storage::settings::ExecutorSettings;
use crate::store::StateStore;

/// Which failure a non-zero exit maps to
#[derive(Debug, Clone, Copy)]
enum Phase {
    Build,
    Activation,
}

impl Phase {
    fn failure(self, command: &str, exit_code: i32) -> DeploydError {
        let command = command.to_string();
        match self {
            Phase::Build => DeploydError::BuildFailureError { command, exit_code },
            Phase::Activation => DeploydError::ActivationFailureError { command, exit_code },
        }
    }
}

/// Executes deployments against remote targets
pub struct DeploymentExecutor {
    store: StateStore,
    cipher: Arc<CredentialCipher>,
    connector: Arc<dyn ShellConnector>,
    leases: LeaseManager,
    step_timeout: Duration,
    activation_timeout: Duration,
}

impl DeploymentExecutor {
    pub fn new(
        store: StateStore,
        cipher: Arc<CredentialCipher>,
        connector: Arc<dyn ShellConnector>,
        leases: LeaseManager,
        settings: &ExecutorSettings,
    ) -> Self {
        Self {
            store,
            cipher,
            connector,
            leases,
            step_timeout: Duration::from_secs(settings.step_timeout_secs),
            activation_timeout: Duration::from_secs(settings.activation_timeout_secs),
        }
    }

    /// Drive a pending deployment to `deployed` or `failed`.
    ///
    /// Deployments that are no longer pending are returned unchanged.
    pub async fn execute(&self, deployment_id: &str) -> Result<Deployment, DeploydError> {
        let deployment = self
            .store
            .get_deployment(deployment_id)?
            .ok_or_else(|| DeploydError::NotFound(format!("Deployment {}", deployment_id)))?;
        if deployment.status != DeploymentStatus::Pending {
            warn!(deployment_id, status = %deployment.status, "deployment is not pending, skipping");
            return Ok(deployment);
        }

        let (sink, pump) = log_pump::start(self.store.clone(), deployment_id.to_string());
        sink.system(format!(
            "waiting for target {}:{}",
            deployment.web_server_id, deployment.deployment_path
        ));

        let guard = match self.leases.acquire(&deployment.target(), deployment_id).await {
            Ok(guard) => guard,
            Err(e) => return self.finish(deployment_id, sink, pump, Err(e)).await,
        };
        if let Err(e) = self.store.apply_deployment_event(deployment_id, DeploymentEvent::Start) {
            // deleted or picked up elsewhere while we waited; the record is not ours to fail
            warn!(deployment_id, "deployment could not be started: {}", e);
            Self::close_log(deployment_id, sink, pump).await;
            return Err(e);
        }
        info!(deployment_id, target = %guard.target(), "deployment started");

        let result = self.run(&deployment, &guard, &sink).await;
        let finished = self.finish(deployment_id, sink, pump, result).await;
        drop(guard);
        finished
    }

    /// Record the outcome. The log is flushed first since appends are
    /// rejected once the deployment is terminal.
    async fn finish(
        &self,
        deployment_id: &str,
        sink: LogSink,
        pump: tokio::task::JoinHandle<()>,
        result: Result<(), DeploydError>,
    ) -> Result<Deployment, DeploydError> {
        let event = match result {
            Ok(()) => {
                sink.system("deployment succeeded");
                DeploymentEvent::Activated
            }
            Err(e) => {
                let failure = DeploymentFailure::from_error(&e);
                match (&failure.command, failure.exit_code) {
                    (Some(command), Some(code)) => {
                        sink.system(format!("command failed (exit {}): {}", code, command))
                    }
                    _ => sink.system(format!("deployment failed: {}", e)),
                }
                DeploymentEvent::Fail(failure)
            }
        };
        Self::close_log(deployment_id, sink, pump).await;

        let finished = self.store.apply_deployment_event(deployment_id, event)?;
        match &finished.failure {
            Some(failure) => warn!(deployment_id, kind = ?failure.kind, "deployment failed: {}", failure.message),
            None => info!(deployment_id, "deployment finished: {}", finished.status),
        }
        Ok(finished)
    }

    /// Write out everything queued on `sink` and stop its pump
    async fn close_log(deployment_id: &str, sink: LogSink, pump: tokio::task::JoinHandle<()>) {
        sink.flush().await;
        drop(sink);
        if let Err(e) = pump.await {
            error!(deployment_id, "log pump task failed: {}", e);
        }
    }

    async fn run(&self, deployment: &Deployment, guard: &LeaseGuard, sink: &LogSink) -> Result<(), DeploydError> {
        let server = self
            .store
            .get_web_server(&deployment.web_server_id)?
            .ok_or_else(|| DeploydError::TargetNotFound(deployment.web_server_id.clone()))?;
        let target = resolve_target(&self.store, &self.cipher, &server, &deployment.ssh_key_id)?;

        sink.system(format!("connecting to {}", target.endpoint));
        let shell = self.connector.connect(&target).await?;
        let result = self.run_remote(deployment, guard, shell.as_ref(), sink).await;
        if let Err(e) = shell.close().await {
            warn!(deployment_id = %deployment.id, "failed to close ssh session: {}", e);
        }
        result
    }

    async fn run_remote(
        &self,
        deployment: &Deployment,
        guard: &LeaseGuard,
        shell: &dyn RemoteShell,
        sink: &LogSink,
    ) -> Result<(), DeploydError> {
        let path = deployment.deployment_path.as_str();
        let option = &deployment.install_option;

        // building
        if let Some(fetch) = self.fetch_command(deployment)? {
            self.step(shell, sink, guard, fetch, Phase::Build).await?;
        }
        if option.build_command.trim().is_empty() {
            sink.system("no build command, skipping build");
        } else {
            let build = RemoteCommand::new(
                option.build_command.as_str(),
                commands::build_script(path, &option.build_command, &option.environment),
                self.step_timeout,
            );
            self.step(shell, sink, guard, build, Phase::Build).await?;
        }
        self.store
            .apply_deployment_event(&deployment.id, DeploymentEvent::BuildSucceeded)?;
        sink.system("build finished, activating");

        // deploying
        if let Some(port) = deployment.port {
            guard.ensure_held()?;
            let check = port_guard::check_port(shell, port, Some(path)).await?;
            if !check.available {
                return Err(DeploydError::PortConflict {
                    port,
                    occupant: check.occupying_process.unwrap_or_else(|| "unknown".to_string()),
                });
            }
            if check.owned_by_target {
                sink.system(format!("port {} is held by the previous instance", port));
            }
        }

        let stop = RemoteCommand::new("stop previous instance", commands::stop_script(path), self.step_timeout);
        self.step(shell, sink, guard, stop, Phase::Activation).await?;

        let start = RemoteCommand::new(
            option.start_command.as_str(),
            commands::start_script(path, &option.start_command, &option.environment, deployment.port),
            self.step_timeout,
        );
        self.step(shell, sink, guard, start, Phase::Activation).await?;

        let label = match deployment.port {
            Some(port) => format!("wait for port {}", port),
            None => "liveness check".to_string(),
        };
        let activation = RemoteCommand::new(
            label,
            commands::activation_script(path, deployment.port, self.activation_timeout.as_secs()),
            self.activation_timeout + Duration::from_secs(30),
        );
        self.step(shell, sink, guard, activation, Phase::Activation).await
    }

    /// Clone-or-update command for deployments tied to a repository
    fn fetch_command(&self, deployment: &Deployment) -> Result<Option<RemoteCommand>, DeploydError> {
        let Some(repo_id) = &deployment.github_repository_id else {
            return Ok(None);
        };
        let repo = self
            .store
            .get_repository(repo_id)?
            .ok_or_else(|| DeploydError::RepositoryNotFound(repo_id.clone()))?;

        let git_ref = if deployment.commit_hash.is_empty() {
            deployment.branch.as_str()
        } else {
            deployment.commit_hash.as_str()
        };
        let label = format!("git fetch {}", git_ref);

        if let Some(key_id) = &repo.ssh_key_id {
            let key = self
                .store
                .get_ssh_key(key_id)?
                .filter(|k| k.project_id == repo.project_id)
                .ok_or_else(|| DeploydError::NotFound(format!("SSH key {}", key_id)))?;
            let script = commands::checkout_script(
                &deployment.deployment_path,
                &repo.ssh_clone_url(),
                git_ref,
                FetchAuth::DeployKey,
            );
            let command = RemoteCommand::new(label, script, self.step_timeout)
                .with_stdin(self.cipher.open(&key.encrypted_private_key)?);
            return Ok(Some(command));
        }

        if let Some(sealed) = &repo.encrypted_access_token {
            let token = self.cipher.open(sealed)?;
            let basic = STANDARD.encode(format!("x-access-token:{}", token.expose_secret()));
            let header = SecretString::from(format!("Authorization: Basic {}\n", basic));
            let script = commands::checkout_script(
                &deployment.deployment_path,
                &repo.clone_url,
                git_ref,
                FetchAuth::Token,
            );
            return Ok(Some(RemoteCommand::new(label, script, self.step_timeout).with_stdin(header)));
        }

        let script = commands::checkout_script(
            &deployment.deployment_path,
            &repo.clone_url,
            git_ref,
            FetchAuth::Anonymous,
        );
        Ok(Some(RemoteCommand::new(label, script, self.step_timeout)))
    }

    async fn step(
        &self,
        shell: &dyn RemoteShell,
        sink: &LogSink,
        guard: &LeaseGuard,
        command: RemoteCommand,
        phase: Phase,
    ) -> Result<(), DeploydError> {
        guard.ensure_held()?;
        sink.system(format!("$ {}", command.label));
        let output = shell.exec(&command, Some(sink)).await?;
        if output.timed_out {
            sink.system(format!(
                "{} timed out after {}s",
                command.label,
                command.timeout.as_secs()
            ));
        }
        if !output.success() {
            return Err(phase.failure(&command.label, output.exit_code));
        }
        Ok(())
    }
}
