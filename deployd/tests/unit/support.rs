//! Shared fixtures: an in-memory store wired to scripted remote collaborators

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;

use deploy_api::{
    CreateDeploymentRequest, CreateRepositoryRequest, CreateSshKeyRequest, CreateWebServerRequest,
    InstallOption,
};
use deployd::app::options::AppOptions;
use deployd::app::state::AppState;
use deployd::authn::caller_token::{issue_token, CallerClaims, Role};
use deployd::deploy::log_pump::LogSink;
use deployd::deploy::remote::{
    CommandOutput, RemoteCommand, RemoteShell, ShellConnector, SshEndpoint, SshTarget,
};
use deployd::errors::DeploydError;
use deployd::github::client::{RemoteRepository, RepositoryHost};
use deployd::models::deployment::{Deployment, LogStream};
use deployd::models::repository::RepositoryCreated;
use deployd::storage::layout::StorageLayout;
use deployd::storage::settings::Settings;
use deployd::store::StateStore;

pub const PROJECT: &str = "project-1";
pub const JWT_SECRET: &str = "jwt-test-secret";
pub const PORT_CHECK_LABEL: &str = "port check";

/// What the fake remote host does and what it saw
pub struct FakeRemote {
    /// Non-zero exit codes keyed by command label
    exit_codes: Mutex<HashMap<String, i32>>,
    /// Verdict line printed by the port probe
    probe: Mutex<String>,
    step_delay: Mutex<Duration>,
    unreachable: Mutex<bool>,
    executed: Mutex<Vec<String>>,
    stdin_seen: Mutex<Vec<String>>,
    connections: Mutex<usize>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self {
            exit_codes: Mutex::new(HashMap::new()),
            probe: Mutex::new("FREE".to_string()),
            step_delay: Mutex::new(Duration::ZERO),
            unreachable: Mutex::new(false),
            executed: Mutex::new(Vec::new()),
            stdin_seen: Mutex::new(Vec::new()),
            connections: Mutex::new(0),
        }
    }
}

impl FakeRemote {
    pub fn fail_step(&self, label: &str, exit_code: i32) {
        self.exit_codes.lock().unwrap().insert(label.to_string(), exit_code);
    }

    pub fn set_probe(&self, verdict: &str) {
        *self.probe.lock().unwrap() = verdict.to_string();
    }

    pub fn set_step_delay(&self, delay: Duration) {
        *self.step_delay.lock().unwrap() = delay;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock().unwrap() = unreachable;
    }

    /// Labels of every command run so far, in order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn stdin_seen(&self) -> Vec<String> {
        self.stdin_seen.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        *self.connections.lock().unwrap()
    }
}

pub struct FakeShell {
    remote: Arc<FakeRemote>,
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn exec(&self, command: &RemoteCommand, sink: Option<&LogSink>) -> Result<CommandOutput, DeploydError> {
        self.remote.executed.lock().unwrap().push(command.label.clone());
        if let Some(stdin) = &command.stdin {
            self.remote
                .stdin_seen
                .lock()
                .unwrap()
                .push(stdin.expose_secret().to_string());
        }

        if command.label == PORT_CHECK_LABEL {
            let verdict = self.remote.probe.lock().unwrap().clone();
            return Ok(CommandOutput {
                stdout: format!("{}\n", verdict),
                ..Default::default()
            });
        }

        let delay = *self.remote.step_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let exit_code = self
            .remote
            .exit_codes
            .lock()
            .unwrap()
            .get(&command.label)
            .copied()
            .unwrap_or(0);
        if let Some(sink) = sink {
            if exit_code == 0 {
                sink.line(LogStream::Stdout, format!("ran {}", command.label));
            } else {
                sink.line(LogStream::Stderr, format!("{}: simulated failure", command.label));
            }
        }
        Ok(CommandOutput {
            exit_code,
            ..Default::default()
        })
    }

    async fn close(&self) -> Result<(), DeploydError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub remote: Arc<FakeRemote>,
}

#[async_trait]
impl ShellConnector for FakeConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteShell>, DeploydError> {
        if *self.remote.unreachable.lock().unwrap() {
            return Err(DeploydError::SshConnectionError(format!(
                "{}: connection refused",
                target.endpoint
            )));
        }
        *self.remote.connections.lock().unwrap() += 1;
        Ok(Box::new(FakeShell {
            remote: self.remote.clone(),
        }))
    }

    async fn install_public_key(
        &self,
        _endpoint: &SshEndpoint,
        _password: &SecretString,
        _public_key: &str,
    ) -> Result<(), DeploydError> {
        Ok(())
    }
}

/// Repository host that knows every repository and has no files
pub struct FakeHost;

#[async_trait]
impl RepositoryHost for FakeHost {
    async fn repository(&self, full_name: &str, _token: Option<&SecretString>) -> Result<RemoteRepository, DeploydError> {
        Ok(RemoteRepository {
            full_name: full_name.to_string(),
            default_branch: "main".to_string(),
            private: false,
        })
    }

    async fn branch_head(&self, _full_name: &str, _branch: &str, _token: Option<&SecretString>) -> Result<String, DeploydError> {
        Ok("0123456789abcdef0123456789abcdef01234567".to_string())
    }

    async fn file(
        &self,
        _full_name: &str,
        _git_ref: &str,
        _path: &str,
        _token: Option<&SecretString>,
    ) -> Result<Option<String>, DeploydError> {
        Ok(None)
    }
}

pub struct Harness {
    pub app: AppState,
    pub queue: mpsc::UnboundedReceiver<String>,
    pub remote: Arc<FakeRemote>,
    pub options: AppOptions,
    pub key_id: String,
    pub server_id: String,
}

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.master_key = Some(SecretString::from("test-master-key"));
    settings.auth.jwt_secret = Some(SecretString::from(JWT_SECRET));
    settings.server.base_url = "https://deploy.example.com".to_string();
    settings.executor.lock_wait_secs = 0;
    settings.executor.lease_ttl_secs = 30;
    settings.executor.activation_timeout_secs = 5;
    settings
}

pub fn harness() -> Harness {
    harness_with(settings())
}

/// Build the application over an in-memory store with one key and one server
pub fn harness_with(settings: Settings) -> Harness {
    let options = AppOptions::from_settings(&settings, StorageLayout::new("/tmp/deployd-test")).unwrap();
    let connector = Arc::new(FakeConnector::default());
    let remote = connector.remote.clone();
    let store = StateStore::open_in_memory().unwrap();
    let (app, queue) = AppState::assemble(&options, store, connector, Arc::new(FakeHost)).unwrap();

    let key_id = app
        .ssh_keys
        .create(
            PROJECT,
            CreateSshKeyRequest {
                name: "deploy".to_string(),
                description: None,
                private_key: None,
                public_key: None,
            },
        )
        .unwrap()
        .id;
    let server_id = app
        .web_servers
        .create(
            PROJECT,
            CreateWebServerRequest {
                name: "web-1".to_string(),
                description: None,
                host: "192.0.2.10".to_string(),
                port: None,
                ssh_user: "deploy".to_string(),
                ssh_key_id: key_id.clone(),
                deploy_path: Some("/srv".to_string()),
            },
        )
        .unwrap()
        .id;

    Harness {
        app,
        queue,
        remote,
        options,
        key_id,
        server_id,
    }
}

pub fn node_option(port: Option<u16>) -> InstallOption {
    InstallOption {
        name: "node".to_string(),
        description: String::new(),
        build_command: "npm ci && npm run build".to_string(),
        start_command: "node server.js".to_string(),
        port,
        is_recommended: true,
        environment: Default::default(),
    }
}

impl Harness {
    pub fn store(&self) -> &StateStore {
        &self.app.store
    }

    pub fn repository_request(&self, full_name: &str, auto_deploy: bool) -> CreateRepositoryRequest {
        CreateRepositoryRequest {
            full_name: full_name.to_string(),
            name: None,
            clone_url: None,
            default_branch: None,
            is_private: false,
            ssh_key_id: None,
            access_token: None,
            auto_deploy,
            app_port: Some(3000),
            build_command: Some("npm ci".to_string()),
            start_command: Some("npm start".to_string()),
            environment: Default::default(),
        }
    }

    pub fn create_repository(&self, full_name: &str, auto_deploy: bool) -> RepositoryCreated {
        self.app
            .repositories
            .create(PROJECT, self.repository_request(full_name, auto_deploy))
            .unwrap()
    }

    /// A pending deployment of `repo_id` onto the harness server at `commit_hash`
    pub fn create_repository_deployment(&self, repo_id: &str, commit_hash: Option<&str>) -> Deployment {
        let request = CreateDeploymentRequest {
            github_repository_id: Some(repo_id.to_string()),
            web_server_id: self.server_id.clone(),
            ssh_key_id: None,
            branch: None,
            commit_hash: commit_hash.map(str::to_string),
            install_option: None,
            install_option_name: None,
            port: None,
            deployment_path: None,
            environment: Default::default(),
        };
        self.app.deployments.create(PROJECT, request).unwrap()
    }

    pub fn deployment_request(&self, path: &str, port: Option<u16>) -> CreateDeploymentRequest {
        CreateDeploymentRequest {
            github_repository_id: None,
            web_server_id: self.server_id.clone(),
            ssh_key_id: None,
            branch: None,
            commit_hash: None,
            install_option: Some(node_option(port)),
            install_option_name: None,
            port: None,
            deployment_path: Some(path.to_string()),
            environment: Default::default(),
        }
    }

    /// A pending deployment of the plain node option to `path`
    pub fn create_deployment(&self, path: &str, port: Option<u16>) -> Deployment {
        self.app
            .deployments
            .create(PROJECT, self.deployment_request(path, port))
            .unwrap()
    }

    /// Full log text of a deployment, one line per entry
    pub fn log_text(&self, deployment_id: &str) -> Vec<String> {
        self.store()
            .read_logs(deployment_id, 0, 10_000)
            .unwrap()
            .into_iter()
            .map(|l| l.line)
            .collect()
    }
}

pub fn token(role: Role, projects: &[&str]) -> String {
    let now = Utc::now().timestamp();
    let claims = CallerClaims {
        sub: "user-1".to_string(),
        role,
        projects: projects.iter().map(|p| p.to_string()).collect(),
        iat: now,
        exp: now + 3600,
    };
    issue_token(&claims, &SecretString::from(JWT_SECRET)).unwrap()
}
