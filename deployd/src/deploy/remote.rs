//! Remote shell access through the system OpenSSH client
//!
//! One multiplexed master connection (`ssh -M -S <socket> -fN`) is opened per
//! deployment and every command reuses it through the control socket.
//! Tests substitute the `ShellConnector` seam with an in-process fake.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::credentials::cipher::CredentialCipher;
use crate::deploy::commands;
use crate::deploy::log_pump::LogSink;
use crate::errors::DeploydError;
use crate::filesys::file::File;
use crate::models::deployment::LogStream;
use crate::models::web_server::WebServer;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::ExecutorSettings;
use crate::store::StateStore;

/// Exit status ssh reports for its own failures
const SSH_ERROR_EXIT: i32 = 255;

/// Exit status reported when a step exceeds its timeout
pub const TIMEOUT_EXIT: i32 = 124;

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl SshEndpoint {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl std::fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Endpoint plus the decrypted private key used to reach it
#[derive(Clone)]
pub struct SshTarget {
    pub endpoint: SshEndpoint,
    pub private_key: SecretString,
}

/// Resolve the endpoint of `server` and decrypt `key_id` for it
pub fn resolve_target(
    store: &StateStore,
    cipher: &CredentialCipher,
    server: &WebServer,
    key_id: &str,
) -> Result<SshTarget, DeploydError> {
    let key = store
        .get_ssh_key(key_id)?
        .filter(|k| k.project_id == server.project_id)
        .ok_or_else(|| DeploydError::NotFound(format!("SSH key {}", key_id)))?;
    Ok(SshTarget {
        endpoint: SshEndpoint {
            host: server.host.clone(),
            port: server.port,
            user: server.ssh_user.clone(),
        },
        private_key: cipher.open(&key.encrypted_private_key)?,
    })
}

/// A script to run remotely
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    /// Short label used in logs and failure records
    pub label: String,
    pub script: String,
    /// Fed to the remote process, never placed on a command line
    pub stdin: Option<SecretString>,
    pub timeout: Duration,
}

impl RemoteCommand {
    pub fn new(label: impl Into<String>, script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            label: label.into(),
            script: script.into(),
            stdin: None,
            timeout,
        }
    }

    pub fn with_stdin(mut self, stdin: SecretString) -> Self {
        self.stdin = Some(stdin);
        self
    }
}

/// Outcome of a remote command. Output is only captured when no log sink
/// was given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Opens sessions to remote hosts
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteShell>, DeploydError>;

    /// Append `public_key` to the user's authorized_keys using password login
    async fn install_public_key(
        &self,
        endpoint: &SshEndpoint,
        password: &SecretString,
        public_key: &str,
    ) -> Result<(), DeploydError>;
}

/// An open session
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn exec(&self, command: &RemoteCommand, sink: Option<&LogSink>) -> Result<CommandOutput, DeploydError>;

    async fn close(&self) -> Result<(), DeploydError>;
}

/// `ShellConnector` backed by the `ssh` and `sshpass` binaries
pub struct SshConnector {
    ssh_binary: String,
    sshpass_binary: String,
    connect_timeout: Duration,
    scratch_dir: PathBuf,
    known_hosts: PathBuf,
}

impl SshConnector {
    pub fn new(settings: &ExecutorSettings, layout: &StorageLayout) -> Self {
        Self {
            ssh_binary: settings.ssh_binary.clone(),
            sshpass_binary: settings.sshpass_binary.clone(),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            scratch_dir: layout.ssh_dir().path().to_path_buf(),
            known_hosts: layout.known_hosts_file().path().to_path_buf(),
        }
    }

    fn common_options(&self, endpoint: &SshEndpoint) -> Vec<String> {
        vec![
            "-p".to_string(),
            endpoint.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", self.known_hosts.display()),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
        ]
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteShell>, DeploydError> {
        // control socket paths are limited to ~100 bytes
        let name = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let key_file = File::new(self.scratch_dir.join(format!("{}.key", name)));
        let socket = self.scratch_dir.join(format!("{}.sock", name));
        let ssh_log = self.scratch_dir.join(format!("{}.log", name));

        let mut pem = target.private_key.expose_secret().trim_end().to_string();
        pem.push('\n');
        key_file.write_secret(pem.as_bytes()).await?;

        let mut args = vec![
            "-M".to_string(),
            "-S".to_string(),
            socket.display().to_string(),
            "-fN".to_string(),
            "-i".to_string(),
            key_file.path().display().to_string(),
            "-E".to_string(),
            ssh_log.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
        ];
        args.extend(self.common_options(&target.endpoint));
        args.push(target.endpoint.destination());

        debug!(endpoint = %target.endpoint, "opening ssh master connection");
        // -f backgrounds the master after authentication, so only the exit
        // status matters here; diagnostics land in the -E log file
        let status = tokio::time::timeout(
            self.connect_timeout + Duration::from_secs(5),
            Command::new(&self.ssh_binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await;

        let diagnostics = tokio::fs::read_to_string(&ssh_log).await.unwrap_or_default();
        let _ = tokio::fs::remove_file(&ssh_log).await;

        let failure = match status {
            Ok(Ok(status)) if status.success() => None,
            Ok(Ok(status)) => Some(format!(
                "ssh exited with {}: {}",
                status.code().unwrap_or(-1),
                diagnostics.trim()
            )),
            Ok(Err(e)) => Some(format!("failed to run {}: {}", self.ssh_binary, e)),
            Err(_) => Some(format!(
                "timed out after {}s connecting to {}",
                self.connect_timeout.as_secs(),
                target.endpoint
            )),
        };
        if let Some(message) = failure {
            let _ = key_file.delete().await;
            return Err(DeploydError::SshConnectionError(message));
        }

        info!(endpoint = %target.endpoint, "ssh session established");
        Ok(Box::new(SshSession {
            ssh_binary: self.ssh_binary.clone(),
            endpoint: target.endpoint.clone(),
            socket,
            key_file: key_file.path().to_path_buf(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn install_public_key(
        &self,
        endpoint: &SshEndpoint,
        password: &SecretString,
        public_key: &str,
    ) -> Result<(), DeploydError> {
        let mut args = vec![
            "-e".to_string(),
            self.ssh_binary.clone(),
            "-o".to_string(),
            "PreferredAuthentications=password,keyboard-interactive".to_string(),
            "-o".to_string(),
            "PubkeyAuthentication=no".to_string(),
            "-o".to_string(),
            "NumberOfPasswordPrompts=1".to_string(),
        ];
        args.extend(self.common_options(endpoint));
        args.push(endpoint.destination());
        args.push("--".to_string());
        args.push(commands::remote_shell(&commands::authorize_key_script(public_key)));

        info!(%endpoint, "installing public key with password login");
        let output = tokio::time::timeout(
            self.connect_timeout + Duration::from_secs(30),
            Command::new(&self.sshpass_binary)
                .args(&args)
                .env("SSHPASS", password.expose_secret())
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| DeploydError::SshConnectionError(format!("timed out reaching {}", endpoint)))?
        .map_err(|e| DeploydError::SshConnectionError(format!("failed to run {}: {}", self.sshpass_binary, e)))?;

        match output.status.code() {
            Some(0) => Ok(()),
            // sshpass: 5 = invalid password
            Some(5) => Err(DeploydError::SshConnectionError(
                "password authentication failed".to_string(),
            )),
            code => Err(DeploydError::SshConnectionError(format!(
                "key installation exited with {}: {}",
                code.unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

/// Session multiplexed over a control socket
pub struct SshSession {
    ssh_binary: String,
    endpoint: SshEndpoint,
    socket: PathBuf,
    key_file: PathBuf,
    closed: AtomicBool,
}

impl SshSession {
    fn control_args(&self) -> Vec<String> {
        vec![
            "-S".to_string(),
            self.socket.display().to_string(),
            "-p".to_string(),
            self.endpoint.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ]
    }
}

impl SshSession {
    /// Ask the control master whether it is still connected
    async fn master_alive(&self) -> bool {
        let mut args = self.control_args();
        args.extend(["-O".to_string(), "check".to_string(), self.endpoint.destination()]);
        let status = tokio::time::timeout(
            Duration::from_secs(10),
            Command::new(&self.ssh_binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await;
        matches!(status, Ok(Ok(s)) if s.success())
    }
}

#[async_trait]
impl RemoteShell for SshSession {
    async fn exec(&self, command: &RemoteCommand, sink: Option<&LogSink>) -> Result<CommandOutput, DeploydError> {
        let mut args = self.control_args();
        args.push(self.endpoint.destination());
        args.push("--".to_string());
        args.push(commands::remote_shell(&command.script));

        debug!(endpoint = %self.endpoint, step = %command.label, "running remote command");
        let mut child = Command::new(&self.ssh_binary)
            .args(&args)
            .stdin(if command.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DeploydError::SshConnectionError(format!("failed to run {}: {}", self.ssh_binary, e)))?;

        if let (Some(input), Some(mut stdin)) = (&command.stdin, child.stdin.take()) {
            stdin.write_all(input.expose_secret().as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(pump_lines(out, LogStream::Stdout, sink.cloned()))
        });
        let stderr = child.stderr.take().map(|err| {
            tokio::spawn(pump_lines(err, LogStream::Stderr, sink.cloned()))
        });

        let (exit_code, timed_out) = match tokio::time::timeout(command.timeout, child.wait()).await {
            Ok(status) => (status?.code().unwrap_or(-1), false),
            Err(_) => {
                warn!(endpoint = %self.endpoint, step = %command.label, "remote command timed out");
                let _ = child.kill().await;
                (TIMEOUT_EXIT, true)
            }
        };

        let mut output = CommandOutput {
            exit_code,
            timed_out,
            ..Default::default()
        };
        if let Some(task) = stdout {
            output.stdout = task.await.unwrap_or_default();
        }
        if let Some(task) = stderr {
            output.stderr = task.await.unwrap_or_default();
        }

        // 255 is also a legal exit status of the remote command itself; only a
        // dead master connection means the session was lost
        if exit_code == SSH_ERROR_EXIT && !self.master_alive().await {
            return Err(DeploydError::SshConnectionError(format!(
                "connection to {} lost during {}: {}",
                self.endpoint,
                command.label,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn close(&self) -> Result<(), DeploydError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut args = self.control_args();
        args.extend(["-O".to_string(), "exit".to_string(), self.endpoint.destination()]);
        let status = Command::new(&self.ssh_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        let _ = tokio::fs::remove_file(&self.key_file).await;
        let _ = tokio::fs::remove_file(&self.socket).await;
        match status {
            Ok(s) if s.success() => {
                debug!(endpoint = %self.endpoint, "ssh session closed");
                Ok(())
            }
            Ok(s) => Err(DeploydError::SshConnectionError(format!(
                "closing master connection exited with {}",
                s.code().unwrap_or(-1)
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = std::fs::remove_file(&self.key_file);
        // Best effort: stop the background master without blocking
        if tokio::runtime::Handle::try_current().is_ok() {
            let mut args = self.control_args();
            args.extend(["-O".to_string(), "exit".to_string(), self.endpoint.destination()]);
            let _ = Command::new(&self.ssh_binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
        }
    }
}

/// Forward lines to `sink`, or collect them when there is none
async fn pump_lines<R>(reader: R, stream: LogStream, sink: Option<LogSink>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut captured = String::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match &sink {
                Some(sink) => sink.line(stream, line),
                None => {
                    captured.push_str(&line);
                    captured.push('\n');
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!("failed to read remote output: {}", e);
                break;
            }
        }
    }
    captured
}
