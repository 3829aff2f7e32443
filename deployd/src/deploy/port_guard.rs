//! Port availability probe
//!
//! The probe is read-only: it classifies the current listener on a port and
//! never touches it, so repeated checks give the same answer.

use std::time::Duration;

use tracing::{debug, warn};

use deploy_api::PortCheckResponse;

use crate::deploy::commands::shell_quote;
use crate::deploy::remote::{RemoteCommand, RemoteShell};
use crate::errors::DeploydError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Script printing `FREE`, `SELF <pid>/<name>`, `BUSY <pid>/<name>` or
/// `UNKNOWN` when no probe tool is installed.
pub fn probe_script(port: u16, deployment_path: Option<&str>) -> String {
    format!(
        r#"PORT={port}
TARGET={target}
FOUND=""
PID=""
if command -v ss >/dev/null 2>&1; then
  LINE=$(ss -ltnpH "sport = :$PORT" 2>/dev/null | head -n1)
  if [ -n "$LINE" ]; then FOUND=1; PID=$(echo "$LINE" | sed -n 's/.*pid=\([0-9]*\).*/\1/p'); fi
elif command -v lsof >/dev/null 2>&1; then
  PID=$(lsof -nP -iTCP:"$PORT" -sTCP:LISTEN -t 2>/dev/null | head -n1)
  if [ -n "$PID" ]; then FOUND=1; fi
elif command -v netstat >/dev/null 2>&1; then
  LINE=$(netstat -ltnp 2>/dev/null | awk -v p=":$PORT" '$4 ~ p"$" {{print; exit}}')
  if [ -n "$LINE" ]; then FOUND=1; PID=$(echo "$LINE" | awk '{{print $7}}' | cut -d/ -f1 | tr -cd '0-9'); fi
else
  echo UNKNOWN
  exit 0
fi
if [ -z "$FOUND" ]; then echo FREE; exit 0; fi
NAME=unknown
if [ -n "$PID" ]; then
  NAME=$(cat /proc/$PID/comm 2>/dev/null || ps -p "$PID" -o comm= 2>/dev/null || echo unknown)
  CWD=$(readlink /proc/$PID/cwd 2>/dev/null || true)
  if [ -n "$TARGET" ] && [ -n "$CWD" ]; then
    case "$CWD" in "$TARGET"|"$TARGET"/*) echo "SELF $PID/$NAME"; exit 0;; esac
  fi
fi
echo "BUSY ${{PID:-?}}/$NAME"
"#,
        port = port,
        target = shell_quote(deployment_path.unwrap_or(""))
    )
}

/// Classify the probe's output
pub fn parse_probe(port: u16, output: &str) -> Result<PortCheckResponse, DeploydError> {
    let line = output
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .unwrap_or_default();
    let (verdict, detail) = match line.split_once(' ') {
        Some((verdict, detail)) => (verdict, Some(detail.trim().to_string())),
        None => (line, None),
    };

    let response = match verdict {
        "FREE" => PortCheckResponse {
            port,
            available: true,
            occupying_process: None,
            owned_by_target: false,
        },
        "SELF" => PortCheckResponse {
            port,
            available: true,
            occupying_process: detail,
            owned_by_target: true,
        },
        "BUSY" => PortCheckResponse {
            port,
            available: false,
            occupying_process: detail.or_else(|| Some("unknown".to_string())),
            owned_by_target: false,
        },
        "UNKNOWN" => {
            warn!(port, "no port probe tool on target, assuming the port is free");
            PortCheckResponse {
                port,
                available: true,
                occupying_process: None,
                owned_by_target: false,
            }
        }
        other => {
            return Err(DeploydError::Internal(format!(
                "unexpected port probe output: {:?}",
                other
            )))
        }
    };
    Ok(response)
}

/// Run the probe over an open session
pub async fn check_port(
    shell: &dyn RemoteShell,
    port: u16,
    deployment_path: Option<&str>,
) -> Result<PortCheckResponse, DeploydError> {
    if port == 0 {
        return Err(DeploydError::ValidationError("Port must be between 1 and 65535".to_string()));
    }
    let command = RemoteCommand::new("port check", probe_script(port, deployment_path), PROBE_TIMEOUT);
    let output = shell.exec(&command, None).await?;
    if !output.success() {
        return Err(DeploydError::Internal(format!(
            "port probe exited with {}: {}",
            output.exit_code,
            output.stderr.trim()
        )));
    }
    let result = parse_probe(port, &output.stdout)?;
    debug!(port, available = result.available, "port checked");
    Ok(result)
}
