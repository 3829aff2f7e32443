//! Shell scripts run on the target host
//!
//! Every interpolated value goes through `shell_quote`. Secrets never appear
//! in a script; they are fed over stdin.

use std::collections::BTreeMap;

/// Directory under the deployment path holding the pid and service log
pub const STATE_DIR: &str = ".deployd";
pub const PID_FILE: &str = ".deployd/app.pid";
pub const APP_LOG_FILE: &str = ".deployd/app.log";

/// Quote a value for POSIX sh
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Wrap a script as the single command string ssh hands to the remote shell
pub fn remote_shell(script: &str) -> String {
    format!("bash -lc {}", shell_quote(script))
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `export` lines for the environment. Invalid names are skipped.
pub fn export_lines(environment: &BTreeMap<String, String>) -> String {
    environment
        .iter()
        .filter(|(name, _)| is_valid_env_name(name))
        .map(|(name, value)| format!("export {}={}\n", name, shell_quote(value)))
        .collect()
}

/// How the fetch authenticates against the git host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchAuth {
    /// Public repository
    Anonymous,
    /// Private key arrives on stdin
    DeployKey,
    /// `Authorization` header value arrives on stdin
    Token,
}

/// Clone into `path` or update the existing checkout, pinned to `git_ref`
pub fn checkout_script(path: &str, clone_url: &str, git_ref: &str, auth: FetchAuth) -> String {
    let mut script = String::from("set -e\n");
    script.push_str(&format!("mkdir -p {path}\ncd {path}\n", path = shell_quote(path)));
    script.push_str(&format!(
        "if [ -d .git ]; then git remote set-url origin {url}; \
         else git init -q && git remote add origin {url}; fi\n",
        url = shell_quote(clone_url)
    ));

    let fetch = format!("fetch --depth 1 origin {}", shell_quote(git_ref));
    match auth {
        FetchAuth::Anonymous => script.push_str(&format!("git {}\n", fetch)),
        FetchAuth::DeployKey => {
            script.push_str(
                "KEY_FILE=$(mktemp)\n\
                 trap 'rm -f \"$KEY_FILE\"' EXIT\n\
                 chmod 600 \"$KEY_FILE\"\n\
                 cat > \"$KEY_FILE\"\n\
                 export GIT_SSH_COMMAND=\"ssh -i $KEY_FILE -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new\"\n",
            );
            script.push_str(&format!("git {}\n", fetch));
        }
        FetchAuth::Token => {
            script.push_str("IFS= read -r AUTH_HEADER\n");
            script.push_str(&format!("git -c http.extraHeader=\"$AUTH_HEADER\" {}\n", fetch));
        }
    }

    script.push_str("git checkout -q --force FETCH_HEAD\n");
    script.push_str("echo \"checked out $(git rev-parse HEAD)\"\n");
    script
}

/// Run the build command inside the checkout
pub fn build_script(path: &str, build_command: &str, environment: &BTreeMap<String, String>) -> String {
    format!(
        "set -e\ncd {}\n{}{}\n",
        shell_quote(path),
        export_lines(environment),
        build_command
    )
}

/// Stop the instance recorded in the pid file, if it is still running
pub fn stop_script(path: &str) -> String {
    format!(
        "cd {path} 2>/dev/null || exit 0\n\
         [ -f {pid} ] || exit 0\n\
         PID=$(cat {pid})\n\
         if [ -n \"$PID\" ] && kill -0 \"$PID\" 2>/dev/null; then\n\
         \x20 echo \"stopping previous instance $PID\"\n\
         \x20 kill \"$PID\" 2>/dev/null || true\n\
         \x20 for _ in $(seq 1 20); do kill -0 \"$PID\" 2>/dev/null || break; sleep 0.5; done\n\
         \x20 kill -9 \"$PID\" 2>/dev/null || true\n\
         fi\n\
         rm -f {pid}\n",
        path = shell_quote(path),
        pid = PID_FILE
    )
}

/// Start the service detached, recording its pid
pub fn start_script(
    path: &str,
    start_command: &str,
    environment: &BTreeMap<String, String>,
    port: Option<u16>,
) -> String {
    let mut script = format!("set -e\ncd {}\nmkdir -p {}\n", shell_quote(path), STATE_DIR);
    script.push_str(&export_lines(environment));
    if let Some(port) = port {
        script.push_str(&format!("export PORT={}\n", port));
    }
    script.push_str(&format!(
        "nohup sh -c {} > {log} 2>&1 < /dev/null &\n\
         echo $! > {pid}\n\
         echo \"started pid $(cat {pid})\"\n",
        shell_quote(start_command),
        log = APP_LOG_FILE,
        pid = PID_FILE
    ));
    script
}

/// Wait for the new instance to come up.
///
/// With a port: poll until something listens on it, failing early if the
/// process dies. Without: the process must still be alive after a grace period.
pub fn activation_script(path: &str, port: Option<u16>, timeout_secs: u64) -> String {
    let mut script = format!(
        "cd {}\nPID=$(cat {} 2>/dev/null || true)\n\
         alive() {{ [ -n \"$PID\" ] && kill -0 \"$PID\" 2>/dev/null; }}\n",
        shell_quote(path),
        PID_FILE
    );
    match port {
        Some(port) => script.push_str(&format!(
            "listening() {{\n\
             \x20 if command -v ss >/dev/null 2>&1; then ss -ltnH \"sport = :{port}\" 2>/dev/null | grep -q .;\n\
             \x20 elif command -v lsof >/dev/null 2>&1; then lsof -nP -iTCP:{port} -sTCP:LISTEN >/dev/null 2>&1;\n\
             \x20 else netstat -ltn 2>/dev/null | awk '{{print $4}}' | grep -q ':{port}$'; fi\n\
             }}\n\
             for _ in $(seq 1 {timeout}); do\n\
             \x20 if listening; then echo \"listening on port {port}\"; exit 0; fi\n\
             \x20 if ! alive; then echo \"process exited before listening on port {port}\" >&2; tail -n 20 {log} >&2; exit 1; fi\n\
             \x20 sleep 1\n\
             done\n\
             echo \"nothing listening on port {port} after {timeout}s\" >&2\n\
             tail -n 20 {log} >&2\n\
             exit 1\n",
            port = port,
            timeout = timeout_secs.max(1),
            log = APP_LOG_FILE
        )),
        None => script.push_str(&format!(
            "sleep {grace}\n\
             if alive; then echo \"process $PID is running\"; exit 0; fi\n\
             echo \"process exited during startup\" >&2\n\
             tail -n 20 {log} >&2\n\
             exit 1\n",
            grace = timeout_secs.clamp(1, 3),
            log = APP_LOG_FILE
        )),
    }
    script
}

/// Append a public key to authorized_keys unless it is already present
pub fn authorize_key_script(public_key: &str) -> String {
    format!(
        "set -e\n\
         umask 077\n\
         mkdir -p ~/.ssh\n\
         touch ~/.ssh/authorized_keys\n\
         KEY={key}\n\
         grep -qxF \"$KEY\" ~/.ssh/authorized_keys || echo \"$KEY\" >> ~/.ssh/authorized_keys\n\
         chmod 700 ~/.ssh\n\
         chmod 600 ~/.ssh/authorized_keys\n",
        key = shell_quote(public_key.trim())
    )
}

/// Trivial command used by connection tests
pub fn echo_script() -> &'static str {
    "echo deployd-ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("simple/path-1.0"), "simple/path-1.0");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_exports_skip_invalid_names() {
        let mut env = BTreeMap::new();
        env.insert("NODE_ENV".to_string(), "production".to_string());
        env.insert("BAD-NAME".to_string(), "x".to_string());
        env.insert("MSG".to_string(), "hello world".to_string());
        let lines = export_lines(&env);
        assert!(lines.contains("export NODE_ENV=production\n"));
        assert!(lines.contains("export MSG='hello world'\n"));
        assert!(!lines.contains("BAD-NAME"));
    }

    #[test]
    fn test_checkout_pins_ref_and_keeps_secrets_off_the_script() {
        let script = checkout_script(
            "/home/deploy/deploys/app",
            "git@github.com:acme/app.git",
            "0123abcd",
            FetchAuth::DeployKey,
        );
        assert!(script.contains("git fetch --depth 1 origin 0123abcd"));
        assert!(script.contains("git checkout -q --force FETCH_HEAD"));
        assert!(script.contains("trap 'rm -f \"$KEY_FILE\"' EXIT"));
        assert!(!script.contains("BEGIN OPENSSH"));

        let token = checkout_script("/srv/app", "https://github.com/acme/app.git", "main", FetchAuth::Token);
        assert!(token.contains("http.extraHeader=\"$AUTH_HEADER\""));
    }

    #[test]
    fn test_start_exports_port_and_records_pid() {
        let script = start_script("/srv/app", "npm start", &BTreeMap::new(), Some(3000));
        assert!(script.contains("export PORT=3000\n"));
        assert!(script.contains("nohup sh -c 'npm start'"));
        assert!(script.contains("echo $! > .deployd/app.pid"));
    }

    #[test]
    fn test_activation_variants() {
        assert!(activation_script("/srv/app", Some(8080), 30).contains("sport = :8080"));
        let no_port = activation_script("/srv/app", None, 30);
        assert!(no_port.contains("sleep 3"));
        assert!(!no_port.contains("listening"));
    }

    #[test]
    fn test_authorize_key_is_idempotent_append() {
        let script = authorize_key_script("ssh-ed25519 AAAA me@host\n");
        assert!(script.contains("grep -qxF \"$KEY\""));
        assert!(script.contains("KEY='ssh-ed25519 AAAA me@host'"));
    }
}
