use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use satele_core::config::ToolsConfig;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::text::{truncate_for_log, utf8_safe_prefix};

pub const BLOCKED_MESSAGE: &str = "Error: Dangerous command blocked.";
pub const NO_OUTPUT_MESSAGE: &str = "Success (No output)";
const MAX_CAPTURE_BYTES: usize = 256 * 1024;

/// Runs one command string through the platform shell.
///
/// Never returns an error: refusals, timeouts and spawn failures all come back
/// as human-readable text so the caller can forward them to the chat reply.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    timeout: Duration,
    blocked_patterns: Vec<String>,
    python_interpreter: Option<String>,
}

impl ShellExecutor {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        Self {
            shell: if cfg.shell.trim().is_empty() {
                "sh".to_string()
            } else {
                cfg.shell.trim().to_string()
            },
            timeout: Duration::from_secs(cfg.cmd_timeout_seconds.max(1)),
            blocked_patterns: cfg.blocked_patterns.clone(),
            python_interpreter: cfg
                .python_interpreter
                .as_ref()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_blocked(&self, command: &str) -> bool {
        self.blocked_patterns
            .iter()
            .any(|p| !p.is_empty() && command.contains(p.as_str()))
    }

    pub async fn run(&self, command: &str, cwd: &Path) -> String {
        if self.is_blocked(command) {
            warn!("blocked command: {}", truncate_for_log(command));
            return BLOCKED_MESSAGE.to_string();
        }
        let command = self.rewrite_interpreter(command);
        debug!("run_shell cwd={} command={}", cwd.display(), truncate_for_log(&command));

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(err) => return format!("Execution Error: {err}"),
        };

        let out = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(err)) => return format!("Execution Error: {err}"),
            Err(_) => {
                warn!(
                    "run_shell timeout after {}s: {}",
                    self.timeout.as_secs(),
                    truncate_for_log(&command)
                );
                return format!(
                    "Error: Command timed out after {} seconds.",
                    self.timeout.as_secs()
                );
            }
        };

        let stdout_text = String::from_utf8_lossy(&out.stdout);
        let stderr_text = String::from_utf8_lossy(&out.stderr);
        let mut text = String::new();
        text.push_str(&stdout_text);
        if !stderr_text.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr_text);
        }

        let text = utf8_safe_prefix(text.trim(), MAX_CAPTURE_BYTES);
        if text.is_empty() {
            NO_OUTPUT_MESSAGE.to_string()
        } else {
            text.to_string()
        }
    }

    fn rewrite_interpreter(&self, command: &str) -> String {
        let Some(interpreter) = &self.python_interpreter else {
            return command.to_string();
        };
        let trimmed = command.trim_start();
        let first = trimmed.split_whitespace().next().unwrap_or_default();
        if first == "python3" || first == "python" {
            format!("{interpreter}{}", &trimmed[first.len()..])
        } else {
            command.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> ShellExecutor {
        ShellExecutor::from_config(&ToolsConfig::default())
    }

    #[tokio::test]
    async fn echo_output_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let out = executor().run("echo hello", dir.path()).await;
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn stdout_and_stderr_are_combined() {
        let dir = tempfile::tempdir().unwrap();
        let out = executor().run("echo out; echo err 1>&2", dir.path()).await;
        assert_eq!(out, "out\nerr");
    }

    #[tokio::test]
    async fn silent_success_has_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let out = executor().run("true", dir.path()).await;
        assert_eq!(out, NO_OUTPUT_MESSAGE);
    }

    #[tokio::test]
    async fn destructive_command_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let cmd = format!("touch {} && mkfs.ext4 /dev/null", marker.display());
        let out = executor().run(&cmd, dir.path()).await;
        assert_eq!(out, BLOCKED_MESSAGE);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn timeout_is_reported_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor().with_timeout(Duration::from_millis(200));
        let out = exec.run("sleep 5", dir.path()).await;
        assert!(out.starts_with("Error: Command timed out"), "{out}");
    }

    #[tokio::test]
    async fn runs_in_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = executor().run("pwd", dir.path()).await;
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(Path::new(&out).canonicalize().unwrap(), expected);
    }

    #[test]
    fn python_prefix_is_rewritten_only_as_first_token() {
        let mut cfg = ToolsConfig::default();
        cfg.python_interpreter = Some("/venv/bin/python".to_string());
        let exec = ShellExecutor::from_config(&cfg);
        assert_eq!(exec.rewrite_interpreter("python3 a.py"), "/venv/bin/python a.py");
        assert_eq!(exec.rewrite_interpreter("  python a.py"), "/venv/bin/python a.py");
        assert_eq!(exec.rewrite_interpreter("python3-config --help"), "python3-config --help");
        assert_eq!(exec.rewrite_interpreter("echo python3"), "echo python3");
    }
}
