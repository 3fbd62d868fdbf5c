//! External security check.
//!
//! The configured command runs through `sh -c` in the project root. It gets
//! the project state as JSON on stdin and must print a `GuardReport` as JSON
//! on stdout:
//!
//! ```json
//! {"passed": false, "errors": ["AWS key in src/config.rs"], "warnings": []}
//! ```

use super::{Guard, GuardContext, GuardReport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

pub struct CommandSecurityGuard {
    command: Option<String>,
    timeout: Duration,
}

impl CommandSecurityGuard {
    pub fn new(command: Option<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    async fn run(&self, command: &str, ctx: &GuardContext<'_>) -> Result<GuardReport> {
        let state_json =
            serde_json::to_string(ctx.state).context("Failed to serialize state for security command")?;

        tracing::debug!(command, timeout_secs = self.timeout.as_secs(), "running security command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(ctx.project_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PHASEGATE_PROJECT", &ctx.state.project_name)
            .env("PHASEGATE_PHASE", ctx.state.phase.as_str())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn security command: {}", command))?;

        // The write runs beside the wait so a command that never drains a large
        // state still hits the deadline. Killing the child ends the writer.
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(state_json.as_bytes()).await {
                    tracing::debug!(error = %e, "security command did not read stdin");
                }
            });
        }

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for security command")?,
            Err(_) => {
                return Ok(GuardReport::from_findings(
                    vec![format!(
                        "Security command timed out after {} seconds",
                        self.timeout.as_secs()
                    )],
                    vec![],
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        match serde_json::from_str::<GuardReport>(stdout.trim()) {
            Ok(report) => Ok(report),
            Err(_) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let exit_code = output.status.code().unwrap_or(-1);
                let reason = if stderr.trim().is_empty() {
                    format!(
                        "Security command produced unparsable output (exit {})",
                        exit_code
                    )
                } else {
                    format!(
                        "Security command produced unparsable output (exit {}): {}",
                        exit_code,
                        stderr.trim()
                    )
                };
                Ok(GuardReport::from_findings(vec![reason], vec![]))
            }
        }
    }
}

#[async_trait]
impl Guard for CommandSecurityGuard {
    async fn validate(&self, ctx: &GuardContext<'_>) -> Result<GuardReport> {
        match &self.command {
            None => Ok(GuardReport::from_findings(vec![], vec![])
                .with_summary("No security command configured; check skipped")),
            Some(command) => self.run(command, ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ProjectState;
    use std::path::Path;
    use tempfile::tempdir;

    fn create_test_script(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let script_path = dir.join(name);
        std::fs::write(&script_path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    async fn validate_with(dir: &Path, command: Option<String>, secs: u64) -> GuardReport {
        let state = ProjectState::new("demo");
        let ctx = GuardContext {
            project_root: dir,
            state: &state,
        };
        CommandSecurityGuard::new(command, Duration::from_secs(secs))
            .validate(&ctx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_no_command_passes() {
        let dir = tempdir().unwrap();
        let report = validate_with(dir.path(), None, 5).await;
        assert!(report.passed);
        assert!(report.summary.unwrap().contains("skipped"));
    }

    #[tokio::test]
    async fn test_json_report_is_returned() {
        let dir = tempdir().unwrap();
        let script = create_test_script(
            dir.path(),
            "scan.sh",
            "#!/bin/sh\ncat > /dev/null\necho '{\"passed\": false, \"errors\": [\"secret found\"]}'\n",
        );
        let report =
            validate_with(dir.path(), Some(script.to_string_lossy().to_string()), 5).await;
        assert!(!report.passed);
        assert_eq!(report.errors, vec!["secret found"]);
    }

    #[tokio::test]
    async fn test_command_receives_state_on_stdin() {
        let dir = tempdir().unwrap();
        let script = create_test_script(
            dir.path(),
            "scan.sh",
            "#!/bin/sh\nif grep -q '\"projectName\":\"demo\"'; then\n  echo '{\"passed\": true}'\nelse\n  echo '{\"passed\": false, \"errors\": [\"no state\"]}'\nfi\n",
        );
        let report =
            validate_with(dir.path(), Some(script.to_string_lossy().to_string()), 5).await;
        assert!(report.passed, "{:?}", report.errors);
    }

    #[tokio::test]
    async fn test_unparsable_output_is_error() {
        let dir = tempdir().unwrap();
        let report = validate_with(
            dir.path(),
            Some("echo 'all good' && echo 'oops' >&2".to_string()),
            5,
        )
        .await;
        assert!(!report.passed);
        assert!(report.errors[0].contains("unparsable"));
        assert!(report.errors[0].contains("oops"));
    }

    #[tokio::test]
    async fn test_timeout_applies_when_stdin_is_never_read() {
        let dir = tempdir().unwrap();
        let mut state = ProjectState::new("demo");
        state.context.insert(
            "blob".to_string(),
            serde_json::Value::String("x".repeat(512 * 1024)),
        );
        let ctx = GuardContext {
            project_root: dir.path(),
            state: &state,
        };
        let guard = CommandSecurityGuard::new(Some("sleep 6".to_string()), Duration::from_secs(1));

        let started = std::time::Instant::now();
        let report = guard.validate(&ctx).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert!(!report.passed);
        assert!(report.errors[0].contains("timed out"), "{:?}", report.errors);
    }

    #[tokio::test]
    async fn test_timeout_is_error() {
        let dir = tempdir().unwrap();
        let report = validate_with(dir.path(), Some("sleep 5".to_string()), 1).await;
        assert!(!report.passed);
        assert!(report.errors[0].contains("timed out"));
    }
}
