// src/runtime/cli_pool.rs
//! Coding-CLI executor pool
//!
//! Each executor is bound to one CLI binary. Validation is an availability
//! probe (`<binary> --version` must exit 0 within a few seconds).

use crate::observability::event_bus::EventBus;
use crate::runtime::dependency_pool::{InstanceFactory, Pingable, ResourcePool};
use crate::utils::errors::{Result, ToolkitError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tracing::{debug, info, warn};

/// Dependency kind served by CLI executor pools
pub const CLI_EXECUTOR_DEPENDENCY: &str = "cli_executor";

/// Default capacity of a CLI executor pool
pub const DEFAULT_CLI_INSTANCES: usize = 2;

/// Availability probe timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// CLI executor pool type
pub type CliExecutorPool = ResourcePool<CliExecutorFactory>;

/// Output of one CLI invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOutput {
    /// stdout followed by stderr
    pub output: String,

    /// Exit code, -1 on timeout or signal
    pub exit_code: i32,

    pub timed_out: bool,
}

/// Handle to an external coding CLI
#[derive(Debug, Clone)]
pub struct CliExecutor {
    binary_path: PathBuf,
    args: Vec<String>,
}

impl CliExecutor {
    /// Create an executor for `binary_path` invoked with `args`
    pub fn new(binary_path: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args,
        }
    }

    /// Binary this executor drives
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Check that the binary answers `--version`
    pub async fn is_available(&self) -> bool {
        let probe = Command::new(&self.binary_path)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(Ok(status)) if status.success() => {
                debug!("CLI verified: {}", self.binary_path.display());
                true
            }
            Ok(Ok(status)) => {
                warn!("CLI version check failed for {}: {}", self.binary_path.display(), status);
                false
            }
            Ok(Err(e)) => {
                debug!("CLI not runnable {}: {}", self.binary_path.display(), e);
                false
            }
            Err(_) => {
                warn!("CLI version check timed out for {}", self.binary_path.display());
                false
            }
        }
    }

    /// Run the CLI non-interactively in `workspace`, feeding `prompt` on stdin
    pub async fn execute(
        &self,
        prompt: &str,
        workspace: &Path,
        timeout: Duration,
        env: &[(String, String)],
    ) -> Result<CliOutput> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&self.args)
            .current_dir(workspace)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("CI", "true")
            .env("NO_INTERACTIVE", "1")
            .env("TERM", "dumb")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()
            .map_err(|e| ToolkitError::ProcessSpawnFailed(
                format!("Failed to spawn {}: {}", self.binary_path.display(), e)
            ))?;

        // Feed stdin while draining the pipes, all under the one deadline
        let stdin = child.stdin.take();
        let run = async {
            let (fed, output) = tokio::join!(feed_stdin(stdin, prompt.as_bytes()), child.wait_with_output());
            fed?;
            output
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(output) => {
                let output = output?;
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));

                Ok(CliOutput {
                    output: text,
                    exit_code: output.status.code().unwrap_or(-1),
                    timed_out: false,
                })
            }
            Err(_) => {
                // Dropping the wait future kills the child (kill_on_drop)
                warn!("{} timed out after {:?}", self.binary_path.display(), timeout);
                Ok(CliOutput {
                    output: String::new(),
                    exit_code: -1,
                    timed_out: true,
                })
            }
        }
    }
}

/// Write the prompt and close stdin; a child that exits without reading is not an error
async fn feed_stdin(stdin: Option<ChildStdin>, prompt: &[u8]) -> std::io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };

    let written = match stdin.write_all(prompt).await {
        Ok(()) => stdin.shutdown().await,
        Err(e) => Err(e),
    };

    match written {
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            debug!("CLI closed stdin before reading the full prompt");
            Ok(())
        }
        other => other,
    }
}

#[async_trait]
impl Pingable for CliExecutor {
    async fn ping(&self) -> Result<()> {
        if self.is_available().await {
            Ok(())
        } else {
            Err(ToolkitError::RuntimeError(
                format!("{} is not available", self.binary_path.display())
            ))
        }
    }
}

/// Factory binding executors to one binary
#[derive(Debug, Clone)]
pub struct CliExecutorFactory {
    binary_path: String,
    args: Vec<String>,
}

impl CliExecutorFactory {
    pub fn new(binary_path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args,
        }
    }
}

#[async_trait]
impl InstanceFactory for CliExecutorFactory {
    type Instance = CliExecutor;

    async fn create_instance(&self) -> Result<CliExecutor> {
        let resolved = which::which(&self.binary_path)
            .map_err(|e| ToolkitError::InstanceCreation(
                format!("CLI binary '{}' not found: {}", self.binary_path, e)
            ))?;

        info!("Created CLI executor with binary: {}", resolved.display());
        Ok(CliExecutor::new(resolved, self.args.clone()))
    }

    async fn destroy_instance(&self, instance: &CliExecutor) -> Result<()> {
        debug!("Destroyed CLI executor for {}", instance.binary_path().display());
        Ok(())
    }
}

/// Build a CLI executor pool
pub fn cli_executor_pool(
    binary_path: impl Into<String>,
    args: Vec<String>,
    max_instances: usize,
    event_bus: Arc<EventBus>,
) -> CliExecutorPool {
    ResourcePool::new(
        CLI_EXECUTOR_DEPENDENCY,
        max_instances,
        CliExecutorFactory::new(binary_path, args),
        event_bus,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_available_binary() {
        let executor = CliExecutor::new("true", vec![]);
        assert!(executor.is_available().await);
        assert!(executor.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let executor = CliExecutor::new("/nonexistent/coding-cli", vec![]);
        assert!(!executor.is_available().await);
        assert!(executor.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_execute_pipes_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CliExecutor::new("cat", vec![]);

        let result = executor
            .execute("fix the bug", dir.path(), Duration::from_secs(5), &[])
            .await
            .unwrap();

        assert_eq!(result.output, "fix the bug");
        assert_eq!(result.exit_code, 0);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_execute_sets_non_interactive_env() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CliExecutor::new("sh", vec!["-c".into(), "echo $CI:$TERM:$EXTRA".into()]);
        let env = vec![("EXTRA".to_string(), "yes".to_string())];

        let result = executor
            .execute("", dir.path(), Duration::from_secs(5), &env)
            .await
            .unwrap();

        assert_eq!(result.output.trim(), "true:dumb:yes");
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CliExecutor::new("sleep", vec!["10".into()]);

        let result = executor
            .execute("", dir.path(), Duration::from_millis(200), &[])
            .await
            .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn test_timeout_covers_unread_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CliExecutor::new("sleep", vec!["3".into()]);
        let prompt = "x".repeat(1024 * 1024);

        let started = std::time::Instant::now();
        let result = executor
            .execute(&prompt, dir.path(), Duration::from_millis(200), &[])
            .await
            .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_unread_prompt_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CliExecutor::new("true", vec![]);
        let prompt = "x".repeat(1024 * 1024);

        let result = executor
            .execute(&prompt, dir.path(), Duration::from_secs(5), &[])
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_pool_rejects_missing_binary() {
        let bus = Arc::new(EventBus::new(100));
        let pool = cli_executor_pool("definitely-not-a-real-cli", vec![], 1, bus);

        let err = pool.acquire("bug_fix_agent", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ToolkitError::InstanceCreation(_)));
    }

    #[tokio::test]
    async fn test_pool_reuses_available_executor() {
        let bus = Arc::new(EventBus::new(100));
        let pool = cli_executor_pool("true", vec![], 1, bus);

        let first = pool.acquire("bug_fix_agent", Duration::from_secs(1)).await.unwrap();
        pool.release("bug_fix_agent").await;
        let second = pool.acquire("review_agent", Duration::from_secs(5)).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }
}
