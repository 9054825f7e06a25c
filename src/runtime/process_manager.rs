// src/runtime/process_manager.rs
//! Process manager for spawning and terminating sandboxed commands
//!
//! Commands run through a shell (`/bin/sh -c`) in their own process group,
//! so the resource monitor can account for every descendant and a timeout
//! can take the whole group down at once.

use crate::utils::errors::{Result, ToolkitError};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Default shell used for sandboxed commands
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Configuration for spawning a command
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Shell binary
    pub shell: PathBuf,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// Extra environment variables
    pub env_vars: Vec<(String, String)>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from(DEFAULT_SHELL),
            work_dir: None,
            env_vars: vec![],
        }
    }
}

/// Process manager for shell commands
#[derive(Debug, Clone, Default)]
pub struct ProcessManager {
    config: SpawnConfig,
}

impl ProcessManager {
    /// Create a process manager
    pub fn new(config: SpawnConfig) -> Self {
        Self { config }
    }

    /// Spawn `command` as the leader of a new process group
    pub fn spawn_shell(&self, command: &str) -> Result<Child> {
        debug!("Spawning shell command: {}", command);

        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c").arg(command);

        if let Some(work_dir) = &self.config.work_dir {
            cmd.current_dir(work_dir);
        }

        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()
            .map_err(|e| ToolkitError::ProcessSpawnFailed(
                format!("Failed to spawn '{}': {}", command, e)
            ))?;

        debug!("Process spawned with PID: {:?}", child.id());

        Ok(child)
    }

    /// Forcibly kill every process in a group
    #[cfg(unix)]
    pub fn kill_group(pgid: u32) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        debug!("Sending SIGKILL to process group {}", pgid);

        match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ToolkitError::RuntimeError(
                format!("Failed to kill process group {}: {}", pgid, e)
            )),
        }
    }

    #[cfg(not(unix))]
    pub fn kill_group(_pgid: u32) -> Result<()> {
        Err(ToolkitError::RuntimeError("Process groups not supported on this platform".into()))
    }

    /// Check if a process is running
    #[cfg(unix)]
    pub fn is_running(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    pub fn is_running(_pid: u32) -> bool {
        false
    }
}
