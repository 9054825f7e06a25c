// src/runtime/sandbox.rs
//! Sandboxed command execution under named resource-ceiling strategies
//!
//! Provides:
//! - Per-strategy concurrency limits
//! - Wall-clock timeout (kills the whole process group)
//! - Live CPU/memory sampling with after-the-fact ceiling checks
//! - Start/finish telemetry on the event bus
//!
//! `run` never returns an error. Spawn and introspection failures become a
//! failed `SandboxResult` with the error text in `stderr`.

use crate::observability::event_bus::EventBus;
use crate::observability::events::{Event, SandboxPhase};
use crate::runtime::process_manager::{ProcessManager, SpawnConfig};
use crate::runtime::resource_limiter::StrategyConfig;
use crate::runtime::resource_monitor::{ProcessSampler, ResourceMonitor, ResourceUsage};
use crate::utils::errors::{Result, ToolkitError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// How long to keep draining pipes after the process has exited
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Succeeded,
    Failed,
}

/// Binds an agent to a strategy; no process exists until `run`
#[derive(Debug, Clone, Serialize)]
pub struct SandboxSession {
    pub id: Ulid,
    pub agent_id: String,
    pub strategy: String,
    pub created_ts: DateTime<Utc>,
    state: SessionState,
}

impl SandboxSession {
    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }
}

/// Telemetry attached to a run's finish event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTelemetry {
    /// Exit code; -1 when killed or signalled, `None` if never spawned
    pub exit_code: Option<i32>,

    /// Peak CPU percentage over the process group
    pub actual_cpu_used: f64,

    /// Peak resident memory over the process group
    pub actual_memory_mb: f64,

    pub resource_exceeded: bool,
    pub timed_out: bool,
    pub pid: Option<u32>,
}

/// Outcome of a sandboxed run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub latency_ms: f64,
    pub telemetry: ExecutionTelemetry,
}

/// Raw outcome of one spawned command
struct Execution {
    exit_code: i32,
    stdout: String,
    stderr: String,
    usage: ResourceUsage,
    timed_out: bool,
    pid: u32,
}

/// Runs commands under named strategies
pub struct SandboxManager {
    strategies: HashMap<String, Arc<StrategyConfig>>,
    permits: HashMap<String, Arc<Semaphore>>,
    process_manager: ProcessManager,
    event_bus: Arc<EventBus>,
}

impl SandboxManager {
    /// Create a manager for a fixed set of strategies
    pub fn new(strategies: HashMap<String, StrategyConfig>, event_bus: Arc<EventBus>) -> Self {
        let permits = strategies
            .iter()
            .map(|(name, config)| (name.clone(), Arc::new(Semaphore::new(config.max_concurrency.max(1)))))
            .collect();

        let strategies = strategies
            .into_iter()
            .map(|(name, config)| (name, Arc::new(config)))
            .collect();

        Self {
            strategies,
            permits,
            process_manager: ProcessManager::default(),
            event_bus,
        }
    }

    /// Override how commands are spawned (shell, working directory, env)
    pub fn with_spawn_config(mut self, config: SpawnConfig) -> Self {
        self.process_manager = ProcessManager::new(config);
        self
    }

    /// Look up a strategy
    pub fn strategy(&self, name: &str) -> Option<&StrategyConfig> {
        self.strategies.get(name).map(|s| s.as_ref())
    }

    /// Configured strategy names, sorted
    pub fn strategy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }

    /// Create a session; fails for unknown strategies
    pub fn create_session(&self, agent_id: &str, strategy: &str) -> Result<SandboxSession> {
        if !self.strategies.contains_key(strategy) {
            return Err(ToolkitError::UnknownStrategy(strategy.to_string()));
        }

        let session = SandboxSession {
            id: Ulid::new(),
            agent_id: agent_id.to_string(),
            strategy: strategy.to_string(),
            created_ts: Utc::now(),
            state: SessionState::Created,
        };

        debug!("Created sandbox session {} for agent {} ({})", session.id, agent_id, strategy);
        Ok(session)
    }

    /// Run `command` under the session's strategy
    pub async fn run(&self, session: &mut SandboxSession, command: &str) -> SandboxResult {
        session.state = SessionState::Running;

        let (strategy, permits) = match (
            self.strategies.get(&session.strategy),
            self.permits.get(&session.strategy),
        ) {
            (Some(strategy), Some(permits)) => (Arc::clone(strategy), Arc::clone(permits)),
            _ => {
                let err = ToolkitError::UnknownStrategy(session.strategy.clone());
                return self.finish(session, command, Self::failed(&err, 0.0));
            }
        };

        self.event_bus.publish(
            Event::sandbox(&session.agent_id, &session.strategy, SandboxPhase::Start, Some(command))
                .with_data(json!({
                    "cpu_limit_pct": strategy.hard_cpu_limit_pct,
                    "memory_limit_mb": strategy.memory_limit_mb,
                    "network_policy": strategy.network_policy,
                    "timeout_secs": strategy.timeout_secs,
                })),
        );

        // Runs beyond max_concurrency queue here
        let _permit = match permits.acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                let err = ToolkitError::RuntimeError(format!("strategy closed: {}", e));
                return self.finish(session, command, Self::failed(&err, 0.0));
            }
        };

        let started = Instant::now();
        let outcome = self.execute(&strategy, command).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let result = match outcome {
            Ok(execution) => Self::judge(&strategy, execution, latency_ms),
            Err(e) => {
                warn!("Sandbox execution failed for agent {}: {}", session.agent_id, e);
                Self::failed(&e, latency_ms)
            }
        };

        self.finish(session, command, result)
    }

    /// Reserved teardown hook; sessions hold no process or resource
    pub async fn cleanup(&self, session: &SandboxSession) {
        debug!("Cleaning up sandbox session {}", session.id);
        self.event_bus.publish(Event::sandbox(
            &session.agent_id,
            &session.strategy,
            SandboxPhase::Cleanup,
            None,
        ));
    }

    async fn execute(&self, strategy: &StrategyConfig, command: &str) -> Result<Execution> {
        // Fail before spawning if we could not observe the process anyway
        ProcessSampler::probe()?;

        let mut child = self.process_manager.spawn_shell(command)?;
        let pid = child
            .id()
            .ok_or_else(|| ToolkitError::RuntimeError("process exited before its pid was read".into()))?;

        let sampler = match ProcessSampler::new(pid) {
            Ok(sampler) => sampler,
            Err(e) => {
                let _ = ProcessManager::kill_group(pid);
                return Err(e);
            }
        };
        let monitor = ResourceMonitor::start(sampler, strategy.sample_interval());

        let stdout = OutputCollector::spawn(child.stdout.take());
        let stderr = OutputCollector::spawn(child.stderr.take());

        let (exit_code, timed_out) = match tokio::time::timeout(strategy.timeout(), child.wait()).await {
            Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
            Ok(Err(e)) => {
                let _ = ProcessManager::kill_group(pid);
                monitor.finish().await;
                return Err(e.into());
            }
            Err(_) => {
                warn!("Command exceeded {}s timeout, killing process group {}", strategy.timeout_secs, pid);
                if let Err(e) = ProcessManager::kill_group(pid) {
                    warn!("{}", e);
                    let _ = child.start_kill();
                }
                let _ = child.wait().await;
                (-1, true)
            }
        };

        let usage = monitor.finish().await;

        Ok(Execution {
            exit_code,
            stdout: stdout.collect().await,
            stderr: stderr.collect().await,
            usage,
            timed_out,
            pid,
        })
    }

    /// Turn a raw execution into a result, applying the ceilings
    fn judge(strategy: &StrategyConfig, execution: Execution, latency_ms: f64) -> SandboxResult {
        let check = strategy.check(&execution.usage);
        let success = execution.exit_code == 0 && !execution.timed_out && !check.exceeded();

        let mut stderr = execution.stderr;
        if execution.timed_out {
            push_line(&mut stderr, &format!("Command timed out after {}s", strategy.timeout_secs));
        }
        if check.cpu_exceeded {
            push_line(&mut stderr, &format!(
                "CPU ceiling exceeded: {:.1}% > {}%",
                execution.usage.max_cpu_pct, strategy.hard_cpu_limit_pct
            ));
        }
        if check.memory_exceeded {
            push_line(&mut stderr, &format!(
                "Memory ceiling exceeded: {:.1} MB > {} MB",
                execution.usage.max_memory_mb,
                strategy.memory_limit_mb.unwrap_or_default()
            ));
        }

        SandboxResult {
            success,
            stdout: execution.stdout,
            stderr,
            latency_ms,
            telemetry: ExecutionTelemetry {
                exit_code: Some(execution.exit_code),
                actual_cpu_used: execution.usage.max_cpu_pct,
                actual_memory_mb: execution.usage.max_memory_mb,
                resource_exceeded: check.exceeded(),
                timed_out: execution.timed_out,
                pid: Some(execution.pid),
            },
        }
    }

    fn failed(err: &ToolkitError, latency_ms: f64) -> SandboxResult {
        SandboxResult {
            success: false,
            stderr: format!("Execution failed: {}", err),
            latency_ms,
            ..Default::default()
        }
    }

    /// Record the outcome on the session, the event bus and the metrics
    fn finish(&self, session: &mut SandboxSession, command: &str, result: SandboxResult) -> SandboxResult {
        session.state = if result.success {
            SessionState::Succeeded
        } else {
            SessionState::Failed
        };

        let telemetry = &result.telemetry;
        self.event_bus.publish(
            Event::sandbox(&session.agent_id, &session.strategy, SandboxPhase::Finish, Some(command))
                .with_outcome(result.success, result.latency_ms)
                .with_data(json!({
                    "exit_code": telemetry.exit_code,
                    "actual_cpu_used": telemetry.actual_cpu_used,
                    "actual_memory_mb": telemetry.actual_memory_mb,
                    "resource_exceeded": telemetry.resource_exceeded,
                    "timed_out": telemetry.timed_out,
                })),
        );

        metrics::counter!("toolkit_sandbox_runs_total", "success" => result.success.to_string()).increment(1);
        metrics::histogram!("toolkit_sandbox_latency_ms", "strategy" => session.strategy.clone())
            .record(result.latency_ms);

        info!(
            "Sandbox run for agent {} finished: success={} exit={:?} latency={:.1}ms",
            session.agent_id, result.success, telemetry.exit_code, result.latency_ms
        );

        result
    }
}

/// Reads a pipe into a shared buffer so partial output survives an abort
struct OutputCollector {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

impl OutputCollector {
    fn spawn<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);

        let handle = tokio::spawn(async move {
            let Some(mut reader) = reader else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                }
            }
        });

        Self { buffer, handle }
    }

    /// Wait briefly for EOF (a background grandchild may hold the pipe open)
    async fn collect(mut self) -> String {
        if tokio::time::timeout(OUTPUT_GRACE, &mut self.handle).await.is_err() {
            debug!("Output pipe still open after exit, keeping partial output");
            self.handle.abort();
        }

        let output = String::from_utf8_lossy(&self.buffer.lock()).into_owned();
        output
    }
}

fn push_line(buf: &mut String, line: &str) {
    if !buf.is_empty() && !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf.push_str(line);
}
