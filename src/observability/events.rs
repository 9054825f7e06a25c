// src/observability/events.rs
//! Structured telemetry events
//!
//! Every event carries the common envelope (`ts`, `event_type`, `component`,
//! `data`) plus kind-specific fields. Events are immutable once published;
//! the bus buffer owns its copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type emitted by dependency pools
pub const EVENT_DEPENDENCY_POOL: &str = "dependency.pool";

/// Event type emitted by the sandbox manager
pub const EVENT_SANDBOX_EXEC: &str = "sandbox.exec";

/// Event type for forwarded log records
pub const EVENT_LOG: &str = "log";

/// Event type emitted once the toolkit context is up
pub const EVENT_SYSTEM_INIT: &str = "system.init";

/// A published telemetry event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Publication timestamp
    pub ts: DateTime<Utc>,
    
    /// Routing key used by subscribers (e.g. "dependency.pool")
    pub event_type: String,
    
    /// Emitting component
    pub component: Option<String>,
    
    /// Free-form payload
    #[serde(default)]
    pub data: Map<String, Value>,
    
    /// Kind-specific fields
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Kind-specific event fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Envelope only
    Generic,
    
    /// Forwarded tracing record
    Log {
        level: String,
        message: String,
        target: String,
    },
    
    /// Pool lifecycle transition
    DependencyPool {
        action: PoolAction,
        dependency_type: String,
        agent_id: Option<String>,
        in_use: usize,
        available: usize,
    },
    
    /// Sandboxed command telemetry
    SandboxExecution {
        agent_id: String,
        strategy: String,
        phase: SandboxPhase,
        command: Option<String>,
        success: Option<bool>,
        latency_ms: Option<f64>,
    },
}

/// Pool lifecycle actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolAction {
    Acquire,
    Release,
    Cleanup,
}

/// Sandbox execution phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxPhase {
    Start,
    Finish,
    Cleanup,
}

impl Event {
    /// Create an envelope-only event
    pub fn new(event_type: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            event_type: event_type.into(),
            component: Some(component.into()),
            data: Map::new(),
            kind: EventKind::Generic,
        }
    }
    
    /// Pool lifecycle event
    pub fn dependency_pool(
        action: PoolAction,
        dependency_type: &str,
        agent_id: Option<&str>,
        in_use: usize,
        available: usize,
    ) -> Self {
        Self {
            kind: EventKind::DependencyPool {
                action,
                dependency_type: dependency_type.to_string(),
                agent_id: agent_id.map(str::to_string),
                in_use,
                available,
            },
            ..Self::new(EVENT_DEPENDENCY_POOL, "dependency_pool")
        }
    }
    
    /// Sandbox execution event; outcome fields are filled by `with_outcome`
    pub fn sandbox(agent_id: &str, strategy: &str, phase: SandboxPhase, command: Option<&str>) -> Self {
        Self {
            kind: EventKind::SandboxExecution {
                agent_id: agent_id.to_string(),
                strategy: strategy.to_string(),
                phase,
                command: command.map(str::to_string),
                success: None,
                latency_ms: None,
            },
            ..Self::new(EVENT_SANDBOX_EXEC, "sandbox")
        }
    }
    
    /// Forwarded log record
    pub fn log(level: &str, message: String, target: &str) -> Self {
        Self {
            kind: EventKind::Log {
                level: level.to_string(),
                message,
                target: target.to_string(),
            },
            ..Self::new(EVENT_LOG, target)
        }
    }
    
    /// Attach an outcome to a sandbox event (no-op for other kinds)
    pub fn with_outcome(mut self, outcome_success: bool, outcome_latency_ms: f64) -> Self {
        if let EventKind::SandboxExecution { success, latency_ms, .. } = &mut self.kind {
            *success = Some(outcome_success);
            *latency_ms = Some(outcome_latency_ms);
        }
        self
    }
    
    /// Merge an object into the payload; non-object values land under "value"
    pub fn with_data(mut self, data: Value) -> Self {
        match data {
            Value::Object(map) => self.data.extend(map),
            other => {
                self.data.insert("value".to_string(), other);
            }
        }
        self
    }
    
    /// Look up a payload field
    pub fn data_field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}
