// src/utils/errors.rs
//! Error types for the toolkit engine
//!
//! Errors fall into three classes:
//!
//! - **Configuration**: unknown pool, agent, dependency or strategy. These are
//!   caller precondition violations and are never retried internally.
//! - **Timeout**: a pool could not hand out an instance within the window.
//! - **Runtime**: instance creation, process spawning and introspection failures.
//!
//! Sandboxed command outcomes are not errors: `SandboxManager::run` always
//! returns a `SandboxResult`, converting any of the runtime errors below into
//! a failed result.

use std::time::Duration;
use thiserror::Error;

/// Result type for toolkit operations
pub type Result<T> = std::result::Result<T, ToolkitError>;

/// Toolkit engine errors
#[derive(Debug, Error)]
pub enum ToolkitError {
    #[error("Unknown dependency pool: {0}")]
    UnknownPool(String),

    #[error("Agent {0} not registered")]
    UnknownAgent(String),

    #[error("Agent {agent_id} not authorized for dependency {dependency}")]
    Unauthorized { agent_id: String, dependency: String },

    #[error("Unknown sandbox strategy: {0}")]
    UnknownStrategy(String),

    #[error("Dependency {dependency} does not hold instances of type {expected}")]
    DependencyTypeMismatch {
        dependency: String,
        expected: &'static str,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("No available {dependency_type} instance within {timeout:?}")]
    Timeout {
        dependency_type: String,
        timeout: Duration,
    },

    #[error("Failed to create instance: {0}")]
    InstanceCreation(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    #[error("Process introspection unavailable: {0}")]
    ProcessIntrospection(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolkitError {
    /// True for caller precondition violations (unknown names, bad config)
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ToolkitError::UnknownPool(_)
                | ToolkitError::UnknownAgent(_)
                | ToolkitError::Unauthorized { .. }
                | ToolkitError::UnknownStrategy(_)
                | ToolkitError::DependencyTypeMismatch { .. }
                | ToolkitError::InvalidConfig(_)
                | ToolkitError::Config(_)
        )
    }

    /// True when a pool could not supply an instance in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, ToolkitError::Timeout { .. })
    }
}
