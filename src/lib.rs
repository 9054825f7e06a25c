// src/lib.rs
//! Agent Toolkit Engine Library
//!
//! Resource pooling and sandboxed execution core for agent orchestration:
//! many short-lived agent tasks share a few expensive external resources and
//! run shell commands under observed resource ceilings.
//!
//! # Architecture
//!
//! - **runtime**: dependency pools, dependency manager, sandbox
//! - **observability**: event bus, tracing, metrics
//! - **context**: explicit wiring of the shared components
//! - **utils**: configuration and errors

pub mod context;
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use context::ToolkitContext;
pub use observability::event_bus::EventBus;
pub use runtime::dependency_manager::DependencyManager;
pub use runtime::sandbox::{SandboxManager, SandboxResult};
pub use utils::config::ToolkitConfig;
pub use utils::errors::{Result, ToolkitError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
