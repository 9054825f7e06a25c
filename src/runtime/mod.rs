// src/runtime/mod.rs
//! Resource pooling and sandboxed execution
//!
//! - **Dependency Pool**: bounded, validated, reusable instances with timed waits
//! - **Filesystem / CLI pools**: the two concrete resource kinds
//! - **Dependency Manager**: named pools plus per-agent authorization
//! - **Sandbox**: shell commands under named resource-ceiling strategies
//! - **Process Manager / Resource Monitor**: process groups and /proc sampling
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  DependencyManager                   │
//! │   agents: {agent -> {pool names}}                    │
//! │   ┌──────────────┐  ┌──────────────┐                 │
//! │   │ filesystem   │  │ cli_executor │  ...            │
//! │   │ ResourcePool │  │ ResourcePool │                 │
//! │   └──────────────┘  └──────────────┘                 │
//! │          ▲  periodic cleanup_expired                 │
//! └──────────┼───────────────────────────────────────────┘
//!            │ acquire / release
//!      agent tasks ──── run ────► SandboxManager
//!                                  ├─ semaphore per strategy
//!                                  ├─ /bin/sh -c (own process group)
//!                                  └─ ResourceMonitor (/proc sampling)
//! ```
//!
//! Both halves publish lifecycle events on the shared `EventBus`.

pub mod cli_pool;
pub mod dependency_manager;
pub mod dependency_pool;
pub mod filesystem_pool;
pub mod process_manager;
pub mod resource_limiter;
pub mod resource_monitor;
pub mod sandbox;

// Re-export commonly used types
pub use cli_pool::{CliExecutor, CliExecutorFactory, CliExecutorPool, CliOutput};
pub use dependency_manager::{DependencyManager, ManagerStats};
pub use dependency_pool::{DependencyPool, InstanceFactory, Pingable, PoolStats, ResourcePool};
pub use filesystem_pool::{FileSystemAccessor, FileSystemFactory, FileSystemPool};
pub use process_manager::{ProcessManager, SpawnConfig};
pub use resource_limiter::{NetworkPolicy, StrategyConfig};
pub use resource_monitor::{ResourceMonitor, ResourceUsage};
pub use sandbox::{SandboxManager, SandboxResult, SandboxSession, SessionState};
