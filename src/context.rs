// src/context.rs
//! Toolkit context
//!
//! Built once at startup from a `ToolkitConfig` and passed to whatever needs
//! the shared components. Nothing here is global, so independent contexts
//! (one per test, for instance) never interfere.

use crate::observability::event_bus::EventBus;
use crate::observability::events::{Event, EVENT_SYSTEM_INIT};
use crate::runtime::cli_pool::cli_executor_pool;
use crate::runtime::dependency_manager::DependencyManager;
use crate::runtime::dependency_pool::DependencyPool;
use crate::runtime::filesystem_pool::filesystem_pool;
use crate::runtime::sandbox::{SandboxManager, SandboxSession};
use crate::utils::config::{PoolConfig, PoolKind, ToolkitConfig};
use crate::utils::errors::{Result, ToolkitError};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Binary used by CLI executor pools that do not name one
pub const DEFAULT_CLI_BINARY: &str = "cursor";

/// Shared components of a running toolkit
pub struct ToolkitContext {
    config: ToolkitConfig,
    event_bus: Arc<EventBus>,
    dependencies: Arc<DependencyManager>,
    sandbox: Arc<SandboxManager>,
}

impl ToolkitContext {
    /// Build every component and start the cleanup loop
    pub async fn initialize(config: ToolkitConfig) -> Result<Self> {
        let event_bus = Arc::new(EventBus::new(config.observability.event_buffer_size));
        Self::initialize_with_event_bus(config, event_bus).await
    }

    /// Like `initialize`, publishing on an existing bus (e.g. one the log
    /// forwarding layer already writes to)
    pub async fn initialize_with_event_bus(config: ToolkitConfig, event_bus: Arc<EventBus>) -> Result<Self> {
        config.validate()?;

        let strategies: HashMap<_, _> = config
            .sandbox
            .strategies
            .iter()
            .map(|(name, strategy)| (name.clone(), strategy.clone()))
            .collect();
        let sandbox = Arc::new(SandboxManager::new(strategies, Arc::clone(&event_bus)));

        let dependencies = Arc::new(DependencyManager::new());
        for (name, pool_config) in &config.dependency_pools {
            dependencies.register_pool(name.clone(), build_pool(pool_config, &event_bus));
        }

        for (agent, agent_config) in &config.agents {
            dependencies.register_agent(agent, agent_config.dependency_pools.iter().cloned())?;
        }

        dependencies.start_cleanup_task(config.cleanup.interval(), config.cleanup.max_age());

        event_bus.publish(
            Event::new(EVENT_SYSTEM_INIT, "bootstrap").with_data(json!({
                "environment": config.meta.environment,
                "dependency_pools": config.dependency_pools.keys().collect::<Vec<_>>(),
                "strategies": sandbox.strategy_names(),
                "agents": config.agents.keys().collect::<Vec<_>>(),
            })),
        );

        info!(
            "Toolkit initialized: {} pools, {} strategies, {} agents",
            config.dependency_pools.len(),
            config.sandbox.strategies.len(),
            config.agents.len()
        );

        Ok(Self {
            config,
            event_bus,
            dependencies,
            sandbox,
        })
    }

    pub fn config(&self) -> &ToolkitConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn dependencies(&self) -> &Arc<DependencyManager> {
        &self.dependencies
    }

    pub fn sandbox(&self) -> &Arc<SandboxManager> {
        &self.sandbox
    }

    /// Re-authorize a configured agent, e.g. after `release_agent_dependencies`
    pub fn register_agent(&self, agent: &str) -> Result<()> {
        let agent_config = self
            .config
            .agents
            .get(agent)
            .ok_or_else(|| ToolkitError::UnknownAgent(agent.to_string()))?;

        self.dependencies
            .register_agent(agent, agent_config.dependency_pools.iter().cloned())
    }

    /// Open a sandbox session for a configured agent
    ///
    /// `strategy` overrides the agent's configured strategy.
    pub fn create_agent_session(&self, agent: &str, strategy: Option<&str>) -> Result<SandboxSession> {
        let resolved = self.config.resolve_agent(agent)?;
        let strategy = strategy.unwrap_or(resolved.strategy_name.as_str());
        self.sandbox.create_session(agent, strategy)
    }

    /// Stop the cleanup loop, release every agent and drain idle instances
    pub async fn shutdown(&self) {
        for agent in self.dependencies.registered_agents() {
            self.dependencies.release_agent_dependencies(&agent).await;
        }
        self.dependencies.shutdown().await;

        info!("Toolkit shut down");
    }
}

fn build_pool(config: &PoolConfig, event_bus: &Arc<EventBus>) -> Arc<dyn DependencyPool> {
    match config.kind {
        PoolKind::Filesystem => Arc::new(filesystem_pool(
            &config.paths,
            config.max_instances,
            Arc::clone(event_bus),
        )),
        PoolKind::CliExecutor => Arc::new(cli_executor_pool(
            config.binary_path.as_deref().unwrap_or(DEFAULT_CLI_BINARY),
            config.args.clone(),
            config.max_instances,
            Arc::clone(event_bus),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::cli_pool::CliExecutor;
    use crate::runtime::filesystem_pool::FileSystemAccessor;
    use std::time::Duration;

    fn config_for(root: &str) -> ToolkitConfig {
        let raw = json!({
            "sandbox": {
                "strategies": {
                    "subprocess": {},
                    "strict": { "max_concurrency": 1, "timeout_secs": 5 }
                }
            },
            "dependency_pools": {
                "workspace": { "type": "filesystem", "paths": [root], "max_instances": 1 },
                "shell": { "type": "cli_executor", "binary_path": "true" }
            },
            "agents": {
                "bug_fix_agent": { "dependency_pools": ["workspace", "shell"] },
                "review_agent": { "sandbox_strategy": "strict" }
            }
        });
        ToolkitConfig::from_value(raw).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_wires_components() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolkitContext::initialize(config_for(&dir.path().to_string_lossy()))
            .await
            .unwrap();

        let init = ctx.event_bus().recent_of_type(EVENT_SYSTEM_INIT, 1);
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].data_field("agents"), Some(&json!(["bug_fix_agent", "review_agent"])));

        let stats = ctx.dependencies().stats().await;
        assert_eq!(stats.total_pools, 2);
        assert_eq!(stats.total_agents, 2);
        assert!(ctx.dependencies().is_cleanup_running());

        let fs = ctx
            .dependencies()
            .get_dependency_as::<FileSystemAccessor>("bug_fix_agent", "workspace", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(fs.is_allowed(dir.path()));

        let cli = ctx
            .dependencies()
            .get_dependency_as::<CliExecutor>("bug_fix_agent", "shell", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(cli.binary_path().ends_with("true"));

        ctx.shutdown().await;
        assert!(!ctx.dependencies().is_cleanup_running());
        assert_eq!(ctx.dependencies().stats().await.total_agents, 0);
    }

    #[tokio::test]
    async fn test_agent_sessions_use_configured_strategy() {
        let ctx = ToolkitContext::initialize(config_for("/tmp")).await.unwrap();

        let session = ctx.create_agent_session("review_agent", None).unwrap();
        assert_eq!(session.strategy, "strict");

        let session = ctx.create_agent_session("bug_fix_agent", None).unwrap();
        assert_eq!(session.strategy, "subprocess");

        let session = ctx.create_agent_session("bug_fix_agent", Some("strict")).unwrap();
        assert_eq!(session.strategy, "strict");

        assert!(ctx.create_agent_session("bug_fix_agent", Some("docker")).is_err());
        assert!(ctx.create_agent_session("ghost", None).is_err());

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_reregister_after_release() {
        let ctx = ToolkitContext::initialize(config_for("/tmp")).await.unwrap();
        let deps = ctx.dependencies();

        deps.get_dependency("bug_fix_agent", "workspace", Duration::from_secs(1)).await.unwrap();
        deps.release_agent_dependencies("bug_fix_agent").await;
        assert!(!deps.is_registered("bug_fix_agent"));

        ctx.register_agent("bug_fix_agent").unwrap();
        assert!(deps.get_dependency("bug_fix_agent", "workspace", Duration::from_secs(1)).await.is_ok());

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_contexts_are_independent() {
        let a = ToolkitContext::initialize(config_for("/tmp")).await.unwrap();
        let b = ToolkitContext::initialize(config_for("/tmp")).await.unwrap();

        // Capacity 1 in each context; holding one does not block the other
        a.dependencies()
            .get_dependency("bug_fix_agent", "workspace", Duration::from_secs(1))
            .await
            .unwrap();
        b.dependencies()
            .get_dependency("bug_fix_agent", "workspace", Duration::from_millis(100))
            .await
            .unwrap();

        a.shutdown().await;
        b.shutdown().await;
    }
}
