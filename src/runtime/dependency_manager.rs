// src/runtime/dependency_manager.rs
//! Dependency manager
//!
//! Composes named dependency pools, authorizes which agent may use which
//! pool, and runs periodic eviction of expired idle instances.

use crate::runtime::dependency_pool::{DependencyPool, PoolStats};
use crate::utils::errors::{Result, ToolkitError};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Aggregate manager statistics
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Per-pool statistics
    pub pools: BTreeMap<String, PoolStats>,

    /// Agent -> authorized pool names
    pub agents: BTreeMap<String, BTreeSet<String>>,

    pub total_agents: usize,
    pub total_pools: usize,
}

/// Running cleanup loop
struct CleanupTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Named pools plus per-agent authorization
#[derive(Default)]
pub struct DependencyManager {
    pools: DashMap<String, Arc<dyn DependencyPool>>,
    agents: DashMap<String, HashSet<String>>,
    cleanup_task: Mutex<Option<CleanupTask>>,
}

impl DependencyManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a pool under `name`
    pub fn register_pool(&self, name: impl Into<String>, pool: Arc<dyn DependencyPool>) {
        let name = name.into();
        if self.pools.insert(name.clone(), pool).is_some() {
            warn!("Replaced existing dependency pool: {}", name);
        } else {
            info!("Registered dependency pool: {}", name);
        }
    }

    /// Authorize `agent_id` for exactly the given pools
    ///
    /// Every name is checked before anything is stored, so an unknown pool
    /// leaves the previous registration untouched.
    pub fn register_agent<I, S>(&self, agent_id: &str, dependencies: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dependencies: HashSet<String> = dependencies.into_iter().map(Into::into).collect();

        if let Some(missing) = dependencies.iter().find(|name| !self.pools.contains_key(*name)) {
            return Err(ToolkitError::UnknownPool(missing.clone()));
        }

        info!("Registered agent {} with dependencies: {:?}", agent_id, dependencies);
        self.agents.insert(agent_id.to_string(), dependencies);
        Ok(())
    }

    /// Check whether `agent_id` is currently registered
    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Currently registered agents, sorted
    pub fn registered_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.agents.iter().map(|entry| entry.key().clone()).collect();
        agents.sort();
        agents
    }

    /// Acquire an instance of `dependency` on behalf of `agent_id`
    pub async fn get_dependency(
        &self,
        agent_id: &str,
        dependency: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Any + Send + Sync>> {
        let pool = self.authorized_pool(agent_id, dependency)?;
        pool.acquire_any(agent_id, timeout).await
    }

    /// Typed variant of `get_dependency`
    ///
    /// On a type mismatch the acquired instance is released again before the
    /// error is returned.
    pub async fn get_dependency_as<T>(
        &self,
        agent_id: &str,
        dependency: &str,
        timeout: Duration,
    ) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let pool = self.authorized_pool(agent_id, dependency)?;
        let instance = pool.acquire_any(agent_id, timeout).await?;

        match instance.downcast::<T>() {
            Ok(typed) => Ok(typed),
            Err(_) => {
                pool.release(agent_id).await;
                Err(ToolkitError::DependencyTypeMismatch {
                    dependency: dependency.to_string(),
                    expected: std::any::type_name::<T>(),
                })
            }
        }
    }

    /// Release the instance `agent_id` holds from `dependency`
    pub async fn release_dependency(&self, agent_id: &str, dependency: &str) {
        let pool = self.pools.get(dependency).map(|p| Arc::clone(p.value()));

        match pool {
            Some(pool) => pool.release(agent_id).await,
            None => debug!("Release for unknown pool {} ignored", dependency),
        }
    }

    /// Release everything `agent_id` holds and forget its registration
    ///
    /// The agent must call `register_agent` again before its next
    /// `get_dependency`.
    pub async fn release_agent_dependencies(&self, agent_id: &str) {
        let Some((_, dependencies)) = self.agents.remove(agent_id) else {
            debug!("Agent {} not registered, nothing to release", agent_id);
            return;
        };

        for dependency in &dependencies {
            self.release_dependency(agent_id, dependency).await;
        }

        info!("Released all dependencies for agent {}", agent_id);
    }

    /// Evict expired idle instances from every pool
    pub async fn cleanup_expired_instances(&self, max_age: Duration) -> BTreeMap<String, usize> {
        let mut removed = BTreeMap::new();

        for (name, pool) in self.pool_snapshot() {
            match pool.cleanup_expired(max_age).await {
                Ok(count) => {
                    removed.insert(name, count);
                }
                Err(e) => error!("Cleanup failed for pool {}: {}", name, e),
            }
        }

        removed
    }

    /// Get manager statistics
    pub async fn stats(&self) -> ManagerStats {
        let pools: BTreeMap<String, PoolStats> = join_all(
            self.pool_snapshot()
                .into_iter()
                .map(|(name, pool)| async move { (name, pool.stats().await) }),
        )
        .await
        .into_iter()
        .collect();

        let agents: BTreeMap<String, BTreeSet<String>> = self
            .agents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().iter().cloned().collect()))
            .collect();

        ManagerStats {
            total_agents: agents.len(),
            total_pools: pools.len(),
            pools,
            agents,
        }
    }

    /// Start the periodic eviction loop, replacing any running one
    ///
    /// The loop holds only a weak reference and ends once the manager is
    /// dropped.
    pub fn start_cleanup_task(self: &Arc<Self>, interval: Duration, max_age: Duration) {
        let mut slot = self.cleanup_task.lock();

        if let Some(previous) = slot.take() {
            debug!("Restarting dependency cleanup task");
            previous.token.cancel();
        }

        let token = CancellationToken::new();
        let manager: Weak<Self> = Arc::downgrade(self);
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(manager) = manager.upgrade() else {
                    break;
                };

                let removed = manager.cleanup_expired_instances(max_age).await;
                let total: usize = removed.values().sum();
                if total > 0 {
                    info!("Dependency cleanup removed {} instances: {:?}", total, removed);
                }
            }

            debug!("Dependency cleanup task stopped");
        });

        info!("Started dependency cleanup task (interval {:?}, max age {:?})", interval, max_age);
        *slot = Some(CleanupTask { token, handle });
    }

    /// Stop the eviction loop and wait for it to exit
    pub async fn stop_cleanup_task(&self) {
        let task = self.cleanup_task.lock().take();

        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                warn!("Dependency cleanup task ended abnormally: {}", e);
            }
            info!("Stopped dependency cleanup task");
        }
    }

    /// Stop the eviction loop and destroy every idle instance
    pub async fn shutdown(&self) {
        self.stop_cleanup_task().await;

        for (name, pool) in self.pool_snapshot() {
            pool.shutdown().await;
            debug!("Shut down dependency pool {}", name);
        }
    }

    /// Check whether the eviction loop is running
    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup_task
            .lock()
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    fn authorized_pool(&self, agent_id: &str, dependency: &str) -> Result<Arc<dyn DependencyPool>> {
        let authorized = self
            .agents
            .get(agent_id)
            .ok_or_else(|| ToolkitError::UnknownAgent(agent_id.to_string()))?
            .contains(dependency);

        if !authorized {
            return Err(ToolkitError::Unauthorized {
                agent_id: agent_id.to_string(),
                dependency: dependency.to_string(),
            });
        }

        self.pools
            .get(dependency)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| ToolkitError::UnknownPool(dependency.to_string()))
    }

    /// Clone the pool handles out so no map guard is held across an await
    fn pool_snapshot(&self) -> Vec<(String, Arc<dyn DependencyPool>)> {
        self.pools
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }
}

impl Drop for DependencyManager {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.get_mut().take() {
            task.token.cancel();
        }
    }
}
