// src/runtime/dependency_pool.rs
//! Bounded pool of reusable dependency instances
//!
//! Many short-lived agent tasks share a small number of expensive external
//! resources. Each pool hands out at most `max_instances` instances at once,
//! reuses idle ones after validating them, and makes callers wait (with a
//! deadline) when the pool is exhausted.
//!
//! # Architecture
//!
//! ```text
//! ResourcePool<F>
//! ├─ idle:    [inst3, inst5]            (validated, FIFO)
//! ├─ in_use:  {agent-a: inst1, ...}     (at most max_instances)
//! ├─ records: {id -> instance metadata}
//! └─ waiters: parked on `available`     (woken on release)
//! ```
//!
//! The decision phase (check idle, check capacity, park) runs under the pool
//! lock, so concurrent acquirers never over-allocate. Waiters are not served
//! in FIFO order: whoever wins the lock after a release gets the instance.

use crate::observability::event_bus::EventBus;
use crate::observability::events::{Event, PoolAction};
use crate::utils::errors::{Result, ToolkitError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// No-op liveness probe every pooled resource implements
#[async_trait]
pub trait Pingable: Send + Sync {
    /// Cheap liveness/capability check, not a deep health check
    async fn ping(&self) -> Result<()>;
}

/// Creates, destroys and validates the instances of one pool
#[async_trait]
pub trait InstanceFactory: Send + Sync + 'static {
    /// Instance handle type
    type Instance: Pingable + 'static;

    /// Create a new instance (may fail)
    async fn create_instance(&self) -> Result<Self::Instance>;

    /// Tear an instance down; errors are logged by the pool, never propagated
    async fn destroy_instance(&self, instance: &Self::Instance) -> Result<()>;

    /// Decide whether an instance may be handed out again
    async fn validate_instance(&self, instance: &Self::Instance) -> bool {
        instance.ping().await.is_ok()
    }
}

type InstanceId = u64;

/// Metadata kept for every live instance
struct InstanceRecord<T> {
    instance: Arc<T>,
    owning_agent_id: Option<String>,
    acquired_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
    use_count: u64,
    created_at: Instant,
}

impl<T> InstanceRecord<T> {
    fn touch(&mut self, agent_id: &str) {
        let now = Utc::now();
        if self.owning_agent_id.as_deref() != Some(agent_id) {
            self.acquired_at = now;
        }
        self.owning_agent_id = Some(agent_id.to_string());
        self.last_used = now;
        self.use_count += 1;
    }
}

/// Lock-protected pool state
struct PoolState<T> {
    /// Idle instances, oldest release first
    idle: VecDeque<InstanceId>,

    /// Agent -> held instance
    in_use: HashMap<String, InstanceId>,

    /// Live instance metadata (idle and in use)
    records: HashMap<InstanceId, InstanceRecord<T>>,

    next_id: InstanceId,
}

impl<T> PoolState<T> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            in_use: HashMap::new(),
            records: HashMap::new(),
            next_id: 0,
        }
    }

    /// Move an instance into the in-use map and return its handle
    fn assign(&mut self, id: InstanceId, agent_id: &str) -> Option<Arc<T>> {
        let record = self.records.get_mut(&id)?;
        record.touch(agent_id);
        let instance = Arc::clone(&record.instance);
        self.in_use.insert(agent_id.to_string(), id);
        Some(instance)
    }
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub dependency_type: String,
    pub max_instances: usize,
    pub in_use: usize,
    pub available: usize,

    /// Live instances tracked by the pool (idle + in use)
    pub total_created: usize,

    /// Use count of the instance each agent currently holds
    pub per_agent_use_count: BTreeMap<String, u64>,
}

/// Snapshot of one live instance's metadata
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub owning_agent_id: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub use_count: u64,
    pub age_secs: f64,
}

/// Generic bounded pool over a factory's instances
pub struct ResourcePool<F: InstanceFactory> {
    dependency_type: String,
    max_instances: usize,
    factory: F,
    state: Mutex<PoolState<F::Instance>>,

    /// Signalled whenever an instance goes idle or capacity frees up
    available: Notify,

    event_bus: Arc<EventBus>,
}

impl<F: InstanceFactory> ResourcePool<F> {
    /// Create an empty pool; instances are created lazily on demand
    pub fn new(
        dependency_type: impl Into<String>,
        max_instances: usize,
        factory: F,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let dependency_type = dependency_type.into();
        debug!("Creating {} pool with {} max instances", dependency_type, max_instances);

        Self {
            dependency_type,
            max_instances,
            factory,
            state: Mutex::new(PoolState::new()),
            available: Notify::new(),
            event_bus,
        }
    }

    /// Dependency kind served by this pool
    pub fn dependency_type(&self) -> &str {
        &self.dependency_type
    }

    /// Capacity bound
    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    /// Underlying factory
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Acquire an instance for `agent_id`, waiting up to `timeout`
    ///
    /// An agent that already holds an instance gets the same one back.
    /// The deadline is fixed on entry and covers waiting for the pool lock
    /// and for capacity. Validating or creating an instance once the lock is
    /// held is not interrupted.
    pub async fn acquire(&self, agent_id: &str, timeout: Duration) -> Result<Arc<F::Instance>> {
        let deadline = Instant::now() + timeout;

        loop {
            let Ok(mut state) = tokio::time::timeout_at(deadline, self.state.lock()).await else {
                return Err(self.timed_out(agent_id, timeout));
            };

            if let Some(id) = state.in_use.get(agent_id).copied() {
                if let Some(instance) = state.assign(id, agent_id) {
                    debug!("Agent {} already holds a {} instance", agent_id, self.dependency_type);
                    self.publish(PoolAction::Acquire, Some(agent_id), &state);
                    return Ok(instance);
                }
            }

            // Reuse idle instances, dropping any that no longer validate.
            // An id leaves `idle` only once validation is done, so a
            // cancelled acquire never strands it.
            while let Some(id) = state.idle.front().copied() {
                let Some(candidate) = state.records.get(&id).map(|r| Arc::clone(&r.instance)) else {
                    state.idle.pop_front();
                    continue;
                };

                let valid = self.factory.validate_instance(&candidate).await;
                state.idle.pop_front();

                if valid {
                    if let Some(instance) = state.assign(id, agent_id) {
                        debug!("Reused {} instance for agent {}", self.dependency_type, agent_id);
                        self.publish(PoolAction::Acquire, Some(agent_id), &state);
                        metrics::counter!("toolkit_pool_acquire_total", "dependency" => self.dependency_type.clone()).increment(1);
                        return Ok(instance);
                    }
                } else {
                    warn!("Dropping idle {} instance that failed validation", self.dependency_type);
                    self.discard(&mut state, id).await;
                }
            }

            if state.in_use.len() < self.max_instances {
                let instance = Arc::new(self.factory.create_instance().await?);

                let id = state.next_id;
                state.next_id += 1;
                let now = Utc::now();
                state.records.insert(id, InstanceRecord {
                    instance: Arc::clone(&instance),
                    owning_agent_id: Some(agent_id.to_string()),
                    acquired_at: now,
                    last_used: now,
                    use_count: 1,
                    created_at: Instant::now(),
                });
                state.in_use.insert(agent_id.to_string(), id);

                info!("Created new {} instance for agent {}", self.dependency_type, agent_id);
                self.publish(PoolAction::Acquire, Some(agent_id), &state);
                metrics::counter!("toolkit_pool_acquire_total", "dependency" => self.dependency_type.clone()).increment(1);
                return Ok(instance);
            }

            // Exhausted: register as a waiter before unlocking so a release
            // between unlock and await is not missed
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(state);

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(self.timed_out(agent_id, timeout));
            }
        }
    }

    /// Return the instance held by `agent_id` (no-op if it holds none)
    pub async fn release(&self, agent_id: &str) {
        let mut state = self.state.lock().await;

        let Some(id) = state.in_use.get(agent_id).copied() else {
            debug!("Agent {} holds no {} instance, nothing to release", agent_id, self.dependency_type);
            return;
        };

        // Stays in use until validated; a cancelled release leaves the agent
        // holding it
        let instance = state.records.get(&id).map(|r| Arc::clone(&r.instance));
        let still_valid = match &instance {
            Some(instance) => self.factory.validate_instance(instance).await,
            None => false,
        };
        state.in_use.remove(agent_id);

        if still_valid {
            if let Some(record) = state.records.get_mut(&id) {
                record.owning_agent_id = None;
            }
            state.idle.push_back(id);
            debug!("Released {} instance from agent {}", self.dependency_type, agent_id);
        } else {
            self.discard(&mut state, id).await;
            warn!("Destroyed invalid {} instance from agent {}", self.dependency_type, agent_id);
        }

        self.publish(PoolAction::Release, Some(agent_id), &state);
        drop(state);

        self.available.notify_one();
    }

    /// Destroy idle instances older than `max_age`; in-use ones are never touched
    pub async fn cleanup_expired(&self, max_age: Duration) -> usize {
        let mut state = self.state.lock().await;

        let (expired, keep): (Vec<InstanceId>, Vec<InstanceId>) = state
            .idle
            .iter()
            .copied()
            .partition(|id| {
                state
                    .records
                    .get(id)
                    .map(|r| r.created_at.elapsed() > max_age)
                    .unwrap_or(true)
            });

        state.idle = keep.into_iter().collect();

        let removed = expired.len();
        for id in expired {
            self.discard(&mut state, id).await;
        }

        if removed > 0 {
            info!("Cleaned up {} expired {} instances", removed, self.dependency_type);
            metrics::counter!("toolkit_pool_cleanup_removed_total", "dependency" => self.dependency_type.clone())
                .increment(removed as u64);

            let event = Event::dependency_pool(
                PoolAction::Cleanup,
                &self.dependency_type,
                None,
                state.in_use.len(),
                state.idle.len(),
            )
            .with_data(serde_json::json!({ "expired_count": removed }));
            self.event_bus.publish(event);
        }

        removed
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;

        let per_agent_use_count = state
            .in_use
            .iter()
            .filter_map(|(agent_id, id)| {
                state.records.get(id).map(|r| (agent_id.clone(), r.use_count))
            })
            .collect();

        PoolStats {
            dependency_type: self.dependency_type.clone(),
            max_instances: self.max_instances,
            in_use: state.in_use.len(),
            available: state.idle.len(),
            total_created: state.records.len(),
            per_agent_use_count,
        }
    }

    /// Metadata of every live instance, in-use first
    pub async fn instances(&self) -> Vec<InstanceInfo> {
        let state = self.state.lock().await;

        let mut infos: Vec<InstanceInfo> = state
            .records
            .values()
            .map(|r| InstanceInfo {
                owning_agent_id: r.owning_agent_id.clone(),
                acquired_at: r.acquired_at,
                last_used: r.last_used,
                use_count: r.use_count,
                age_secs: r.created_at.elapsed().as_secs_f64(),
            })
            .collect();
        infos.sort_by_key(|i| i.owning_agent_id.is_none());
        infos
    }

    /// Destroy every idle instance (in-use instances are left to their owners)
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let idle: Vec<InstanceId> = state.idle.drain(..).collect();

        for id in idle {
            self.discard(&mut state, id).await;
        }

        debug!("{} pool shut down, {} instances still in use", self.dependency_type, state.in_use.len());
    }

    /// Drop metadata and destroy an instance that is no longer pooled
    async fn discard(&self, state: &mut PoolState<F::Instance>, id: InstanceId) {
        if let Some(record) = state.records.remove(&id) {
            if let Err(e) = self.factory.destroy_instance(&record.instance).await {
                warn!("Error destroying {} instance: {}", self.dependency_type, e);
            }
        }
    }

    fn timed_out(&self, agent_id: &str, timeout: Duration) -> ToolkitError {
        debug!("Agent {} timed out waiting for {} instance", agent_id, self.dependency_type);
        metrics::counter!("toolkit_pool_timeout_total", "dependency" => self.dependency_type.clone()).increment(1);
        ToolkitError::Timeout {
            dependency_type: self.dependency_type.clone(),
            timeout,
        }
    }

    fn publish(&self, action: PoolAction, agent_id: Option<&str>, state: &PoolState<F::Instance>) {
        self.event_bus.publish(Event::dependency_pool(
            action,
            &self.dependency_type,
            agent_id,
            state.in_use.len(),
            state.idle.len(),
        ));
    }
}

/// Type-erased pool interface for heterogeneous pool maps
#[async_trait]
pub trait DependencyPool: Send + Sync {
    /// Dependency kind served by the pool
    fn dependency_type(&self) -> &str;

    /// Acquire an instance as `Any`; see `ResourcePool::acquire`
    async fn acquire_any(&self, agent_id: &str, timeout: Duration) -> Result<Arc<dyn Any + Send + Sync>>;

    /// See `ResourcePool::release`
    async fn release(&self, agent_id: &str);

    /// See `ResourcePool::cleanup_expired`
    async fn cleanup_expired(&self, max_age: Duration) -> Result<usize>;

    /// See `ResourcePool::stats`
    async fn stats(&self) -> PoolStats;

    /// See `ResourcePool::shutdown`
    async fn shutdown(&self);
}

#[async_trait]
impl<F> DependencyPool for ResourcePool<F>
where
    F: InstanceFactory,
{
    fn dependency_type(&self) -> &str {
        &self.dependency_type
    }

    async fn acquire_any(&self, agent_id: &str, timeout: Duration) -> Result<Arc<dyn Any + Send + Sync>> {
        let instance: Arc<dyn Any + Send + Sync> = self.acquire(agent_id, timeout).await?;
        Ok(instance)
    }

    async fn release(&self, agent_id: &str) {
        ResourcePool::release(self, agent_id).await
    }

    async fn cleanup_expired(&self, max_age: Duration) -> Result<usize> {
        Ok(ResourcePool::cleanup_expired(self, max_age).await)
    }

    async fn stats(&self) -> PoolStats {
        ResourcePool::stats(self).await
    }

    async fn shutdown(&self) {
        ResourcePool::shutdown(self).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::observability::events::{EventKind, EVENT_DEPENDENCY_POOL};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    /// Instance whose health can be flipped from the test
    #[derive(Debug)]
    pub(crate) struct TestInstance {
        pub id: usize,
        pub healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Pingable for TestInstance {
        async fn ping(&self) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ToolkitError::RuntimeError(format!("instance {} unhealthy", self.id)))
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingFactory {
        pub created: Arc<AtomicUsize>,
        pub destroyed: Arc<AtomicUsize>,
        pub healthy: Arc<AtomicBool>,
        pub fail_create: Arc<AtomicBool>,

        /// Milliseconds each validation takes
        pub validate_delay_ms: Arc<AtomicU64>,
    }

    impl CountingFactory {
        pub fn new() -> Self {
            Self {
                healthy: Arc::new(AtomicBool::new(true)),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl InstanceFactory for CountingFactory {
        type Instance = TestInstance;

        async fn create_instance(&self) -> Result<TestInstance> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(ToolkitError::InstanceCreation("factory offline".into()));
            }
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(TestInstance {
                id,
                healthy: Arc::clone(&self.healthy),
            })
        }

        async fn destroy_instance(&self, _instance: &TestInstance) -> Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn validate_instance(&self, instance: &TestInstance) -> bool {
            let delay = self.validate_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            instance.ping().await.is_ok()
        }
    }

    fn pool(max: usize) -> (Arc<ResourcePool<CountingFactory>>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(1000));
        let pool = ResourcePool::new("test", max, CountingFactory::new(), Arc::clone(&bus));
        (Arc::new(pool), bus)
    }

    fn pool_actions(bus: &EventBus) -> Vec<PoolAction> {
        bus.recent_of_type(EVENT_DEPENDENCY_POOL, 100)
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::DependencyPool { action, .. } => Some(action),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (pool, bus) = pool(2);

        let instance = pool.acquire("agent-a", Duration::from_secs(1)).await.unwrap();
        assert_eq!(instance.id, 0);

        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.per_agent_use_count.get("agent-a"), Some(&1));

        pool.release("agent-a").await;
        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.total_created, 1);

        assert_eq!(pool_actions(&bus), vec![PoolAction::Acquire, PoolAction::Release]);
    }

    #[tokio::test]
    async fn test_idle_instance_is_reused() {
        let (pool, _bus) = pool(2);

        let first = pool.acquire("agent-a", Duration::from_secs(1)).await.unwrap();
        let first_id = first.id;
        pool.release("agent-a").await;

        let second = pool.acquire("agent-b", Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.id, first_id);
        assert_eq!(pool.factory().created.load(Ordering::SeqCst), 1);

        let stats = pool.stats().await;
        assert_eq!(stats.per_agent_use_count.get("agent-b"), Some(&2));

        let infos = pool.instances().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].owning_agent_id.as_deref(), Some("agent-b"));
        assert!(infos[0].last_used >= infos[0].acquired_at);
    }

    #[tokio::test]
    async fn test_reacquire_returns_held_instance() {
        let (pool, bus) = pool(2);

        let first = pool.acquire("agent-a", Duration::from_secs(1)).await.unwrap();
        let again = pool.acquire("agent-a", Duration::from_secs(1)).await.unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.per_agent_use_count.get("agent-a"), Some(&2));

        // Every counted use shows up on the bus
        assert_eq!(pool_actions(&bus), vec![PoolAction::Acquire, PoolAction::Acquire]);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_keeps_instance_idle() {
        let (pool, _bus) = pool(1);
        pool.acquire("agent-a", Duration::from_secs(1)).await.unwrap();
        pool.release("agent-a").await;

        pool.factory().validate_delay_ms.store(300, Ordering::SeqCst);
        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            pool.acquire("agent-b", Duration::from_secs(5)),
        )
        .await;
        assert!(cancelled.is_err());

        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.total_created, 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.cleanup_expired(Duration::ZERO).await, 1);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().await.total_created, 0);
    }

    #[tokio::test]
    async fn test_cancelled_release_keeps_instance_held() {
        let (pool, _bus) = pool(1);
        pool.acquire("agent-a", Duration::from_secs(1)).await.unwrap();

        pool.factory().validate_delay_ms.store(300, Ordering::SeqCst);
        let cancelled = tokio::time::timeout(Duration::from_millis(50), pool.release("agent-a")).await;
        assert!(cancelled.is_err());

        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.total_created, 1);

        pool.factory().validate_delay_ms.store(0, Ordering::SeqCst);
        pool.release("agent-a").await;
        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, 1);
    }

    #[tokio::test]
    async fn test_deadline_not_reset_after_lost_race() {
        let (pool, _bus) = pool(1);
        pool.acquire("holder", Duration::from_secs(1)).await.unwrap();

        let timeout = Duration::from_millis(300);
        let started = std::time::Instant::now();
        let waiter_pool = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { waiter_pool.acquire("waiter", timeout).await });

        tokio::time::sleep(Duration::from_millis(100)).await;

        // The waiter is woken, but a fresh acquirer takes the instance first
        pool.release("holder").await;
        pool.acquire("newcomer", Duration::from_secs(1)).await.unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout());
        assert!(elapsed >= timeout, "failed after {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(380), "deadline was extended: {:?}", elapsed);
        assert_eq!(pool.stats().await.per_agent_use_count.get("newcomer"), Some(&2));
    }

    #[tokio::test]
    async fn test_lock_wait_counts_against_deadline() {
        let (pool, _bus) = pool(1);
        pool.acquire("agent-a", Duration::from_secs(1)).await.unwrap();

        // A slow release holds the pool lock while it validates
        pool.factory().validate_delay_ms.store(400, Ordering::SeqCst);
        let releaser_pool = Arc::clone(&pool);
        let releaser = tokio::spawn(async move { releaser_pool.release("agent-a").await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let err = pool.acquire("agent-b", Duration::from_millis(100)).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout());
        assert!(elapsed < Duration::from_millis(300), "failed after {:?}", elapsed);
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_on_exhausted_pool() {
        let (pool, bus) = pool(1);
        pool.acquire("holder", Duration::from_secs(1)).await.unwrap();
        let events_before = bus.stats().published;

        let timeout = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let err = pool.acquire("waiter", timeout).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout());
        assert!(elapsed >= timeout, "failed after {:?}", elapsed);
        assert!(elapsed < timeout + Duration::from_millis(500), "failed after {:?}", elapsed);

        // Timeouts are not state transitions
        assert_eq!(bus.stats().published, events_before);
    }

    #[tokio::test]
    async fn test_waiter_woken_by_release() {
        let (pool, _bus) = pool(1);
        pool.acquire("holder", Duration::from_secs(1)).await.unwrap();

        let waiter_pool = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            waiter_pool.acquire("waiter", Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release("holder").await;

        let instance = waiter.await.unwrap().unwrap();
        assert_eq!(instance.id, 0);
        assert_eq!(pool.stats().await.in_use, 1);
    }

    #[tokio::test]
    async fn test_invalid_idle_instance_is_replaced() {
        let (pool, _bus) = pool(2);

        pool.acquire("agent-a", Duration::from_secs(1)).await.unwrap();
        pool.release("agent-a").await;
        assert_eq!(pool.stats().await.available, 1);

        // Instance goes bad while idle; a new one must be created
        pool.factory().healthy.store(false, Ordering::SeqCst);
        let fresh = pool.acquire("agent-b", Duration::from_secs(1)).await.unwrap();

        assert_eq!(fresh.id, 1);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().await.total_created, 1);
    }

    #[tokio::test]
    async fn test_release_destroys_invalid_instance() {
        let (pool, bus) = pool(2);

        pool.acquire("agent-a", Duration::from_secs(1)).await.unwrap();
        pool.factory().healthy.store(false, Ordering::SeqCst);
        pool.release("agent-a").await;

        let stats = pool.stats().await;
        assert_eq!(stats.available, 0);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.total_created, 0);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool_actions(&bus), vec![PoolAction::Acquire, PoolAction::Release]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (pool, bus) = pool(2);

        pool.acquire("agent-a", Duration::from_secs(1)).await.unwrap();
        pool.release("agent-a").await;
        pool.release("agent-a").await;
        pool.release("never-acquired").await;

        let stats = pool.stats().await;
        assert_eq!(stats.available, 1);
        assert_eq!(pool_actions(&bus).len(), 2);
    }

    #[tokio::test]
    async fn test_create_failure_propagates() {
        let (pool, bus) = pool(2);
        pool.factory().fail_create.store(true, Ordering::SeqCst);

        let err = pool.acquire("agent-a", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ToolkitError::InstanceCreation(_)));
        assert_eq!(pool.stats().await.in_use, 0);
        assert!(pool_actions(&bus).is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_skips_in_use() {
        let (pool, bus) = pool(3);

        pool.acquire("agent-a", Duration::from_secs(1)).await.unwrap();
        pool.acquire("agent-b", Duration::from_secs(1)).await.unwrap();
        pool.release("agent-b").await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = pool.cleanup_expired(Duration::ZERO).await;

        assert_eq!(removed, 1);
        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.total_created, 1);

        let cleanup = bus.recent(1).pop().unwrap();
        assert_eq!(cleanup.data_field("expired_count"), Some(&serde_json::json!(1)));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_fresh_instances() {
        let (pool, bus) = pool(2);
        pool.acquire("agent-a", Duration::from_secs(1)).await.unwrap();
        pool.release("agent-a").await;
        let published = bus.stats().published;

        assert_eq!(pool.cleanup_expired(Duration::from_secs(3600)).await, 0);
        assert_eq!(pool.stats().await.available, 1);
        assert_eq!(bus.stats().published, published);
    }

    #[tokio::test]
    async fn test_concurrent_acquisitions_respect_capacity() {
        let (pool, _bus) = pool(3);
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for i in 0..12 {
            let pool = Arc::clone(&pool);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let agent = format!("agent-{}", i);
                pool.acquire(&agent, Duration::from_secs(10)).await.unwrap();
                let in_use = pool.stats().await.in_use;
                peak.fetch_max(in_use, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                pool.release(&agent).await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 0);
        assert!(stats.total_created <= 3);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(u8),
        Release(u8),
        Cleanup,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6).prop_map(Op::Acquire),
            (0u8..6).prop_map(Op::Release),
            Just(Op::Cleanup),
        ]
    }

    proptest! {
        #[test]
        fn prop_capacity_never_exceeded(ops in proptest::collection::vec(op(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let (pool, _bus) = pool(3);

                for op in ops {
                    match op {
                        Op::Acquire(agent) => {
                            let _ = pool.acquire(&format!("a{}", agent), Duration::from_millis(1)).await;
                        }
                        Op::Release(agent) => pool.release(&format!("a{}", agent)).await,
                        Op::Cleanup => {
                            pool.cleanup_expired(Duration::ZERO).await;
                        }
                    }

                    let stats = pool.stats().await;
                    prop_assert!(stats.in_use <= 3);
                    prop_assert_eq!(stats.in_use + stats.available, stats.total_created);
                }
                Ok(())
            })?;
        }
    }
}
