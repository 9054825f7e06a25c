// src/observability/event_bus.rs
//! Bounded in-memory publish/subscribe bus
//!
//! Events are appended to a fixed-capacity ring (oldest dropped on overflow)
//! and then dispatched synchronously to the handlers subscribed to their
//! `event_type`. Dispatch happens outside the buffer lock, and a panicking
//! handler never blocks insertion or the other handlers.
//!
//! Ordering is only guaranteed among events published sequentially by the
//! same caller.

use crate::observability::events::Event;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Default ring capacity
pub const DEFAULT_BUFFER_SIZE: usize = 10_000;

/// Subscriber callback
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Bounded event bus
pub struct EventBus {
    /// Retained events, oldest first
    buffer: Mutex<VecDeque<Event>>,
    
    /// Ring capacity
    capacity: usize,
    
    /// Handlers keyed by event type
    subscribers: RwLock<HashMap<String, Vec<EventHandler>>>,
    
    /// Total events published
    published: AtomicU64,
    
    /// Events evicted from the ring
    dropped: AtomicU64,
}

impl EventBus {
    /// Create a bus retaining at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_SIZE))),
            capacity,
            subscribers: RwLock::new(HashMap::new()),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }
    
    /// Append an event and dispatch it to its subscribers
    pub fn publish(&self, event: Event) {
        {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= self.capacity {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("toolkit_events_dropped_total").increment(1);
            }
            buffer.push_back(event.clone());
        }
        
        self.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("toolkit_events_published_total").increment(1);
        
        // Snapshot handlers so subscribers may publish or subscribe re-entrantly
        let handlers: Vec<EventHandler> = self
            .subscribers
            .read()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();
        
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!(event_type = %event.event_type, "Event handler panicked, ignoring");
            }
        }
    }
    
    /// Register a handler for one event type
    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .entry(event_type.into())
            .or_default()
            .push(Arc::new(handler));
    }
    
    /// Last `limit` events regardless of type, oldest first
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let buffer = self.buffer.lock();
        let skip = buffer.len().saturating_sub(limit);
        buffer.iter().skip(skip).cloned().collect()
    }
    
    /// Last `limit` events of one type, oldest first
    pub fn recent_of_type(&self, event_type: &str, limit: usize) -> Vec<Event> {
        let buffer = self.buffer.lock();
        let mut matching: Vec<Event> = buffer
            .iter()
            .rev()
            .filter(|e| e.event_type == event_type)
            .take(limit)
            .cloned()
            .collect();
        matching.reverse();
        matching
    }
    
    /// Number of handlers registered for an event type
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers
            .read()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }
    
    /// Get bus statistics
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            buffered: self.buffer.lock().len(),
            capacity: self.capacity,
        }
    }
    
    /// Ring capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// Event bus statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventBusStats {
    /// Total events published
    pub published: u64,
    
    /// Events evicted on overflow
    pub dropped: u64,
    
    /// Events currently retained
    pub buffered: usize,
    
    /// Ring capacity
    pub capacity: usize,
}
