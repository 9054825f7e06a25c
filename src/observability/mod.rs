// src/observability/mod.rs
//! Observability: event bus, tracing and metrics
//!
//! - **Event Bus**: bounded in-memory telemetry channel
//! - **Tracing**: `tracing-subscriber` registry with env filter and fmt output
//! - **Metrics**: Prometheus recorder behind the `metrics` facade
//! - **Log forwarding**: optional layer publishing log records on the bus

pub mod event_bus;
pub mod events;

pub use event_bus::{EventBus, EventBusStats};
pub use events::{Event, EventKind, PoolAction, SandboxPhase};

use crate::utils::config::{LogFormat, LoggingConfig};
use crate::utils::errors::{Result, ToolkitError};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::cell::Cell;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level. Output goes to
/// stderr so stdout stays free for command results.
pub fn init_tracing(config: &LoggingConfig, event_bus: Option<Arc<EventBus>>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ToolkitError::InvalidConfig(format!("invalid log level '{}': {}", config.level, e)))?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).pretty().boxed(),
        LogFormat::Compact => fmt::layer().with_writer(std::io::stderr).compact().boxed(),
        LogFormat::Json => fmt::layer().with_writer(std::io::stderr).json().boxed(),
    };

    let forward = event_bus
        .filter(|_| config.forward_to_event_bus)
        .map(|bus| EventBusLogLayer::new(bus, Level::INFO));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(forward)
        .with(filter)
        .try_init()
        .map_err(|e| ToolkitError::RuntimeError(format!("Failed to install tracing subscriber: {}", e)))
}

/// Install the Prometheus recorder and return its render handle
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ToolkitError::RuntimeError(format!("Failed to install Prometheus recorder: {}", e)))?;

    tracing::debug!("Prometheus metrics recorder installed");
    Ok(handle)
}

thread_local! {
    /// Set while a record is being forwarded, so logging from inside the bus
    /// or a subscriber does not loop
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// Publishes tracing events at or above `min_level` as `log` events
pub struct EventBusLogLayer {
    bus: Arc<EventBus>,
    min_level: Level,
}

impl EventBusLogLayer {
    pub fn new(bus: Arc<EventBus>, min_level: Level) -> Self {
        Self { bus, min_level }
    }
}

impl<S: Subscriber> Layer<S> for EventBusLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();

        // Level ordering is by verbosity: ERROR < WARN < ... < TRACE
        if *metadata.level() > self.min_level {
            return;
        }

        if FORWARDING.with(Cell::get) {
            return;
        }
        FORWARDING.with(|f| f.set(true));

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        self.bus.publish(events::Event::log(
            metadata.level().as_str(),
            visitor.finish(),
            metadata.target(),
        ));

        FORWARDING.with(|f| f.set(false));
    }
}

/// Renders `message` followed by the remaining fields as `key=value`
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            if !self.fields.is_empty() {
                self.fields.push(' ');
            }
            let _ = write!(self.fields, "{}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::events::EVENT_LOG;

    #[test]
    fn test_log_layer_forwards_by_level() {
        let bus = Arc::new(EventBus::new(100));
        let subscriber = tracing_subscriber::registry()
            .with(EventBusLogLayer::new(Arc::clone(&bus), Level::INFO));

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("too verbose");
            tracing::info!(pool = "filesystem", "pool ready");
            tracing::warn!("instance invalid");
        });

        let logs = bus.recent_of_type(EVENT_LOG, 10);
        assert_eq!(logs.len(), 2);

        match &logs[0].kind {
            EventKind::Log { level, message, .. } => {
                assert_eq!(level, "INFO");
                assert_eq!(message, "pool ready pool=\"filesystem\"");
            }
            other => panic!("unexpected kind: {:?}", other),
        }
        match &logs[1].kind {
            EventKind::Log { level, .. } => assert_eq!(level, "WARN"),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_log_layer_does_not_recurse() {
        let bus = Arc::new(EventBus::new(100));
        bus.subscribe(EVENT_LOG, |_| tracing::warn!("logged from a subscriber"));

        let subscriber = tracing_subscriber::registry()
            .with(EventBusLogLayer::new(Arc::clone(&bus), Level::INFO));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("outer");
        });

        assert_eq!(bus.recent_of_type(EVENT_LOG, 10).len(), 1);
    }
}
