//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use widgetbus_core::{ArchivedMessage, HubStats, RoomStore, SessionSummary, StoreError};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "widgetbus_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "widgetbus_connections_active";
    pub const MESSAGES_TOTAL: &str = "widgetbus_messages_total";
    pub const ROOMS_ACTIVE: &str = "widgetbus_rooms_active";
    pub const STORE_FAILURES_TOTAL: &str = "widgetbus_store_failures_total";
    pub const ERRORS_TOTAL: &str = "widgetbus_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of relay connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of relay connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Relay events by direction");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with at least one member");
    metrics::describe_counter!(
        names::STORE_FAILURES_TOTAL,
        "Persistence writes that failed, by operation"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record the traffic of a finished session.
pub fn record_session(summary: &SessionSummary) {
    counter!(names::MESSAGES_TOTAL, "direction" => "inbound").increment(summary.received);
    counter!(names::MESSAGES_TOTAL, "direction" => "published").increment(summary.published);
    counter!(names::MESSAGES_TOTAL, "direction" => "outbound").increment(summary.sent);
    if summary.failed {
        record_error("transport");
    }
}

/// Update the room gauge.
pub fn record_hub(stats: &HubStats) {
    gauge!(names::ROOMS_ACTIVE).set(stats.rooms as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

fn record_store_failure(operation: &'static str) {
    counter!(names::STORE_FAILURES_TOTAL, "operation" => operation).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

/// A store wrapper that counts failed operations.
pub struct MeteredStore {
    inner: Arc<dyn RoomStore>,
}

impl MeteredStore {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn RoomStore>) -> Self {
        Self { inner }
    }
}

fn metered<T>(operation: &'static str, result: Result<T, StoreError>) -> Result<T, StoreError> {
    if result.is_err() {
        record_store_failure(operation);
    }
    result
}

#[async_trait]
impl RoomStore for MeteredStore {
    async fn add_member(&self, room: &str, member: &str) -> Result<(), StoreError> {
        metered("add_member", self.inner.add_member(room, member).await)
    }

    async fn remove_member(&self, room: &str, member: &str) -> Result<bool, StoreError> {
        metered("remove_member", self.inner.remove_member(room, member).await)
    }

    async fn move_member(&self, from: &str, to: &str, member: &str) -> Result<(), StoreError> {
        metered("move_member", self.inner.move_member(from, to, member).await)
    }

    async fn members(&self, room: &str) -> Result<Vec<String>, StoreError> {
        metered("members", self.inner.members(room).await)
    }

    async fn archive(&self, entry: &ArchivedMessage) -> Result<(), StoreError> {
        metered("archive", self.inner.archive(entry).await)
    }

    async fn history(&self, room: &str, limit: usize) -> Result<Vec<ArchivedMessage>, StoreError> {
        metered("history", self.inner.history(room, limit).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use widgetbus_core::MemoryStore;
    use widgetbus_protocol::RawMessage;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; must not panic.
        let _guard = ConnectionMetricsGuard::new();
        record_session(&SessionSummary {
            received: 2,
            published: 1,
            sent: 3,
            failed: true,
        });
    }

    #[tokio::test]
    async fn test_metered_store_passes_through() {
        let store = MeteredStore::new(Arc::new(MemoryStore::new()));
        store.add_member("default", "c1").await.unwrap();
        store
            .archive(&ArchivedMessage::new(
                "default",
                1,
                RawMessage::new("ping", json!("hi"), "u1"),
            ))
            .await
            .unwrap();

        assert_eq!(store.members("default").await.unwrap(), vec!["c1"]);
        assert_eq!(store.history("default", 5).await.unwrap().len(), 1);
    }
}
