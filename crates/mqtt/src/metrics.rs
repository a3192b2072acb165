//! Metrics sink consumed by the connection manager.
//!
//! The telemetry backend lives outside this crate; the manager only reports
//! through this trait. `NoopMetrics` is used when nothing is wired in.

use std::time::Duration;

use crate::error::ErrorCategory;

pub trait MetricsSink: Send + Sync {
    /// Connection status gauge: 1 when connected, 0 otherwise.
    fn set_connection_status(&self, connected: bool);

    fn inc_messages_delivered(&self);

    fn observe_message_size(&self, bytes: usize);

    fn observe_publish_latency(&self, latency: Duration);

    /// Per-category error counter.
    fn inc_error(&self, category: ErrorCategory);

    fn inc_reconnect_attempts(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn set_connection_status(&self, _connected: bool) {}
    fn inc_messages_delivered(&self) {}
    fn observe_message_size(&self, _bytes: usize) {}
    fn observe_publish_latency(&self, _latency: Duration) {}
    fn inc_error(&self, _category: ErrorCategory) {}
    fn inc_reconnect_attempts(&self) {}
}
