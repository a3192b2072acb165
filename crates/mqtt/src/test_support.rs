//! In-memory collaborators for unit tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{
    config::ClientConfig,
    error::{ClientError, ErrorCategory},
    metrics::MetricsSink,
    state::ConnectionStatus,
    transport::Transport,
    Result,
};

/// Configuration pointing at a literal address so no DNS lookup happens.
pub(crate) fn test_config() -> ClientConfig {
    ClientConfig {
        broker: "tcp://127.0.0.1:1883".into(),
        client_id: "test-client".into(),
        topic: "birdnet".into(),
        ..Default::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Scriptable transport: connect outcomes, delays and publish rejections are
/// set up front, publishes are recorded.
pub(crate) struct FakeTransport {
    connected: AtomicBool,
    status_tx: watch::Sender<ConnectionStatus>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    connect_failures: Mutex<VecDeque<ClientError>>,
    connect_delay: Mutex<Option<Duration>>,
    publish_delay: Mutex<Option<Duration>>,
    rejected_topics: Mutex<Vec<String>>,
    publishes: Mutex<Vec<Published>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected("not connected".into()));
        Arc::new(Self {
            connected: AtomicBool::new(false),
            status_tx,
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            connect_failures: Mutex::new(VecDeque::new()),
            connect_delay: Mutex::new(None),
            publish_delay: Mutex::new(None),
            rejected_topics: Mutex::new(Vec::new()),
            publishes: Mutex::new(Vec::new()),
        })
    }

    /// Queues an error for the next connect call.
    pub fn fail_next_connect(&self, err: ClientError) {
        self.connect_failures.lock().unwrap().push_back(err);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        *self.publish_delay.lock().unwrap() = Some(delay);
    }

    pub fn reject_topic(&self, topic: &str) {
        self.rejected_topics.lock().unwrap().push(topic.to_string());
    }

    /// Simulates an unexpected loss of the session.
    pub fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::Release);
        self.status_tx
            .send_replace(ConnectionStatus::Disconnected(reason.to_string()));
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn publishes(&self) -> Vec<Published> {
        self.publishes.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.publishes().into_iter().map(|p| p.topic).collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.status_tx.send_replace(ConnectionStatus::Connecting);

        let delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.connect_failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            self.status_tx
                .send_replace(ConnectionStatus::Disconnected(err.to_string()));
            return Err(err);
        }

        self.connected.store(true, Ordering::Release);
        self.status_tx.send_replace(ConnectionStatus::Connected);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ClientError::NotConnected);
        }

        let delay = *self.publish_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.rejected_topics.lock().unwrap().iter().any(|t| t == topic) {
            return Err(ClientError::Publish(format!("broker rejected {topic}")));
        }

        self.publishes.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::Release);
        self.status_tx
            .send_replace(ConnectionStatus::Disconnected("disconnected by client".into()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }
}

/// Metrics sink that counts what it is told.
#[derive(Default)]
pub(crate) struct RecordingMetrics {
    pub connected: AtomicBool,
    pub delivered: AtomicU64,
    pub bytes: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub errors: Mutex<Vec<ErrorCategory>>,
}

impl RecordingMetrics {
    pub fn errors(&self) -> Vec<ErrorCategory> {
        self.errors.lock().unwrap().clone()
    }
}

impl MetricsSink for RecordingMetrics {
    fn set_connection_status(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn inc_messages_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }

    fn observe_message_size(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::SeqCst);
    }

    fn observe_publish_latency(&self, _latency: Duration) {}

    fn inc_error(&self, category: ErrorCategory) {
        self.errors.lock().unwrap().push(category);
    }

    fn inc_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
    }
}
