//! Resilient broker connection management.
//!
//! [`ConnectionManager`] owns the single broker session of the process. It
//! wraps a [`Transport`] with the policies the transport does not know about:
//!
//! - a cooldown between manual connect attempts,
//! - certificate and DNS prechecks before every attempt,
//! - handshake and publish timeouts that stay distinct from cancellation,
//! - ordered on-connect handlers, re-run after every reconnect,
//! - a loss watcher that reconnects with doubling backoff.
//!
//! # Architecture
//!
//! ```text
//! Application ── connect / publish / disconnect ──> ConnectionManager
//!                                                      │        ▲
//!                                           Transport  │        │ status (loss)
//!                                                      ▼        │
//!                                                rumqttc session
//!                                                      │
//!                                         loss watcher task (one per manager)
//!                                           sleep(backoff) -> connect(Auto) -> ...
//! ```
//!
//! Session bookkeeping sits behind a `std::sync::RwLock` that is never held
//! across an await. Connection attempts, manual or automatic, are serialized by
//! an async mutex.
//!
//! # Usage
//!
//! ```ignore
//! let transport = Arc::new(RumqttTransport::from_config(&config)?);
//! let manager = ConnectionManager::builder(config, transport)
//!     .metrics(metrics)
//!     .build()?;
//!
//! manager.register_on_connect_handler(|mqtt| async move {
//!     let _ = mqtt.publish(&CancellationToken::new(), "birdnet/status", "online").await;
//! });
//!
//! manager.connect(&cancel).await?;
//! manager.publish(&cancel, "birdnet", payload).await?;
//! manager.disconnect().await;
//! ```

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak},
};

use futures_util::future::BoxFuture;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use validator::Validate;

use crate::{
    backoff::Backoff,
    config::ClientConfig,
    error::{ClientError, ErrorCategory},
    metrics::{MetricsSink, NoopMetrics},
    precheck::{self, BrokerUrl},
    state::{ConnectionState, ConnectionStatus},
    tls,
    transport::Transport,
    Result,
};

/// Callback run after every successful (re)connect, in registration order.
pub type OnConnectHandler = Arc<dyn Fn(ConnectionManager) -> BoxFuture<'static, ()> + Send + Sync>;

/// Who asked for a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Caller-initiated; subject to the cooldown gate.
    Manual,
    /// Issued by the reconnect loop; bypasses the cooldown gate.
    Auto,
}

/// Builder for [`ConnectionManager`].
pub struct ConnectionManagerBuilder {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    metrics: Arc<dyn MetricsSink>,
    span: Option<Span>,
}

impl ConnectionManagerBuilder {
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Span every manager operation and the loss watcher run under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Validates the configuration and builds the manager.
    ///
    /// # Errors
    /// `ConfigValidation` or `InvalidBrokerUrl` for a bad configuration.
    pub fn build(self) -> Result<ConnectionManager> {
        self.config.validate()?;
        let broker = self.config.broker_url()?;
        let span = self
            .span
            .unwrap_or_else(|| info_span!("mqtt", broker = %broker));
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected("not connected".into()));

        Ok(ConnectionManager {
            inner: Arc::new(Inner {
                config: self.config,
                broker,
                transport: self.transport,
                metrics: self.metrics,
                state: RwLock::new(ConnectionState::default()),
                connect_lock: tokio::sync::Mutex::new(()),
                handlers: Mutex::new(Vec::new()),
                stop: Mutex::new(CancellationToken::new()),
                watcher: Mutex::new(None),
                status_tx,
                span,
            }),
        })
    }
}

struct Inner {
    config: ClientConfig,
    broker: BrokerUrl,
    transport: Arc<dyn Transport>,
    metrics: Arc<dyn MetricsSink>,
    state: RwLock<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    handlers: Mutex<Vec<OnConnectHandler>>,
    /// Cancelled by `disconnect`; replaced by the next manual connect.
    stop: Mutex<CancellationToken>,
    /// Loss watcher and the stop token it was started with.
    watcher: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    status_tx: watch::Sender<ConnectionStatus>,
    span: Span,
}

/// Handle to the broker session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn builder(config: ClientConfig, transport: Arc<dyn Transport>) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            config,
            transport,
            metrics: Arc::new(NoopMetrics),
            span: None,
        }
    }

    /// Builds a manager with no metrics and the default span.
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::builder(config, transport).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn broker(&self) -> &BrokerUrl {
        &self.inner.broker
    }

    pub fn is_connected(&self) -> bool {
        self.read_state().connected
    }

    /// Snapshot of the session bookkeeping.
    pub fn state(&self) -> ConnectionState {
        self.read_state().clone()
    }

    /// Status updates including `Reconnecting` delays.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Registers a callback awaited after every successful connect.
    ///
    /// The callback receives a manager handle so it can publish without
    /// capturing one.
    pub fn register_on_connect_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(ConnectionManager) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: OnConnectHandler = Arc::new(move |manager| Box::pin(handler(manager)));
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Connects to the broker.
    ///
    /// # Errors
    /// - `Cooldown` when called again inside the cooldown window
    /// - certificate errors when TLS is enabled and material is missing
    /// - `Dns` when the broker host does not resolve
    /// - `ConnectTimeout` / `Cancelled` / `Handshake` / `Connection`
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        self.connect_with(Origin::Manual, cancel)
            .instrument(self.inner.span.clone())
            .await
    }

    /// Publishes with the configured retain flag.
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.publish_with_retain(cancel, topic, payload, self.inner.config.retain)
            .await
    }

    /// Publishes one QoS 1 message.
    ///
    /// Fails fast with `NotConnected` when there is no session; otherwise
    /// bounded by the publish timeout.
    ///
    /// `Ok` means the message was handed to the session's outgoing queue. It
    /// does not wait for the broker's PUBACK, so a broker-side rejection or a
    /// lost acknowledgement is not reported here.
    pub async fn publish_with_retain(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        retain: bool,
    ) -> Result<()> {
        let payload = payload.into();
        self.publish_inner(cancel, topic, payload, retain)
            .instrument(self.inner.span.clone())
            .await
    }

    /// Stops the reconnect loop and closes the session.
    ///
    /// Idempotent. The close is best effort and bounded by
    /// [`ClientConfig::disconnect_timeout`].
    pub async fn disconnect(&self) {
        self.stop_token().cancel();
        // An attempt in flight sees `stop` and gives the lock up promptly.
        let _attempt = self.inner.connect_lock.lock().await;

        let was_connected = {
            let mut state = self.write_state();
            let was = state.connected;
            state.mark_disconnected();
            was
        };

        let budget = self.inner.config.disconnect_timeout();
        match time::timeout(budget, self.inner.transport.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(parent: &self.inner.span, "Error closing broker session: {e}"),
            Err(_) => warn!(parent: &self.inner.span, "Broker session close exceeded {budget:?}"),
        }

        self.inner.metrics.set_connection_status(false);
        self.set_status(ConnectionStatus::Disconnected("disconnected by client".into()));
        if was_connected {
            info!(parent: &self.inner.span, "Disconnected from MQTT broker");
        }
    }

    async fn connect_with(&self, origin: Origin, cancel: &CancellationToken) -> Result<()> {
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled("connect")),
            guard = self.inner.connect_lock.lock() => guard,
        };

        if origin == Origin::Manual {
            self.admit_manual_attempt()?;
        }

        if self.is_connected() && self.inner.transport.is_connected() {
            debug!("Already connected to {}", self.inner.broker);
            return Ok(());
        }

        self.set_status(ConnectionStatus::Connecting);
        info!(?origin, "Connecting to MQTT broker {}", self.inner.broker);

        // Subscribed before the handshake so a loss right after it is still seen.
        let transport_status = self.inner.transport.subscribe_status();
        let stop = self.stop_token();

        let outcome = tokio::select! {
            biased;
            _ = stop.cancelled() => Err(ClientError::Cancelled("connect")),
            result = self.establish(cancel) => result,
        };
        // disconnect() cancels `stop` before taking the lock, so a session
        // established in the meantime is torn down by it.
        let outcome = match outcome {
            Ok(()) if stop.is_cancelled() => Err(ClientError::Cancelled("connect")),
            other => other,
        };
        if let Err(e) = outcome {
            self.inner.metrics.inc_error(e.category());
            self.set_status(ConnectionStatus::Disconnected(e.to_string()));
            return Err(e);
        }

        self.write_state().mark_connected();
        self.inner.metrics.set_connection_status(true);
        self.set_status(ConnectionStatus::Connected);
        info!("Connected to MQTT broker {}", self.inner.broker);
        self.ensure_watcher(transport_status);
        drop(attempt);

        self.run_on_connect_handlers().await;
        Ok(())
    }

    /// Applies the cooldown gate and records the admitted attempt.
    fn admit_manual_attempt(&self) -> Result<()> {
        let now = Instant::now();
        {
            let mut state = self.write_state();
            if let Some(remaining) = state.cooldown_remaining(now, self.inner.config.cooldown()) {
                debug!(?remaining, "Manual connect rejected by cooldown");
                self.inner.metrics.inc_error(ErrorCategory::Cooldown);
                return Err(ClientError::Cooldown { remaining });
            }
            state.last_connection_attempt = Some(now);
        }

        let mut stop = self.inner.stop.lock().unwrap_or_else(PoisonError::into_inner);
        if stop.is_cancelled() {
            *stop = CancellationToken::new();
        }
        Ok(())
    }

    /// Prechecks and handshake.
    async fn establish(&self, cancel: &CancellationToken) -> Result<()> {
        let config = &self.inner.config;

        if config.tls_enabled() {
            tls::validate_tls_files(&config.tls)?;
        }

        let broker = &self.inner.broker;
        if !broker.is_ip_literal() {
            precheck::resolve_host(&broker.host, broker.port, config.connect_timeout(), cancel)
                .await?;
        }

        let timeout = config.connect_timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled("connect")),
            result = time::timeout(timeout, self.inner.transport.connect()) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(ClientError::ConnectTimeout(timeout)),
            },
        }
    }

    async fn run_on_connect_handlers(&self) {
        let handlers = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for handler in handlers {
            handler(self.clone()).await;
        }
    }

    async fn publish_inner(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<()> {
        if !self.is_connected() {
            self.inner.metrics.inc_error(ErrorCategory::Publish);
            return Err(ClientError::NotConnected);
        }

        let size = payload.len();
        let timeout = self.inner.config.publish_timeout();
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled("publish")),
            outcome = time::timeout(timeout, self.inner.transport.publish(topic, payload, retain)) => {
                match outcome {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ClientError::PublishTimeout(timeout)),
                }
            }
        };

        match &result {
            Ok(()) => {
                self.inner.metrics.inc_messages_delivered();
                self.inner.metrics.observe_message_size(size);
                self.inner.metrics.observe_publish_latency(started.elapsed());
                debug!(topic, size, retain, "Published message");
            }
            Err(e) => {
                self.inner.metrics.inc_error(e.category());
                warn!(topic, "Publish failed: {e}");
            }
        }
        result
    }

    /// Starts the loss watcher unless one is already running for the current
    /// stop token.
    fn ensure_watcher(&self, status: watch::Receiver<ConnectionStatus>) {
        let stop = self.stop_token();
        if stop.is_cancelled() {
            return;
        }

        let mut watcher = self.inner.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((token, handle)) = watcher.as_ref() {
            if !token.is_cancelled() && !handle.is_finished() {
                return;
            }
        }

        let task = watch_for_loss(Arc::downgrade(&self.inner), status, stop.clone())
            .instrument(self.inner.span.clone());
        *watcher = Some((stop, tokio::spawn(task)));
    }

    fn handle_loss(&self, reason: &str) {
        self.write_state().mark_disconnected();
        self.inner.metrics.set_connection_status(false);
        self.inner.metrics.inc_error(ErrorCategory::Connection);
        self.set_status(ConnectionStatus::Disconnected(reason.to_string()));
        warn!("Connection to MQTT broker lost: {reason}");
    }

    /// Sleeps and retries until a reconnect succeeds, the stop token fires or
    /// a configuration error makes retrying pointless.
    async fn reconnect_loop(&self, stop: &CancellationToken) {
        let config = &self.inner.config;
        let mut backoff = Backoff::new(config.initial_backoff(), config.max_backoff());

        loop {
            let delay = match backoff.next_sleep() {
                Ok(delay) => delay,
                Err(e) => {
                    error!("Giving up reconnecting: {e}");
                    return;
                }
            };

            self.write_state().reconnect_backoff = delay;
            self.set_status(ConnectionStatus::Reconnecting(delay.as_secs_f64()));
            info!(
                attempt = backoff.attempt(),
                "Reconnecting in {:.2} seconds",
                delay.as_secs_f64()
            );

            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!("Reconnect loop stopped");
                    return;
                }
                _ = time::sleep(delay) => {}
            }

            self.inner.metrics.inc_reconnect_attempts();
            match self.connect_with(Origin::Auto, stop).await {
                Ok(()) => {
                    info!("Reconnected after {} attempt(s)", backoff.attempt());
                    return;
                }
                Err(e) if e.is_cancelled() => return,
                Err(e) if e.is_fatal() => {
                    error!("Reconnect aborted, configuration error: {e}");
                    return;
                }
                Err(e) => warn!("Reconnect attempt failed: {e}"),
            }
        }
    }

    fn stop_token(&self) -> CancellationToken {
        self.inner
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.inner.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ConnectionState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ConnectionState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Watches the transport for unexpected loss and drives reconnection.
///
/// Holds only a weak reference so a dropped manager ends the task.
async fn watch_for_loss(
    inner: Weak<Inner>,
    mut status: watch::Receiver<ConnectionStatus>,
    stop: CancellationToken,
) {
    // The session may already be gone by the time the task starts.
    status.mark_changed();
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let reason = match &*status.borrow_and_update() {
            ConnectionStatus::Disconnected(reason) => reason.clone(),
            _ => continue,
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let manager = ConnectionManager { inner };

        // Losses after a deliberate disconnect or a failed attempt are not ours.
        if stop.is_cancelled() || !manager.is_connected() {
            continue;
        }

        manager.handle_loss(&reason);
        manager.reconnect_loop(&stop).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use tracing_test::traced_test;

    use super::*;
    use crate::{
        config::TlsConfig,
        test_support::{test_config, FakeTransport, RecordingMetrics},
    };

    struct Harness {
        manager: ConnectionManager,
        transport: Arc<FakeTransport>,
        metrics: Arc<RecordingMetrics>,
    }

    fn harness(config: ClientConfig) -> Harness {
        let transport = FakeTransport::new();
        let metrics = Arc::new(RecordingMetrics::default());
        let manager = ConnectionManager::builder(config, transport.clone())
            .metrics(metrics.clone())
            .build()
            .unwrap();
        Harness {
            manager,
            transport,
            metrics,
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<ConnectionStatus>,
        pred: impl Fn(&ConnectionStatus) -> bool,
    ) {
        time::timeout(Duration::from_secs(600), async {
            loop {
                if pred(&*rx.borrow_and_update()) {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("status not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_scenario() {
        let h = harness(test_config());
        let cancel = CancellationToken::new();

        h.manager.connect(&cancel).await.unwrap();
        assert!(h.manager.is_connected());
        h.manager.disconnect().await;
        assert!(!h.manager.is_connected());

        time::advance(Duration::from_secs(2)).await;
        let err = h.manager.connect(&cancel).await.unwrap_err();
        match &err {
            ClientError::Cooldown { remaining } => {
                assert!(*remaining <= Duration::from_secs(3));
                assert!(*remaining > Duration::from_secs(2));
            }
            other => panic!("expected cooldown, got {other:?}"),
        }
        assert!(err.to_string().contains("cooldown"));
        assert_eq!(err.category(), ErrorCategory::Cooldown);

        time::advance(Duration::from_secs(3)).await;
        h.manager.connect(&cancel).await.unwrap();
        assert!(h.manager.is_connected());
        assert_eq!(h.transport.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_attempt_does_not_extend_cooldown() {
        let h = harness(test_config());
        let cancel = CancellationToken::new();

        h.manager.connect(&cancel).await.unwrap();
        time::advance(Duration::from_secs(4)).await;
        assert!(h.manager.connect(&cancel).await.is_err());

        time::advance(Duration::from_secs(1)).await;
        assert!(h.manager.connect(&cancel).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_before_connect_fails_fast() {
        let h = harness(test_config());
        let started = Instant::now();

        let err = h
            .manager
            .publish(&CancellationToken::new(), "birdnet", "{}")
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::NotConnected));
        assert!(started.elapsed() < h.manager.config().publish_timeout());
        assert!(h.transport.publishes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_records_metrics() {
        let h = harness(test_config());
        let cancel = CancellationToken::new();
        h.manager.connect(&cancel).await.unwrap();

        h.manager
            .publish_with_retain(&cancel, "birdnet/status", "online", true)
            .await
            .unwrap();

        let published = h.transport.publishes();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "birdnet/status");
        assert!(published[0].retain);
        assert_eq!(h.metrics.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(h.metrics.bytes.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout_and_cancel_are_distinct() {
        let h = harness(test_config());
        let cancel = CancellationToken::new();
        h.manager.connect(&cancel).await.unwrap();
        h.transport.set_publish_delay(Duration::from_secs(60));

        let err = h.manager.publish(&cancel, "birdnet", "x").await.unwrap_err();
        assert!(matches!(err, ClientError::PublishTimeout(d) if d == Duration::from_secs(10)));

        let caller = CancellationToken::new();
        let trigger = caller.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = h.manager.publish(&caller, "birdnet", "x").await.unwrap_err();
        assert!(err.is_cancelled(), "got {err:?}");
        assert_eq!(
            h.metrics.errors(),
            vec![ErrorCategory::Timeout, ErrorCategory::Cancelled]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_and_cancel_are_distinct() {
        let config = ClientConfig {
            reconnect_cooldown: 0,
            ..test_config()
        };
        let h = harness(config);
        h.transport.set_connect_delay(Duration::from_secs(120));

        let err = h.manager.connect(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectTimeout(d) if d == Duration::from_secs(30)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h.manager.connect(&cancel).await.unwrap_err();
        assert!(matches!(err, ClientError::Cancelled(_)));
        assert!(!err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_tls_material_reported_before_handshake() {
        let config = ClientConfig {
            broker: "mqtts://127.0.0.1".into(),
            tls: TlsConfig::with_client_auth(
                "/nonexistent/ca.crt",
                "/nonexistent/client.crt",
                "/nonexistent/client.key",
            ),
            ..test_config()
        };
        let h = harness(config);

        let err = h.manager.connect(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::CaCertMissing(_)));
        assert!(err.is_fatal());
        assert_eq!(h.transport.connect_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handlers_run_in_order_on_every_connect() {
        let h = harness(test_config());
        let calls = Arc::new(Mutex::new(Vec::new()));

        for id in [1, 2] {
            let calls = calls.clone();
            h.manager.register_on_connect_handler(move |_| {
                let calls = calls.clone();
                async move { calls.lock().unwrap().push(id) }
            });
        }

        let mut status = h.manager.subscribe_status();
        h.manager.connect(&CancellationToken::new()).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);

        h.transport.drop_connection("network down");
        wait_for(&mut status, |s| matches!(s, ConnectionStatus::Reconnecting(_))).await;
        wait_for(&mut status, ConnectionStatus::is_connected).await;
        assert_eq!(*calls.lock().unwrap(), vec![1, 2, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_can_publish_through_manager() {
        let h = harness(test_config());
        h.manager.register_on_connect_handler(|mqtt| async move {
            let _ = mqtt
                .publish_with_retain(&CancellationToken::new(), "birdnet/status", "online", true)
                .await;
        });

        h.manager.connect(&CancellationToken::new()).await.unwrap();
        assert_eq!(h.transport.topics(), vec!["birdnet/status"]);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_loss_during_handler_triggers_reconnect() {
        let h = harness(test_config());
        let transport = h.transport.clone();
        let dropped = Arc::new(AtomicBool::new(false));
        let once = dropped.clone();
        h.manager.register_on_connect_handler(move |_| {
            let transport = transport.clone();
            let once = once.clone();
            async move {
                if !once.swap(true, Ordering::SeqCst) {
                    transport.drop_connection("kicked during discovery");
                }
            }
        });

        let mut status = h.manager.subscribe_status();
        h.manager.connect(&CancellationToken::new()).await.unwrap();
        wait_for(&mut status, |s| matches!(s, ConnectionStatus::Reconnecting(_))).await;
        wait_for(&mut status, ConnectionStatus::is_connected).await;

        assert!(h.manager.is_connected());
        assert!(h.transport.is_connected());
        assert_eq!(h.transport.connect_calls(), 2);
        h.manager
            .publish(&CancellationToken::new(), "birdnet", "{}")
            .await
            .unwrap();
        assert!(logs_contain("Connection to MQTT broker lost: kicked during discovery"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_aborts_connect_in_flight() {
        let h = harness(test_config());
        h.transport.set_connect_delay(Duration::from_secs(10));

        let manager = h.manager.clone();
        let pending =
            tokio::spawn(async move { manager.connect(&CancellationToken::new()).await });
        time::sleep(Duration::from_secs(1)).await;
        h.manager.disconnect().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_cancelled(), "got {err:?}");
        assert!(!h.manager.is_connected());

        time::sleep(Duration::from_secs(60)).await;
        assert!(!h.transport.is_connected());
        assert!(!h.manager.is_connected());
        assert_eq!(h.transport.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_auto_reconnect_bypasses_cooldown() {
        let config = ClientConfig {
            reconnect_cooldown: 300,
            ..test_config()
        };
        let h = harness(config);
        let mut status = h.manager.subscribe_status();

        h.manager.connect(&CancellationToken::new()).await.unwrap();
        h.transport.drop_connection("broker restarted");

        wait_for(&mut status, |s| matches!(s, ConnectionStatus::Reconnecting(_))).await;
        wait_for(&mut status, ConnectionStatus::is_connected).await;

        assert!(h.manager.is_connected());
        assert_eq!(h.transport.connect_calls(), 2);
        assert_eq!(h.metrics.reconnect_attempts.load(Ordering::SeqCst), 1);
        assert!(logs_contain("Connection to MQTT broker lost: broker restarted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_delays_double() {
        let h = harness(test_config());
        let mut status = h.manager.subscribe_status();
        h.manager.connect(&CancellationToken::new()).await.unwrap();
        status.borrow_and_update();

        for _ in 0..3 {
            h.transport
                .fail_next_connect(ClientError::Handshake("broker unavailable".into()));
        }
        h.transport.drop_connection("network down");

        let mut delays = Vec::new();
        time::timeout(Duration::from_secs(600), async {
            loop {
                status.changed().await.unwrap();
                match &*status.borrow_and_update() {
                    ConnectionStatus::Reconnecting(secs) => delays.push(*secs),
                    ConnectionStatus::Connected => break,
                    _ => {}
                }
            }
        })
        .await
        .expect("reconnected");

        assert_eq!(delays, vec![1.0, 2.0, 4.0, 8.0]);
        assert_eq!(h.transport.connect_calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_error_stops_reconnect_loop() {
        let h = harness(test_config());
        h.manager.connect(&CancellationToken::new()).await.unwrap();

        h.transport
            .fail_next_connect(ClientError::TlsMaterial("bad certificate".into()));
        h.transport.drop_connection("network down");

        time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.transport.connect_calls(), 2);
        assert!(!h.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_reconnect_loop() {
        let h = harness(test_config());
        let mut status = h.manager.subscribe_status();
        h.manager.connect(&CancellationToken::new()).await.unwrap();

        for _ in 0..10 {
            h.transport
                .fail_next_connect(ClientError::Handshake("broker unavailable".into()));
        }
        h.transport.drop_connection("network down");
        wait_for(&mut status, |s| matches!(s, ConnectionStatus::Reconnecting(_))).await;

        h.manager.disconnect().await;
        let calls = h.transport.connect_calls();

        time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.transport.connect_calls(), calls);
        assert!(!h.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let h = harness(test_config());
        h.manager.connect(&CancellationToken::new()).await.unwrap();

        h.manager.disconnect().await;
        h.manager.disconnect().await;

        assert!(!h.manager.is_connected());
        assert!(!h.metrics.connected.load(Ordering::SeqCst));
        assert_eq!(h.transport.disconnect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliberate_disconnect_does_not_reconnect() {
        let h = harness(test_config());
        h.manager.connect(&CancellationToken::new()).await.unwrap();
        h.manager.disconnect().await;

        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.transport.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_after_disconnect_rearms_watcher() {
        let h = harness(test_config());
        let cancel = CancellationToken::new();
        h.manager.connect(&cancel).await.unwrap();
        h.manager.disconnect().await;

        time::advance(Duration::from_secs(5)).await;
        h.manager.connect(&cancel).await.unwrap();

        let mut status = h.manager.subscribe_status();
        h.transport.drop_connection("network down");
        wait_for(&mut status, |s| matches!(s, ConnectionStatus::Reconnecting(_))).await;
        wait_for(&mut status, ConnectionStatus::is_connected).await;
        assert_eq!(h.transport.connect_calls(), 3);
    }

    #[test]
    fn test_invalid_config_rejected_at_build() {
        let config = ClientConfig {
            broker: "ws://broker".into(),
            ..test_config()
        };
        let result = ConnectionManager::new(config, FakeTransport::new());
        assert!(matches!(result, Err(ClientError::ConfigValidation(_))));
    }
}
