//! Broker transport seam.
//!
//! The connection manager never touches rumqttc directly. It drives a
//! [`Transport`], which owns exactly one broker session at a time and reports
//! unexpected loss on a `watch` channel of [`ConnectionStatus`].
//!
//! [`RumqttTransport`] is the production implementation. Each `connect` opens
//! a fresh `AsyncClient`/`EventLoop` pair, polls until the broker's CONNACK and
//! then hands the event loop to a driver task:
//!
//! ```text
//! connect() ── poll ── CONNACK ──> spawn driver ── poll ... ── error / DISCONNECT
//!                                                                   │
//!                                    status_tx <── Disconnected(reason)
//! ```
//!
//! The driver never reconnects on its own; retry policy belongs to the manager.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    client::ClientBuilder, config::ClientConfig, error::ClientError, state::ConnectionStatus,
    Result,
};

/// A single broker session with loss reporting.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a session and returns once the broker accepted it.
    ///
    /// Not bounded by a timeout; the caller is expected to wrap it.
    async fn connect(&self) -> Result<()>;

    /// Hands one QoS 1 message to the session.
    ///
    /// Resolves once the message is queued for the event loop, not when the
    /// broker acknowledges it.
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()>;

    /// Closes the session. Closing an already closed transport is a no-op.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Status updates, including `Disconnected` on unexpected loss.
    fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus>;
}

struct Session {
    client: AsyncClient,
    driver: JoinHandle<()>,
    cancel: CancellationToken,
}

/// rumqttc-backed transport.
pub struct RumqttTransport {
    options: MqttOptions,
    cap: usize,
    session: Mutex<Option<Session>>,
    connected: Arc<AtomicBool>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
}

impl RumqttTransport {
    pub fn new(options: MqttOptions, cap: usize) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected("not connected".into()));
        Self {
            options,
            cap,
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            status_tx: Arc::new(status_tx),
        }
    }

    /// Builds options from configuration. TLS material is loaded here once;
    /// the manager re-checks file presence before every attempt.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let (options, cap) = ClientBuilder::from_config(config)?.build()?;
        Ok(Self::new(options, cap))
    }

    fn set_status(&self, status: ConnectionStatus) {
        update_status(&self.status_tx, status);
    }

    /// Tears down a leftover session whose driver may already have exited.
    async fn discard_session(&self) {
        if let Some(old) = self.session.lock().await.take() {
            old.cancel.cancel();
            old.driver.abort();
        }
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&self) -> Result<()> {
        self.discard_session().await;
        self.set_status(ConnectionStatus::Connecting);

        let (client, mut event_loop) = AsyncClient::new(self.options.clone(), self.cap);

        if let Err(e) = await_connack(&mut event_loop).await {
            self.set_status(ConnectionStatus::Disconnected(e.to_string()));
            return Err(e);
        }

        self.connected.store(true, Ordering::Release);
        self.set_status(ConnectionStatus::Connected);
        info!("Broker session established");

        let cancel = CancellationToken::new();
        let driver = tokio::spawn(drive(
            event_loop,
            cancel.clone(),
            self.connected.clone(),
            self.status_tx.clone(),
        ));

        *self.session.lock().await = Some(Session {
            client,
            driver,
            cancel,
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        let client = {
            let session = self.session.lock().await;
            match session.as_ref() {
                Some(s) if self.connected.load(Ordering::Acquire) => s.client.clone(),
                _ => return Err(ClientError::NotConnected),
            }
        };

        client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| ClientError::Publish(e.to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        // Dropping this future (caller timeout) still stops the driver.
        let _guard = session.cancel.clone().drop_guard();

        if let Err(e) = session.client.disconnect().await {
            debug!("Disconnect request not delivered: {e}");
        }
        if let Err(e) = session.driver.await {
            warn!("Event loop driver ended abnormally: {e}");
        }

        self.connected.store(false, Ordering::Release);
        self.set_status(ConnectionStatus::Disconnected("disconnected by client".into()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }
}

/// Polls a fresh event loop until the broker answers the CONNECT.
async fn await_connack(event_loop: &mut EventLoop) -> Result<()> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(ClientError::Handshake(refusal_reason(code))),
                };
            }
            Ok(event) => trace!("Handshake event: {event:?}"),
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(ClientError::Handshake(refusal_reason(code)));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Runs the event loop of an established session until it ends.
async fn drive(
    mut event_loop: EventLoop,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
) {
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Disconnected by broker");
                    break "disconnected by broker".to_string();
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    trace!(pkid = ack.pkid, "Publish acknowledged");
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("Disconnect sent, stopping event loop");
                    break "disconnected by client".to_string();
                }
                Ok(_) => {}
                Err(e) => {
                    let reason = root_cause(&e);
                    warn!("Broker connection lost: {reason}");
                    break reason;
                }
            }
        }
    };

    connected.store(false, Ordering::Release);
    update_status(&status_tx, ConnectionStatus::Disconnected(reason));
}

fn update_status(tx: &watch::Sender<ConnectionStatus>, status: ConnectionStatus) {
    tx.send_if_modified(|current| {
        if *current == status {
            return false;
        }
        debug!("Transport status changed to: {status}");
        *current = status;
        true
    });
}

fn refusal_reason(code: ConnectReturnCode) -> String {
    match code {
        ConnectReturnCode::RefusedProtocolVersion => "unsupported protocol version".into(),
        ConnectReturnCode::BadClientId => "client identifier rejected".into(),
        ConnectReturnCode::ServiceUnavailable => "broker unavailable".into(),
        ConnectReturnCode::BadUserNamePassword => "bad username or password".into(),
        ConnectReturnCode::NotAuthorized => "not authorized".into(),
        ConnectReturnCode::Success => "accepted".into(),
    }
}

/// Innermost message of an error chain, without surrounding quotes.
fn root_cause(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
