//! Detection relay.
//!
//! Reads newline-delimited `EventDto` JSON (typically from stdin), waits for
//! the broker to be ready and publishes each event to the configured topic.
//! Malformed lines are skipped; failed publishes are logged and counted but
//! never stop the relay.

use std::io;

use birdnet_mqtt_client::{ConnectionManager, EventDto};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    time::{sleep, Duration},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::readiness::Readiness;

const READINESS_REMINDER: Duration = Duration::from_secs(30);

/// Counters reported when the input ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub forwarded: u64,
    pub skipped: u64,
    pub failed: u64,
}

pub struct Relay {
    manager: ConnectionManager,
    readiness: Readiness,
    topic: String,
}

impl Relay {
    /// Publishes to the manager's configured topic.
    pub fn new(manager: ConnectionManager, readiness: Readiness) -> Self {
        let topic = manager.config().topic.clone();
        Self {
            manager,
            readiness,
            topic,
        }
    }

    /// Relays until the input ends or `cancel` fires.
    ///
    /// # Errors
    /// Only read errors on the input end the relay with an error.
    #[instrument(skip_all, fields(topic = %self.topic))]
    pub async fn run<R>(&self, input: R, cancel: &CancellationToken) -> io::Result<RelayStats>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let mut stats = RelayStats::default();

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                debug!("Input closed");
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let event: EventDto = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping malformed event: {e}");
                    stats.skipped += 1;
                    continue;
                }
            };

            if !self.wait_ready(cancel).await {
                break;
            }

            match self.forward(&event, cancel).await {
                Ok(()) => {
                    stats.forwarded += 1;
                    debug!(
                        species = %event.common_name,
                        confidence = event.confidence,
                        "Detection relayed"
                    );
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(species = %event.common_name, "Failed to relay detection: {e}");
                }
            }
        }

        info!(
            forwarded = stats.forwarded,
            skipped = stats.skipped,
            failed = stats.failed,
            "Relay stopped"
        );
        Ok(stats)
    }

    async fn forward(
        &self,
        event: &EventDto,
        cancel: &CancellationToken,
    ) -> birdnet_mqtt_client::Result<()> {
        let payload = event.to_json()?;
        self.manager.publish(cancel, &self.topic, payload).await
    }

    /// Returns `false` when cancelled before the broker became ready.
    async fn wait_ready(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.readiness.subscribe();
        if rx.borrow_and_update().is_ready() {
            return true;
        }

        warn!("Waiting for broker readiness... Current: {}", *rx.borrow());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    let state = rx.borrow_and_update().clone();
                    if state.is_ready() {
                        info!("Broker ready, resuming relay");
                        return true;
                    }
                    debug!("Still not ready: {}", state);
                }
                _ = sleep(READINESS_REMINDER) => {
                    warn!("Still waiting for readiness... Current: {}", *rx.borrow());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    };

    use async_trait::async_trait;
    use birdnet_mqtt_client::{ClientConfig, ConnectionStatus, Transport};
    use tokio::sync::watch;
    use tracing_test::traced_test;

    use super::*;
    use crate::core::readiness::ReadinessState;

    struct RecordingTransport {
        connected: AtomicBool,
        status_tx: watch::Sender<ConnectionStatus>,
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            let (status_tx, _) = watch::channel(ConnectionStatus::Connecting);
            Arc::new(Self {
                connected: AtomicBool::new(false),
                status_tx,
                published: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn connect(&self) -> birdnet_mqtt_client::Result<()> {
            self.connected.store(true, Ordering::SeqCst);
            self.status_tx.send_replace(ConnectionStatus::Connected);
            Ok(())
        }

        async fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            _retain: bool,
        ) -> birdnet_mqtt_client::Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }

        async fn disconnect(&self) -> birdnet_mqtt_client::Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
            self.status_tx.subscribe()
        }
    }

    async fn connected_relay() -> (Relay, Arc<RecordingTransport>) {
        let config = ClientConfig {
            broker: "tcp://127.0.0.1:1883".into(),
            topic: "birdnet/detections".into(),
            ..Default::default()
        };
        let transport = RecordingTransport::new();
        let manager = ConnectionManager::new(config, transport.clone()).unwrap();
        manager.connect(&CancellationToken::new()).await.unwrap();

        let readiness = Readiness::new();
        readiness.set_state(ReadinessState::Ready);
        (Relay::new(manager, readiness), transport)
    }

    const ROBIN: &str = r#"{"Date":"2024-01-15","Time":"12:00:00","CommonName":"American Robin","ScientificName":"Turdus migratorius","Confidence":0.95,"Latitude":0,"Longitude":0,"ClipName":"","ProcessingTime":0}"#;

    #[tokio::test]
    #[traced_test]
    async fn test_relays_events_and_skips_garbage() {
        let (relay, transport) = connected_relay().await;
        let input = format!("{ROBIN}\n\nnot json\n{ROBIN}\n");

        let stats = relay
            .run(input.as_bytes(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            stats,
            RelayStats {
                forwarded: 2,
                skipped: 1,
                failed: 0
            }
        );
        let published = transport.published.lock().unwrap().clone();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "birdnet/detections");
        let value: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(value["CommonName"], "American Robin");
        assert!(logs_contain("Skipping malformed event"));
    }

    #[tokio::test]
    async fn test_publish_failure_counted() {
        let (relay, transport) = connected_relay().await;
        relay.manager.disconnect().await;

        let stats = relay
            .run(format!("{ROBIN}\n").as_bytes(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.failed, 1);
        assert!(transport.published.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_readiness_until_cancelled() {
        let (relay, transport) = connected_relay().await;
        relay
            .readiness
            .set_state(ReadinessState::NotReadyYet("Connecting...".into()));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(90)).await;
            trigger.cancel();
        });

        let stats = relay
            .run(format!("{ROBIN}\n").as_bytes(), &cancel)
            .await
            .unwrap();

        assert_eq!(stats.forwarded, 0);
        assert!(transport.published.lock().unwrap().is_empty());
    }
}
