//! Readiness derived from broker connectivity.
//!
//! The relay waits on `Ready` before forwarding events; everything else is
//! reported with the reason taken from the connection status.

use std::fmt;

use birdnet_mqtt_client::ConnectionStatus;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessState {
    Ready,
    NotReadyYet(String),
    Unknown,
}

impl ReadinessState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessState::Ready)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReadinessState::Ready => "Ready",
            ReadinessState::NotReadyYet(_) => "NotReadyYet",
            ReadinessState::Unknown => "Unknown",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ReadinessState::NotReadyYet(reason) => reason,
            _ => "",
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessState::NotReadyYet(reason) => write!(f, "NotReadyYet: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

impl From<&ConnectionStatus> for ReadinessState {
    fn from(status: &ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Connected => ReadinessState::Ready,
            ConnectionStatus::Connecting => ReadinessState::NotReadyYet("Connecting...".to_string()),
            ConnectionStatus::Disconnected(reason) => {
                ReadinessState::NotReadyYet(format!("Disconnected: {}", reason))
            }
            ConnectionStatus::Reconnecting(secs) => {
                ReadinessState::NotReadyYet(format!("Reconnecting in {:.1} sec", secs))
            }
        }
    }
}

/// Shared readiness tracker; clones observe the same state.
#[derive(Debug, Clone)]
pub struct Readiness {
    state_tx: watch::Sender<ReadinessState>,
    state_rx: watch::Receiver<ReadinessState>,
}

impl Readiness {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ReadinessState::Unknown);
        Self { state_tx, state_rx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> ReadinessState {
        self.state_rx.borrow().clone()
    }

    /// Follows `status` in a background task until its sender goes away.
    pub fn start_listening(&self, status: watch::Receiver<ConnectionStatus>) {
        let readiness = self.clone();
        tokio::spawn(async move { readiness.listen(status).await });
    }

    async fn listen(&self, mut status: watch::Receiver<ConnectionStatus>) {
        debug!("Tracking readiness from connection status");

        let initial = ReadinessState::from(&*status.borrow_and_update());
        self.set_state(initial);

        while status.changed().await.is_ok() {
            let next = ReadinessState::from(&*status.borrow_and_update());
            self.set_state(next);
        }

        warn!("Connection status channel closed, readiness tracking stopped");
    }

    /// Updates the state; repeated values are not re-broadcast.
    pub fn set_state(&self, state: ReadinessState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("The readiness status has changed: {} -> {}", current, state);
            *current = state;
            true
        });
    }

    /// Resolves once the state is `Ready`.
    pub async fn wait_ready(&self) {
        let mut rx = self.subscribe();
        // the sender lives in self, so this cannot fail
        let _ = rx.wait_for(ReadinessState::is_ready).await;
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}
