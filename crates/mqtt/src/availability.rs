//! Online/offline availability messages.
//!
//! The bridge entity announced by discovery reads `{base_topic}/status`.
//! `Availability` keeps that topic truthful: a retained `online` after every
//! (re)connect, a retained `offline` before a deliberate shutdown, and a Last
//! Will carrying `offline` for everything else.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{config::LastWillConfig, connection::ConnectionManager, Result};

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

#[derive(Debug, Clone)]
pub struct Availability {
    /// Base topic for status messages; status goes to "{base_topic}/status".
    base_topic: String,
}

impl Availability {
    pub fn new(base_topic: &str) -> Self {
        Self {
            base_topic: base_topic.trim_end_matches('/').to_string(),
        }
    }

    pub fn status_topic(&self) -> String {
        format!("{}/status", self.base_topic)
    }

    /// Last Will matching the status topic, for `ClientConfig::last_will`.
    pub fn last_will(&self) -> LastWillConfig {
        LastWillConfig {
            topic: self.status_topic(),
            payload: OFFLINE.to_string(),
            qos: 1,
            retain: true,
        }
    }

    /// Publishes `online` after every successful connect.
    pub fn install(&self, manager: &ConnectionManager) {
        let topic = self.status_topic();
        manager.register_on_connect_handler(move |mqtt| {
            let topic = topic.clone();
            async move {
                match mqtt
                    .publish_with_retain(&CancellationToken::new(), &topic, ONLINE, true)
                    .await
                {
                    Ok(()) => info!("Published online status to {topic}"),
                    Err(e) => warn!("Failed to publish online status: {e}"),
                }
            }
        });
    }

    /// Publishes `offline` ahead of a deliberate disconnect.
    pub async fn publish_offline(
        &self,
        manager: &ConnectionManager,
        cancel: &CancellationToken,
    ) -> Result<()> {
        manager
            .publish_with_retain(cancel, &self.status_topic(), OFFLINE, true)
            .await?;
        info!("Published offline status to {}", self.status_topic());
        Ok(())
    }
}
