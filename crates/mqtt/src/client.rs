//! Translation of [`ClientConfig`] into rumqttc options.
//!
//! `ClientBuilder` resolves everything that does not change between
//! connection attempts: client id, credentials, keep-alive, Last Will and the
//! network transport (plain TCP or rustls). The rumqttc transport clones the
//! resulting `MqttOptions` for every session it opens.
//!
//! # Examples
//!
//! ```ignore
//! let config = ClientConfig {
//!     broker: "mqtts://broker.example.com".into(),
//!     tls: TlsConfig::with_ca_only("/etc/birdnet-mqtt/ca.pem"),
//!     ..Default::default()
//! };
//! let (options, capacity) = ClientBuilder::from_config(&config)?.build()?;
//! ```

use std::{net::Ipv6Addr, sync::Arc, time::Duration};

use rumqttc::{LastWill, MqttOptions, QoS, TlsConfiguration, Transport as NetworkTransport};
use tracing::debug;

use crate::{
    config::{ClientConfig, LastWillConfig, TlsConfig},
    precheck::BrokerUrl,
    tls, Result,
};

/// Builder for session options shared by every connection attempt.
pub struct ClientBuilder {
    /// MQTT protocol options (host, port, keep-alive, credentials, etc.)
    opts: MqttOptions,

    /// Capacity of the request channel between `AsyncClient` and `EventLoop`.
    cap: usize,

    /// TLS material, present when the scheme or config asks for TLS.
    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    /// Creates a plain TCP builder.
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16, cap: usize) -> Self {
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_clean_session(true);
        Self {
            opts,
            cap,
            tls_config: None,
        }
    }

    /// Creates a builder from validated configuration.
    ///
    /// # Errors
    /// `InvalidBrokerUrl` if the broker URL does not parse.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let url = BrokerUrl::parse(&config.broker)?;

        let mut builder = Self::new(
            config.effective_client_id(),
            rumqttc_host(&url),
            url.port,
            config.request_channel_capacity,
        )
        .keep_alive(config.keep_alive);

        if config.has_credentials() {
            builder = builder.credentials(&config.username, &config.password);
        }

        if let Some(will) = &config.last_will {
            builder = builder.last_will(will);
        }

        if config.tls_enabled() {
            builder.tls_config = Some(config.tls.clone());
        }

        Ok(builder)
    }

    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.opts.set_keep_alive(Duration::from_secs(secs));
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.opts.set_credentials(username, password);
        self
    }

    /// Configures the Last Will published by the broker on unclean loss.
    pub fn last_will(mut self, will: &LastWillConfig) -> Self {
        self.opts.set_last_will(LastWill::new(
            will.topic.clone(),
            will.payload.as_bytes().to_vec(),
            qos_from_u8(will.qos),
            will.retain,
        ));
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls_config = Some(tls);
        self
    }

    pub fn is_tls(&self) -> bool {
        self.tls_config.is_some()
    }

    /// Resolves the network transport and returns options plus channel capacity.
    ///
    /// # Errors
    /// Any TLS validation error from [`tls::build_client_config`].
    pub fn build(self) -> Result<(MqttOptions, usize)> {
        let mut opts = self.opts;

        if let Some(tls_config) = &self.tls_config {
            let client_config = tls::build_client_config(tls_config)?;
            opts.set_transport(NetworkTransport::Tls(TlsConfiguration::Rustls(Arc::new(
                client_config,
            ))));
            debug!("Using TLS transport");
        } else {
            opts.set_transport(NetworkTransport::Tcp);
        }

        Ok((opts, self.cap))
    }
}

/// rumqttc formats `host:port` itself, so raw IPv6 literals need brackets.
fn rumqttc_host(url: &BrokerUrl) -> String {
    if url.host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]", url.host)
    } else {
        url.host.clone()
    }
}

/// Maps a configured QoS level. Values above 1 degrade to at-least-once.
pub fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}
