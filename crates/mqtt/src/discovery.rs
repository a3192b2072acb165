//! Home Assistant MQTT discovery.
//!
//! Announces one bridge device plus one device per audio source, each with a
//! fixed set of sensors, as retained configuration messages:
//!
//! ```text
//! {prefix}/binary_sensor/{node}/status/config                       bridge
//! {prefix}/sensor/{node}/{node}_{source}_{type}/config              sensor
//! ```
//!
//! All sources share one state topic, so every sensor template filters on the
//! raw (unsanitized) source id carried in the event and otherwise keeps its
//! previous state.
//!
//! See <https://www.home-assistant.io/integrations/mqtt/#mqtt-discovery>.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::{connection::ConnectionManager, error::ClientError, Result};

pub const SENSOR_SPECIES: &str = "species";
pub const SENSOR_CONFIDENCE: &str = "confidence";
pub const SENSOR_SCIENTIFIC_NAME: &str = "scientific_name";
pub const SENSOR_SOUND_LEVEL: &str = "sound_level";

/// Every sensor type, including optional ones. Removal clears all of them.
pub const ALL_SENSOR_TYPES: [&str; 4] = [
    SENSOR_SPECIES,
    SENSOR_CONFIDENCE,
    SENSOR_SCIENTIFIC_NAME,
    SENSOR_SOUND_LEVEL,
];

const DEVICE_ID_PREFIX: &str = "birdnet_go";
const MANUFACTURER: &str = "BirdNET-Go";
const SUPPORT_URL: &str = "https://github.com/tphakala/birdnet-go";
const MAX_DISPLAY_NAME_LENGTH: usize = 32;
const RTSP_PREFIX: &str = "rtsp_";
/// `rtsp_` plus the first 8 characters of the stream UUID.
const RTSP_SHORT_LENGTH: usize = 13;

/// Publisher settings, immutable per publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DiscoveryConfig {
    #[validate(length(min = 1, message = "Discovery prefix must not be empty"))]
    pub discovery_prefix: String,

    /// Topic events are published to; `{base}/status` carries availability.
    #[validate(length(min = 1, message = "Base topic must not be empty"))]
    pub base_topic: String,

    pub device_name: String,

    pub node_id: String,

    pub version: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            discovery_prefix: "homeassistant".to_string(),
            base_topic: "birdnet".to_string(),
            device_name: "BirdNET-Go".to_string(),
            node_id: "birdnet-go".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl DiscoveryConfig {
    pub fn availability_topic(&self) -> String {
        format!("{}/status", self.base_topic)
    }
}

/// An audio input whose detections are announced as a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSource {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

impl AudioSource {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Application features that change the announced sensor set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySettings {
    pub sound_level_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value_template: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit_of_measurement: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_class: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state_class: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entity_category: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload_available: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload_not_available: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub availability_topic: String,
    pub device: DiscoveryDevice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<DiscoveryOrigin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDevice {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sw_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub via_device: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryOrigin {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sw_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub support_url: String,
}

/// Replaces characters outside `[A-Za-z0-9_-]` with `_`, collapses runs of
/// `_` and trims them from both ends. Never returns an empty string.
pub fn sanitize_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Keeps fallback device names short enough for the Home Assistant UI.
pub fn shorten_display_name(name: &str) -> String {
    if name.len() <= MAX_DISPLAY_NAME_LENGTH {
        return name.to_string();
    }

    if name.starts_with(RTSP_PREFIX) && name.len() > RTSP_SHORT_LENGTH {
        return prefix(name, RTSP_SHORT_LENGTH).to_string();
    }

    let truncated = prefix(name, MAX_DISPLAY_NAME_LENGTH);
    let bytes = truncated.as_bytes();
    let natural_break = (MAX_DISPLAY_NAME_LENGTH / 2..bytes.len())
        .rev()
        .find(|&i| matches!(bytes[i], b'_' | b'-' | b'/'));

    match natural_break {
        Some(i) => truncated[..i].to_string(),
        None => truncated.to_string(),
    }
}

/// Longest prefix of at most `max` bytes ending on a char boundary.
fn prefix(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

pub fn bridge_id(node_id: &str) -> String {
    format!("{DEVICE_ID_PREFIX}_{node_id}_bridge")
}

pub fn bridge_topic(prefix: &str, node_id: &str) -> String {
    format!("{prefix}/binary_sensor/{node_id}/status/config")
}

pub fn sensor_topic(prefix: &str, node_id: &str, source_id: &str, sensor_type: &str) -> String {
    format!("{prefix}/sensor/{node_id}/{node_id}_{source_id}_{sensor_type}/config")
}

/// Retained publishing capability the discovery publisher depends on.
#[async_trait]
pub trait RetainedPublisher: Send + Sync {
    async fn publish_retained(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<()>;
}

#[async_trait]
impl RetainedPublisher for ConnectionManager {
    async fn publish_retained(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.publish_with_retain(cancel, topic, payload, true).await
    }
}

/// Publishes and removes discovery entries over a [`RetainedPublisher`].
pub struct DiscoveryPublisher<P> {
    client: P,
    config: DiscoveryConfig,
}

impl<P: RetainedPublisher> DiscoveryPublisher<P> {
    pub fn new(client: P, config: DiscoveryConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Publishes the bridge entry, then every sensor of every source.
    ///
    /// A failed publish is logged and the remaining entries are still
    /// attempted; the first failure is returned wrapped in
    /// [`ClientError::Discovery`].
    pub async fn publish_discovery(
        &self,
        cancel: &CancellationToken,
        sources: &[AudioSource],
        settings: &DiscoverySettings,
    ) -> Result<()> {
        info!(
            source_count = sources.len(),
            discovery_prefix = %self.config.discovery_prefix,
            "Publishing Home Assistant discovery messages"
        );

        let mut first_error = None;
        for (topic, payload) in self.entries(sources, settings) {
            if let Err(e) = self.publish_payload(cancel, &topic, &payload).await {
                error!(topic = %topic, "Failed to publish discovery: {e}");
                first_error.get_or_insert(e);
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        match first_error {
            Some(e) => Err(ClientError::Discovery(Box::new(e))),
            None => {
                info!("Home Assistant discovery messages published");
                Ok(())
            }
        }
    }

    /// Clears every topic `publish_discovery` could have used for `sources`,
    /// including optional sensors. Failures are only logged.
    pub async fn remove_discovery(
        &self,
        cancel: &CancellationToken,
        sources: &[AudioSource],
    ) -> Result<()> {
        info!("Removing Home Assistant discovery messages");

        for topic in self.all_topics(sources) {
            if let Err(e) = self.client.publish_retained(cancel, &topic, Vec::new()).await {
                warn!(topic = %topic, "Failed to remove discovery entry: {e}");
            }
        }
        Ok(())
    }

    /// Bridge topic followed by every sensor topic of every source.
    pub fn all_topics(&self, sources: &[AudioSource]) -> Vec<String> {
        let prefix = &self.config.discovery_prefix;
        let node = sanitize_id(&self.config.node_id);

        let mut topics = vec![bridge_topic(prefix, &node)];
        for source in sources {
            let source_id = sanitize_id(&source.id);
            topics.extend(
                ALL_SENSOR_TYPES
                    .iter()
                    .map(|sensor| sensor_topic(prefix, &node, &source_id, sensor)),
            );
        }
        topics
    }

    async fn publish_payload(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        payload: &DiscoveryPayload,
    ) -> Result<()> {
        let data = serde_json::to_vec(payload)?;
        debug!(topic, payload_size = data.len(), "Publishing discovery message");
        self.client.publish_retained(cancel, topic, data).await
    }

    fn entries(
        &self,
        sources: &[AudioSource],
        settings: &DiscoverySettings,
    ) -> Vec<(String, DiscoveryPayload)> {
        let node = sanitize_id(&self.config.node_id);
        let mut entries = vec![(
            bridge_topic(&self.config.discovery_prefix, &node),
            self.bridge_payload(&node),
        )];
        for source in sources {
            entries.extend(self.source_entries(&node, source, settings));
        }
        entries
    }

    fn bridge_payload(&self, node: &str) -> DiscoveryPayload {
        let bridge = bridge_id(node);
        DiscoveryPayload {
            name: "Status".into(),
            unique_id: format!("{bridge}_status"),
            state_topic: self.config.availability_topic(),
            value_template: String::new(),
            unit_of_measurement: String::new(),
            device_class: "connectivity".into(),
            state_class: String::new(),
            icon: String::new(),
            entity_category: "diagnostic".into(),
            payload_available: "online".into(),
            payload_not_available: "offline".into(),
            availability_topic: String::new(),
            device: DiscoveryDevice {
                identifiers: vec![bridge],
                name: self.config.device_name.clone(),
                manufacturer: MANUFACTURER.into(),
                model: "Bridge".into(),
                sw_version: self.config.version.clone(),
                via_device: String::new(),
            },
            origin: Some(self.origin()),
        }
    }

    fn source_entries(
        &self,
        node: &str,
        source: &AudioSource,
        settings: &DiscoverySettings,
    ) -> Vec<(String, DiscoveryPayload)> {
        let source_id = sanitize_id(&source.id);
        let device_id = format!("{DEVICE_ID_PREFIX}_{node}_{source_id}");

        let display = if source.display_name.is_empty() {
            shorten_display_name(&source.id)
        } else {
            source.display_name.clone()
        };

        let device = DiscoveryDevice {
            identifiers: vec![device_id.clone()],
            name: format!("{} {display}", self.config.device_name),
            manufacturer: MANUFACTURER.into(),
            model: "Audio Analyzer".into(),
            sw_version: self.config.version.clone(),
            via_device: bridge_id(node),
        };

        // Templates match the raw id exactly as it appears in events.
        let raw = &source.id;
        let base = &self.config.base_topic;

        let mut sensors = vec![
            Sensor {
                kind: SENSOR_SPECIES,
                name: "Last Species",
                state_topic: base.clone(),
                value_template: format!(
                    "{{{{ value_json.CommonName if value_json.sourceId == '{raw}' else this.state }}}}"
                ),
                unit: "",
                device_class: "",
                state_class: "",
                icon: "mdi:bird",
            },
            Sensor {
                kind: SENSOR_CONFIDENCE,
                name: "Confidence",
                state_topic: base.clone(),
                value_template: format!(
                    "{{{{ (value_json.Confidence * 100) | round(1) if value_json.sourceId == '{raw}' else this.state }}}}"
                ),
                unit: "%",
                device_class: "",
                state_class: "measurement",
                icon: "mdi:percent",
            },
            Sensor {
                kind: SENSOR_SCIENTIFIC_NAME,
                name: "Scientific Name",
                state_topic: base.clone(),
                value_template: format!(
                    "{{{{ value_json.ScientificName if value_json.sourceId == '{raw}' else this.state }}}}"
                ),
                unit: "",
                device_class: "",
                state_class: "",
                icon: "mdi:format-quote-close",
            },
        ];

        if settings.sound_level_enabled {
            sensors.push(Sensor {
                kind: SENSOR_SOUND_LEVEL,
                name: "Sound Level",
                state_topic: format!("{base}/soundlevel"),
                value_template: format!(
                    "{{{{ value_json.b['1.0_kHz'].m if value_json.src == '{raw}' else this.state }}}}"
                ),
                unit: "dB",
                device_class: "sound_pressure",
                state_class: "measurement",
                icon: "mdi:volume-high",
            });
        }

        sensors
            .into_iter()
            .map(|sensor| {
                let topic =
                    sensor_topic(&self.config.discovery_prefix, node, &source_id, sensor.kind);
                let payload = DiscoveryPayload {
                    name: sensor.name.into(),
                    unique_id: format!("{device_id}_{}", sensor.kind),
                    state_topic: sensor.state_topic,
                    value_template: sensor.value_template,
                    unit_of_measurement: sensor.unit.into(),
                    device_class: sensor.device_class.into(),
                    state_class: sensor.state_class.into(),
                    icon: sensor.icon.into(),
                    entity_category: String::new(),
                    payload_available: String::new(),
                    payload_not_available: String::new(),
                    availability_topic: self.config.availability_topic(),
                    device: device.clone(),
                    origin: Some(self.origin()),
                };
                (topic, payload)
            })
            .collect()
    }

    fn origin(&self) -> DiscoveryOrigin {
        DiscoveryOrigin {
            name: MANUFACTURER.into(),
            sw_version: self.config.version.clone(),
            support_url: SUPPORT_URL.into(),
        }
    }
}

struct Sensor {
    kind: &'static str,
    name: &'static str,
    state_topic: String,
    value_template: String,
    unit: &'static str,
    device_class: &'static str,
    state_class: &'static str,
    icon: &'static str,
}

/// Republishes discovery after every (re)connect of `manager`.
pub fn republish_on_connect(
    manager: &ConnectionManager,
    config: DiscoveryConfig,
    sources: Vec<AudioSource>,
    settings: DiscoverySettings,
) {
    manager.register_on_connect_handler(move |mqtt| {
        let publisher = DiscoveryPublisher::new(mqtt, config.clone());
        let sources = sources.clone();
        async move {
            if let Err(e) = publisher
                .publish_discovery(&CancellationToken::new(), &sources, &settings)
                .await
            {
                warn!("Discovery republish incomplete: {e}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Value;

    use super::*;
    use crate::test_support::{test_config, FakeTransport};

    fn config() -> DiscoveryConfig {
        DiscoveryConfig {
            discovery_prefix: "homeassistant".into(),
            base_topic: "birdnet".into(),
            device_name: "BirdNET-Go".into(),
            node_id: "test-node".into(),
            version: "1.0.0".into(),
        }
    }

    async fn connected() -> (ConnectionManager, Arc<FakeTransport>) {
        let transport = FakeTransport::new();
        let manager = ConnectionManager::new(test_config(), transport.clone()).unwrap();
        manager.connect(&CancellationToken::new()).await.unwrap();
        (manager, transport)
    }

    fn payload_for(transport: &FakeTransport, topic: &str) -> Value {
        let published = transport
            .publishes()
            .into_iter()
            .find(|p| p.topic == topic)
            .unwrap_or_else(|| panic!("nothing published to {topic}"));
        assert!(published.retain, "{topic} must be retained");
        serde_json::from_slice(&published.payload).unwrap()
    }

    #[test]
    fn test_sanitize_id() {
        let cases = [
            ("test123", "test123"),
            ("Test_ID-123", "Test_ID-123"),
            ("test id", "test_id"),
            ("hw:0,0", "hw_0_0"),
            ("test@#$%id", "test_id"),
            ("path/to/source", "path_to_source"),
            ("test___id", "test_id"),
            ("@@@test", "test"),
            ("test@@@", "test"),
            ("@#$%", "unknown"),
            ("", "unknown"),
            ("_", "unknown"),
            ("   ", "unknown"),
            ("hw:0,0 USB Audio", "hw_0_0_USB_Audio"),
            ("alsa_output.pci-0000_00_1f.3", "alsa_output_pci-0000_00_1f_3"),
            ("http://192.168.1.1:8080/stream", "http_192_168_1_1_8080_stream"),
            ("mikrofoni-ääni", "mikrofoni-_ni"),
        ];
        for (input, expected) in cases {
            let out = sanitize_id(input);
            assert_eq!(out, expected, "sanitize_id({input:?})");
            assert!(!out.contains("__"));
        }
    }

    #[test]
    fn test_shorten_display_name() {
        assert_eq!(shorten_display_name("USB Microphone"), "USB Microphone");

        let exact = "a".repeat(32);
        assert_eq!(shorten_display_name(&exact), exact);

        assert_eq!(
            shorten_display_name("rtsp_a1b2c3d4-e5f6-7890-abcd-ef1234567890"),
            "rtsp_a1b2c3d4"
        );

        // Last break inside the second half of the 32-byte prefix wins.
        assert_eq!(
            shorten_display_name("http://camera.local:554/stream/main/channel1"),
            "http://camera.local:554/stream"
        );

        let no_breaks = "x".repeat(40);
        assert_eq!(shorten_display_name(&no_breaks).len(), 32);
    }

    #[test]
    fn test_shorten_display_name_respects_char_boundaries() {
        let name = "ä".repeat(20);
        let short = shorten_display_name(&name);
        assert!(short.len() <= 32);
        assert!(short.chars().all(|c| c == 'ä'));
    }

    #[test]
    fn test_topics() {
        assert_eq!(
            bridge_topic("homeassistant", "node"),
            "homeassistant/binary_sensor/node/status/config"
        );
        assert_eq!(
            sensor_topic("homeassistant", "node", "hw_0_0", SENSOR_SPECIES),
            "homeassistant/sensor/node/node_hw_0_0_species/config"
        );
    }

    #[tokio::test]
    async fn test_bridge_payload() {
        let (manager, transport) = connected().await;
        let publisher = DiscoveryPublisher::new(manager, config());

        publisher
            .publish_discovery(&CancellationToken::new(), &[], &DiscoverySettings::default())
            .await
            .unwrap();

        let bridge = payload_for(&transport, "homeassistant/binary_sensor/test-node/status/config");
        assert_eq!(bridge["name"], "Status");
        assert_eq!(bridge["unique_id"], "birdnet_go_test-node_bridge_status");
        assert_eq!(bridge["state_topic"], "birdnet/status");
        assert_eq!(bridge["device_class"], "connectivity");
        assert_eq!(bridge["entity_category"], "diagnostic");
        assert_eq!(bridge["payload_available"], "online");
        assert_eq!(bridge["payload_not_available"], "offline");
        assert_eq!(bridge["device"]["identifiers"][0], "birdnet_go_test-node_bridge");
        assert_eq!(bridge["device"]["model"], "Bridge");
        assert_eq!(bridge["device"]["sw_version"], "1.0.0");
        assert_eq!(bridge["origin"]["name"], "BirdNET-Go");
        assert!(bridge.get("value_template").is_none());
        assert!(bridge["device"].get("via_device").is_none());
    }

    #[tokio::test]
    async fn test_source_with_unsanitized_template() {
        let (manager, transport) = connected().await;
        let publisher = DiscoveryPublisher::new(manager, config());
        let sources = [AudioSource::new("hw:0,0", "")];

        publisher
            .publish_discovery(&CancellationToken::new(), &sources, &DiscoverySettings::default())
            .await
            .unwrap();

        let species = payload_for(
            &transport,
            "homeassistant/sensor/test-node/test-node_hw_0_0_species/config",
        );
        assert_eq!(species["name"], "Last Species");
        assert_eq!(species["unique_id"], "birdnet_go_test-node_hw_0_0_species");
        assert_eq!(species["state_topic"], "birdnet");
        assert_eq!(species["availability_topic"], "birdnet/status");
        assert_eq!(
            species["value_template"],
            "{{ value_json.CommonName if value_json.sourceId == 'hw:0,0' else this.state }}"
        );
        assert_eq!(species["device"]["name"], "BirdNET-Go hw:0,0");
        assert_eq!(species["device"]["model"], "Audio Analyzer");
        assert_eq!(species["device"]["via_device"], "birdnet_go_test-node_bridge");

        let confidence = payload_for(
            &transport,
            "homeassistant/sensor/test-node/test-node_hw_0_0_confidence/config",
        );
        assert_eq!(confidence["unit_of_measurement"], "%");
        assert_eq!(confidence["state_class"], "measurement");
        assert_eq!(
            confidence["value_template"],
            "{{ (value_json.Confidence * 100) | round(1) if value_json.sourceId == 'hw:0,0' else this.state }}"
        );

        // bridge + species + confidence + scientific name
        assert_eq!(transport.publishes().len(), 4);
    }

    #[tokio::test]
    async fn test_sound_level_sensor_only_when_enabled() {
        let (manager, transport) = connected().await;
        let publisher = DiscoveryPublisher::new(manager, config());
        let sources = [AudioSource::new("usb-mic", "USB Microphone")];
        let settings = DiscoverySettings {
            sound_level_enabled: true,
        };

        publisher
            .publish_discovery(&CancellationToken::new(), &sources, &settings)
            .await
            .unwrap();

        let sound = payload_for(
            &transport,
            "homeassistant/sensor/test-node/test-node_usb-mic_sound_level/config",
        );
        assert_eq!(sound["state_topic"], "birdnet/soundlevel");
        assert_eq!(sound["device_class"], "sound_pressure");
        assert_eq!(sound["unit_of_measurement"], "dB");
        assert_eq!(
            sound["value_template"],
            "{{ value_json.b['1.0_kHz'].m if value_json.src == 'usb-mic' else this.state }}"
        );
        assert_eq!(sound["device"]["name"], "BirdNET-Go USB Microphone");
        assert_eq!(transport.publishes().len(), 5);
    }

    #[tokio::test]
    async fn test_multiple_sources() {
        let (manager, transport) = connected().await;
        let publisher = DiscoveryPublisher::new(manager, config());
        let sources = [
            AudioSource::new("usb-mic", "USB Microphone"),
            AudioSource::new("built-in", "Built-in Audio"),
            AudioSource::new("network", "Network Stream"),
        ];

        publisher
            .publish_discovery(&CancellationToken::new(), &sources, &DiscoverySettings::default())
            .await
            .unwrap();

        let topics = transport.topics();
        assert_eq!(topics.len(), 10);
        assert_eq!(topics[0], "homeassistant/binary_sensor/test-node/status/config");
        for source in &sources {
            let expected = sensor_topic("homeassistant", "test-node", &source.id, SENSOR_SPECIES);
            assert!(topics.contains(&expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_failure_continues_and_returns_first_error() {
        let (manager, transport) = connected().await;
        let publisher = DiscoveryPublisher::new(manager, config());
        let sources = [
            AudioSource::new("first", ""),
            AudioSource::new("second", ""),
        ];
        let failing = sensor_topic("homeassistant", "test-node", "first", SENSOR_CONFIDENCE);
        transport.reject_topic(&failing);

        let err = publisher
            .publish_discovery(&CancellationToken::new(), &sources, &DiscoverySettings::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Discovery(_)));
        let message = err.to_string();
        assert!(message.starts_with("failed to publish discovery for one or more sources"));
        assert!(message.contains(&failing));

        // Everything except the rejected topic still went out.
        assert_eq!(transport.publishes().len(), 6);
    }

    #[tokio::test]
    async fn test_remove_clears_every_published_topic() {
        let (manager, transport) = connected().await;
        let publisher = DiscoveryPublisher::new(manager, config());
        let sources = [AudioSource::new("hw:0,0", ""), AudioSource::new("usb", "USB")];
        let settings = DiscoverySettings {
            sound_level_enabled: true,
        };
        let cancel = CancellationToken::new();

        publisher
            .publish_discovery(&cancel, &sources, &settings)
            .await
            .unwrap();
        let published = transport.topics();

        publisher.remove_discovery(&cancel, &sources).await.unwrap();
        let removals: Vec<_> = transport.publishes().into_iter().skip(published.len()).collect();

        assert_eq!(removals.len(), 1 + 2 * ALL_SENSOR_TYPES.len());
        for removal in &removals {
            assert!(removal.payload.is_empty());
            assert!(removal.retain);
        }
        for topic in &published {
            assert!(removals.iter().any(|r| &r.topic == topic), "{topic} not cleared");
        }
    }

    #[tokio::test]
    async fn test_remove_ignores_failures() {
        let transport = FakeTransport::new();
        let manager = ConnectionManager::new(test_config(), transport.clone()).unwrap();
        let publisher = DiscoveryPublisher::new(manager, config());

        // Not connected: every removal fails, removal still reports success.
        let result = publisher
            .remove_discovery(&CancellationToken::new(), &[AudioSource::new("usb", "")])
            .await;
        assert!(result.is_ok());
        assert!(transport.publishes().is_empty());
    }

    #[tokio::test]
    async fn test_republish_on_every_connect() {
        let transport = FakeTransport::new();
        let config_with_zero_cooldown = crate::config::ClientConfig {
            reconnect_cooldown: 0,
            ..test_config()
        };
        let manager = ConnectionManager::new(config_with_zero_cooldown, transport.clone()).unwrap();
        republish_on_connect(
            &manager,
            config(),
            vec![AudioSource::new("usb", "USB")],
            DiscoverySettings::default(),
        );

        let cancel = CancellationToken::new();
        manager.connect(&cancel).await.unwrap();
        assert_eq!(transport.publishes().len(), 4);

        manager.disconnect().await;
        manager.connect(&cancel).await.unwrap();
        assert_eq!(transport.publishes().len(), 8);
    }
}
