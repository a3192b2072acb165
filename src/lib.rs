//! birdnet-mqtt, publishes BirdNET detections to an MQTT broker
//!
//! The application side of the workspace: configuration loading, logging
//! setup and the runtime glue around [`birdnet_mqtt_client`].
//!
//! ## Modules
//!
//! * `config`: TOML configuration with `validator` rules; sections for the
//!   logger, the broker client and Home Assistant discovery.
//!
//! * `core`: Runtime components:
//!   - Readiness tracking from the broker connection status
//!   - The stdin detection relay
//!
//! * `logger`: `tracing` subscriber initialization: console output in
//!   compact, pretty or JSON format and optional systemd journald.

pub mod config;
pub mod core;
pub mod logger;
