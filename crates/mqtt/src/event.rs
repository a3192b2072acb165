//! Detection event wire format.
//!
//! Field names are consumed by Home Assistant templates and third-party
//! integrations and must never change. Legacy fields keep their PascalCase
//! names; fields added later are camelCase and omitted when empty, so
//! existing consumers see the same document they always did.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One detection as published to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDto {
    #[serde(rename = "Date")]
    pub date: String,

    #[serde(rename = "Time")]
    pub time: String,

    #[serde(rename = "CommonName")]
    pub common_name: String,

    #[serde(rename = "ScientificName")]
    pub scientific_name: String,

    #[serde(rename = "Confidence")]
    pub confidence: f64,

    #[serde(rename = "Latitude")]
    pub latitude: f64,

    #[serde(rename = "Longitude")]
    pub longitude: f64,

    #[serde(rename = "ClipName")]
    pub clip_name: String,

    /// Serialized as integer nanoseconds.
    #[serde(rename = "ProcessingTime", with = "nanos")]
    pub processing_time: Duration,

    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub occurrence: f64,

    #[serde(rename = "detectionId", default, skip_serializing_if = "is_zero_u64")]
    pub detection_id: u64,

    /// Raw audio source id, used by discovery templates for filtering.
    #[serde(rename = "sourceId", default, skip_serializing_if = "String::is_empty")]
    pub source_id: String,

    #[serde(rename = "BirdImage", default, skip_serializing_if = "Option::is_none")]
    pub bird_image: Option<BirdImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BirdImage {
    #[serde(rename = "URL")]
    pub url: String,
    pub scientific_name: String,
    pub license_name: String,
    #[serde(rename = "LicenseURL")]
    pub license_url: String,
    pub author_name: String,
    #[serde(rename = "AuthorURL")]
    pub author_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub cached_at: OffsetDateTime,
    pub source_provider: String,
}

impl EventDto {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

fn is_zero_f64(value: &f64) -> bool {
    *value == 0.0
}

fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}

mod nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = i64::try_from(value.as_nanos()).unwrap_or(i64::MAX);
        serializer.serialize_i64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = i64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos.max(0) as u64))
    }
}
