//! The log record kept for every completed exchange.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use http::HeaderMap;
use http::header::CONTENT_ENCODING;
use serde::{Deserialize, Serialize};

use crate::client_profile::ClientProfile;

pub const PROTOCOL_HTTPS: &str = "HTTPS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLog {
    pub method: String,
    pub url: String,
    pub protocol: String,
    pub client_ip: String,
    pub request_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_body: String,

    pub status_code: u16,
    pub response_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response_body: String,
    #[serde(rename = "response_time_ms", with = "duration_ms")]
    pub response_time: Duration,

    pub timestamp: DateTime<Utc>,
    pub completed: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_info: String,
    pub is_simulator: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_identifier: String,
}

impl RequestLog {
    /// Start a record now; response fields stay empty until [`finish`](Self::finish).
    pub fn begin(method: impl Into<String>, url: impl Into<String>, protocol: impl Into<String>) -> Self {
        let now = Utc::now();
        RequestLog {
            method: method.into(),
            url: url.into(),
            protocol: protocol.into(),
            client_ip: String::new(),
            request_headers: BTreeMap::new(),
            request_body: String::new(),
            status_code: 0,
            response_headers: BTreeMap::new(),
            response_body: String::new(),
            response_time: Duration::ZERO,
            timestamp: now,
            completed: now,
            user_agent: String::new(),
            device_info: String::new(),
            is_simulator: false,
            app_identifier: String::new(),
        }
    }

    pub fn apply_profile(&mut self, profile: &ClientProfile) {
        self.device_info = profile.device_info.clone();
        self.is_simulator = profile.is_simulator;
        self.app_identifier = profile.app_identifier.clone();
    }

    /// Stamp the completion time and latency.
    pub fn finish(&mut self) {
        self.completed = Utc::now();
        self.response_time = (self.completed - self.timestamp).to_std().unwrap_or_default();
    }
}

/// One string per header name, repeated values joined with `", "`.
pub fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        flat.entry(name.as_str().to_string())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    flat
}

/// Human readable body for the log. A gzip `Content-Encoding` is undone when
/// possible; malformed gzip falls back to the raw bytes. The caller keeps the
/// original bytes for the wire.
pub fn loggable_body(headers: &HeaderMap, body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }
    let gzipped = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"));
    if gzipped {
        let mut decoded = Vec::new();
        if MultiGzDecoder::new(body).read_to_end(&mut decoded).is_ok() {
            return String::from_utf8_lossy(&decoded).into_owned();
        }
    }
    String::from_utf8_lossy(body).into_owned()
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
