//! Inbound device change feed
//!
//! Devices are owned by an external inventory; the engine only hears about
//! them through change notifications. On the wire a notification is a JSON
//! envelope:
//!
//! ```json
//! {"eventType": "device.updated",
//!  "payload": {"deviceId": "d-1", "ipAddress": {"old": "10.0.0.1", "new": "10.0.0.2"}}}
//! ```
//!
//! Payload fields of update notifications may be plain values or
//! `{"old": .., "new": ..}` maps, in which case the new value wins.

use std::net::IpAddr;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::DeviceId;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("malformed device change: {0}")]
    Json(#[from] serde_json::Error),

    #[error("device change is missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid ip address '{0}'")]
    InvalidAddress(String),
}

/// A change to a device in the external inventory
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceChange {
    Created {
        device_id: DeviceId,
        ip_address: IpAddr,
        hostname: Option<String>,
        interval_secs: Option<u32>,
        monitored: bool,
    },
    Updated {
        device_id: DeviceId,
        ip_address: Option<IpAddr>,
        hostname: Option<String>,
    },
    Deleted {
        device_id: DeviceId,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    event_type: String,
    #[serde(default)]
    payload: Option<serde_json::Map<String, Value>>,
}

impl DeviceChange {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            DeviceChange::Created { device_id, .. }
            | DeviceChange::Updated { device_id, .. }
            | DeviceChange::Deleted { device_id } => device_id,
        }
    }

    /// Parse one wire notification
    ///
    /// Returns `Ok(None)` for event types the engine does not act on.
    pub fn from_json(line: &str) -> Result<Option<DeviceChange>, FeedError> {
        let envelope: Envelope = serde_json::from_str(line)?;
        let payload = envelope.payload.ok_or(FeedError::MissingField("payload"))?;

        let device_id = field(&payload, "deviceId")
            .map(DeviceId::new)
            .ok_or(FeedError::MissingField("deviceId"))?;

        let change = match envelope.event_type.as_str() {
            "device.created" => {
                let ip = field(&payload, "ipAddress").ok_or(FeedError::MissingField("ipAddress"))?;
                DeviceChange::Created {
                    device_id,
                    ip_address: parse_ip(&ip)?,
                    hostname: field(&payload, "hostname"),
                    interval_secs: payload
                        .get("pingIntervalSeconds")
                        .and_then(Value::as_u64)
                        .and_then(|secs| u32::try_from(secs).ok()),
                    monitored: payload
                        .get("monitored")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }
            }
            "device.updated" => DeviceChange::Updated {
                device_id,
                ip_address: field(&payload, "ipAddress")
                    .map(|ip| parse_ip(&ip))
                    .transpose()?,
                hostname: field(&payload, "hostname"),
            },
            "device.deleted" => DeviceChange::Deleted { device_id },
            other => {
                debug!(%device_id, event_type = other, "ignoring unhandled device event type");
                return Ok(None);
            }
        };

        Ok(Some(change))
    }
}

/// A string field that may be wrapped in an `{"old", "new"}` update map
fn field(payload: &serde_json::Map<String, Value>, name: &str) -> Option<String> {
    let value = match payload.get(name)? {
        Value::Object(update) => update.get("new")?,
        value => value,
    };

    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn parse_ip(raw: &str) -> Result<IpAddr, FeedError> {
    raw.trim()
        .parse()
        .map_err(|_| FeedError::InvalidAddress(raw.to_string()))
}
