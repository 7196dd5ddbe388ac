//! Outbound domain events
//!
//! The engine publishes every recorded ping result and every alert transition
//! through an [`EventSink`]. Delivery is at-least-once from the engine's point
//! of view: a sink failure is logged and processing carries on.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::DeviceId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitoringEvent {
    PingResultRecorded {
        device_id: DeviceId,
        success: bool,
        response_time_ms: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    DeviceDown {
        device_id: DeviceId,
        address: String,
        timestamp: DateTime<Utc>,
    },
    DeviceRecovered {
        device_id: DeviceId,
        address: String,
        timestamp: DateTime<Utc>,
    },
    MonitoringStarted {
        device_id: DeviceId,
        address: String,
        timestamp: DateTime<Utc>,
    },
    MonitoringStopped {
        device_id: DeviceId,
        address: String,
        timestamp: DateTime<Utc>,
    },
    TargetAddressChanged {
        device_id: DeviceId,
        previous_address: String,
        address: String,
        timestamp: DateTime<Utc>,
    },
}

impl MonitoringEvent {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            MonitoringEvent::PingResultRecorded { device_id, .. }
            | MonitoringEvent::DeviceDown { device_id, .. }
            | MonitoringEvent::DeviceRecovered { device_id, .. }
            | MonitoringEvent::MonitoringStarted { device_id, .. }
            | MonitoringEvent::MonitoringStopped { device_id, .. }
            | MonitoringEvent::TargetAddressChanged { device_id, .. } => device_id,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            MonitoringEvent::PingResultRecorded { .. } => "ping_result_recorded",
            MonitoringEvent::DeviceDown { .. } => "device_down",
            MonitoringEvent::DeviceRecovered { .. } => "device_recovered",
            MonitoringEvent::MonitoringStarted { .. } => "monitoring_started",
            MonitoringEvent::MonitoringStopped { .. } => "monitoring_stopped",
            MonitoringEvent::TargetAddressChanged { .. } => "target_address_changed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: MonitoringEvent) -> Result<(), EventError>;
}

/// Fans events out to any number of subscribers
///
/// Slow subscribers lag and lose the oldest events; having no subscribers at
/// all is fine.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<MonitoringEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitoringEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn publish(&self, event: MonitoringEvent) -> Result<(), EventError> {
        match self.sender.send(event) {
            Ok(receivers) => trace!("published event to {receivers} receivers"),
            Err(_) => trace!("no receivers for event"),
        }
        Ok(())
    }
}

/// Keeps every published event in memory, in publication order
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MonitoringEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MonitoringEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events_for(&self, device_id: &DeviceId) -> Vec<MonitoringEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.device_id() == device_id)
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|event| event.kind() == kind)
            .count()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: MonitoringEvent) -> Result<(), EventError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
