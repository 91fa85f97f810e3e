//! Registry change events and the bus that carries them
//!
//! The registry publishes one [`InstanceEvent`] per change. The refresh
//! controller and the notification dispatcher each hold their own
//! subscription; neither is registered implicitly.

use crate::instance::{InstanceId, Registration, Status, StatusInfo};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of events buffered per subscriber before it lags
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// What happened to an instance
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceEventKind {
    Registered { registration: Registration },
    Deregistered,
    AddressChanged { registration: Registration },
    StatusChanged { previous: StatusInfo, status: StatusInfo },
}

impl InstanceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "REGISTERED",
            Self::Deregistered => "DEREGISTERED",
            Self::AddressChanged { .. } => "ADDRESS_CHANGED",
            Self::StatusChanged { .. } => "STATUS_CHANGED",
        }
    }
}

/// A single registry change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceEvent {
    pub instance_id: InstanceId,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: InstanceEventKind,
}

impl InstanceEvent {
    pub fn new(instance_id: InstanceId, version: u64, kind: InstanceEventKind) -> Self {
        Self {
            instance_id,
            version,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Structural events move or remove proxy targets; status flips do not.
    pub fn affects_routes(&self) -> bool {
        !matches!(self.kind, InstanceEventKind::StatusChanged { .. })
    }

    pub fn status_change(&self) -> Option<StatusChangeEvent> {
        match &self.kind {
            InstanceEventKind::StatusChanged { previous, status } => Some(StatusChangeEvent {
                instance_id: self.instance_id.clone(),
                version: self.version,
                previous: previous.clone(),
                status: status.clone(),
                timestamp: self.timestamp,
            }),
            _ => None,
        }
    }
}

/// Status transition as seen by notifiers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeEvent {
    pub instance_id: InstanceId,
    pub version: u64,
    pub previous: StatusInfo,
    pub status: StatusInfo,
    pub timestamp: DateTime<Utc>,
}

impl StatusChangeEvent {
    pub fn new(instance_id: InstanceId, previous: Status, status: Status) -> Self {
        Self {
            instance_id,
            version: 0,
            previous: StatusInfo::of(previous),
            status: StatusInfo::of(status),
            timestamp: Utc::now(),
        }
    }

    pub fn is_change(&self) -> bool {
        self.previous.status != self.status.status
    }
}

/// Publish/subscribe channel between the registry and its consumers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<InstanceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers received the event
    pub fn publish(&self, event: InstanceEvent) -> usize {
        trace!(instance_id = %event.instance_id, kind = event.kind.as_str(), "Publishing instance event");
        // No subscribers is not an error: nothing is listening yet.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: InstanceEventKind) -> InstanceEvent {
        InstanceEvent::new(InstanceId::new("a1"), 1, kind)
    }

    #[test]
    fn test_only_structural_events_affect_routes() {
        let reg = Registration::new("app").with_service_url("http://h:1");
        assert!(event(InstanceEventKind::Registered { registration: reg.clone() }).affects_routes());
        assert!(event(InstanceEventKind::Deregistered).affects_routes());
        assert!(event(InstanceEventKind::AddressChanged { registration: reg }).affects_routes());
        assert!(!event(InstanceEventKind::StatusChanged {
            previous: StatusInfo::of(Status::Up),
            status: StatusInfo::of(Status::Down),
        })
        .affects_routes());
    }

    #[test]
    fn test_status_change_extraction() {
        let e = event(InstanceEventKind::StatusChanged {
            previous: StatusInfo::of(Status::Up),
            status: StatusInfo::of(Status::Down),
        });
        let change = e.status_change().unwrap();
        assert_eq!(change.instance_id, InstanceId::new("a1"));
        assert_eq!(change.previous.status, Status::Up);
        assert_eq!(change.status.status, Status::Down);
        assert!(change.is_change());

        assert!(event(InstanceEventKind::Deregistered).status_change().is_none());
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(event(InstanceEventKind::Deregistered)).unwrap();
        assert_eq!(json["type"], "DEREGISTERED");
        assert_eq!(json["instanceId"], "a1");
    }

    #[tokio::test]
    async fn test_bus_delivers_in_order() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(event(InstanceEventKind::Deregistered)), 0);

        let mut rx = bus.subscribe();
        for version in 1..=3 {
            bus.publish(InstanceEvent::new(
                InstanceId::new("a1"),
                version,
                InstanceEventKind::Deregistered,
            ));
        }
        for version in 1..=3 {
            assert_eq!(rx.recv().await.unwrap().version, version);
        }
    }
}
