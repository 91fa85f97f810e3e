//! Marks the route table dirty when the registry changes shape
//!
//! The controller never rebuilds routes itself. Bursts of registrations
//! collapse into one rebuild on the next lookup.

use crate::events::InstanceEvent;
use crate::locator::RouteLocator;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub struct RefreshController {
    locator: Arc<RouteLocator>,
}

impl RefreshController {
    pub fn new(locator: Arc<RouteLocator>) -> Self {
        Self { locator }
    }

    /// Returns true if the event marked the routes dirty
    pub fn handle(&self, event: &InstanceEvent) -> bool {
        if !event.affects_routes() {
            return false;
        }
        debug!(
            instance_id = %event.instance_id,
            kind = event.kind.as_str(),
            "Registry change invalidates routes"
        );
        self.locator.mark_dirty();
        true
    }

    /// Consume events until shutdown or until the bus closes
    pub async fn run(
        self,
        mut events: broadcast::Receiver<InstanceEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Route refresh controller started");
        loop {
            tokio::select! {
                result = events.recv() => {
                    match result {
                        Ok(event) => {
                            self.handle(&event);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Missed events may have been structural.
                            warn!(skipped, "Refresh controller lagged, invalidating routes");
                            self.locator.mark_dirty();
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Event bus closed");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Route refresh controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, InstanceEventKind};
    use crate::instance::{InstanceId, Registration, Status, StatusInfo};
    use crate::registry::InMemoryRegistry;
    use std::time::Duration;

    async fn clean_locator(registry: Arc<InMemoryRegistry>) -> Arc<RouteLocator> {
        let locator = Arc::new(RouteLocator::new(registry));
        locator.get_routes().await;
        assert!(!locator.is_dirty());
        locator
    }

    fn event(kind: InstanceEventKind) -> InstanceEvent {
        InstanceEvent::new(InstanceId::new("a1"), 2, kind)
    }

    #[tokio::test]
    async fn test_status_only_events_do_not_mark_dirty() {
        let registry = Arc::new(InMemoryRegistry::new(EventBus::default()));
        let locator = clean_locator(registry).await;
        let controller = RefreshController::new(Arc::clone(&locator));

        for (from, to) in [(Status::Up, Status::Down), (Status::Down, Status::Up), (Status::Unknown, Status::Offline)] {
            let marked = controller.handle(&event(InstanceEventKind::StatusChanged {
                previous: StatusInfo::of(from),
                status: StatusInfo::of(to),
            }));
            assert!(!marked);
        }
        assert!(!locator.is_dirty());
    }

    #[tokio::test]
    async fn test_structural_events_always_mark_dirty() {
        let registry = Arc::new(InMemoryRegistry::new(EventBus::default()));
        let reg = Registration::new("app").with_management_url("http://h:1");
        let kinds = [
            InstanceEventKind::Registered { registration: reg.clone() },
            InstanceEventKind::Deregistered,
            InstanceEventKind::AddressChanged { registration: reg },
        ];

        for kind in kinds {
            let locator = clean_locator(Arc::clone(&registry)).await;
            let controller = RefreshController::new(Arc::clone(&locator));
            assert!(controller.handle(&event(kind)));
            assert!(locator.is_dirty());
        }
    }

    #[tokio::test]
    async fn test_run_loop_follows_registry() {
        let bus = EventBus::new(64);
        let registry = Arc::new(InMemoryRegistry::new(bus.clone()));
        let locator = clean_locator(Arc::clone(&registry)).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let controller = RefreshController::new(Arc::clone(&locator));
        let handle = tokio::spawn(controller.run(bus.subscribe(), shutdown_rx));

        let id = registry
            .register(None, Registration::new("app").with_management_url("http://10.0.0.5:8081"))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !locator.is_dirty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("route table should be marked dirty");

        let table = locator.get_routes().await;
        assert!(table.get(id.as_str()).is_some());

        // Status flips leave the freshly built table alone.
        registry.update_status(&id, StatusInfo::of(Status::Up)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!locator.is_dirty());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("controller should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_reregister_with_sensitive_metadata_updates_route() {
        let bus = EventBus::new(64);
        let registry = Arc::new(InMemoryRegistry::new(bus.clone()));
        let id = InstanceId::new("vault");
        let base = Registration::new("vault").with_management_url("http://10.0.0.9:8081");
        registry.register(Some(id.clone()), base.clone()).unwrap();

        let locator = clean_locator(Arc::clone(&registry)).await;
        assert!(!locator.find("vault").await.unwrap().sensitive);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(RefreshController::new(Arc::clone(&locator)).run(bus.subscribe(), shutdown_rx));

        registry
            .register(Some(id), base.with_metadata("sensitive", "true"))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !locator.is_dirty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("metadata change should mark routes dirty");
        assert!(locator.find("vault").await.unwrap().sensitive);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
