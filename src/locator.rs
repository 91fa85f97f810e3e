//! Route locator: lazily rebuilt route table
//!
//! Readers load the current table through an `ArcSwap` and never wait on a
//! rebuild that is already committed. When the dirty flag is set, the next
//! reader rebuilds; concurrent readers queue on a single async mutex and pick
//! up the table the winner built instead of rebuilding again.

use crate::registry::{InstanceRegistry, RegistryError};
use crate::route::{Route, RouteTable};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Counters describing locator activity
#[derive(Debug, Default)]
pub struct LocatorStats {
    rebuilds: AtomicU64,
    failed_rebuilds: AtomicU64,
}

impl LocatorStats {
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    pub fn failed_rebuilds(&self) -> u64 {
        self.failed_rebuilds.load(Ordering::Relaxed)
    }
}

pub struct RouteLocator {
    registry: Arc<dyn InstanceRegistry>,
    table: ArcSwap<RouteTable>,
    dirty: AtomicBool,
    generation: AtomicU64,
    rebuild_lock: Mutex<()>,
    stats: LocatorStats,
}

impl RouteLocator {
    /// Starts dirty, so the first lookup builds the table.
    pub fn new(registry: Arc<dyn InstanceRegistry>) -> Self {
        Self {
            registry,
            table: ArcSwap::from_pointee(RouteTable::empty()),
            dirty: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            rebuild_lock: Mutex::new(()),
            stats: LocatorStats::default(),
        }
    }

    /// Current routes, rebuilding first if the table is stale.
    ///
    /// A failed rebuild leaves the previous table in place and keeps the
    /// dirty flag set, so the next call retries.
    pub async fn get_routes(&self) -> Arc<RouteTable> {
        if !self.is_dirty() {
            return self.table.load_full();
        }

        let _guard = self.rebuild_lock.lock().await;
        // Another caller may have rebuilt while we waited.
        if !self.is_dirty() {
            return self.table.load_full();
        }

        match self.rebuild().await {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "Route rebuild failed, serving previous routes");
                self.table.load_full()
            }
        }
    }

    /// Look up a single route, rebuilding first if needed
    pub async fn find(&self, route_id: &str) -> Option<Arc<Route>> {
        self.get_routes().await.get(route_id).cloned()
    }

    /// Current table without triggering a rebuild
    pub fn current(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    /// Force a rebuild now, regardless of the dirty flag
    pub async fn refresh(&self) -> Result<Arc<RouteTable>, RegistryError> {
        let _guard = self.rebuild_lock.lock().await;
        self.rebuild().await
    }

    pub fn mark_dirty(&self) {
        if !self.dirty.swap(true, Ordering::AcqRel) {
            debug!("Routes marked dirty");
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &LocatorStats {
        &self.stats
    }

    /// Caller must hold `rebuild_lock`.
    async fn rebuild(&self) -> Result<Arc<RouteTable>, RegistryError> {
        // Cleared before reading, so events arriving mid-rebuild dirty the result again.
        self.dirty.store(false, Ordering::Release);

        let instances = match self.registry.list_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                self.stats.failed_rebuilds.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let table = Arc::new(RouteTable::build(&instances, generation));
        self.table.store(Arc::clone(&table));
        self.stats.rebuilds.fetch_add(1, Ordering::Relaxed);

        info!(
            generation,
            routes = table.len(),
            instances = instances.len(),
            "Route table rebuilt"
        );
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::instance::{Instance, InstanceId, Registration};
    use crate::registry::InMemoryRegistry;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn registration(port: u16) -> Registration {
        Registration::new(format!("app-{}", port)).with_management_url(format!("http://10.0.0.5:{}", port))
    }

    /// Registry whose snapshot and availability are set by the test
    struct ScriptedRegistry {
        instances: SyncMutex<Vec<Instance>>,
        fail: AtomicBool,
        delay: Duration,
        calls: AtomicU64,
    }

    impl ScriptedRegistry {
        fn new(instances: Vec<Instance>, delay: Duration) -> Self {
            Self {
                instances: SyncMutex::new(instances),
                fail: AtomicBool::new(false),
                delay,
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl InstanceRegistry for ScriptedRegistry {
        async fn list_instances(&self) -> Result<Vec<Instance>, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let snapshot = self.instances.lock().clone();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(RegistryError::Unavailable("scripted failure".into()));
            }
            Ok(snapshot)
        }

        async fn get_instance(&self, id: &InstanceId) -> Result<Option<Instance>, RegistryError> {
            Ok(self.instances.lock().iter().find(|i| &i.id == id).cloned())
        }
    }

    fn instances(prefix: &str, count: u16) -> Vec<Instance> {
        (0..count)
            .map(|n| Instance::new(InstanceId::new(format!("{}{}", prefix, n)), registration(8000 + n)))
            .collect()
    }

    #[tokio::test]
    async fn test_lazy_rebuild_tracks_registrations() {
        let registry = Arc::new(InMemoryRegistry::new(EventBus::default()));
        let locator = RouteLocator::new(registry.clone());
        assert!(locator.is_dirty());
        assert!(locator.current().is_empty());

        let a = registry.register(Some(InstanceId::new("a")), registration(8081)).unwrap();
        let b = registry.register(Some(InstanceId::new("b")), registration(8082)).unwrap();
        registry
            .register(Some(InstanceId::new("c")), Registration::new("c").with_health_url("http://h:1/health"))
            .unwrap();

        let table = locator.get_routes().await;
        assert_eq!(table.len(), 2);
        assert!(table.get("a").is_some() && table.get("b").is_some());
        assert!(!locator.is_dirty());

        registry.deregister(&a);
        // Not dirty, so the stale table is still served.
        assert_eq!(locator.get_routes().await.len(), 2);

        locator.mark_dirty();
        let table = locator.get_routes().await;
        assert_eq!(table.len(), 1);
        assert!(table.get("a").is_none());
        assert_eq!(locator.find(b.as_str()).await.unwrap().instance_id, b);
        assert_eq!(locator.stats().rebuilds(), 2);
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_previous_table_and_stays_dirty() {
        let registry = Arc::new(ScriptedRegistry::new(instances("a", 3), Duration::ZERO));
        let locator = RouteLocator::new(registry.clone());
        assert_eq!(locator.get_routes().await.len(), 3);

        *registry.instances.lock() = instances("a", 5);
        registry.fail.store(true, Ordering::SeqCst);
        locator.mark_dirty();

        let table = locator.get_routes().await;
        assert_eq!(table.len(), 3);
        assert!(locator.is_dirty());
        assert_eq!(locator.stats().failed_rebuilds(), 1);

        registry.fail.store(false, Ordering::SeqCst);
        assert_eq!(locator.get_routes().await.len(), 5);
        assert!(!locator.is_dirty());
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let registry = Arc::new(ScriptedRegistry::new(instances("a", 4), Duration::ZERO));
        let locator = RouteLocator::new(registry);
        let first = locator.refresh().await.unwrap();
        let second = locator.refresh().await.unwrap();
        assert_eq!(*first, *second);
        assert_ne!(first.generation(), second.generation());
    }

    #[tokio::test]
    async fn test_concurrent_readers_share_single_rebuild() {
        let registry = Arc::new(ScriptedRegistry::new(instances("a", 3), Duration::from_millis(50)));
        let locator = Arc::new(RouteLocator::new(registry.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let locator = Arc::clone(&locator);
                tokio::spawn(async move { locator.get_routes().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().len(), 3);
        }
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_observe_partial_table() {
        let old: BTreeSet<String> = (0..3).map(|n| format!("old{}", n)).collect();
        let new: BTreeSet<String> = (0..7).map(|n| format!("new{}", n)).collect();

        let registry = Arc::new(ScriptedRegistry::new(instances("old", 3), Duration::from_millis(5)));
        let locator = Arc::new(RouteLocator::new(registry.clone()));
        locator.get_routes().await;

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let locator = Arc::clone(&locator);
                let (old, new) = (old.clone(), new.clone());
                tokio::spawn(async move {
                    for _ in 0..200 {
                        let ids: BTreeSet<String> =
                            locator.current().iter().map(|r| r.id.clone()).collect();
                        assert!(ids == old || ids == new, "partial table observed: {:?}", ids);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for round in 0..10 {
            *registry.instances.lock() = if round % 2 == 0 {
                instances("new", 7)
            } else {
                instances("old", 3)
            };
            locator.mark_dirty();
            locator.get_routes().await;
        }

        for reader in readers {
            reader.await.unwrap();
        }
    }
}
