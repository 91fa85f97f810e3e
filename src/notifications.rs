//! Status change notification dispatch
//!
//! Every status change is fanned out to all configured notifiers. Each
//! notifier owns a worker task and an unbounded queue, so a slow or broken
//! channel only delays itself, and the events of one instance reach a
//! notifier in the order they happened. Delivery is tracked per
//! (notifier, instance) pair:
//!
//! - `Idle`: nothing in flight
//! - `Pending`: event received, filters being evaluated
//! - `Sending`: message rendered, send in progress
//! - `Failed`: render or send failed; logged, then back to `Idle`
//!
//! Failed deliveries are not retried. Only pairs with a delivery in flight
//! are stored; `Idle` is the absence of an entry. Cooldown state of a
//! deregistered instance is dropped through the same worker queues, after
//! any delivery still queued for it.

use crate::config::NotifierConfig;
use crate::events::{InstanceEvent, InstanceEventKind, StatusChangeEvent};
use crate::instance::InstanceId;
use crate::notifier::{NotificationContext, Notifier, NotifyError};
use crate::registry::InstanceRegistry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Idle,
    Pending,
    Sending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Skipped,
    Failed(String),
}

/// Result of handing one event to one notifier
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub notifier: String,
    pub instance_id: InstanceId,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Default)]
pub struct NotificationStats {
    sent: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl NotificationStats {
    fn record(&self, outcome: &DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Sent => &self.sent,
            DeliveryOutcome::Skipped => &self.skipped,
            DeliveryOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Work item for a notifier's worker
enum Work {
    Deliver(NotificationContext),
    Forget(InstanceId),
}

/// A notifier together with its send timeout
pub struct NotifierEntry {
    notifier: Arc<dyn Notifier>,
    send_timeout: RwLock<Duration>,
}

impl NotifierEntry {
    pub fn new(notifier: Arc<dyn Notifier>, send_timeout: Duration) -> Self {
        Self {
            notifier,
            send_timeout: RwLock::new(send_timeout),
        }
    }

    pub fn name(&self) -> &str {
        self.notifier.name()
    }
}

pub struct NotificationDispatcher {
    entries: Vec<Arc<NotifierEntry>>,
    registry: Arc<dyn InstanceRegistry>,
    states: DashMap<(String, InstanceId), DeliveryState>,
    stats: NotificationStats,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<dyn InstanceRegistry>, entries: Vec<NotifierEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(Arc::new).collect(),
            registry,
            states: DashMap::new(),
            stats: NotificationStats::default(),
        }
    }

    pub fn notifiers(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Current state of a (notifier, instance) pair
    pub fn state(&self, notifier: &str, instance_id: &InstanceId) -> DeliveryState {
        self.states
            .get(&(notifier.to_string(), instance_id.clone()))
            .map(|s| *s)
            .unwrap_or(DeliveryState::Idle)
    }

    fn set_state(&self, notifier: &str, instance_id: &InstanceId, state: DeliveryState) {
        let key = (notifier.to_string(), instance_id.clone());
        if state == DeliveryState::Idle {
            self.states.remove(&key);
        } else {
            self.states.insert(key, state);
        }
    }

    /// Pairs with a delivery in flight
    pub fn tracked_pairs(&self) -> usize {
        self.states.len()
    }

    fn forget_for(&self, entry: &NotifierEntry, instance_id: &InstanceId) {
        entry.notifier.forget(instance_id);
        self.states.remove(&(entry.name().to_string(), instance_id.clone()));
        debug!(notifier = entry.name(), %instance_id, "Dropped notification state");
    }

    /// Look up the instance an event belongs to
    async fn context_for(&self, event: &StatusChangeEvent) -> Option<NotificationContext> {
        match self.registry.get_instance(&event.instance_id).await {
            Ok(Some(instance)) => Some(NotificationContext {
                event: event.clone(),
                instance,
            }),
            Ok(None) => {
                debug!(instance_id = %event.instance_id, "Instance gone before notification");
                None
            }
            Err(e) => {
                warn!(instance_id = %event.instance_id, error = %e, "Failed to load instance for notification");
                None
            }
        }
    }

    /// Deliver one event to every notifier concurrently
    pub async fn dispatch(&self, event: &StatusChangeEvent) -> Vec<DeliveryReport> {
        let Some(ctx) = self.context_for(event).await else {
            return self
                .entries
                .iter()
                .map(|entry| {
                    let outcome = DeliveryOutcome::Skipped;
                    self.stats.record(&outcome);
                    DeliveryReport {
                        notifier: entry.name().to_string(),
                        instance_id: event.instance_id.clone(),
                        outcome,
                    }
                })
                .collect();
        };

        join_all(self.entries.iter().map(|entry| self.deliver(entry, &ctx))).await
    }

    async fn deliver(&self, entry: &NotifierEntry, ctx: &NotificationContext) -> DeliveryReport {
        let name = entry.name();
        let instance_id = &ctx.event.instance_id;

        self.set_state(name, instance_id, DeliveryState::Pending);
        let outcome = match self.try_deliver(entry, ctx).await {
            Ok(true) => {
                info!(notifier = name, %instance_id, status = %ctx.event.status.status, "Notification sent");
                DeliveryOutcome::Sent
            }
            Ok(false) => DeliveryOutcome::Skipped,
            Err(e) => {
                self.set_state(name, instance_id, DeliveryState::Failed);
                error!(notifier = name, %instance_id, error = %e, "Notification failed");
                DeliveryOutcome::Failed(e.to_string())
            }
        };
        self.set_state(name, instance_id, DeliveryState::Idle);
        self.stats.record(&outcome);

        DeliveryReport {
            notifier: name.to_string(),
            instance_id: instance_id.clone(),
            outcome,
        }
    }

    async fn try_deliver(&self, entry: &NotifierEntry, ctx: &NotificationContext) -> Result<bool, NotifyError> {
        if !entry.notifier.should_notify(ctx) {
            return Ok(false);
        }
        let message = entry.notifier.render(ctx)?;

        self.set_state(entry.name(), &ctx.event.instance_id, DeliveryState::Sending);
        let timeout = *entry.send_timeout.read();
        tokio::time::timeout(timeout, entry.notifier.send(&message))
            .await
            .map_err(|_| NotifyError::Timeout(timeout))??;
        Ok(true)
    }

    /// Apply new settings to the running notifiers, matched by name
    pub fn reload(&self, configs: &[NotifierConfig]) {
        for entry in &self.entries {
            let Some(config) = configs.iter().find(|c| c.name == entry.name()) else {
                warn!(notifier = entry.name(), "Notifier removed from configuration; restart to drop it");
                continue;
            };
            match entry.notifier.reload(config) {
                Ok(()) => {
                    *entry.send_timeout.write() = config.send_timeout();
                    info!(notifier = entry.name(), "Notifier settings reloaded");
                }
                Err(e) => error!(notifier = entry.name(), error = %e, "Failed to reload notifier, keeping previous settings"),
            }
        }

        for config in configs {
            if !self.entries.iter().any(|e| e.name() == config.name) {
                warn!(notifier = %config.name, "New notifier requires a restart");
            }
        }
    }

    /// Consume instance events until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<InstanceEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut queues = Vec::with_capacity(self.entries.len());
        let mut workers = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let (tx, mut rx) = mpsc::unbounded_channel::<Work>();
            let dispatcher = Arc::clone(&self);
            let entry = Arc::clone(entry);
            workers.push(tokio::spawn(async move {
                while let Some(work) = rx.recv().await {
                    match work {
                        Work::Deliver(ctx) => {
                            dispatcher.deliver(&entry, &ctx).await;
                        }
                        Work::Forget(instance_id) => dispatcher.forget_for(&entry, &instance_id),
                    }
                }
            }));
            queues.push(tx);
        }

        info!(notifiers = self.entries.len(), "Notification dispatcher started");
        loop {
            tokio::select! {
                result = events.recv() => {
                    match result {
                        Ok(event) => {
                            if matches!(event.kind, InstanceEventKind::Deregistered) {
                                for queue in &queues {
                                    let _ = queue.send(Work::Forget(event.instance_id.clone()));
                                }
                                continue;
                            }
                            let Some(change) = event.status_change() else { continue };
                            let Some(ctx) = self.context_for(&change).await else { continue };
                            for queue in &queues {
                                let _ = queue.send(Work::Deliver(ctx.clone()));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Notification dispatcher lagged, status changes lost");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Queued deliveries finish, bounded by their send timeouts.
        drop(queues);
        join_all(workers).await;
        info!("Notification dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::instance::{Registration, Status, StatusInfo};
    use crate::notifier::{FilterSettings, Filtered, Message};
    use crate::registry::InMemoryRegistry;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    enum Behavior {
        Succeed,
        FailSend,
        FailRender,
        Hang,
    }

    struct TestNotifier {
        name: String,
        behavior: Behavior,
        sent: Mutex<Vec<Status>>,
    }

    impl TestNotifier {
        fn new(name: &str, behavior: Behavior) -> Self {
            Self {
                name: name.to_string(),
                behavior,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Notifier for TestNotifier {
        fn name(&self) -> &str {
            &self.name
        }

        fn render(&self, ctx: &NotificationContext) -> Result<Message, NotifyError> {
            if matches!(self.behavior, Behavior::FailRender) {
                return Err(crate::template::TemplateError::MissingValue("x".to_string()).into());
            }
            Ok(Message {
                instance_id: ctx.event.instance_id.clone(),
                status: ctx.event.status.status,
                subject: String::new(),
                body: String::new(),
                recipients: Vec::new(),
            })
        }

        async fn send(&self, message: &Message) -> Result<(), NotifyError> {
            match self.behavior {
                Behavior::FailSend => Err(NotifyError::Delivery("smtp down".to_string())),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                _ => {
                    self.sent.lock().push(message.status);
                    Ok(())
                }
            }
        }
    }

    fn setup() -> (Arc<InMemoryRegistry>, InstanceId) {
        let registry = Arc::new(InMemoryRegistry::new(EventBus::new(64)));
        let id = registry
            .register(None, Registration::new("billing").with_service_url("http://10.0.0.5:8080"))
            .unwrap();
        (registry, id)
    }

    fn entry(notifier: Arc<dyn Notifier>) -> NotifierEntry {
        NotifierEntry::new(notifier, Duration::from_secs(1))
    }

    fn outcome_of<'a>(reports: &'a [DeliveryReport], name: &str) -> &'a DeliveryOutcome {
        &reports.iter().find(|r| r.notifier == name).unwrap().outcome
    }

    #[tokio::test]
    async fn test_failing_notifier_does_not_affect_others() {
        let (registry, id) = setup();
        let ok = Arc::new(TestNotifier::new("ok", Behavior::Succeed));
        let dispatcher = NotificationDispatcher::new(
            registry,
            vec![
                entry(Arc::new(TestNotifier::new("broken", Behavior::FailSend))),
                entry(ok.clone()),
            ],
        );

        let reports = dispatcher
            .dispatch(&StatusChangeEvent::new(id.clone(), Status::Up, Status::Down))
            .await;

        assert_eq!(reports.len(), 2);
        assert!(matches!(outcome_of(&reports, "broken"), DeliveryOutcome::Failed(e) if e.contains("smtp down")));
        assert_eq!(outcome_of(&reports, "ok"), &DeliveryOutcome::Sent);
        assert_eq!(*ok.sent.lock(), vec![Status::Down]);
        assert_eq!(dispatcher.state("broken", &id), DeliveryState::Idle);
        assert_eq!(dispatcher.tracked_pairs(), 0);
        assert_eq!(dispatcher.stats(), StatsSnapshot { sent: 1, failed: 1, skipped: 0 });
    }

    #[tokio::test]
    async fn test_render_failure_is_handled() {
        let (registry, id) = setup();
        let dispatcher = NotificationDispatcher::new(
            registry,
            vec![
                entry(Arc::new(TestNotifier::new("bad-template", Behavior::FailRender))),
                entry(Arc::new(TestNotifier::new("ok", Behavior::Succeed))),
            ],
        );

        let reports = dispatcher
            .dispatch(&StatusChangeEvent::new(id, Status::Up, Status::Offline))
            .await;
        assert!(matches!(outcome_of(&reports, "bad-template"), DeliveryOutcome::Failed(e) if e.contains("render")));
        assert_eq!(outcome_of(&reports, "ok"), &DeliveryOutcome::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_notifier_times_out_without_blocking_others() {
        let (registry, id) = setup();
        let ok = Arc::new(TestNotifier::new("ok", Behavior::Succeed));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            registry,
            vec![entry(Arc::new(TestNotifier::new("slow", Behavior::Hang))), entry(ok.clone())],
        ));

        let event = StatusChangeEvent::new(id.clone(), Status::Up, Status::Down);
        let task = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.dispatch(&event).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.state("slow", &id), DeliveryState::Sending);
        assert_eq!(*ok.sent.lock(), vec![Status::Down]);

        let reports = task.await.unwrap();
        assert!(matches!(outcome_of(&reports, "slow"), DeliveryOutcome::Failed(e) if e.contains("timed out")));
        assert_eq!(dispatcher.state("slow", &id), DeliveryState::Idle);
    }

    #[tokio::test]
    async fn test_unchanged_status_and_unknown_instance_are_skipped() {
        let (registry, id) = setup();
        let dispatcher =
            NotificationDispatcher::new(registry, vec![entry(Arc::new(TestNotifier::new("ok", Behavior::Succeed)))]);

        let reports = dispatcher.dispatch(&StatusChangeEvent::new(id, Status::Up, Status::Up)).await;
        assert_eq!(reports[0].outcome, DeliveryOutcome::Skipped);

        let reports = dispatcher
            .dispatch(&StatusChangeEvent::new(InstanceId::new("ghost"), Status::Up, Status::Down))
            .await;
        assert_eq!(reports[0].outcome, DeliveryOutcome::Skipped);
        assert_eq!(dispatcher.stats().skipped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_resend() {
        let (registry, id) = setup();
        let settings = FilterSettings {
            cooldown: Duration::from_secs(30),
            ..FilterSettings::default()
        };
        let notifier = Arc::new(Filtered::new(TestNotifier::new("mail", Behavior::Succeed), settings));
        let dispatcher = NotificationDispatcher::new(registry, vec![entry(notifier.clone())]);

        let down = StatusChangeEvent::new(id.clone(), Status::Up, Status::Down);
        let up = StatusChangeEvent::new(id.clone(), Status::Down, Status::Up);

        assert_eq!(dispatcher.dispatch(&down).await[0].outcome, DeliveryOutcome::Sent);
        assert_eq!(dispatcher.dispatch(&up).await[0].outcome, DeliveryOutcome::Skipped);
        assert_eq!(dispatcher.dispatch(&down).await[0].outcome, DeliveryOutcome::Skipped);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(dispatcher.dispatch(&up).await[0].outcome, DeliveryOutcome::Sent);
        assert_eq!(*notifier.inner().sent.lock(), vec![Status::Down, Status::Up]);
    }

    #[tokio::test]
    async fn test_deregistered_instance_state_is_dropped() {
        let (registry, id) = setup();
        let settings = FilterSettings {
            cooldown: Duration::from_secs(3600),
            ..FilterSettings::default()
        };
        let notifier = Arc::new(Filtered::new(TestNotifier::new("mail", Behavior::Succeed), settings));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::clone(&registry) as Arc<dyn InstanceRegistry>,
            vec![entry(notifier.clone())],
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(registry.bus().subscribe(), shutdown_rx));

        registry.update_status(&id, StatusInfo::of(Status::Down)).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while notifier.inner().sent.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first change should be sent");

        // Same id comes back: the old cooldown must not suppress its first change.
        assert!(registry.deregister(&id));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let id = registry
            .register(Some(id), Registration::new("billing").with_service_url("http://10.0.0.5:8080"))
            .unwrap();
        registry.update_status(&id, StatusInfo::of(Status::Offline)).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while notifier.inner().sent.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("re-registered instance should be notified");
        assert_eq!(*notifier.inner().sent.lock(), vec![Status::Down, Status::Offline]);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_delivers_in_order_despite_hung_channel() {
        let (registry, id) = setup();
        let recorder = Arc::new(TestNotifier::new("recorder", Behavior::Succeed));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::clone(&registry) as Arc<dyn InstanceRegistry>,
            vec![
                NotifierEntry::new(Arc::new(TestNotifier::new("hung", Behavior::Hang)), Duration::from_millis(100)),
                entry(recorder.clone()),
            ],
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(registry.bus().subscribe(), shutdown_rx));

        for status in [Status::Up, Status::Down, Status::Up, Status::Offline] {
            registry.update_status(&id, StatusInfo::of(status)).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.sent.lock().len() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("recorder should receive every change");
        assert_eq!(
            *recorder.sent.lock(),
            vec![Status::Up, Status::Down, Status::Up, Status::Offline]
        );

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("dispatcher should stop")
            .unwrap();
        assert_eq!(dispatcher.stats().failed, 4);
    }
}
