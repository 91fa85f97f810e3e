//! Notifier capability and the reusable status-change filter
//!
//! A notifier decides whether an event is worth reporting, renders a
//! [`Message`] and sends it. Rules every channel shares (enabled flag,
//! ignored transitions, cooldown per instance) live in [`Filtered`], which
//! wraps any notifier.

use crate::config::NotifierConfig;
use crate::events::StatusChangeEvent;
use crate::instance::{Instance, InstanceId, Status};
use crate::template::TemplateError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("render failed: {0}")]
    Render(#[from] TemplateError),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid notifier configuration: {0}")]
    InvalidConfig(String),
}

/// Everything a notifier may look at for one event
#[derive(Debug, Clone)]
pub struct NotificationContext {
    pub event: StatusChangeEvent,
    pub instance: Instance,
}

/// Rendered notification, ready for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub instance_id: InstanceId,
    pub status: Status,
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    /// Only real transitions are reported by default.
    fn should_notify(&self, ctx: &NotificationContext) -> bool {
        ctx.event.is_change()
    }

    fn render(&self, ctx: &NotificationContext) -> Result<Message, NotifyError>;

    async fn send(&self, message: &Message) -> Result<(), NotifyError>;

    /// Apply new settings at runtime
    fn reload(&self, _config: &NotifierConfig) -> Result<(), NotifyError> {
        Ok(())
    }

    /// Drop any per-instance state kept for a deregistered instance
    fn forget(&self, _instance_id: &InstanceId) {}
}

/// `FROM:TO` transition pattern; `*` matches any status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    from: Option<Status>,
    to: Option<Status>,
}

impl TransitionRule {
    pub fn matches(&self, from: Status, to: Status) -> bool {
        self.from.map_or(true, |s| s == from) && self.to.map_or(true, |s| s == to)
    }
}

impl FromStr for TransitionRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (from, to) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid transition rule '{}', expected FROM:TO", s))?;
        let parse = |part: &str| -> Result<Option<Status>, String> {
            match part.trim() {
                "*" => Ok(None),
                other => Status::from_str(other)
                    .map(Some)
                    .ok_or_else(|| format!("unknown status '{}' in rule '{}'", other, s)),
            }
        };
        Ok(Self {
            from: parse(from)?,
            to: parse(to)?,
        })
    }
}

/// Shared filter settings, swappable at runtime
#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub enabled: bool,
    pub cooldown: Duration,
    pub ignore_changes: Vec<TransitionRule>,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown: Duration::ZERO,
            ignore_changes: vec![TransitionRule {
                from: Some(Status::Unknown),
                to: Some(Status::Up),
            }],
        }
    }
}

impl FilterSettings {
    pub fn from_config(config: &NotifierConfig) -> Result<Self, NotifyError> {
        Ok(Self {
            enabled: config.enabled,
            cooldown: config.cooldown(),
            ignore_changes: config
                .transition_rules()
                .map_err(NotifyError::InvalidConfig)?,
        })
    }
}

/// Adds enablement, transition and cooldown rules to a notifier
pub struct Filtered<N> {
    inner: N,
    settings: RwLock<FilterSettings>,
    last_sent: DashMap<InstanceId, Instant>,
}

impl<N: Notifier> Filtered<N> {
    pub fn new(inner: N, settings: FilterSettings) -> Self {
        Self {
            inner,
            settings: RwLock::new(settings),
            last_sent: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &N {
        &self.inner
    }

    pub fn settings(&self) -> FilterSettings {
        self.settings.read().clone()
    }

    pub fn update_settings(&self, settings: FilterSettings) {
        *self.settings.write() = settings;
    }

    fn in_cooldown(&self, instance_id: &InstanceId, cooldown: Duration) -> bool {
        if cooldown.is_zero() {
            return false;
        }
        self.last_sent
            .get(instance_id)
            .map(|sent| sent.elapsed() < cooldown)
            .unwrap_or(false)
    }
}

#[async_trait]
impl<N: Notifier> Notifier for Filtered<N> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn should_notify(&self, ctx: &NotificationContext) -> bool {
        let settings = self.settings.read();
        if !settings.enabled || !ctx.event.is_change() {
            return false;
        }

        let (from, to) = (ctx.event.previous.status, ctx.event.status.status);
        if settings.ignore_changes.iter().any(|rule| rule.matches(from, to)) {
            debug!(notifier = self.name(), instance_id = %ctx.event.instance_id, %from, %to, "Transition ignored");
            return false;
        }

        if self.in_cooldown(&ctx.event.instance_id, settings.cooldown) {
            debug!(notifier = self.name(), instance_id = %ctx.event.instance_id, "Notification suppressed by cooldown");
            return false;
        }

        self.inner.should_notify(ctx)
    }

    fn render(&self, ctx: &NotificationContext) -> Result<Message, NotifyError> {
        self.inner.render(ctx)
    }

    async fn send(&self, message: &Message) -> Result<(), NotifyError> {
        self.inner.send(message).await?;
        self.last_sent.insert(message.instance_id.clone(), Instant::now());
        Ok(())
    }

    fn reload(&self, config: &NotifierConfig) -> Result<(), NotifyError> {
        let settings = FilterSettings::from_config(config)?;
        self.inner.reload(config)?;
        self.update_settings(settings);
        Ok(())
    }

    fn forget(&self, instance_id: &InstanceId) {
        self.last_sent.remove(instance_id);
        self.inner.forget(instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Registration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNotifier {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        fn name(&self) -> &str {
            "counting"
        }

        fn render(&self, ctx: &NotificationContext) -> Result<Message, NotifyError> {
            Ok(Message {
                instance_id: ctx.event.instance_id.clone(),
                status: ctx.event.status.status,
                subject: "s".to_string(),
                body: "b".to_string(),
                recipients: Vec::new(),
            })
        }

        async fn send(&self, _message: &Message) -> Result<(), NotifyError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ctx(id: &str, from: Status, to: Status) -> NotificationContext {
        let instance_id = InstanceId::new(id);
        NotificationContext {
            event: StatusChangeEvent::new(instance_id.clone(), from, to),
            instance: Instance::new(instance_id, Registration::new("app").with_service_url("http://h:1")),
        }
    }

    async fn notify_if_due(notifier: &Filtered<CountingNotifier>, ctx: &NotificationContext) -> bool {
        if !notifier.should_notify(ctx) {
            return false;
        }
        let message = notifier.render(ctx).unwrap();
        notifier.send(&message).await.unwrap();
        true
    }

    #[test]
    fn test_transition_rule_parsing() {
        let rule: TransitionRule = "UNKNOWN:UP".parse().unwrap();
        assert!(rule.matches(Status::Unknown, Status::Up));
        assert!(!rule.matches(Status::Down, Status::Up));

        let wildcard: TransitionRule = "*:offline".parse().unwrap();
        assert!(wildcard.matches(Status::Up, Status::Offline));
        assert!(wildcard.matches(Status::Down, Status::Offline));
        assert!(!wildcard.matches(Status::Offline, Status::Up));

        assert!("UP".parse::<TransitionRule>().is_err());
        assert!("UP:SIDEWAYS".parse::<TransitionRule>().is_err());
    }

    #[tokio::test]
    async fn test_default_settings_filter_unknown_to_up_and_non_changes() {
        let notifier = Filtered::new(CountingNotifier::default(), FilterSettings::default());
        assert!(!notifier.should_notify(&ctx("a", Status::Unknown, Status::Up)));
        assert!(!notifier.should_notify(&ctx("a", Status::Up, Status::Up)));
        assert!(notifier.should_notify(&ctx("a", Status::Up, Status::Down)));
    }

    #[tokio::test]
    async fn test_disabled_notifier_never_notifies() {
        let settings = FilterSettings {
            enabled: false,
            ..FilterSettings::default()
        };
        let notifier = Filtered::new(CountingNotifier::default(), settings);
        assert!(!notifier.should_notify(&ctx("a", Status::Up, Status::Down)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_resend_per_instance() {
        let settings = FilterSettings {
            cooldown: Duration::from_secs(60),
            ..FilterSettings::default()
        };
        let notifier = Filtered::new(CountingNotifier::default(), settings);

        assert!(notify_if_due(&notifier, &ctx("a", Status::Up, Status::Down)).await);
        assert!(!notify_if_due(&notifier, &ctx("a", Status::Down, Status::Up)).await);
        assert!(!notify_if_due(&notifier, &ctx("a", Status::Up, Status::Offline)).await);
        // Other instances have their own cooldown.
        assert!(notify_if_due(&notifier, &ctx("b", Status::Up, Status::Down)).await);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!notify_if_due(&notifier, &ctx("a", Status::Offline, Status::Up)).await);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(notify_if_due(&notifier, &ctx("a", Status::Offline, Status::Up)).await);
        assert_eq!(notifier.inner().sent.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_clears_cooldown() {
        let settings = FilterSettings {
            cooldown: Duration::from_secs(60),
            ..FilterSettings::default()
        };
        let notifier = Filtered::new(CountingNotifier::default(), settings);

        assert!(notify_if_due(&notifier, &ctx("a", Status::Up, Status::Down)).await);
        assert!(!notify_if_due(&notifier, &ctx("a", Status::Down, Status::Up)).await);

        notifier.forget(&InstanceId::new("a"));
        assert!(notifier.last_sent.is_empty());
        assert!(notify_if_due(&notifier, &ctx("a", Status::Down, Status::Up)).await);
    }

    #[tokio::test]
    async fn test_update_settings_applies_immediately() {
        let notifier = Filtered::new(CountingNotifier::default(), FilterSettings::default());
        assert!(!notifier.should_notify(&ctx("a", Status::Unknown, Status::Up)));

        notifier.update_settings(FilterSettings {
            ignore_changes: Vec::new(),
            ..FilterSettings::default()
        });
        assert!(notifier.should_notify(&ctx("a", Status::Unknown, Status::Up)));
    }
}
