use crate::instance::{Registration, Status};
use crate::notifier::TransitionRule;
use crate::template::Template;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Proxy routing and forwarding settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Headers injected into proxied requests
    #[serde(default)]
    pub headers: HeadersConfig,

    /// Named body templates for notifications (name -> template source)
    #[serde(default)]
    pub templates: HashMap<String, String>,

    /// Notification channels
    #[serde(default)]
    pub notifiers: Vec<NotifierConfig>,

    /// Instances registered at startup
    #[serde(default)]
    pub instances: Vec<StaticInstance>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Proxy port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API (routes, instances, notifications)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for admin API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Events buffered per subscriber before it is considered lagging
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            event_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Path prefix under which `/{route_id}/**` is proxied
    #[serde(default = "default_proxy_prefix")]
    pub prefix: String,

    /// Max time to wait for an instance to answer, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per instance (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Concurrent requests allowed per instance (default: 20)
    #[serde(default = "default_max_connections_per_target")]
    pub max_connections_per_target: usize,

    /// Extra headers never forwarded in either direction (hop-by-hop are always dropped)
    #[serde(default)]
    pub ignored_headers: Vec<String>,

    /// Headers stripped for sensitive routes
    #[serde(default = "default_sensitive_headers")]
    pub sensitive_headers: Vec<String>,

    /// Strip sensitive headers on every route, not only flagged ones
    #[serde(default)]
    pub sensitive_all: bool,

    /// Management endpoints that may be proxied (empty: all)
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            prefix: default_proxy_prefix(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            max_connections_per_target: default_max_connections_per_target(),
            ignored_headers: Vec::new(),
            sensitive_headers: default_sensitive_headers(),
            sensitive_all: false,
            endpoints: Vec::new(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    /// Prefix without trailing slash, always starting with one
    pub fn normalized_prefix(&self) -> String {
        let trimmed = self.prefix.trim().trim_end_matches('/');
        if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        }
    }
}

/// Headers added to forwarded requests
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct HeadersConfig {
    /// Sent to every instance
    #[serde(default)]
    pub global: HashMap<String, String>,

    /// Sent to instances registered under the given application name
    #[serde(default)]
    pub apps: HashMap<String, HashMap<String, String>>,
}

/// Notification channel types
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Mail,
    Webhook,
    Slack,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mail => "mail",
            Self::Webhook => "webhook",
            Self::Slack => "slack",
        }
    }
}

/// Configuration for a notification channel
#[derive(Debug, Deserialize, Clone)]
pub struct NotifierConfig {
    /// Unique name, used in logs and for reloads
    pub name: String,

    #[serde(rename = "type")]
    pub channel_type: ChannelType,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum seconds between two notifications for the same instance (0: none)
    #[serde(default)]
    pub cooldown_secs: u64,

    /// Max seconds a single delivery may take
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Transitions that never notify, as `FROM:TO` (`*` matches any status)
    #[serde(default = "default_ignore_changes")]
    pub ignore_changes: Vec<String>,

    /// Subject template
    #[serde(default = "default_subject")]
    pub subject: String,

    /// Name of the body template
    #[serde(default = "default_body_template")]
    pub body_template: String,

    #[serde(default)]
    pub mail: Option<MailSettings>,

    #[serde(default)]
    pub webhook: Option<WebhookSettings>,
}

impl NotifierConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn transition_rules(&self) -> Result<Vec<TransitionRule>, String> {
        self.ignore_changes
            .iter()
            .map(|rule| rule.parse::<TransitionRule>())
            .collect()
    }

    /// Validate the notifier configuration
    pub fn validate(&self, templates: &HashMap<String, String>) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Notifier: 'name' must not be empty".to_string());
        }

        match self.channel_type {
            ChannelType::Mail => match &self.mail {
                Some(mail) if mail.smtp_host.is_empty() => {
                    return Err(format!("Notifier '{}': 'mail.smtp_host' must not be empty", self.name));
                }
                Some(mail) if mail.to.is_empty() => {
                    return Err(format!("Notifier '{}': 'mail.to' must not be empty", self.name));
                }
                Some(_) => {}
                None => {
                    return Err(format!("Notifier '{}': mail notifier requires a [mail] section", self.name));
                }
            },
            ChannelType::Webhook | ChannelType::Slack => match &self.webhook {
                Some(webhook) if !is_http_url(&webhook.url) => {
                    return Err(format!("Notifier '{}': 'webhook.url' must be an http(s) URL", self.name));
                }
                Some(_) => {}
                None => {
                    return Err(format!(
                        "Notifier '{}': {} notifier requires a [webhook] section",
                        self.name,
                        self.channel_type.as_str()
                    ));
                }
            },
        }

        if self.send_timeout_secs == 0 {
            return Err(format!("Notifier '{}': 'send_timeout_secs' must be greater than 0", self.name));
        }

        if let Err(e) = self.subject.parse::<Template>() {
            return Err(format!("Notifier '{}': invalid subject template: {}", self.name, e));
        }

        if self.body_template != default_body_template() && !templates.contains_key(&self.body_template) {
            return Err(format!(
                "Notifier '{}': unknown body template '{}'",
                self.name, self.body_template
            ));
        }

        self.transition_rules()
            .map(|_| ())
            .map_err(|e| format!("Notifier '{}': {}", self.name, e))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MailSettings {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub smtp_tls: bool,
    /// Sender address (default: the SMTP username, else `fleetgate@localhost`)
    pub from: Option<String>,
    #[serde(default = "default_mail_to")]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WebhookSettings {
    pub url: String,
    #[serde(default = "default_webhook_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Signs the payload into `X-Signature-256`
    pub secret: Option<String>,
    /// Slack only
    pub channel: Option<String>,
    pub username: Option<String>,
    pub icon_emoji: Option<String>,
}

/// Instance registered from the configuration file
#[derive(Debug, Deserialize, Clone)]
pub struct StaticInstance {
    pub id: Option<String>,
    #[serde(flatten)]
    pub registration: Registration,
    pub status: Option<Status>,
}

fn is_http_url(url: &str) -> bool {
    reqwest::Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
        .unwrap_or(false)
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_event_capacity() -> usize {
    crate::events::DEFAULT_EVENT_CAPACITY
}

fn default_proxy_prefix() -> String {
    "/proxy".to_string()
}

fn default_request_timeout() -> u64 {
    10 // 10 seconds max for an instance to respond
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per instance
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_max_connections_per_target() -> usize {
    20
}

fn default_sensitive_headers() -> Vec<String> {
    vec![
        "cookie".to_string(),
        "set-cookie".to_string(),
        "authorization".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

fn default_send_timeout() -> u64 {
    10
}

fn default_ignore_changes() -> Vec<String> {
    vec!["UNKNOWN:UP".to_string()]
}

pub fn default_subject() -> String {
    crate::template::DEFAULT_SUBJECT.to_string()
}

pub fn default_body_template() -> String {
    crate::template::DEFAULT_BODY_TEMPLATE_NAME.to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_mail_to() -> Vec<String> {
    vec!["root@localhost".to_string()]
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.proxy.normalized_prefix() == "/" {
            errors.push("Proxy: 'prefix' must not be empty or '/'".to_string());
        }
        if self.proxy.request_timeout_secs == 0 {
            errors.push("Proxy: 'request_timeout_secs' must be greater than 0".to_string());
        }
        if self.proxy.max_connections_per_target == 0 {
            errors.push("Proxy: 'max_connections_per_target' must be greater than 0".to_string());
        }

        for (name, source) in &self.templates {
            if let Err(e) = source.parse::<Template>() {
                errors.push(format!("Template '{}': {}", name, e));
            }
        }

        let mut names = HashSet::new();
        for notifier in &self.notifiers {
            if !names.insert(notifier.name.as_str()) {
                errors.push(format!("Notifier '{}': duplicate name", notifier.name));
            }
            if let Err(e) = notifier.validate(&self.templates) {
                errors.push(e);
            }
        }

        for instance in &self.instances {
            if let Err(e) = instance.registration.validate() {
                errors.push(format!("Instance: {}", e));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
