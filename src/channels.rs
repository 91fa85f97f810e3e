//! Mail and webhook notifiers

use crate::config::{ChannelType, MailSettings, NotifierConfig, WebhookSettings};
use crate::instance::Status;
use crate::notifier::{FilterSettings, Filtered, Message, NotificationContext, Notifier, NotifyError};
use crate::template::{Template, TemplateRenderer, TemplateVars};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use std::sync::Arc;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const USER_AGENT: &str = "fleetgate-notifications/1.0";
const DEFAULT_FROM: &str = "fleetgate@localhost";

/// Subject and body templates a notifier renders with
#[derive(Debug, Clone)]
struct MessageTemplates {
    subject: Template,
    body_template: String,
}

impl MessageTemplates {
    fn from_config(config: &NotifierConfig, renderer: &dyn TemplateRenderer) -> Result<Self, NotifyError> {
        if !renderer.has_template(&config.body_template) {
            return Err(NotifyError::InvalidConfig(format!(
                "notifier '{}' uses unknown body template '{}'",
                config.name, config.body_template
            )));
        }
        Ok(Self {
            subject: Template::parse(&config.subject)?,
            body_template: config.body_template.clone(),
        })
    }

    fn render(
        &self,
        renderer: &dyn TemplateRenderer,
        ctx: &NotificationContext,
        recipients: Vec<String>,
    ) -> Result<Message, NotifyError> {
        let vars = TemplateVars::new(&ctx.event, &ctx.instance);
        Ok(Message {
            instance_id: ctx.event.instance_id.clone(),
            status: ctx.event.status.status,
            subject: self.subject.render(&vars)?,
            body: renderer.render(&self.body_template, &vars)?,
            recipients,
        })
    }
}

/// Delivery backend of a channel
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<(), NotifyError>;

    /// Pick up changed backend settings
    fn reconfigure(&self, _config: &NotifierConfig) -> Result<(), NotifyError> {
        Ok(())
    }
}

fn mail_settings(config: &NotifierConfig) -> Result<MailSettings, NotifyError> {
    config
        .mail
        .clone()
        .ok_or_else(|| NotifyError::InvalidConfig(format!("notifier '{}' has no mail settings", config.name)))
}

/// Sends mail with lettre, opening a transport per message
pub struct SmtpSender {
    settings: RwLock<MailSettings>,
}

impl SmtpSender {
    pub fn new(settings: MailSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }
}

#[async_trait]
impl ChannelSender for SmtpSender {
    async fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<(), NotifyError> {
        use lettre::{
            message::{header::ContentType, Mailbox},
            transport::smtp::authentication::Credentials,
            AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
        };

        let settings = self.settings.read().clone();
        let parse = |addr: &str| -> Result<Mailbox, NotifyError> {
            addr.parse()
                .map_err(|e| NotifyError::InvalidConfig(format!("invalid address {}: {}", addr, e)))
        };

        let from = settings
            .from
            .as_deref()
            .or(settings.smtp_username.as_deref())
            .unwrap_or(DEFAULT_FROM);
        let mut builder = lettre::Message::builder()
            .from(parse(from)?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for to in recipients {
            builder = builder.to(parse(to)?);
        }
        for cc in &settings.cc {
            builder = builder.cc(parse(cc)?);
        }
        let email = builder
            .body(body.to_string())
            .map_err(|e| NotifyError::Delivery(format!("failed to build email: {}", e)))?;

        let mut transport_builder = if settings.smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)
                .map_err(|e| NotifyError::Delivery(format!("failed to create SMTP transport: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.smtp_host)
        };
        transport_builder = transport_builder.port(settings.smtp_port);

        if let (Some(username), Some(password)) = (&settings.smtp_username, &settings.smtp_password) {
            transport_builder = transport_builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        transport_builder
            .build()
            .send(email)
            .await
            .map_err(|e| NotifyError::Delivery(format!("SMTP send failed: {}", e)))?;

        debug!(host = %settings.smtp_host, recipients = recipients.len(), "Email sent");
        Ok(())
    }

    fn reconfigure(&self, config: &NotifierConfig) -> Result<(), NotifyError> {
        *self.settings.write() = mail_settings(config)?;
        Ok(())
    }
}

struct MailState {
    templates: MessageTemplates,
    to: Vec<String>,
}

pub struct MailNotifier {
    name: String,
    state: RwLock<MailState>,
    renderer: Arc<dyn TemplateRenderer>,
    sender: Arc<dyn ChannelSender>,
}

impl MailNotifier {
    pub fn new(
        config: &NotifierConfig,
        renderer: Arc<dyn TemplateRenderer>,
        sender: Arc<dyn ChannelSender>,
    ) -> Result<Self, NotifyError> {
        Ok(Self {
            name: config.name.clone(),
            state: RwLock::new(Self::state_from(config, renderer.as_ref())?),
            renderer,
            sender,
        })
    }

    /// Mail notifier delivering over SMTP
    pub fn smtp(config: &NotifierConfig, renderer: Arc<dyn TemplateRenderer>) -> Result<Self, NotifyError> {
        let sender = Arc::new(SmtpSender::new(mail_settings(config)?));
        Self::new(config, renderer, sender)
    }

    fn state_from(config: &NotifierConfig, renderer: &dyn TemplateRenderer) -> Result<MailState, NotifyError> {
        Ok(MailState {
            templates: MessageTemplates::from_config(config, renderer)?,
            to: mail_settings(config)?.to,
        })
    }
}

#[async_trait]
impl Notifier for MailNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn render(&self, ctx: &NotificationContext) -> Result<Message, NotifyError> {
        let state = self.state.read();
        state.templates.render(self.renderer.as_ref(), ctx, state.to.clone())
    }

    async fn send(&self, message: &Message) -> Result<(), NotifyError> {
        self.sender
            .send(&message.subject, &message.body, &message.recipients)
            .await
    }

    fn reload(&self, config: &NotifierConfig) -> Result<(), NotifyError> {
        let state = Self::state_from(config, self.renderer.as_ref())?;
        self.sender.reconfigure(config)?;
        *self.state.write() = state;
        Ok(())
    }
}

/// Payload shape posted to the webhook URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookFlavor {
    Generic,
    Slack,
}

struct WebhookState {
    templates: MessageTemplates,
    settings: WebhookSettings,
}

pub struct WebhookNotifier {
    name: String,
    flavor: WebhookFlavor,
    state: RwLock<WebhookState>,
    renderer: Arc<dyn TemplateRenderer>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: &NotifierConfig, renderer: Arc<dyn TemplateRenderer>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(config.send_timeout())
            .build()
            .map_err(|e| NotifyError::InvalidConfig(format!("failed to create HTTP client: {}", e)))?;
        let flavor = match config.channel_type {
            ChannelType::Slack => WebhookFlavor::Slack,
            _ => WebhookFlavor::Generic,
        };

        Ok(Self {
            name: config.name.clone(),
            flavor,
            state: RwLock::new(Self::state_from(config, renderer.as_ref())?),
            renderer,
            client,
        })
    }

    fn state_from(config: &NotifierConfig, renderer: &dyn TemplateRenderer) -> Result<WebhookState, NotifyError> {
        let settings = config
            .webhook
            .clone()
            .ok_or_else(|| NotifyError::InvalidConfig(format!("notifier '{}' has no webhook settings", config.name)))?;
        Ok(WebhookState {
            templates: MessageTemplates::from_config(config, renderer)?,
            settings,
        })
    }

    pub fn flavor(&self) -> WebhookFlavor {
        self.flavor
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn render(&self, ctx: &NotificationContext) -> Result<Message, NotifyError> {
        let state = self.state.read();
        state.templates.render(self.renderer.as_ref(), ctx, Vec::new())
    }

    async fn send(&self, message: &Message) -> Result<(), NotifyError> {
        let settings = self.state.read().settings.clone();
        let payload = match self.flavor {
            WebhookFlavor::Generic => generic_payload(message),
            WebhookFlavor::Slack => slack_payload(message, &settings),
        };
        let body = serde_json::to_string(&payload)
            .map_err(|e| NotifyError::Delivery(format!("failed to encode payload: {}", e)))?;

        let mut request = match settings.method.to_uppercase().as_str() {
            "POST" => self.client.post(&settings.url),
            "PUT" => self.client.put(&settings.url),
            other => {
                return Err(NotifyError::InvalidConfig(format!("unsupported HTTP method: {}", other)));
            }
        };

        for (key, value) in &settings.headers {
            request = request.header(key, value);
        }
        if let Some(secret) = &settings.secret {
            request = request.header("X-Signature-256", format!("sha256={}", compute_signature(secret, &body)));
        }

        let response = request
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT)
            .body(body)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(format!("webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(NotifyError::Delivery(format!("webhook returned {} - {}", status, text)));
        }

        debug!(notifier = %self.name, url = %settings.url, "Webhook notification sent");
        Ok(())
    }

    fn reload(&self, config: &NotifierConfig) -> Result<(), NotifyError> {
        *self.state.write() = Self::state_from(config, self.renderer.as_ref())?;
        Ok(())
    }
}

fn generic_payload(message: &Message) -> serde_json::Value {
    serde_json::json!({
        "instanceId": message.instance_id,
        "status": message.status,
        "subject": message.subject,
        "body": message.body,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

fn status_color(status: Status) -> &'static str {
    match status {
        Status::Up => "#16a34a",
        Status::Down | Status::Offline => "#dc2626",
        Status::Restricted => "#f59e0b",
        Status::Unknown => "#6b7280",
    }
}

fn status_emoji(status: Status) -> &'static str {
    match status {
        Status::Up => ":white_check_mark:",
        Status::Down | Status::Offline => ":fire:",
        _ => ":bell:",
    }
}

fn slack_payload(message: &Message, settings: &WebhookSettings) -> serde_json::Value {
    serde_json::json!({
        "channel": settings.channel,
        "username": settings.username.as_deref().unwrap_or("fleetgate"),
        "icon_emoji": settings.icon_emoji.as_deref().unwrap_or(":rotating_light:"),
        "attachments": [{
            "color": status_color(message.status),
            "title": message.subject,
            "text": message.body,
            "fields": [
                {
                    "title": "Instance",
                    "value": message.instance_id.as_str(),
                    "short": true
                },
                {
                    "title": "Status",
                    "value": format!("{} {}", status_emoji(message.status), message.status),
                    "short": true
                }
            ],
            "footer": "fleetgate",
            "ts": chrono::Utc::now().timestamp()
        }]
    })
}

/// Hex HMAC-SHA256 of the payload
pub fn compute_signature(secret: &str, body: &str) -> String {
    // HMAC accepts keys of any length, so this never fails.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Build the filtered notifier for a configured channel
pub fn build_notifier(
    config: &NotifierConfig,
    renderer: Arc<dyn TemplateRenderer>,
) -> Result<Arc<dyn Notifier>, NotifyError> {
    let filter = FilterSettings::from_config(config)?;
    let notifier: Arc<dyn Notifier> = match config.channel_type {
        ChannelType::Mail => Arc::new(Filtered::new(MailNotifier::smtp(config, renderer)?, filter)),
        ChannelType::Webhook | ChannelType::Slack => {
            Arc::new(Filtered::new(WebhookNotifier::new(config, renderer)?, filter))
        }
    };
    Ok(notifier)
}
