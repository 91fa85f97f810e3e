//! Notification templates
//!
//! Templates are plain text with `#{path}` placeholders. Placeholders are
//! resolved against a fixed set of variables (`event`, `instance`,
//! `lastStatus`) and checked when the template is parsed, so a typo fails at
//! configuration time instead of on the first outage.

use crate::events::StatusChangeEvent;
use crate::instance::{Instance, Status};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_SUBJECT: &str =
    "#{instance.registration.name} (#{instance.id}) is #{event.statusInfo.status}";

pub const DEFAULT_BODY_TEMPLATE_NAME: &str = "status-change";

const DEFAULT_BODY_TEMPLATE: &str = "\
#{instance.registration.name} (#{instance.id})
Status changed from #{lastStatus} to #{event.statusInfo.status}

Service URL: #{instance.registration.serviceUrl}
Management URL: #{instance.registration.managementUrl}
Health URL: #{instance.registration.healthUrl}
Time: #{event.timestamp}

---
fleetgate
";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unterminated placeholder at offset {0}")]
    Unterminated(usize),
    #[error("unknown template variable '{0}'")]
    UnknownVariable(String),
    #[error("template '{0}' not found")]
    NotFound(String),
    #[error("no value for '{0}'")]
    MissingValue(String),
}

/// Variables available to templates
pub struct TemplateVars<'a> {
    pub event: &'a StatusChangeEvent,
    pub instance: &'a Instance,
    pub last_status: Status,
}

impl<'a> TemplateVars<'a> {
    pub fn new(event: &'a StatusChangeEvent, instance: &'a Instance) -> Self {
        Self {
            event,
            instance,
            last_status: event.previous.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Variable {
    InstanceId,
    InstanceVersion,
    Name,
    ServiceUrl,
    ManagementUrl,
    HealthUrl,
    Metadata(String),
    InstanceStatus,
    EventInstance,
    EventType,
    EventVersion,
    EventTimestamp,
    EventStatus,
    LastStatus,
}

impl Variable {
    fn parse(path: &str) -> Result<Self, TemplateError> {
        let var = match path {
            "instance.id" => Self::InstanceId,
            "instance.version" => Self::InstanceVersion,
            "instance.registration.name" => Self::Name,
            "instance.registration.serviceUrl" => Self::ServiceUrl,
            "instance.registration.managementUrl" => Self::ManagementUrl,
            "instance.registration.healthUrl" => Self::HealthUrl,
            "instance.statusInfo.status" => Self::InstanceStatus,
            "event.instance" => Self::EventInstance,
            "event.type" => Self::EventType,
            "event.version" => Self::EventVersion,
            "event.timestamp" => Self::EventTimestamp,
            "event.statusInfo.status" => Self::EventStatus,
            "lastStatus" => Self::LastStatus,
            other => match other.strip_prefix("instance.registration.metadata.") {
                Some(key) if !key.is_empty() => Self::Metadata(key.to_string()),
                _ => return Err(TemplateError::UnknownVariable(other.to_string())),
            },
        };
        Ok(var)
    }

    fn resolve(&self, vars: &TemplateVars<'_>) -> Result<String, TemplateError> {
        let registration = &vars.instance.registration;
        let value = match self {
            Self::InstanceId => vars.instance.id.to_string(),
            Self::InstanceVersion => vars.instance.version.to_string(),
            Self::Name => registration.name.clone(),
            Self::ServiceUrl => registration.service_url.clone().unwrap_or_default(),
            Self::ManagementUrl => registration.management_url.clone().unwrap_or_default(),
            Self::HealthUrl => registration.health_url.clone().unwrap_or_default(),
            Self::Metadata(key) => registration
                .metadata
                .get(key)
                .cloned()
                .ok_or_else(|| TemplateError::MissingValue(format!("instance.registration.metadata.{}", key)))?,
            Self::InstanceStatus => vars.instance.status().to_string(),
            Self::EventInstance => vars.event.instance_id.to_string(),
            Self::EventType => "STATUS_CHANGED".to_string(),
            Self::EventVersion => vars.event.version.to_string(),
            Self::EventTimestamp => vars.event.timestamp.to_rfc3339(),
            Self::EventStatus => vars.event.status.status.to_string(),
            Self::LastStatus => vars.last_status.to_string(),
        };
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(Variable),
}

/// A parsed, validated template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("#{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or(TemplateError::Unterminated(offset + start))?;
            segments.push(Segment::Variable(Variable::parse(after[..end].trim())?));

            let consumed = start + 2 + end + 1;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, vars: &TemplateVars<'_>) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(var) => out.push_str(&var.resolve(vars)?),
            }
        }
        Ok(out)
    }
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Renders a named template
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, name: &str, vars: &TemplateVars<'_>) -> Result<String, TemplateError>;

    fn has_template(&self, name: &str) -> bool;
}

/// Named templates, including the built-in status change body
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<String, Template>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            DEFAULT_BODY_TEMPLATE_NAME.to_string(),
            Template::parse(DEFAULT_BODY_TEMPLATE).expect("built-in template is valid"),
        );
        Self { templates }
    }

    /// Built-ins plus the given sources; user templates may override built-ins.
    pub fn from_sources(sources: &HashMap<String, String>) -> Result<Self, TemplateError> {
        let mut registry = Self::new();
        for (name, source) in sources {
            registry.templates.insert(name.clone(), Template::parse(source)?);
        }
        Ok(registry)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer for TemplateRegistry {
    fn render(&self, name: &str, vars: &TemplateVars<'_>) -> Result<String, TemplateError> {
        self.templates
            .get(name)
            .ok_or_else(|| TemplateError::NotFound(name.to_string()))?
            .render(vars)
    }

    fn has_template(&self, name: &str) -> bool {
        self.contains(name)
    }
}
