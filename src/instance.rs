//! Instance domain model
//!
//! Instances are owned by the registry. Everything else in the crate works on
//! cloned, read-only snapshots of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Number of status records kept per instance
pub const MAX_STATUS_HISTORY: usize = 32;

/// Opaque, stable identifier of a registered instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an id from the registration's most stable URL.
    ///
    /// The same registration always yields the same id, so an instance that
    /// re-registers after a restart keeps its routes and cooldown state.
    pub fn from_registration(registration: &Registration) -> Self {
        let key = registration
            .health_url
            .as_deref()
            .or(registration.management_url.as_deref())
            .or(registration.service_url.as_deref())
            .unwrap_or(&registration.name);

        let digest = Sha256::digest(key.as_bytes());
        Self(hex::encode(&digest[..6]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Reported status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Up,
    Down,
    Offline,
    #[default]
    Unknown,
    Restricted,
}

impl Status {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "UP" => Some(Self::Up),
            "DOWN" => Some(Self::Down),
            "OFFLINE" => Some(Self::Offline),
            "UNKNOWN" => Some(Self::Unknown),
            "RESTRICTED" => Some(Self::Restricted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Offline => "OFFLINE",
            Self::Unknown => "UNKNOWN",
            Self::Restricted => "RESTRICTED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus whatever details the health endpoint returned
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusInfo {
    pub status: Status,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
}

impl StatusInfo {
    pub fn of(status: Status) -> Self {
        Self {
            status,
            details: HashMap::new(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == Status::Up
    }
}

/// Registration data as submitted by the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub name: String,
    #[serde(default, alias = "service_url")]
    pub service_url: Option<String>,
    #[serde(default, alias = "management_url")]
    pub management_url: Option<String>,
    #[serde(default, alias = "health_url")]
    pub health_url: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Registration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_url: None,
            management_url: None,
            health_url: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_service_url(mut self, url: impl Into<String>) -> Self {
        self.service_url = Some(url.into());
        self
    }

    pub fn with_management_url(mut self, url: impl Into<String>) -> Self {
        self.management_url = Some(url.into());
        self
    }

    pub fn with_health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// True when the network location differs, i.e. proxied targets would move
    pub fn address_differs(&self, other: &Registration) -> bool {
        self.service_url != other.service_url
            || self.management_url != other.management_url
            || self.health_url != other.health_url
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("'name' must not be empty".to_string());
        }
        if self.health_url.is_none() && self.management_url.is_none() && self.service_url.is_none()
        {
            return Err(format!(
                "registration '{}' needs at least one of healthUrl, managementUrl or serviceUrl",
                self.name
            ));
        }
        Ok(())
    }
}

/// One entry of an instance's status history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRecord {
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of a registered instance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: InstanceId,
    /// Bumped on every change the registry applies to this instance
    pub version: u64,
    pub registration: Registration,
    pub status_info: StatusInfo,
    pub status_timestamp: DateTime<Utc>,
    /// Oldest first
    pub status_history: Vec<StatusRecord>,
}

impl Instance {
    pub fn new(id: InstanceId, registration: Registration) -> Self {
        let now = Utc::now();
        Self {
            id,
            version: 1,
            registration,
            status_info: StatusInfo::default(),
            status_timestamp: now,
            status_history: vec![StatusRecord {
                status: Status::Unknown,
                timestamp: now,
            }],
        }
    }

    pub fn status(&self) -> Status {
        self.status_info.status
    }

    /// Apply a new status, returning the previous one
    pub fn apply_status(&mut self, status_info: StatusInfo, at: DateTime<Utc>) -> StatusInfo {
        self.version += 1;
        self.status_timestamp = at;
        self.status_history.push(StatusRecord {
            status: status_info.status,
            timestamp: at,
        });
        if self.status_history.len() > MAX_STATUS_HISTORY {
            let excess = self.status_history.len() - MAX_STATUS_HISTORY;
            self.status_history.drain(..excess);
        }
        std::mem::replace(&mut self.status_info, status_info)
    }
}
