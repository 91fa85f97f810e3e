//! Headers injected into proxied requests

use crate::config::HeadersConfig;
use crate::instance::InstanceId;
use crate::registry::InstanceRegistry;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("header provider failed: {0}")]
pub struct HeaderProviderError(pub String);

/// Supplies extra request headers per instance, such as auth tokens
#[async_trait]
pub trait HeaderProvider: Send + Sync {
    async fn headers_for(&self, instance_id: &InstanceId) -> Result<HashMap<String, String>, HeaderProviderError>;
}

/// Headers from the `[headers]` config section: global ones for every
/// instance, overlaid with the ones configured for the instance's name.
pub struct StaticHeaderProvider {
    config: RwLock<HeadersConfig>,
    registry: Arc<dyn InstanceRegistry>,
}

impl StaticHeaderProvider {
    pub fn new(config: HeadersConfig, registry: Arc<dyn InstanceRegistry>) -> Self {
        Self {
            config: RwLock::new(config),
            registry,
        }
    }

    pub fn update(&self, config: HeadersConfig) {
        *self.config.write() = config;
    }
}

#[async_trait]
impl HeaderProvider for StaticHeaderProvider {
    async fn headers_for(&self, instance_id: &InstanceId) -> Result<HashMap<String, String>, HeaderProviderError> {
        {
            let config = self.config.read();
            if config.apps.is_empty() {
                return Ok(config.global.clone());
            }
        }

        let name = self
            .registry
            .get_instance(instance_id)
            .await
            .map_err(|e| HeaderProviderError(e.to_string()))?
            .map(|instance| instance.registration.name);

        let config = self.config.read();
        let mut headers = config.global.clone();
        if let Some(app_headers) = name.as_deref().and_then(|name| config.apps.get(name)) {
            headers.extend(app_headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(headers)
    }
}
