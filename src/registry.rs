//! Instance registry read interface and an in-memory implementation
//!
//! The proxy and the notifiers only ever read from the registry through
//! [`InstanceRegistry`]. [`InMemoryRegistry`] backs the standalone binary
//! and the tests; it publishes every change it applies to an [`EventBus`].

use crate::events::{EventBus, InstanceEvent, InstanceEventKind};
use crate::instance::{Instance, InstanceId, Registration, StatusInfo};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),
    #[error("instance not found: {0}")]
    NotFound(InstanceId),
}

/// Read access to registered instances
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<Instance>, RegistryError>;

    /// `Ok(None)` when the instance is not registered
    async fn get_instance(&self, id: &InstanceId) -> Result<Option<Instance>, RegistryError>;
}

/// Registry kept in process memory
pub struct InMemoryRegistry {
    instances: DashMap<InstanceId, Instance>,
    bus: EventBus,
}

impl InMemoryRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            instances: DashMap::new(),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Register or re-register an instance.
    ///
    /// A new id publishes `Registered`. An existing id whose URLs changed
    /// publishes `AddressChanged`; any other change to the registration
    /// (name, metadata) publishes `Registered` again. Re-registering
    /// identical data is silent.
    pub fn register(
        &self,
        id: Option<InstanceId>,
        registration: Registration,
    ) -> Result<InstanceId, RegistryError> {
        registration
            .validate()
            .map_err(RegistryError::InvalidRegistration)?;
        let id = id.unwrap_or_else(|| InstanceId::from_registration(&registration));

        let event = match self.instances.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let instance = entry.get_mut();
                if instance.registration == registration {
                    None
                } else {
                    let moved = instance.registration.address_differs(&registration);
                    instance.registration = registration.clone();
                    instance.version += 1;
                    let kind = if moved {
                        InstanceEventKind::AddressChanged { registration }
                    } else {
                        InstanceEventKind::Registered { registration }
                    };
                    Some(InstanceEvent::new(id.clone(), instance.version, kind))
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let instance = Instance::new(id.clone(), registration.clone());
                let version = instance.version;
                entry.insert(instance);
                Some(InstanceEvent::new(
                    id.clone(),
                    version,
                    InstanceEventKind::Registered { registration },
                ))
            }
        };

        if let Some(event) = event {
            info!(instance_id = %id, kind = event.kind.as_str(), "Instance registered");
            self.bus.publish(event);
        } else {
            debug!(instance_id = %id, "Instance re-registered without changes");
        }
        Ok(id)
    }

    /// Returns false when the id was not registered
    pub fn deregister(&self, id: &InstanceId) -> bool {
        match self.instances.remove(id) {
            Some((_, instance)) => {
                info!(instance_id = %id, name = %instance.registration.name, "Instance deregistered");
                self.bus.publish(InstanceEvent::new(
                    id.clone(),
                    instance.version + 1,
                    InstanceEventKind::Deregistered,
                ));
                true
            }
            None => false,
        }
    }

    /// Apply a new status. Returns `Ok(false)` when the status did not change.
    pub fn update_status(&self, id: &InstanceId, status: StatusInfo) -> Result<bool, RegistryError> {
        let event = {
            let mut instance = self
                .instances
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
            if instance.status_info == status {
                return Ok(false);
            }
            let new_status = status.clone();
            let previous = instance.apply_status(status, Utc::now());
            InstanceEvent::new(
                id.clone(),
                instance.version,
                InstanceEventKind::StatusChanged {
                    previous,
                    status: new_status,
                },
            )
        };

        debug!(instance_id = %id, "Instance status updated");
        self.bus.publish(event);
        Ok(true)
    }
}

#[async_trait]
impl InstanceRegistry for InMemoryRegistry {
    async fn list_instances(&self) -> Result<Vec<Instance>, RegistryError> {
        Ok(self.instances.iter().map(|e| e.value().clone()).collect())
    }

    async fn get_instance(&self, id: &InstanceId) -> Result<Option<Instance>, RegistryError> {
        Ok(self.instances.get(id).map(|e| e.value().clone()))
    }
}
