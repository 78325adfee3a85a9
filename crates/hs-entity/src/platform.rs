//! Entity platform: renders entities into the state machine

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use hs_coordinator::{ListenerHandle, PollingCoordinator, UpdateError};
use hs_core::{Context, STATE_UNAVAILABLE};
use hs_state_machine::StateMachine;
use thiserror::Error;
use tracing::debug;

use crate::Entity;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("entity {entity_id} does not belong to platform domain {domain}")]
    DomainMismatch { entity_id: String, domain: String },

    #[error("entity {0} already added to this platform")]
    Duplicate(String),

    #[error(transparent)]
    Coordinator(#[from] UpdateError),
}

struct PlatformEntity {
    entity: Arc<dyn Entity>,
    /// Keeps the coordinator listener alive; dropped on removal
    _subscription: Option<ListenerHandle>,
}

/// Owns the entities of one platform domain (`sensor`, `switch`, ...)
pub struct EntityPlatform {
    domain: String,
    state_machine: Arc<StateMachine>,
    entities: DashMap<String, PlatformEntity>,
}

impl EntityPlatform {
    pub fn new(domain: impl Into<String>, state_machine: Arc<StateMachine>) -> Self {
        Self {
            domain: domain.into(),
            state_machine,
            entities: DashMap::new(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Add a self-contained entity and render its initial state
    pub fn add_entity(&self, entity: Arc<dyn Entity>) -> Result<(), PlatformError> {
        self.insert(entity, None)
    }

    /// Add an entity backed by a coordinator
    ///
    /// The platform subscribes to the coordinator so the entity is
    /// re-rendered after every refresh cycle, successful or not. The
    /// subscription lives until the entity is removed.
    pub fn add_coordinator_entity<T: Send + Sync + 'static>(
        &self,
        entity: Arc<dyn Entity>,
        coordinator: &PollingCoordinator<T>,
    ) -> Result<(), PlatformError> {
        let state_machine = Arc::clone(&self.state_machine);
        let subscribed = Arc::clone(&entity);
        let handle = coordinator.add_listener(move |_snapshot| {
            render(&state_machine, subscribed.as_ref());
        })?;
        self.insert(entity, Some(handle))
    }

    fn insert(
        &self,
        entity: Arc<dyn Entity>,
        subscription: Option<ListenerHandle>,
    ) -> Result<(), PlatformError> {
        let entity_id = entity.entity_id();
        if entity_id.domain() != self.domain {
            return Err(PlatformError::DomainMismatch {
                entity_id: entity_id.to_string(),
                domain: self.domain.clone(),
            });
        }

        let key = entity_id.to_string();
        if self.entities.contains_key(&key) {
            return Err(PlatformError::Duplicate(key));
        }

        debug!(entity_id = %key, "entity added to platform");
        render(&self.state_machine, entity.as_ref());
        self.entities.insert(
            key,
            PlatformEntity {
                entity,
                _subscription: subscription,
            },
        );
        Ok(())
    }

    /// Re-render one entity on demand
    pub fn write_state(&self, entity_id: &str) {
        if let Some(platform_entity) = self.entities.get(entity_id) {
            render(&self.state_machine, platform_entity.entity.as_ref());
        }
    }

    /// Remove an entity: drops its coordinator subscription and its state
    pub fn remove_entity(&self, entity_id: &str) {
        if let Some((_, platform_entity)) = self.entities.remove(entity_id) {
            debug!(entity_id, "entity removed from platform");
            self.state_machine
                .remove(&platform_entity.entity.entity_id(), Context::new());
        }
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.entities.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Unavailable entities render as the marker state, not their last value
fn render(state_machine: &StateMachine, entity: &dyn Entity) {
    let entity_id = entity.entity_id();
    if entity.available() {
        state_machine.set(entity_id, entity.state(), entity.attributes(), Context::new());
    } else {
        state_machine.set(entity_id, STATE_UNAVAILABLE, HashMap::new(), Context::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_core::EntityId;
    use hs_event_bus::EventBus;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FixedSensor {
        object_id: &'static str,
        value: &'static str,
        online: AtomicBool,
    }

    impl FixedSensor {
        fn new(object_id: &'static str, value: &'static str) -> Arc<Self> {
            Arc::new(Self {
                object_id,
                value,
                online: AtomicBool::new(true),
            })
        }
    }

    impl Entity for FixedSensor {
        fn entity_id(&self) -> EntityId {
            EntityId::new("sensor", self.object_id).unwrap()
        }

        fn state(&self) -> String {
            self.value.to_string()
        }

        fn attributes(&self) -> HashMap<String, serde_json::Value> {
            HashMap::from([("unit".to_string(), json!("°C"))])
        }

        fn available(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }
    }

    fn platform() -> (Arc<StateMachine>, EntityPlatform) {
        let bus = Arc::new(EventBus::new());
        let state_machine = Arc::new(StateMachine::new(bus));
        let platform = EntityPlatform::new("sensor", state_machine.clone());
        (state_machine, platform)
    }

    #[test]
    fn add_renders_initial_state() {
        let (state_machine, platform) = platform();
        platform
            .add_entity(FixedSensor::new("outdoor", "21.5"))
            .unwrap();

        let state = state_machine.get("sensor.outdoor").unwrap();
        assert_eq!(state.state, "21.5");
        assert_eq!(state.attributes.get("unit"), Some(&json!("°C")));
    }

    #[test]
    fn wrong_domain_is_rejected() {
        let (_, platform) = platform();
        let result = platform.add_entity(Arc::new(WrongDomain));
        assert!(matches!(result, Err(PlatformError::DomainMismatch { .. })));

        struct WrongDomain;
        impl Entity for WrongDomain {
            fn entity_id(&self) -> EntityId {
                EntityId::new("light", "porch").unwrap()
            }
            fn state(&self) -> String {
                "on".to_string()
            }
        }
    }

    #[test]
    fn duplicate_entity_is_rejected() {
        let (_, platform) = platform();
        platform
            .add_entity(FixedSensor::new("outdoor", "21.5"))
            .unwrap();
        let result = platform.add_entity(FixedSensor::new("outdoor", "22.0"));
        assert!(matches!(result, Err(PlatformError::Duplicate(_))));
        assert_eq!(platform.len(), 1);
    }

    #[test]
    fn unavailable_entity_renders_marker_state() {
        let (state_machine, platform) = platform();
        let sensor = FixedSensor::new("outdoor", "21.5");
        platform.add_entity(sensor.clone()).unwrap();

        sensor.online.store(false, Ordering::SeqCst);
        platform.write_state("sensor.outdoor");

        let state = state_machine.get("sensor.outdoor").unwrap();
        assert!(state.is_unavailable());
        assert!(state.attributes.is_empty());
    }

    #[test]
    fn remove_drops_state() {
        let (state_machine, platform) = platform();
        platform
            .add_entity(FixedSensor::new("outdoor", "21.5"))
            .unwrap();

        platform.remove_entity("sensor.outdoor");
        assert!(state_machine.get("sensor.outdoor").is_none());
        assert!(platform.is_empty());
    }
}
