//! Entity state tracking
//!
//! The [`StateMachine`] holds the current [`State`] of every entity, keeps a
//! per-domain index for queries, and fires `state_changed` on the event bus
//! for every write and removal. Entity platforms write into it; automations
//! and frontends observe it through the bus.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use hs_core::events::StateChangedData;
use hs_core::{Context, EntityId, State};
use hs_event_bus::EventBus;
use tracing::{debug, trace};

/// Current state of all entities, indexed by domain
pub struct StateMachine {
    states: DashMap<String, State>,
    domain_index: DashMap<String, HashSet<String>>,
    bus: Arc<EventBus>,
}

impl StateMachine {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            states: DashMap::new(),
            domain_index: DashMap::new(),
            bus,
        }
    }

    /// Write an entity's state, firing `state_changed`
    ///
    /// When the value is unchanged the previous `last_changed` is carried
    /// over, so observers can distinguish "changed" from "re-reported".
    pub fn set(
        &self,
        entity_id: EntityId,
        value: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> State {
        let key = entity_id.to_string();
        let old_state = self.states.get(&key).map(|s| s.clone());

        let new_state = match &old_state {
            Some(prev) => prev.with_update(value, attributes, context.clone()),
            None => State::new(entity_id.clone(), value, attributes, context.clone()),
        };

        debug!(entity_id = %key, state = %new_state.state, "state write");

        self.states.insert(key.clone(), new_state.clone());
        if old_state.is_none() {
            self.domain_index
                .entry(entity_id.domain().to_string())
                .or_default()
                .insert(key);
        }

        self.bus.fire_typed(
            StateChangedData {
                entity_id,
                old_state,
                new_state: Some(new_state.clone()),
            },
            context,
        );

        new_state
    }

    /// Drop an entity's state, firing `state_changed` with `new_state: None`
    pub fn remove(&self, entity_id: &EntityId, context: Context) -> Option<State> {
        let key = entity_id.to_string();
        let old_state = self.states.remove(&key).map(|(_, s)| s);

        if let Some(ref state) = old_state {
            trace!(entity_id = %key, "state removed");

            if let Some(mut ids) = self.domain_index.get_mut(entity_id.domain()) {
                ids.remove(&key);
            }

            self.bus.fire_typed(
                StateChangedData {
                    entity_id: entity_id.clone(),
                    old_state: Some(state.clone()),
                    new_state: None,
                },
                context,
            );
        }

        old_state
    }

    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    pub fn get_value(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    pub fn is_state(&self, entity_id: &str, value: &str) -> bool {
        self.get_value(entity_id).as_deref() == Some(value)
    }

    /// Entity IDs registered under a domain
    pub fn entity_ids(&self, domain: &str) -> Vec<String> {
        self.domain_index
            .get(domain)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn domain_states(&self, domain: &str) -> Vec<State> {
        self.entity_ids(domain)
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub fn all(&self) -> Vec<State> {
        self.states.iter().map(|s| s.value().clone()).collect()
    }

    pub fn domains(&self) -> Vec<String> {
        self.domain_index.iter().map(|e| e.key().clone()).collect()
    }

    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}

/// Shared handle used by platforms and observers
pub type SharedStateMachine = Arc<StateMachine>;
