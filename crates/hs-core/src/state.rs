//! State type: one entity's value at a point in time

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Context, EntityId, MAX_STATE_LENGTH, STATE_UNAVAILABLE, STATE_UNKNOWN};

/// A snapshot of an entity's value and attributes
///
/// `last_changed` moves only when the value itself changes; `last_updated`
/// moves on every write, including attribute-only updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub entity_id: EntityId,

    /// The value, always a string (`"on"`, `"21.5"`, `"unavailable"`, ...)
    pub state: String,

    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    pub last_changed: DateTime<Utc>,

    pub last_updated: DateTime<Utc>,

    pub context: Context,
}

/// Values longer than [`MAX_STATE_LENGTH`] degrade to `unknown`
fn clamp_state(value: String) -> String {
    if value.len() > MAX_STATE_LENGTH {
        STATE_UNKNOWN.to_string()
    } else {
        value
    }
}

impl State {
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: clamp_state(state.into()),
            attributes,
            last_changed: now,
            last_updated: now,
            context,
        }
    }

    /// The marker state for an entity whose source cannot be reached
    pub fn unavailable(entity_id: EntityId, context: Context) -> Self {
        Self::new(entity_id, STATE_UNAVAILABLE, HashMap::new(), context)
    }

    /// Produce the follow-up state, keeping `last_changed` when the value is equal
    pub fn with_update(
        &self,
        new_state: impl Into<String>,
        new_attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        let new_state = clamp_state(new_state.into());
        let value_changed = self.state != new_state;

        Self {
            entity_id: self.entity_id.clone(),
            state: new_state,
            attributes: new_attributes,
            last_changed: if value_changed { now } else { self.last_changed },
            last_updated: now,
            context,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.state == STATE_UNAVAILABLE
    }

    pub fn is_unknown(&self) -> bool {
        self.state == STATE_UNKNOWN
    }

    /// Deserialize one attribute, if present and of the right shape
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // timestamps and context intentionally excluded
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}
