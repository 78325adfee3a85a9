//! Entities and platforms
//!
//! An [`Entity`] is one observable point (a sensor reading, a switch, a
//! lock) exposed through the fixed attribute contract: a string state, a
//! JSON attribute map and an availability flag. An [`EntityPlatform`] owns
//! the entities of one platform domain and renders them into the
//! [`StateMachine`].
//!
//! Entities backed by a [`PollingCoordinator`] are registered through
//! [`EntityPlatform::add_coordinator_entity`]: the platform subscribes to
//! the coordinator and re-renders the entity after every refresh cycle, so
//! a failing source shows up as `unavailable` rather than a stale value.

mod platform;

pub use platform::{EntityPlatform, PlatformError};

use std::collections::HashMap;

use hs_core::EntityId;

/// The attribute contract every exposed point implements
pub trait Entity: Send + Sync + 'static {
    fn entity_id(&self) -> EntityId;

    /// Stable identifier for registries; optional
    fn unique_id(&self) -> Option<String> {
        None
    }

    /// Current value, rendered as a string
    fn state(&self) -> String;

    fn attributes(&self) -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }

    /// Entities backed by a coordinator mirror its `last_update_success`
    fn available(&self) -> bool {
        true
    }
}
