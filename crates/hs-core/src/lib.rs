//! Core types for Homestead
//!
//! The fundamental vocabulary shared by every other crate in the workspace:
//! [`EntityId`], [`State`], [`Event`] and [`Context`], plus the well-known
//! state values and event types.

mod context;
mod entity_id;
mod event;
mod state;

pub use context::Context;
pub use entity_id::{EntityId, EntityIdError};
pub use event::{Event, EventData, EventOrigin, EventType};
pub use state::State;

/// State value reported for entities whose backing source cannot be reached
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// State value reported when an entity has no meaningful value yet
pub const STATE_UNKNOWN: &str = "unknown";

/// Maximum length of a state value; longer values degrade to [`STATE_UNKNOWN`]
pub const MAX_STATE_LENGTH: usize = 255;

/// Well-known event types fired on the Homestead event bus
pub mod events {
    use super::*;

    /// Fired whenever an entity's state is set or removed
    pub const STATE_CHANGED: &str = "state_changed";

    /// Fired when an integration needs the user to re-authenticate
    pub const CONFIG_ENTRY_REAUTH: &str = "config_entry_reauth";

    /// Fired once when the hub begins shutting down
    pub const HOMESTEAD_STOP: &str = "homestead_stop";

    /// Payload of [`STATE_CHANGED`] events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }

    /// Payload of [`CONFIG_ENTRY_REAUTH`] events
    ///
    /// Fired by the config entry manager when setup of an entry failed with
    /// an authentication error. A frontend would react by opening a reauth
    /// flow for the named entry.
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct ReauthRequestData {
        pub entry_id: String,
        pub domain: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub reason: Option<String>,
    }

    impl EventData for ReauthRequestData {
        fn event_type() -> &'static str {
            CONFIG_ENTRY_REAUTH
        }
    }
}
