//! Config entry lifecycle management
//!
//! A [`ConfigEntry`] is one configured instance of an integration: its
//! credentials, options and runtime state. The [`ConfigEntries`] manager owns
//! all of them, drives setup and unload through per-domain handlers, retries
//! not-ready setups with backoff, and converts authentication failures into
//! `config_entry_reauth` events on the bus.

mod entry;
mod fsm;
mod manager;

pub use entry::{ConfigEntry, ConfigEntryState, ConfigEntrySource, ConfigEntryUpdate, DisabledBy};
pub use fsm::{retry_delay, InvalidTransition};
pub use manager::{
    ConfigEntries, ConfigEntriesError, ConfigEntriesResult, SetupError, SetupHandler,
    UnloadHandler, STORAGE_KEY,
};
