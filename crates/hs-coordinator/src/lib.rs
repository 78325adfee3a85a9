//! Polling update coordination for Homestead integrations
//!
//! Nearly every integration boils down to the same loop: call a vendor API
//! on an interval, cache what came back, and tell every interested entity
//! about it. This crate is that loop, written once:
//!
//! - [`PollingCoordinator`]: interval polling with single-flight refresh
//!   de-duplication, listener fan-out and lazy timer activation
//! - [`UpdateSource`]: the async seam an integration implements around its
//!   vendor client
//! - [`UpdateError`]: the transient / auth-failure / timeout taxonomy that
//!   drives unavailable-marking and re-authentication
//! - [`Debouncer`]: cooldown coalescing behind
//!   [`PollingCoordinator::request_refresh`]

mod coordinator;
mod debounce;
mod error;
mod state;

pub use coordinator::{
    CoordinatorBuilder, ListenerHandle, ListenerId, PollingCoordinator, UpdateSnapshot,
    UpdateSource, REQUEST_REFRESH_COOLDOWN,
};
pub use debounce::{DebouncedFn, Debouncer};
pub use error::{UpdateError, UpdateResult};
pub use state::{CoordinatorState, InvalidTransition};
