//! The config entries manager

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use hs_core::events::ReauthRequestData;
use hs_core::Context;
use hs_event_bus::EventBus;
use hs_storage::{Storable, Storage, StorageFile};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::entry::{ConfigEntry, ConfigEntryState, ConfigEntryUpdate};
use crate::fsm::{retry_delay, InvalidTransition};

/// Storage key for the persisted entry list
pub const STORAGE_KEY: &str = "core.config_entries";
const STORAGE_VERSION: u32 = 1;
const STORAGE_MINOR_VERSION: u32 = 1;

/// How integration setup handlers report failure
///
/// The variant decides what the manager does next: `NotReady` schedules an
/// automatic retry with backoff, `AuthFailed` requests re-authentication and
/// waits for the user, `Failed` parks the entry in `SetupError`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("setup failed: {0}")]
    Failed(String),
}

impl SetupError {
    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::NotReady(message.into())
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("an entry for domain {domain} with unique id {unique_id} already exists")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("cannot unload an entry in state {0:?}")]
    CannotUnload(ConfigEntryState),

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("unload failed: {0}")]
    UnloadFailed(String),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error(transparent)]
    Storage(#[from] hs_storage::StorageError),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// Persisted shape: just the entries themselves
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    pub entries: Vec<ConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Async per-domain setup hook; receives a snapshot of the entry
pub type SetupHandler =
    Arc<dyn Fn(ConfigEntry) -> BoxFuture<'static, Result<(), SetupError>> + Send + Sync>;

/// Async per-domain unload hook; integrations shut their coordinators down here
pub type UnloadHandler =
    Arc<dyn Fn(ConfigEntry) -> BoxFuture<'static, Result<(), anyhow::Error>> + Send + Sync>;

/// Owns every config entry and drives setup/unload through domain handlers
pub struct ConfigEntries {
    storage: Arc<Storage>,
    bus: Arc<EventBus>,

    entries: DashMap<String, ConfigEntry>,
    by_domain: DashMap<String, HashSet<String>>,
    by_unique_id: DashMap<(String, String), String>,

    /// Serializes setup/unload across all entries
    setup_lock: Mutex<()>,

    setup_handlers: DashMap<String, SetupHandler>,
    unload_handlers: DashMap<String, UnloadHandler>,
}

impl ConfigEntries {
    pub fn new(storage: Arc<Storage>, bus: Arc<EventBus>) -> Self {
        Self {
            storage,
            bus,
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            setup_lock: Mutex::new(()),
            setup_handlers: DashMap::new(),
            unload_handlers: DashMap::new(),
        }
    }

    /// Load persisted entries; a no-op when nothing was ever saved
    pub async fn load(&self) -> ConfigEntriesResult<()> {
        if let Some(data) = self.storage.load_storable::<ConfigEntriesData>().await? {
            info!("loading {} config entries from storage", data.entries.len());
            for entry in data.entries {
                self.index_entry(&entry);
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> ConfigEntriesResult<()> {
        let data = ConfigEntriesData {
            entries: self.entries.iter().map(|e| e.value().clone()).collect(),
        };
        let file = StorageFile::new(STORAGE_KEY, data, STORAGE_VERSION, STORAGE_MINOR_VERSION);
        self.storage.save(&file).await?;
        debug!("saved {} config entries", self.entries.len());
        Ok(())
    }

    fn index_entry(&self, entry: &ConfigEntry) {
        let entry_id = entry.entry_id.clone();
        self.entries.insert(entry_id.clone(), entry.clone());
        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry_id.clone());
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .insert((entry.domain.clone(), unique_id.clone()), entry_id);
        }
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }
        self.entries.remove(&entry.entry_id);
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|e| e.value().clone())
    }

    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        self.by_domain
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        self.by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .and_then(|id| self.get(&id))
    }

    /// Add and persist a new entry; duplicate `(domain, unique_id)` is rejected
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            if self.get_by_unique_id(&entry.domain, unique_id).is_some() {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        self.index_entry(&entry);
        self.save().await?;
        info!(
            "added config entry {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );
        Ok(entry)
    }

    pub async fn update(
        &self,
        entry_id: &str,
        update: ConfigEntryUpdate,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.unindex_entry(&entry);

        let mut updated = entry;
        if let Some(title) = update.title {
            updated.title = title;
        }
        if let Some(data) = update.data {
            updated.data = data;
        }
        if let Some(options) = update.options {
            updated.options = options;
        }
        if let Some(unique_id) = update.unique_id {
            updated.unique_id = unique_id;
        }
        if let Some(pref) = update.pref_disable_polling {
            updated.pref_disable_polling = pref;
        }
        updated.modified_at = Utc::now();

        self.index_entry(&updated);
        self.save().await?;
        debug!(entry_id, "updated config entry");
        Ok(updated)
    }

    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.unindex_entry(&entry);
        self.save().await?;
        info!(
            "removed config entry {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );
        Ok(entry)
    }

    /// Apply a validated state transition to an entry
    pub fn try_set_state(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> ConfigEntriesResult<()> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        entry.try_set_state(state, reason)?;
        debug!(entry_id, ?state, "config entry state changed");
        Ok(())
    }

    pub fn register_setup_handler(&self, domain: &str, handler: SetupHandler) {
        self.setup_handlers.insert(domain.to_string(), handler);
        debug!(domain, "registered setup handler");
    }

    pub fn register_unload_handler(&self, domain: &str, handler: UnloadHandler) {
        self.unload_handlers.insert(domain.to_string(), handler);
        debug!(domain, "registered unload handler");
    }

    /// Set up one entry through its domain's handler
    ///
    /// `NotReady` failures move the entry to `SetupRetry` and schedule an
    /// automatic retry with exponential backoff. `AuthFailed` parks the entry
    /// in `SetupError` and fires `config_entry_reauth` on the bus.
    pub async fn setup(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<()> {
        let _guard = self.setup_lock.lock().await;
        self.setup_locked(entry_id).await
    }

    async fn setup_locked(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<()> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if entry.is_disabled() {
            debug!(entry_id, "entry disabled, skipping setup");
            return Ok(());
        }

        self.try_set_state(entry_id, ConfigEntryState::SetupInProgress, None)?;

        let handler = self
            .setup_handlers
            .get(&entry.domain)
            .map(|h| h.value().clone());
        let result = match handler {
            Some(handler) => handler(entry.clone()).await,
            // nothing to do for domains without a handler
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                self.try_set_state(entry_id, ConfigEntryState::Loaded, None)?;
                info!("setup finished for {} [{}]", entry.title, entry_id);
                Ok(())
            }
            Err(SetupError::NotReady(reason)) => {
                let tries = self.increment_tries(entry_id);
                self.try_set_state(
                    entry_id,
                    ConfigEntryState::SetupRetry,
                    Some(reason.clone()),
                )?;
                let delay = retry_delay(tries.saturating_sub(1));
                warn!(
                    "config entry {} for {} not ready: {}; retrying in {:.0?}",
                    entry_id, entry.domain, reason, delay
                );
                self.spawn_retry(entry_id, delay);
                Err(SetupError::NotReady(reason).into())
            }
            Err(SetupError::AuthFailed(reason)) => {
                self.try_set_state(
                    entry_id,
                    ConfigEntryState::SetupError,
                    Some(reason.clone()),
                )?;
                error!(
                    "authentication failed for config entry {} ({}): {}",
                    entry_id, entry.domain, reason
                );
                self.bus.fire_typed(
                    ReauthRequestData {
                        entry_id: entry_id.to_string(),
                        domain: entry.domain.clone(),
                        reason: Some(reason.clone()),
                    },
                    Context::new(),
                );
                Err(SetupError::AuthFailed(reason).into())
            }
            Err(SetupError::Failed(reason)) => {
                self.try_set_state(
                    entry_id,
                    ConfigEntryState::SetupError,
                    Some(reason.clone()),
                )?;
                warn!("setup failed for config entry {}: {}", entry_id, reason);
                Err(SetupError::Failed(reason).into())
            }
        }
    }

    fn increment_tries(&self, entry_id: &str) -> u32 {
        self.entries
            .get_mut(entry_id)
            .map(|mut e| e.increment_tries())
            .unwrap_or(0)
    }

    fn spawn_retry(self: &Arc<Self>, entry_id: &str, delay: Duration) {
        let weak = Arc::downgrade(self);
        let entry_id = entry_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else { return };
            // the entry may have been removed or unloaded in the meantime
            let Some(entry) = manager.get(&entry_id) else { return };
            if entry.state != ConfigEntryState::SetupRetry {
                return;
            }
            debug!(entry_id, "retrying setup");
            let _ = manager.setup(&entry_id).await;
        });
    }

    /// Unload one entry through its domain's handler
    pub async fn unload(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<()> {
        let _guard = self.setup_lock.lock().await;
        self.unload_locked(entry_id).await
    }

    async fn unload_locked(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<()> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if !entry.state.is_recoverable() {
            return Err(ConfigEntriesError::CannotUnload(entry.state));
        }
        if entry.state == ConfigEntryState::NotLoaded {
            return Ok(());
        }

        self.try_set_state(entry_id, ConfigEntryState::UnloadInProgress, None)?;

        let handler = self
            .unload_handlers
            .get(&entry.domain)
            .map(|h| h.value().clone());
        let result = match handler {
            Some(handler) => handler(entry.clone()).await,
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                self.try_set_state(entry_id, ConfigEntryState::NotLoaded, None)?;
                info!("unloaded entry {} [{}]", entry.title, entry_id);
                Ok(())
            }
            Err(err) => {
                self.try_set_state(
                    entry_id,
                    ConfigEntryState::FailedUnload,
                    Some(err.to_string()),
                )?;
                error!("unload failed for config entry {}: {}", entry_id, err);
                Err(ConfigEntriesError::UnloadFailed(err.to_string()))
            }
        }
    }

    pub async fn reload(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<()> {
        self.unload(entry_id).await?;
        self.setup(entry_id).await
    }

    /// Set up every known entry, collecting per-entry outcomes
    pub async fn setup_all(self: &Arc<Self>) -> Vec<(String, ConfigEntriesResult<()>)> {
        let mut results = Vec::new();
        for entry_id in self.entry_ids() {
            let result = self.setup(&entry_id).await;
            results.push((entry_id, result));
        }
        results
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn domains(&self) -> Vec<String> {
        self.by_domain.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
