//! The polling update coordinator
//!
//! One [`PollingCoordinator`] wraps one external data source: it fetches on a
//! fixed interval, de-duplicates concurrent refreshes into a single in-flight
//! fetch, and fans the outcome out to every subscribed listener. Polling is
//! lazy: the interval timer only runs while at least one listener is
//! registered.
//!
//! Failure handling follows the unavailable-not-stale rule: on a failed
//! cycle the previous data is retained, `last_update_success` flips to
//! false, and listeners are still notified so bound entities can report
//! themselves unavailable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::debounce::{DebouncedFn, Debouncer};
use crate::error::{UpdateError, UpdateResult};
use crate::state::CoordinatorState;

/// Cooldown window applied to [`PollingCoordinator::request_refresh`]
pub const REQUEST_REFRESH_COOLDOWN: Duration = Duration::from_millis(300);

/// The seam an integration implements to feed a coordinator
///
/// `fetch` is expected to perform the network round trip against the vendor
/// client and map its errors onto the [`UpdateError`] taxonomy.
#[async_trait]
pub trait UpdateSource: Send + Sync + 'static {
    type Data: Send + Sync + 'static;

    async fn fetch(&self) -> UpdateResult<Self::Data>;
}

/// Handed to every listener after each refresh cycle
pub struct UpdateSnapshot<T> {
    /// Latest successfully fetched data; on a failed cycle this is the
    /// retained data of an earlier success
    pub data: Option<Arc<T>>,
    /// Whether the cycle that triggered this notification succeeded
    pub success: bool,
}

impl<T> Clone for UpdateSnapshot<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            success: self.success,
        }
    }
}

/// Identifies one registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<T> = Arc<dyn Fn(&UpdateSnapshot<T>) + Send + Sync>;
type RefreshFuture = Shared<BoxFuture<'static, UpdateResult<()>>>;

/// Mutable coordinator state, guarded by one mutex
struct CoordinatorCore<T> {
    data: Option<Arc<T>>,
    state: CoordinatorState,
    last_update_success: bool,
    last_updated: Option<DateTime<Utc>>,
    last_error: Option<UpdateError>,
    consecutive_failures: u32,
    /// Single-flight guard: the refresh cycle currently running, if any
    in_flight: Option<RefreshFuture>,
    /// Armed interval timer, present only while listeners exist
    timer: Option<JoinHandle<()>>,
}

struct Inner<T: Send + Sync + 'static> {
    name: String,
    source: Arc<dyn UpdateSource<Data = T>>,
    update_interval: Duration,
    fetch_timeout: Option<Duration>,
    listeners: DashMap<ListenerId, Listener<T>>,
    next_listener_id: AtomicU64,
    debounced_refresh: OnceLock<Debouncer>,
    core: Mutex<CoordinatorCore<T>>,
}

impl<T: Send + Sync + 'static> Inner<T> {
    fn core(&self) -> MutexGuard<'_, CoordinatorCore<T>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, core: &mut CoordinatorCore<T>, to: CoordinatorState) {
        match core.state.try_transition(to) {
            Ok(next) => core.state = next,
            Err(err) => debug!(coordinator = %self.name, %err, "transition skipped"),
        }
    }

    /// Start a refresh cycle, or join the one already in flight
    fn begin_refresh(self: &Arc<Self>) -> UpdateResult<RefreshFuture> {
        let mut core = self.core();
        if core.state.is_stopped() {
            return Err(UpdateError::Stopped);
        }
        if let Some(in_flight) = &core.in_flight {
            debug!(coordinator = %self.name, "joining in-flight refresh");
            return Ok(in_flight.clone());
        }

        let this = Arc::clone(self);
        let cycle: RefreshFuture = async move { this.run_cycle().await }.boxed().shared();
        core.in_flight = Some(cycle.clone());
        Ok(cycle)
    }

    async fn run_cycle(self: Arc<Self>) -> UpdateResult<()> {
        {
            let mut core = self.core();
            if core.state.is_stopped() {
                core.in_flight = None;
                return Err(UpdateError::Stopped);
            }
            self.transition(&mut core, CoordinatorState::Refreshing);
        }

        let result = match self.fetch_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.source.fetch()).await {
                Ok(result) => result,
                Err(_) => Err(UpdateError::Timeout(limit)),
            },
            None => self.source.fetch().await,
        };

        let (snapshot, outcome) = {
            let mut core = self.core();
            if core.state.is_stopped() {
                // shut down while the fetch was in flight: discard the result
                core.in_flight = None;
                return Err(UpdateError::Stopped);
            }
            match result {
                Ok(data) => {
                    let data = Arc::new(data);
                    if !core.last_update_success {
                        info!("Fetching {} data recovered", self.name);
                    }
                    core.data = Some(Arc::clone(&data));
                    core.last_updated = Some(Utc::now());
                    core.last_update_success = true;
                    core.consecutive_failures = 0;
                    core.last_error = None;
                    self.transition(&mut core, CoordinatorState::Success);
                    (
                        UpdateSnapshot {
                            data: Some(data),
                            success: true,
                        },
                        Ok(()),
                    )
                }
                Err(err) => {
                    self.log_failure(&core, &err);
                    core.last_update_success = false;
                    core.consecutive_failures += 1;
                    core.last_error = Some(err.clone());
                    self.transition(&mut core, CoordinatorState::Failed);
                    (
                        UpdateSnapshot {
                            data: core.data.clone(),
                            success: false,
                        },
                        Err(err),
                    )
                }
            }
        };

        // fan out with no lock held, so listeners may query the coordinator
        let listeners: Vec<Listener<T>> = self.listeners.iter().map(|l| l.value().clone()).collect();
        for listener in &listeners {
            listener(&snapshot);
        }

        // cycle complete: release the single-flight guard and push the next
        // scheduled poll a full interval out
        {
            let mut core = self.core();
            core.in_flight = None;
            if let Some(timer) = core.timer.take() {
                timer.abort();
            }
        }
        self.arm_timer();

        outcome
    }

    /// First consecutive failure logs at warn (error for auth), the rest at
    /// debug, so a flapping source cannot flood the log
    fn log_failure(&self, core: &CoordinatorCore<T>, err: &UpdateError) {
        if core.last_update_success {
            if err.is_auth() {
                error!("Authentication failed while fetching {} data: {}", self.name, err);
            } else {
                warn!("Error fetching {} data: {}", self.name, err);
            }
        } else {
            debug!("Error fetching {} data: {}", self.name, err);
        }
    }

    /// Arm the interval timer if listeners exist and it is not already armed
    fn arm_timer(self: &Arc<Self>) {
        let mut core = self.core();
        if core.state.is_stopped() || core.timer.is_some() || self.listeners.is_empty() {
            return;
        }

        let weak = Arc::downgrade(self);
        let interval = self.update_interval;
        core.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else { return };
            {
                let mut core = inner.core();
                core.timer = None;
            }
            if let Ok(cycle) = inner.begin_refresh() {
                // outcome already recorded and logged by the cycle itself
                let _ = cycle.await;
            }
        }));
    }

    fn disarm_timer(&self) {
        let mut core = self.core();
        if let Some(timer) = core.timer.take() {
            timer.abort();
        }
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(&id);
        if self.listeners.is_empty() {
            debug!(coordinator = %self.name, "last listener gone, polling disarmed");
            self.disarm_timer();
        }
    }

    fn shutdown(&self) {
        if let Some(debouncer) = self.debounced_refresh.get() {
            debouncer.shutdown();
        }
        let mut core = self.core();
        if let Some(timer) = core.timer.take() {
            timer.abort();
        }
        self.transition(&mut core, CoordinatorState::Stopped);
        debug!(coordinator = %self.name, "coordinator stopped");
    }
}

/// Builds a [`PollingCoordinator`] with optional fetch timeout and
/// request-refresh cooldown overrides
pub struct CoordinatorBuilder<T: Send + Sync + 'static> {
    name: String,
    source: Arc<dyn UpdateSource<Data = T>>,
    update_interval: Duration,
    fetch_timeout: Option<Duration>,
    request_cooldown: Duration,
}

impl<T: Send + Sync + 'static> CoordinatorBuilder<T> {
    /// Treat fetches running longer than this as failed
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Override the [`REQUEST_REFRESH_COOLDOWN`] coalescing window
    pub fn request_cooldown(mut self, cooldown: Duration) -> Self {
        self.request_cooldown = cooldown;
        self
    }

    pub fn build(self) -> PollingCoordinator<T> {
        let inner = Arc::new(Inner {
            name: self.name,
            source: self.source,
            update_interval: self.update_interval,
            fetch_timeout: self.fetch_timeout,
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(1),
            debounced_refresh: OnceLock::new(),
            core: Mutex::new(CoordinatorCore {
                data: None,
                state: CoordinatorState::Uninitialized,
                // starts optimistic so the very first failure logs at warn
                last_update_success: true,
                last_updated: None,
                last_error: None,
                consecutive_failures: 0,
                in_flight: None,
                timer: None,
            }),
        });

        let weak = Arc::downgrade(&inner);
        let refresh_fn: DebouncedFn = Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    if let Ok(cycle) = inner.begin_refresh() {
                        let _ = cycle.await;
                    }
                }
            }
            .boxed()
        });
        let _ = inner
            .debounced_refresh
            .set(Debouncer::new(self.request_cooldown, false, refresh_fn));

        PollingCoordinator { inner }
    }
}

/// Polls one external source and fans results out to subscribed entities
///
/// Cheap to clone; all clones share the same underlying coordinator.
pub struct PollingCoordinator<T: Send + Sync + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + Sync + 'static> Clone for PollingCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> PollingCoordinator<T> {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn UpdateSource<Data = T>>,
        update_interval: Duration,
    ) -> Self {
        Self::builder(name, source, update_interval).build()
    }

    pub fn builder(
        name: impl Into<String>,
        source: Arc<dyn UpdateSource<Data = T>>,
        update_interval: Duration,
    ) -> CoordinatorBuilder<T> {
        CoordinatorBuilder {
            name: name.into(),
            source,
            update_interval,
            fetch_timeout: None,
            request_cooldown: REQUEST_REFRESH_COOLDOWN,
        }
    }

    /// Refresh now, regardless of the timer
    ///
    /// Concurrent callers share a single underlying fetch: whoever arrives
    /// while a cycle is running awaits that cycle's outcome instead of
    /// triggering another network call.
    pub async fn refresh(&self) -> UpdateResult<()> {
        let cycle = self.inner.begin_refresh()?;
        cycle.await
    }

    /// Blocking first refresh for integration setup
    ///
    /// Unlike the steady-state path, the fetch error is handed straight back
    /// so setup can fail fast (and distinguish auth failures) instead of
    /// loading an integration whose source was never reachable.
    pub async fn first_refresh(&self) -> UpdateResult<()> {
        self.refresh().await
    }

    /// Debounced refresh for entity-triggered updates
    ///
    /// Bursts of requests inside the cooldown window collapse into one
    /// trailing fetch. Errors are recorded on the coordinator, not returned.
    pub async fn request_refresh(&self) {
        if let Some(debouncer) = self.inner.debounced_refresh.get() {
            debouncer.call().await;
        }
    }

    /// Subscribe to refresh outcomes
    ///
    /// The first listener arms the interval timer; dropping the returned
    /// handle unsubscribes, and removing the last listener disarms polling.
    pub fn add_listener(
        &self,
        listener: impl Fn(&UpdateSnapshot<T>) + Send + Sync + 'static,
    ) -> UpdateResult<ListenerHandle> {
        if self.inner.core().state.is_stopped() {
            return Err(UpdateError::Stopped);
        }

        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst));
        self.inner.listeners.insert(id, Arc::new(listener));
        self.inner.arm_timer();

        let weak = Arc::downgrade(&self.inner);
        Ok(ListenerHandle {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.remove_listener(id);
                }
            })),
        })
    }

    /// Stop polling and refuse further refreshes; used at integration unload
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn update_interval(&self) -> Duration {
        self.inner.update_interval
    }

    /// Latest successfully fetched data, if any cycle has succeeded
    pub fn data(&self) -> Option<Arc<T>> {
        self.inner.core().data.clone()
    }

    /// False while the source is unreachable; bound entities report
    /// themselves unavailable from this flag
    pub fn last_update_success(&self) -> bool {
        self.inner.core().last_update_success
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.inner.core().last_updated
    }

    pub fn last_error(&self) -> Option<UpdateError> {
        self.inner.core().last_error.clone()
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.core().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.core().consecutive_failures
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Whether the interval timer is currently armed
    pub fn polling_scheduled(&self) -> bool {
        self.inner.core().timer.is_some()
    }
}

/// Listener deregistration handle; dropping it removes the listener
pub struct ListenerHandle {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    /// Deregister now instead of at drop time
    pub fn unlisten(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").finish_non_exhaustive()
    }
}
