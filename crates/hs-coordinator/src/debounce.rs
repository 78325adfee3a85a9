//! Cooldown-window call coalescing
//!
//! A [`Debouncer`] wraps an async function and guarantees at most one
//! execution per cooldown window. Entities tend to request refreshes in
//! bursts (e.g. right after a service call touched several of them); the
//! debouncer collapses such a burst into a single trailing execution.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::trace;

/// The wrapped operation; must be callable repeatedly
pub type DebouncedFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct DebounceState {
    /// Cooldown timer task, present while a window is open
    timer: Option<JoinHandle<()>>,
    /// A call landed inside the window and wants a trailing execution
    pending: bool,
    stopped: bool,
}

struct Inner {
    cooldown: Duration,
    /// Leading-edge mode: run on the first call and coalesce the rest
    immediate: bool,
    function: DebouncedFn,
    state: Mutex<DebounceState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Coalesces calls to an async function into one per cooldown window
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<Inner>,
}

impl Debouncer {
    pub fn new(cooldown: Duration, immediate: bool, function: DebouncedFn) -> Self {
        Self {
            inner: Arc::new(Inner {
                cooldown,
                immediate,
                function,
                state: Mutex::new(DebounceState::default()),
            }),
        }
    }

    /// Request one execution
    ///
    /// Outside a cooldown window this runs immediately (leading edge) or
    /// schedules a trailing run, depending on the mode. Inside a window the
    /// call only marks the trailing run as wanted.
    pub async fn call(&self) {
        let run_now = {
            let mut state = self.inner.state();
            if state.stopped {
                return;
            }
            if state.timer.is_some() {
                trace!("call coalesced into open cooldown window");
                state.pending = true;
                return;
            }
            let run_now = self.inner.immediate;
            if !run_now {
                state.pending = true;
            }
            state.timer = Some(self.spawn_timer());
            run_now
        };

        if run_now {
            (self.inner.function)().await;
        }
    }

    /// Drive the cooldown window: execute the trailing call (if any), then
    /// keep the window open one more cooldown so back-to-back bursts still
    /// coalesce.
    fn spawn_timer(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let cooldown = self.inner.cooldown;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(cooldown).await;
                let Some(inner) = weak.upgrade() else { return };
                let rerun = {
                    let mut state = inner.state();
                    if state.stopped {
                        state.timer = None;
                        return;
                    }
                    if state.pending {
                        state.pending = false;
                        true
                    } else {
                        state.timer = None;
                        false
                    }
                };
                if !rerun {
                    return;
                }
                (inner.function)().await;
            }
        })
    }

    /// Drop any pending execution and refuse further calls
    pub fn shutdown(&self) {
        let mut state = self.inner.state();
        state.stopped = true;
        state.pending = false;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}
