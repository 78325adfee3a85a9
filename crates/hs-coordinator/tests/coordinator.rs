//! Behavioral tests for the polling coordinator: single-flight refresh,
//! listener fan-out, lazy scheduling, failure semantics and shutdown.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hs_coordinator::{
    CoordinatorState, PollingCoordinator, UpdateError, UpdateResult, UpdateSource,
};
use tokio::sync::Semaphore;

/// Returns successive outcomes from a script; counts fetches
struct ScriptedSource {
    calls: AtomicU32,
    script: Mutex<VecDeque<UpdateResult<u32>>>,
}

impl ScriptedSource {
    fn new(script: impl IntoIterator<Item = UpdateResult<u32>>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            script: Mutex::new(script.into_iter().collect()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpdateSource for ScriptedSource {
    type Data = u32;

    async fn fetch(&self) -> UpdateResult<u32> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.script.lock().unwrap().pop_front();
        // past the end of the script, return the call ordinal
        scripted.unwrap_or(Ok(n))
    }
}

/// Blocks every fetch until the test releases a permit
struct GatedSource {
    calls: AtomicU32,
    gate: Semaphore,
}

impl GatedSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            gate: Semaphore::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpdateSource for GatedSource {
    type Data = u32;

    async fn fetch(&self) -> UpdateResult<u32> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| UpdateError::failed("gate closed"))?;
        permit.forget();
        Ok(n)
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn concurrent_refreshes_share_one_fetch() {
    let source = GatedSource::new();
    let coordinator =
        PollingCoordinator::new("gated", source.clone(), Duration::from_secs(60));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let coordinator = coordinator.clone();
        tasks.push(tokio::spawn(async move { coordinator.refresh().await }));
    }
    settle().await;

    // all four callers are waiting on the same in-flight fetch
    assert_eq!(source.calls(), 1);

    source.gate.add_permits(1);
    for task in tasks {
        assert_eq!(task.await.unwrap(), Ok(()));
    }
    assert_eq!(source.calls(), 1);
    assert_eq!(coordinator.data().as_deref(), Some(&1));

    // the guard is released: a later refresh fetches again
    source.gate.add_permits(1);
    coordinator.refresh().await.unwrap();
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn listeners_notified_exactly_once_per_refresh() {
    let source = ScriptedSource::new([Ok(42)]);
    let coordinator =
        PollingCoordinator::new("scripted", source.clone(), Duration::from_secs(60));

    let seen_a: Arc<Mutex<Vec<u32>>> = Arc::default();
    let seen_b: Arc<Mutex<Vec<u32>>> = Arc::default();

    let push_into = |seen: Arc<Mutex<Vec<u32>>>| {
        move |snap: &hs_coordinator::UpdateSnapshot<u32>| {
            let value = snap.data.as_deref().copied().unwrap();
            seen.lock().unwrap().push(value);
        }
    };
    let _handle_a = coordinator.add_listener(push_into(seen_a.clone())).unwrap();
    let _handle_b = coordinator.add_listener(push_into(seen_b.clone())).unwrap();

    coordinator.refresh().await.unwrap();

    assert_eq!(*seen_a.lock().unwrap(), vec![42]);
    assert_eq!(*seen_b.lock().unwrap(), vec![42]);
}

#[tokio::test]
async fn failure_keeps_data_and_marks_unavailable() {
    let source = ScriptedSource::new([
        Ok(10),
        Err(UpdateError::failed("connection refused")),
        Ok(11),
    ]);
    let coordinator =
        PollingCoordinator::new("flaky", source.clone(), Duration::from_secs(60));

    let outcomes: Arc<Mutex<Vec<(Option<u32>, bool)>>> = Arc::default();
    let _handle = {
        let outcomes = outcomes.clone();
        coordinator
            .add_listener(move |snap| {
                outcomes
                    .lock()
                    .unwrap()
                    .push((snap.data.as_deref().copied(), snap.success));
            })
            .unwrap()
    };

    coordinator.refresh().await.unwrap();
    assert!(coordinator.last_update_success());
    assert_eq!(coordinator.state(), CoordinatorState::Success);
    assert!(coordinator.last_updated().is_some());

    let err = coordinator.refresh().await.unwrap_err();
    assert_eq!(err, UpdateError::failed("connection refused"));
    // previous data retained, but flagged unavailable
    assert_eq!(coordinator.data().as_deref(), Some(&10));
    assert!(!coordinator.last_update_success());
    assert_eq!(coordinator.state(), CoordinatorState::Failed);
    assert_eq!(coordinator.consecutive_failures(), 1);
    assert_eq!(coordinator.last_error(), Some(err));

    coordinator.refresh().await.unwrap();
    assert!(coordinator.last_update_success());
    assert_eq!(coordinator.consecutive_failures(), 0);
    assert!(coordinator.last_error().is_none());

    // listeners saw the failed cycle too, with the retained data
    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![(Some(10), true), (Some(10), false), (Some(11), true)]
    );
}

#[tokio::test(start_paused = true)]
async fn polling_only_runs_while_listeners_exist() {
    let source = ScriptedSource::new([]);
    let coordinator =
        PollingCoordinator::new("lazy", source.clone(), Duration::from_secs(30));

    // nothing subscribes: no polling at all
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(source.calls(), 0);
    assert!(!coordinator.polling_scheduled());

    // first listener arms the timer
    let handle = coordinator.add_listener(|_| {}).unwrap();
    assert!(coordinator.polling_scheduled());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(source.calls(), 1);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(source.calls(), 2);

    // last listener gone: polling stops
    handle.unlisten();
    assert!(!coordinator.polling_scheduled());
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(source.calls(), 2);

    // resubscribing arms it again
    let _handle = coordinator.add_listener(|_| {}).unwrap();
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(source.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn manual_refresh_pushes_next_poll_a_full_interval_out() {
    let source = ScriptedSource::new([]);
    let coordinator =
        PollingCoordinator::new("rearm", source.clone(), Duration::from_secs(30));
    let _handle = coordinator.add_listener(|_| {}).unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;
    coordinator.refresh().await.unwrap();
    assert_eq!(source.calls(), 1);

    // the old tick at t=30 was cancelled; next poll is t=50
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(source.calls(), 1);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn first_refresh_failure_propagates_to_setup() {
    let source = ScriptedSource::new([Err(UpdateError::failed("host unreachable"))]);
    let coordinator = PollingCoordinator::new("dead", source, Duration::from_secs(60));

    let err = coordinator.first_refresh().await.unwrap_err();
    assert!(err.is_transient());
    assert!(coordinator.data().is_none());
}

#[tokio::test]
async fn auth_failure_is_a_distinct_kind() {
    let source = ScriptedSource::new([Err(UpdateError::auth_failed("token expired"))]);
    let coordinator = PollingCoordinator::new("locked_out", source, Duration::from_secs(60));

    let err = coordinator.first_refresh().await.unwrap_err();
    assert!(err.is_auth());
    assert!(!err.is_transient());
}

#[tokio::test(start_paused = true)]
async fn fetch_timeout_counts_as_transient_failure() {
    let source = GatedSource::new();
    let coordinator =
        PollingCoordinator::builder("slowpoke", source.clone(), Duration::from_secs(60))
            .fetch_timeout(Duration::from_secs(10))
            .build();

    // the gate never opens, so the fetch hangs until the timeout fires
    let err = coordinator.refresh().await.unwrap_err();
    assert_eq!(err, UpdateError::Timeout(Duration::from_secs(10)));
    assert!(!coordinator.last_update_success());
}

#[tokio::test(start_paused = true)]
async fn request_refresh_coalesces_bursts() {
    let source = ScriptedSource::new([]);
    let coordinator =
        PollingCoordinator::builder("bursty", source.clone(), Duration::from_secs(60))
            .request_cooldown(Duration::from_millis(100))
            .build();

    for _ in 0..5 {
        coordinator.request_refresh().await;
    }
    assert_eq!(source.calls(), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(source.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_everything() {
    let source = ScriptedSource::new([]);
    let coordinator =
        PollingCoordinator::new("doomed", source.clone(), Duration::from_secs(30));
    let _handle = coordinator.add_listener(|_| {}).unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(source.calls(), 1);

    coordinator.shutdown();
    assert_eq!(coordinator.state(), CoordinatorState::Stopped);
    assert!(!coordinator.polling_scheduled());

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(source.calls(), 1);

    assert_eq!(coordinator.refresh().await, Err(UpdateError::Stopped));
    assert!(matches!(
        coordinator.add_listener(|_| {}),
        Err(UpdateError::Stopped)
    ));
}

#[tokio::test]
async fn shutdown_during_inflight_fetch_discards_result() {
    let source = GatedSource::new();
    let coordinator =
        PollingCoordinator::new("interrupted", source.clone(), Duration::from_secs(60));

    let task = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.refresh().await })
    };
    settle().await;
    assert_eq!(source.calls(), 1);

    coordinator.shutdown();
    source.gate.add_permits(1);

    assert_eq!(task.await.unwrap(), Err(UpdateError::Stopped));
    assert!(coordinator.data().is_none());
}

mod logging {
    use super::*;
    use tracing_subscriber::fmt::MakeWriter;

    /// Collects formatted log output for assertions
    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for LogCapture {
        type Writer = LogCapture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn consecutive_failures_warn_only_once() {
        let capture = LogCapture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(capture.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let source = ScriptedSource::new([
            Err(UpdateError::failed("refused")),
            Err(UpdateError::failed("refused")),
            Err(UpdateError::failed("refused")),
            Ok(1),
            Err(UpdateError::failed("refused")),
        ]);
        let coordinator =
            PollingCoordinator::new("weather", source, Duration::from_secs(60));

        for _ in 0..3 {
            let _ = coordinator.refresh().await;
        }

        let logs = capture.contents();
        let warns = logs
            .lines()
            .filter(|l| l.contains("WARN") && l.contains("Error fetching weather data"))
            .count();
        assert_eq!(warns, 1, "only the first consecutive failure warns:\n{logs}");

        // recovery logs at info, and the next failure warns again
        coordinator.refresh().await.unwrap();
        let _ = coordinator.refresh().await;

        let logs = capture.contents();
        assert!(logs.contains("Fetching weather data recovered"));
        let warns = logs
            .lines()
            .filter(|l| l.contains("WARN") && l.contains("Error fetching weather data"))
            .count();
        assert_eq!(warns, 2, "a failure after recovery warns anew:\n{logs}");
    }

    #[tokio::test]
    async fn auth_failures_log_at_error_level() {
        let capture = LogCapture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(capture.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let source = ScriptedSource::new([Err(UpdateError::auth_failed("token expired"))]);
        let coordinator = PollingCoordinator::new("cloud", source, Duration::from_secs(60));
        let _ = coordinator.refresh().await;

        let logs = capture.contents();
        assert!(logs
            .lines()
            .any(|l| l.contains("ERROR") && l.contains("Authentication failed")));
    }
}
