use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use healthsync::data::{Category, HealthSnapshot, RecordBatch, StepsRecord};
use healthsync::state::LastError;
use healthsync::sync::{SkipReason, SyncPhase};
use healthsync::time::TimeWindow;
use healthsync::{
    HomeAssistantClient, JobOutcome, MemoryStore, MetricSource, PublishOutcome, Publisher,
    SnapshotBuilder, SourceError, StateStore, SyncJob, SyncObserver, SyncState,
};

/// Health store that is down for the first `failures` steps queries.
struct FlakySource {
    failures: u32,
    steps_queries: AtomicU32,
}

impl FlakySource {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            steps_queries: AtomicU32::new(0),
        }
    }

    fn always_down() -> Self {
        Self::new(u32::MAX)
    }
}

#[async_trait]
impl MetricSource for FlakySource {
    async fn query(&self, category: Category, window: TimeWindow) -> Result<RecordBatch, SourceError> {
        if category != Category::Steps {
            return Err(SourceError::Query {
                category,
                message: "not exported".into(),
            });
        }
        let seen = self.steps_queries.fetch_add(1, Ordering::SeqCst);
        if seen < self.failures {
            return Err(SourceError::Unavailable("binder transaction failed".into()));
        }
        Ok(RecordBatch::Steps(vec![StepsRecord {
            start: window.end - chrono::Duration::hours(2),
            end: window.end - chrono::Duration::hours(1),
            count: 4200,
        }]))
    }
}

#[derive(Default)]
struct FakePublisher {
    calls: AtomicU32,
    reject_with: Option<String>,
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish(
        &self,
        _snapshot: &HealthSnapshot,
        _sensor_id: &str,
        _base_url: &str,
        _token: &str,
    ) -> PublishOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reject_with {
            Some(message) => PublishOutcome {
                success: false,
                message: message.clone(),
            },
            None => PublishOutcome {
                success: true,
                message: "200 OK".into(),
            },
        }
    }
}

#[derive(Default)]
struct CountingObserver(AtomicU32);

impl SyncObserver for CountingObserver {
    fn on_synced(&self, _at_ms: i64) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn logged_in(url: &str) -> SyncState {
    SyncState {
        url: Some(url.to_string()),
        token: Some("secret".into()),
        sensor: Some("phone_health".into()),
        ..Default::default()
    }
}

fn job(
    store: Arc<MemoryStore>,
    source: Arc<dyn MetricSource>,
    publisher: Arc<dyn Publisher>,
) -> SyncJob {
    SyncJob::new(store, SnapshotBuilder::local(source), publisher)
}

#[tokio::test(start_paused = true)]
async fn transient_failure_exhausts_three_attempts() {
    let store = Arc::new(MemoryStore::new(logged_in("http://hub.local:8123")));
    let source = Arc::new(FlakySource::always_down());
    let publisher = Arc::new(FakePublisher::default());
    let job = job(store.clone(), source.clone(), publisher.clone());

    let started = tokio::time::Instant::now();
    let outcome = job.run().await;
    let elapsed = started.elapsed();

    match outcome {
        JobOutcome::Failed { message, attempts } => {
            assert_eq!(attempts, 3);
            assert!(message.contains("binder transaction failed"), "{}", message);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(source.steps_queries.load(Ordering::SeqCst), 3);
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
    // 1000ms after the first attempt, 2000ms after the second, none after the last.
    assert!(elapsed >= Duration::from_millis(3000), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(4000), "{:?}", elapsed);

    let state = store.load().unwrap();
    assert!(state.last_error.is_some());
    assert!(state.last_sync.is_none());
    assert_eq!(*job.subscribe().borrow(), SyncPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn recovers_when_store_comes_back() {
    let store = Arc::new(MemoryStore::new(logged_in("http://hub.local:8123")));
    let source = Arc::new(FlakySource::new(1));
    let publisher = Arc::new(FakePublisher::default());
    let observer = Arc::new(CountingObserver::default());
    let job = job(store.clone(), source.clone(), publisher.clone()).with_observer(observer.clone());

    let outcome = job.run().await;

    assert!(matches!(outcome, JobOutcome::Synced { .. }));
    assert_eq!(source.steps_queries.load(Ordering::SeqCst), 2);
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(observer.0.load(Ordering::SeqCst), 1);

    let cached = store.load_snapshot().unwrap().unwrap();
    assert_eq!(cached.steps().unwrap().values().next().unwrap().total, 4200);
}

#[tokio::test]
async fn auto_sync_disabled_is_a_silent_success() {
    let previous = LastError {
        timestamp: 1234,
        message: "Home Assistant error: 401 Unauthorized".into(),
    };
    let store = Arc::new(MemoryStore::new(SyncState {
        auto_sync: false,
        last_error: Some(previous.clone()),
        ..logged_in("http://hub.local:8123")
    }));
    let source = Arc::new(FlakySource::new(0));
    let publisher = Arc::new(FakePublisher::default());
    let job = job(store.clone(), source.clone(), publisher.clone());

    let outcome = job.run().await;

    assert_eq!(outcome, JobOutcome::Skipped(SkipReason::AutoSyncDisabled));
    assert!(outcome.is_success());
    assert_eq!(source.steps_queries.load(Ordering::SeqCst), 0);
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.load().unwrap().last_error, Some(previous));
}

#[tokio::test]
async fn missing_login_is_skipped() {
    let store = Arc::new(MemoryStore::new(SyncState {
        sensor: None,
        ..logged_in("http://hub.local:8123")
    }));
    let publisher = Arc::new(FakePublisher::default());
    let job = job(store.clone(), Arc::new(FlakySource::new(0)), publisher.clone());

    let outcome = job.run().await;

    assert_eq!(outcome, JobOutcome::Skipped(SkipReason::LoginNotConfigured));
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
    assert!(store.load().unwrap().last_error.is_none());
}

#[tokio::test]
async fn rejected_publish_is_not_retried_but_snapshot_stays_cached() {
    let store = Arc::new(MemoryStore::new(logged_in("http://hub.local:8123")));
    let publisher = Arc::new(FakePublisher {
        reject_with: Some("503 Service Unavailable".into()),
        ..Default::default()
    });
    let job = job(store.clone(), Arc::new(FlakySource::new(0)), publisher.clone());

    let outcome = job.run().await;

    assert_eq!(
        outcome,
        JobOutcome::Failed {
            message: "Home Assistant error: 503 Service Unavailable".into(),
            attempts: 1,
        }
    );
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    assert!(store.load_snapshot().unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_leaves_state_alone() {
    let store = Arc::new(MemoryStore::new(logged_in("http://hub.local:8123")));
    let job = job(
        store.clone(),
        Arc::new(FlakySource::always_down()),
        Arc::new(FakePublisher::default()),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        trigger.cancel();
    });

    let outcome = job.run_until_cancelled(&cancel).await;

    assert!(outcome.is_none());
    let state = store.load().unwrap();
    assert!(state.last_error.is_none());
    assert!(state.last_sync.is_none());
    assert_eq!(*job.subscribe().borrow(), SyncPhase::Idle);
}

// ── Against a mock hub ──────────────────────────────────

#[tokio::test]
async fn server_error_fails_after_single_attempt() -> Result<()> {
    let hub = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/states/sensor.phone_health"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&hub)
        .await;

    let store = Arc::new(MemoryStore::new(logged_in(&hub.uri())));
    let source = Arc::new(FlakySource::new(0));
    let job = job(store.clone(), source.clone(), Arc::new(HomeAssistantClient::new()?));

    let outcome = job.run().await;

    match outcome {
        JobOutcome::Failed { message, attempts } => {
            assert_eq!(attempts, 1);
            assert!(message.contains("500 Internal Server Error"), "{}", message);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(source.steps_queries.load(Ordering::SeqCst), 1);

    let last_error = store.load()?.last_error.expect("last error recorded");
    assert_eq!(last_error.message, "Home Assistant error: 500 Internal Server Error");
    Ok(())
}

#[tokio::test]
async fn successful_publish_clears_last_error() -> Result<()> {
    let hub = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/states/sensor.phone_health"))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(json!({
            "state": "synced",
            "attributes": { "unavailable": ["sleep", "heart rate", "exercise",
                "oxygen saturation", "hydration record", "total calories", "body temperature"] }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&hub)
        .await;

    // Trailing slash on the base URL must not produce a double slash.
    let base = format!("{}/", hub.uri());
    let store = Arc::new(MemoryStore::new(SyncState {
        last_error: Some(LastError {
            timestamp: 1,
            message: "Home Assistant error: 500 Internal Server Error".into(),
        }),
        ..logged_in(&base)
    }));
    let job = job(
        store.clone(),
        Arc::new(FlakySource::new(0)),
        Arc::new(HomeAssistantClient::new()?),
    );

    let outcome = job.run().await;

    let at_ms = match outcome {
        JobOutcome::Synced { at_ms } => at_ms,
        other => panic!("expected success, got {:?}", other),
    };
    let state = store.load()?;
    assert!(state.last_error.is_none());
    assert_eq!(state.last_sync, Some(at_ms));
    Ok(())
}

#[tokio::test]
async fn check_reports_status_line() -> Result<()> {
    let hub = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/"))
        .and(header("authorization", "Bearer good"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&hub)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&hub)
        .await;

    let client = HomeAssistantClient::new()?;

    let ok = client.check(&hub.uri(), "good").await;
    assert!(ok.success);
    assert_eq!(ok.message, "200 OK");

    let denied = client.check(&hub.uri(), "bad").await;
    assert!(!denied.success);
    assert_eq!(denied.message, "401 Unauthorized");
    Ok(())
}

#[tokio::test]
async fn unreachable_hub_is_a_publish_failure() -> Result<()> {
    let store = Arc::new(MemoryStore::new(logged_in("http://127.0.0.1:9")));
    let job = job(
        store.clone(),
        Arc::new(FlakySource::new(0)),
        Arc::new(HomeAssistantClient::new()?),
    );

    let outcome = job.run().await;

    match outcome {
        JobOutcome::Failed { message, attempts } => {
            assert_eq!(attempts, 1);
            assert!(message.starts_with("Home Assistant error: "), "{}", message);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    Ok(())
}
