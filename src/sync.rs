//! Sync Job Controller.
//!
//! One [`SyncJob::run`] is a full cycle: validate the stored configuration,
//! build a snapshot (retrying while the health store is unreachable),
//! cache it, publish it, then record the outcome. State is written only
//! once a cycle completes, so a cancelled cycle leaves it untouched.

use chrono::{Local, TimeZone, Utc};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::Publisher;
use crate::data::Category;
use crate::snapshot::SnapshotBuilder;
use crate::source::SourceError;
use crate::state::{LastError, LoginConfig, StateStore};
use crate::time::now_ms;

const UNKNOWN_ERROR: &str = "Unknown error";

/// Linear backoff: the wait after attempt `n` is `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Periodic trigger for [`SyncJob::run`] whose period may change between
/// ticks. The first tick fires immediately.
pub struct SyncSchedule {
    period: Duration,
    interval: Interval,
}

impl SyncSchedule {
    pub fn new(period: Duration) -> Self {
        Self::starting_at(Instant::now(), period)
    }

    fn starting_at(start: Instant, period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { period, interval }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Switches to `period`, counting from now. Returns whether it changed.
    pub fn retune(&mut self, period: Duration) -> bool {
        if period == self.period {
            return false;
        }
        *self = Self::starting_at(Instant::now() + period, period);
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("Home Assistant error: {0}")]
    Publish(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Fatal,
}

/// Only an unreachable health store is worth another attempt.
pub fn classify(error: &JobError) -> ErrorKind {
    match error {
        JobError::Source(SourceError::Unavailable(_)) => ErrorKind::Transient,
        JobError::Source(SourceError::Query { .. }) | JobError::Publish(_) | JobError::Other(_) => {
            ErrorKind::Fatal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Validating,
    Aggregating { attempt: u32 },
    Publishing,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AutoSyncDisabled,
    LoginNotConfigured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Nothing to do; counts as success.
    Skipped(SkipReason),
    Synced { at_ms: i64 },
    Failed { message: String, attempts: u32 },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, JobOutcome::Failed { .. })
    }
}

/// Told about every successful publish, e.g. to refresh a status widget.
pub trait SyncObserver: Send + Sync {
    fn on_synced(&self, at_ms: i64);
}

pub struct SyncJob<Tz: TimeZone = Local> {
    store: Arc<dyn StateStore>,
    builder: SnapshotBuilder<Tz>,
    publisher: Arc<dyn Publisher>,
    retry: RetryPolicy,
    observer: Option<Arc<dyn SyncObserver>>,
    phase: watch::Sender<SyncPhase>,
}

impl<Tz> SyncJob<Tz>
where
    Tz: TimeZone + Send + Sync,
    Tz::Offset: Display + Send + Sync,
{
    pub fn new(
        store: Arc<dyn StateStore>,
        builder: SnapshotBuilder<Tz>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            store,
            builder,
            publisher,
            retry: RetryPolicy::default(),
            observer: None,
            phase,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Runs a cycle unless `cancel` fires first; `None` means cancelled.
    pub async fn run_until_cancelled(&self, cancel: &CancellationToken) -> Option<JobOutcome> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("sync cancelled");
                self.set_phase(SyncPhase::Idle);
                None
            }
            outcome = self.run() => Some(outcome),
        }
    }

    pub async fn run(&self) -> JobOutcome {
        self.set_phase(SyncPhase::Validating);

        let state = match self.store.load() {
            Ok(state) => state,
            Err(err) => return self.fail(JobError::Other(err), 0),
        };

        if !state.auto_sync {
            info!("auto sync disabled, skipping");
            return self.skip(SkipReason::AutoSyncDisabled);
        }
        let Some(login) = state.login() else {
            info!("login not configured, skipping");
            return self.skip(SkipReason::LoginNotConfigured);
        };

        let enabled = state.enabled();
        let days = state.sync_days();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(&login, &enabled, days, attempt).await {
                Ok(()) => return self.succeed(),
                Err(err) => {
                    let retry = classify(&err) == ErrorKind::Transient
                        && attempt < self.retry.max_attempts;
                    if !retry {
                        return self.fail(err, attempt);
                    }

                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "health store unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt(
        &self,
        login: &LoginConfig,
        enabled: &BTreeSet<Category>,
        days: i64,
        attempt: u32,
    ) -> Result<(), JobError> {
        self.set_phase(SyncPhase::Aggregating { attempt });
        let snapshot = self.builder.build(enabled, days, Utc::now()).await?;

        if let Err(err) = self.store.save_snapshot(&snapshot) {
            warn!(error = %err, "failed to cache snapshot");
        }

        self.set_phase(SyncPhase::Publishing);
        let outcome = self
            .publisher
            .publish(&snapshot, &login.sensor_id, &login.base_url, &login.token)
            .await;
        if outcome.success {
            Ok(())
        } else {
            Err(JobError::Publish(outcome.message))
        }
    }

    fn skip(&self, reason: SkipReason) -> JobOutcome {
        self.set_phase(SyncPhase::Succeeded);
        JobOutcome::Skipped(reason)
    }

    fn succeed(&self) -> JobOutcome {
        let at_ms = now_ms();
        if let Err(err) = self.store.record_success(at_ms) {
            error!(error = %err, "failed to record sync success");
        }
        if let Some(observer) = &self.observer {
            observer.on_synced(at_ms);
        }
        info!(at_ms, "sync succeeded");
        self.set_phase(SyncPhase::Succeeded);
        JobOutcome::Synced { at_ms }
    }

    fn fail(&self, err: JobError, attempts: u32) -> JobOutcome {
        let message = match err.to_string() {
            m if m.trim().is_empty() => UNKNOWN_ERROR.to_string(),
            m => m,
        };
        error!(attempts, error = %message, "sync failed");

        let last_error = LastError {
            timestamp: now_ms(),
            message: message.clone(),
        };
        if let Err(err) = self.store.record_failure(last_error) {
            error!(error = %err, "failed to record sync failure");
        }
        self.set_phase(SyncPhase::Failed);
        JobOutcome::Failed { message, attempts }
    }

    fn set_phase(&self, phase: SyncPhase) {
        debug!(?phase, "sync phase");
        self.phase.send_replace(phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(2), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_picks_up_a_new_period() {
        let started = Instant::now();
        let mut schedule = SyncSchedule::new(Duration::from_secs(900));

        schedule.tick().await;
        assert_eq!(started.elapsed(), Duration::ZERO);

        assert!(!schedule.retune(Duration::from_secs(900)));
        assert!(schedule.retune(Duration::from_secs(1800)));
        assert_eq!(schedule.period(), Duration::from_secs(1800));

        schedule.tick().await;
        assert_eq!(started.elapsed(), Duration::from_secs(1800));
        schedule.tick().await;
        assert_eq!(started.elapsed(), Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_period_keeps_the_countdown() {
        let started = Instant::now();
        let mut schedule = SyncSchedule::new(Duration::from_secs(900));
        schedule.tick().await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(!schedule.retune(Duration::from_secs(900)));
        schedule.tick().await;
        assert_eq!(started.elapsed(), Duration::from_secs(900));
    }

    #[test]
    fn only_unavailable_source_is_transient() {
        let unavailable = JobError::Source(SourceError::Unavailable("binder died".into()));
        assert_eq!(classify(&unavailable), ErrorKind::Transient);

        let query = JobError::Source(SourceError::Query {
            category: Category::Sleep,
            message: "denied".into(),
        });
        assert_eq!(classify(&query), ErrorKind::Fatal);
        assert_eq!(
            classify(&JobError::Publish("500 Internal Server Error".into())),
            ErrorKind::Fatal
        );
        assert_eq!(
            classify(&JobError::Other(anyhow::anyhow!("disk full"))),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn publish_error_message() {
        let err = JobError::Publish("401 Unauthorized".into());
        assert_eq!(err.to_string(), "Home Assistant error: 401 Unauthorized");
    }

    #[test]
    fn skipped_counts_as_success() {
        assert!(JobOutcome::Skipped(SkipReason::AutoSyncDisabled).is_success());
        assert!(JobOutcome::Synced { at_ms: 1 }.is_success());
        assert!(!JobOutcome::Failed {
            message: "x".into(),
            attempts: 1
        }
        .is_success());
    }
}
