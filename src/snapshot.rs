use chrono::{DateTime, Local, TimeZone, Utc};
use futures_util::future::join_all;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::aggregate;
use crate::data::{
    Category, CategorySummary, DayKey, HealthSnapshot, RecordBatch, SleepSession, SleepSummary,
};
use crate::source::{MetricSource, SourceError};
use crate::time::{self, TimeWindow};

/// Builds one [`HealthSnapshot`] per sync cycle from a [`MetricSource`].
///
/// Categories are queried concurrently and aggregated independently; the
/// snapshot lists them in category order whatever order they finish in.
pub struct SnapshotBuilder<Tz: TimeZone = Local> {
    source: Arc<dyn MetricSource>,
    tz: Tz,
}

impl SnapshotBuilder<Local> {
    pub fn local(source: Arc<dyn MetricSource>) -> Self {
        Self::new(source, Local)
    }
}

impl<Tz> SnapshotBuilder<Tz>
where
    Tz: TimeZone + Send + Sync,
    Tz::Offset: Display + Send + Sync,
{
    pub fn new(source: Arc<dyn MetricSource>, tz: Tz) -> Self {
        Self { source, tz }
    }

    /// Aggregates every enabled category over the last `window_days` days.
    ///
    /// A category that fails or yields nothing maps to `None` and, where it
    /// has one, adds its reason tag to `unavailable`. Only an unreachable
    /// health store aborts the build.
    pub async fn build(
        &self,
        enabled: &BTreeSet<Category>,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> Result<HealthSnapshot, SourceError> {
        let window = TimeWindow::last_days(now, window_days);
        debug!(
            categories = enabled.len(),
            start = %window.start,
            end = %window.end,
            "building health snapshot"
        );

        let results = join_all(
            enabled
                .iter()
                .map(|&category| self.collect(category, window, now)),
        )
        .await;

        let mut snapshot = HealthSnapshot::new(now.timestamp_millis());
        for (&category, result) in enabled.iter().zip(results) {
            let summary = match result {
                Ok(summary) => summary,
                Err(err @ SourceError::Unavailable(_)) => return Err(err),
                Err(err) => {
                    warn!(%category, error = %err, "category unavailable");
                    None
                }
            };

            if summary.is_none() {
                if let Some(reason) = category.unavailable_reason() {
                    snapshot.mark_unavailable(reason);
                }
            }
            snapshot.insert(category, summary);
        }

        Ok(snapshot)
    }

    fn day_key(&self, at: DateTime<Utc>) -> DayKey {
        time::day_key(&self.tz, at)
    }

    async fn collect(
        &self,
        category: Category,
        window: TimeWindow,
        now: DateTime<Utc>,
    ) -> Result<Option<CategorySummary>, SourceError> {
        if category == Category::Sleep {
            return self.collect_sleep(window, now).await;
        }

        let batch = self.source.query(category, window).await?;
        if batch.category() != category {
            return Err(mismatch(category, &batch));
        }
        Ok(self.summarize(batch))
    }

    fn summarize(&self, batch: RecordBatch) -> Option<CategorySummary> {
        let key = |at: DateTime<Utc>| self.day_key(at);
        let summary = match batch {
            RecordBatch::Sleep(sessions) => CategorySummary::Sleep(SleepSummary {
                last_sleep: None,
                days: aggregate::aggregate_sleep(&sessions, key),
            }),
            RecordBatch::HeartRate(r) => {
                CategorySummary::HeartRate(aggregate::aggregate_heart_rate(&r, key))
            }
            RecordBatch::Steps(r) => CategorySummary::Steps(aggregate::aggregate_steps(&r, key)),
            RecordBatch::Weight(r) => CategorySummary::Weight(aggregate::aggregate_weight(&r, key)),
            RecordBatch::Exercise(r) => {
                CategorySummary::Exercise(aggregate::aggregate_exercise(&r, key))
            }
            RecordBatch::OxygenSaturation(r) => {
                CategorySummary::OxygenSaturation(aggregate::aggregate_oxygen(&r, key))
            }
            RecordBatch::Hydration(r) => {
                CategorySummary::Hydration(aggregate::aggregate_hydration(&r, key))
            }
            RecordBatch::TotalCalories(r) => {
                CategorySummary::TotalCalories(aggregate::aggregate_calories(&r, key))
            }
            RecordBatch::BodyTemperature(r) => {
                CategorySummary::BodyTemperature(aggregate::aggregate_temperature(&r, key))
            }
        };

        (summary.day_count() > 0).then_some(summary)
    }

    /// Per-day sleep over the full window plus `lastSleep` from its own range.
    async fn collect_sleep(
        &self,
        window: TimeWindow,
        now: DateTime<Utc>,
    ) -> Result<Option<CategorySummary>, SourceError> {
        let sessions = self.query_sleep(window).await?;
        let last_night = self.last_night_sessions(now).await?;

        let summary = SleepSummary {
            last_sleep: aggregate::aggregate_last_sleep(&last_night),
            days: aggregate::aggregate_sleep(&sessions, |at| self.day_key(at)),
        };

        if summary.days.is_empty() && summary.last_sleep.is_none() {
            return Ok(None);
        }
        Ok(Some(CategorySummary::Sleep(summary)))
    }

    /// Sessions since 20:00 last evening, or failing that, sessions of today.
    async fn last_night_sessions(&self, now: DateTime<Utc>) -> Result<Vec<SleepSession>, SourceError> {
        let primary = time::last_night_window(&self.tz, now);
        match self.query_sleep(primary).await {
            Ok(sessions) if !sessions.is_empty() => return Ok(sessions),
            Ok(_) => {}
            Err(err @ SourceError::Unavailable(_)) => return Err(err),
            Err(err) => {
                warn!(error = %err, "last night's sleep unavailable");
                return Ok(Vec::new());
            }
        }

        let fallback = time::today_window(&self.tz, now);
        debug!(start = %fallback.start, "no sleep since last evening, falling back to today");
        match self.query_sleep(fallback).await {
            Ok(sessions) => Ok(sessions),
            Err(err @ SourceError::Unavailable(_)) => Err(err),
            Err(err) => {
                warn!(error = %err, "today's sleep unavailable");
                Ok(Vec::new())
            }
        }
    }

    async fn query_sleep(&self, window: TimeWindow) -> Result<Vec<SleepSession>, SourceError> {
        match self.source.query(Category::Sleep, window).await? {
            RecordBatch::Sleep(sessions) => Ok(sessions),
            other => Err(mismatch(Category::Sleep, &other)),
        }
    }
}

fn mismatch(category: Category, batch: &RecordBatch) -> SourceError {
    SourceError::Query {
        category,
        message: format!("source returned {} records", batch.category()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SleepStage, SleepStageType, StepsRecord};
    use async_trait::async_trait;
    use chrono::FixedOffset;
    use std::sync::Mutex;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    /// Serves canned sleep sessions and steps, recording sleep query windows.
    #[derive(Default)]
    struct FakeSource {
        sleep: Vec<SleepSession>,
        steps: Vec<StepsRecord>,
        failing: Vec<Category>,
        sleep_windows: Mutex<Vec<TimeWindow>>,
    }

    #[async_trait]
    impl MetricSource for FakeSource {
        async fn query(
            &self,
            category: Category,
            window: TimeWindow,
        ) -> Result<RecordBatch, SourceError> {
            if self.failing.contains(&category) {
                return Err(SourceError::Query {
                    category,
                    message: "permission denied".into(),
                });
            }
            Ok(match category {
                Category::Sleep => {
                    self.sleep_windows.lock().unwrap().push(window);
                    RecordBatch::Sleep(
                        self.sleep
                            .iter()
                            .filter(|s| window.overlaps(s.start, s.end))
                            .cloned()
                            .collect(),
                    )
                }
                Category::Steps => RecordBatch::Steps(self.steps.clone()),
                Category::HeartRate => RecordBatch::HeartRate(vec![]),
                Category::Hydration => RecordBatch::Hydration(vec![]),
                _ => RecordBatch::Weight(vec![]),
            })
        }
    }

    fn session(start: &str, end: &str) -> SleepSession {
        SleepSession {
            start: utc(start),
            end: utc(end),
            title: None,
            stages: vec![SleepStage {
                start: utc(start),
                end: utc(end),
                stage: SleepStageType::Light,
            }],
        }
    }

    fn builder(source: FakeSource) -> (Arc<FakeSource>, SnapshotBuilder<Utc>) {
        let source = Arc::new(source);
        let builder = SnapshotBuilder::new(source.clone() as Arc<dyn MetricSource>, Utc);
        (source, builder)
    }

    #[tokio::test]
    async fn every_enabled_category_is_present() {
        let (_, builder) = builder(FakeSource {
            steps: vec![StepsRecord {
                start: utc("2024-03-09T10:00:00Z"),
                end: utc("2024-03-09T10:10:00Z"),
                count: 900,
            }],
            ..Default::default()
        });
        let enabled: BTreeSet<_> = [Category::Steps, Category::HeartRate, Category::Hydration]
            .into_iter()
            .collect();

        let snapshot = builder
            .build(&enabled, 7, utc("2024-03-10T08:00:00Z"))
            .await
            .unwrap();

        assert_eq!(snapshot.categories.len(), 3);
        assert_eq!(snapshot.steps().unwrap()["2024-03-09"].total, 900);
        assert!(snapshot.contains(Category::HeartRate));
        assert!(snapshot.get(Category::HeartRate).is_none());
        assert_eq!(snapshot.unavailable, vec!["heart rate", "hydration record"]);
        assert!(!snapshot.contains(Category::Sleep));
    }

    #[tokio::test]
    async fn failing_category_does_not_abort_others() {
        let (_, builder) = builder(FakeSource {
            steps: vec![StepsRecord {
                start: utc("2024-03-09T10:00:00Z"),
                end: utc("2024-03-09T10:10:00Z"),
                count: 10,
            }],
            failing: vec![Category::Exercise],
            ..Default::default()
        });
        let enabled: BTreeSet<_> = [Category::Steps, Category::Exercise].into_iter().collect();

        let snapshot = builder
            .build(&enabled, 7, utc("2024-03-10T08:00:00Z"))
            .await
            .unwrap();

        assert!(snapshot.steps().is_some());
        assert!(snapshot.contains(Category::Exercise));
        assert!(snapshot.exercise().is_none());
        assert_eq!(snapshot.unavailable, vec!["exercise"]);
    }

    #[tokio::test]
    async fn empty_steps_are_null_without_reason() {
        let (_, builder) = builder(FakeSource::default());
        let enabled: BTreeSet<_> = [Category::Steps].into_iter().collect();
        let snapshot = builder
            .build(&enabled, 7, utc("2024-03-10T08:00:00Z"))
            .await
            .unwrap();
        assert!(snapshot.contains(Category::Steps));
        assert!(snapshot.steps().is_none());
        assert!(snapshot.unavailable.is_empty());
    }

    #[tokio::test]
    async fn last_sleep_uses_evening_window() {
        let (source, builder) = builder(FakeSource {
            sleep: vec![
                session("2024-03-07T22:00:00Z", "2024-03-08T06:00:00Z"),
                session("2024-03-09T22:30:00Z", "2024-03-10T06:30:00Z"),
            ],
            ..Default::default()
        });
        let enabled: BTreeSet<_> = [Category::Sleep].into_iter().collect();

        let snapshot = builder
            .build(&enabled, 7, utc("2024-03-10T08:00:00Z"))
            .await
            .unwrap();
        let sleep = snapshot.sleep().unwrap();

        assert_eq!(sleep.days.len(), 2);
        let last = sleep.last_sleep.as_ref().unwrap();
        assert_eq!(last.start_time, utc("2024-03-09T22:30:00Z").timestamp());
        assert_eq!(last.total_duration, 8 * 3600);

        let windows = source.sleep_windows.lock().unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].start, utc("2024-03-09T20:00:00Z"));
    }

    #[tokio::test]
    async fn last_sleep_falls_back_to_today() {
        // Nothing since 20:00 yesterday; a nap later today is still found.
        let (source, builder) = builder(FakeSource {
            sleep: vec![session("2024-03-10T12:00:00Z", "2024-03-10T12:30:00Z")],
            ..Default::default()
        });
        let enabled: BTreeSet<_> = [Category::Sleep].into_iter().collect();

        let snapshot = builder
            .build(&enabled, 7, utc("2024-03-10T08:00:00Z"))
            .await
            .unwrap();
        let sleep = snapshot.sleep().unwrap();

        let windows = source.sleep_windows.lock().unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2].start, utc("2024-03-10T00:00:00Z"));
        assert_eq!(windows[2].end, utc("2024-03-11T00:00:00Z"));
        assert!(sleep.days.is_empty());
        assert_eq!(sleep.last_sleep.as_ref().unwrap().total_duration, 1800);
    }

    #[tokio::test]
    async fn no_sleep_anywhere_is_unavailable() {
        let (_, builder) = builder(FakeSource::default());
        let enabled: BTreeSet<_> = [Category::Sleep].into_iter().collect();
        let snapshot = builder
            .build(&enabled, 7, utc("2024-03-10T08:00:00Z"))
            .await
            .unwrap();
        assert!(snapshot.sleep().is_none());
        assert_eq!(snapshot.unavailable, vec!["sleep"]);
    }

    #[tokio::test]
    async fn days_follow_the_builder_timezone() {
        let source = Arc::new(FakeSource {
            steps: vec![
                StepsRecord {
                    start: utc("2024-03-09T21:00:00Z"),
                    end: utc("2024-03-09T21:10:00Z"),
                    count: 300,
                },
                StepsRecord {
                    start: utc("2024-03-09T23:30:00Z"),
                    end: utc("2024-03-09T23:40:00Z"),
                    count: 700,
                },
            ],
            sleep: vec![session("2024-03-09T23:30:00Z", "2024-03-10T05:30:00Z")],
            ..Default::default()
        });
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let builder = SnapshotBuilder::new(source as Arc<dyn MetricSource>, plus_two);
        let enabled: BTreeSet<_> = [Category::Steps, Category::Sleep].into_iter().collect();

        let snapshot = builder
            .build(&enabled, 7, utc("2024-03-10T08:00:00Z"))
            .await
            .unwrap();

        let steps = snapshot.steps().unwrap();
        assert_eq!(steps["2024-03-09"].total, 300);
        assert_eq!(steps["2024-03-10"].total, 700);

        let sleep = snapshot.sleep().unwrap();
        assert!(sleep.days.contains_key("2024-03-10"));
        assert!(!sleep.days.contains_key("2024-03-09"));
        assert!(sleep.last_sleep.is_some());
    }
}
