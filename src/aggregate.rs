//! Day aggregation.
//!
//! Every category is folded into per-day accumulators first and only turned
//! into summaries once all of its records are in, so derived values such as
//! stage percentages are computed against final totals. Intervals whose end
//! is not after their start are dropped before they reach an accumulator.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::AddAssign;

use crate::data::{
    exercise_name, BodyTemperatureRecord, CaloriesRecord, DayKey, DayMap, DayTotal,
    ExerciseDay, ExerciseEntry, ExerciseSession, ExerciseTypeBreakdown, HeartRatePoint,
    HeartRateSample, HydrationRecord, IntervalSpan, OxygenSaturationRecord, PointSeries,
    SegmentEntry, SleepDay, SleepSession, SleepStageBreakdown, SleepStageType, StepsRecord,
    WeightRecord,
};
use crate::time::format_duration;

// ── Counting categories ─────────────────────────────────

pub fn aggregate_steps<F>(records: &[StepsRecord], day_key: F) -> DayMap<DayTotal<i64>>
where
    F: Fn(DateTime<Utc>) -> DayKey,
{
    fold_totals(
        records.iter().map(|r| (r.start, r.end, r.count)),
        day_key,
        |total| format!("{} steps", total),
    )
}

pub fn aggregate_hydration<F>(records: &[HydrationRecord], day_key: F) -> DayMap<DayTotal<f64>>
where
    F: Fn(DateTime<Utc>) -> DayKey,
{
    fold_totals(
        records.iter().map(|r| (r.start, r.end, r.volume_ml)),
        day_key,
        |total| format!("{:.0} ml", total),
    )
}

pub fn aggregate_calories<F>(records: &[CaloriesRecord], day_key: F) -> DayMap<DayTotal<f64>>
where
    F: Fn(DateTime<Utc>) -> DayKey,
{
    fold_totals(
        records.iter().map(|r| (r.start, r.end, r.energy_kcal)),
        day_key,
        |total| format!("{:.1} kcal", total),
    )
}

struct TotalAccumulator<T> {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    total: T,
    records: u32,
}

impl<T: Copy + Default + AddAssign> TotalAccumulator<T> {
    fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            total: T::default(),
            records: 0,
        }
    }

    fn add(&mut self, start: DateTime<Utc>, end: DateTime<Utc>, amount: T) {
        self.start = self.start.min(start);
        self.end = self.end.max(end);
        self.total += amount;
        self.records += 1;
    }

    fn finish(self, format: impl Fn(T) -> String) -> DayTotal<T> {
        DayTotal {
            start_time: self.start.timestamp(),
            end_time: self.end.timestamp(),
            total: self.total,
            formatted_total: format(self.total),
            records: self.records,
        }
    }
}

fn fold_totals<T, I, F, G>(entries: I, day_key: F, format: G) -> DayMap<DayTotal<T>>
where
    T: Copy + Default + AddAssign,
    I: IntoIterator<Item = (DateTime<Utc>, DateTime<Utc>, T)>,
    F: Fn(DateTime<Utc>) -> DayKey,
    G: Fn(T) -> String,
{
    let mut days: BTreeMap<DayKey, TotalAccumulator<T>> = BTreeMap::new();
    for (start, end, amount) in entries {
        if end <= start {
            continue;
        }
        days.entry(day_key(start))
            .or_insert_with(|| TotalAccumulator::new(start, end))
            .add(start, end, amount);
    }

    days.into_iter()
        .map(|(day, acc)| (day, acc.finish(&format)))
        .collect()
}

// ── Point samples ───────────────────────────────────────

pub fn aggregate_heart_rate<F>(
    samples: &[HeartRateSample],
    day_key: F,
) -> DayMap<PointSeries<HeartRatePoint>>
where
    F: Fn(DateTime<Utc>) -> DayKey,
{
    fold_points(
        samples.iter().map(|s| {
            let point = HeartRatePoint {
                time: s.time.timestamp(),
                bpm: s.bpm,
            };
            (s.time, point)
        }),
        day_key,
    )
}

pub fn aggregate_weight<F>(records: &[WeightRecord], day_key: F) -> DayMap<PointSeries<f64>>
where
    F: Fn(DateTime<Utc>) -> DayKey,
{
    fold_points(records.iter().map(|r| (r.time, r.kilograms)), day_key)
}

pub fn aggregate_oxygen<F>(
    records: &[OxygenSaturationRecord],
    day_key: F,
) -> DayMap<PointSeries<f64>>
where
    F: Fn(DateTime<Utc>) -> DayKey,
{
    fold_points(records.iter().map(|r| (r.time, r.percentage)), day_key)
}

pub fn aggregate_temperature<F>(
    records: &[BodyTemperatureRecord],
    day_key: F,
) -> DayMap<PointSeries<f64>>
where
    F: Fn(DateTime<Utc>) -> DayKey,
{
    fold_points(records.iter().map(|r| (r.time, r.celsius)), day_key)
}

/// Samples sharing a second overwrite each other.
fn fold_points<V, I, F>(samples: I, day_key: F) -> DayMap<PointSeries<V>>
where
    I: IntoIterator<Item = (DateTime<Utc>, V)>,
    F: Fn(DateTime<Utc>) -> DayKey,
{
    let mut days: DayMap<PointSeries<V>> = BTreeMap::new();
    for (time, value) in samples {
        days.entry(day_key(time))
            .or_default()
            .insert(time.timestamp().to_string(), value);
    }
    days
}

// ── Breakdowns ──────────────────────────────────────────

struct BreakdownAccumulator<S> {
    duration: i64,
    occurrences: u32,
    items: Vec<S>,
}

impl<S> Default for BreakdownAccumulator<S> {
    fn default() -> Self {
        Self {
            duration: 0,
            occurrences: 0,
            items: Vec::new(),
        }
    }
}

impl<S> BreakdownAccumulator<S> {
    fn push(&mut self, duration: i64, item: S) {
        self.duration += duration;
        self.occurrences += 1;
        self.items.push(item);
    }

    fn sorted_items(mut self, start_of: impl Fn(&S) -> i64) -> Vec<S> {
        self.items.sort_by_key(|item| start_of(item));
        self.items
    }
}

/// `part / whole * 100`, clamped to `[0, 100]`.
pub fn percentage(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 100.0).clamp(0.0, 100.0)
}

// ── Sleep ───────────────────────────────────────────────

#[derive(Default)]
struct SleepDayAccumulator {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    sessions: u32,
    in_bed: i64,
    stages: BTreeMap<SleepStageType, BreakdownAccumulator<IntervalSpan>>,
}

impl SleepDayAccumulator {
    fn add_session(&mut self, session: &SleepSession) {
        let in_bed = session.end.timestamp() - session.start.timestamp();
        if in_bed <= 0 {
            return;
        }

        self.start = Some(self.start.map_or(session.start, |s| s.min(session.start)));
        self.end = Some(self.end.map_or(session.end, |e| e.max(session.end)));
        self.sessions += 1;
        self.in_bed += in_bed;

        for stage in &session.stages {
            let duration = stage.end.timestamp() - stage.start.timestamp();
            if duration <= 0 {
                continue;
            }
            self.stages.entry(stage.stage).or_default().push(
                duration,
                IntervalSpan {
                    start_time: stage.start.timestamp(),
                    end_time: stage.end.timestamp(),
                    duration,
                },
            );
        }
    }

    fn finish(self) -> Option<SleepDay> {
        let (start, end) = (self.start?, self.end?);

        let staged: i64 = self.stages.values().map(|s| s.duration).sum();
        let awake: i64 = self
            .stages
            .iter()
            .filter(|(stage, _)| stage.is_awake())
            .map(|(_, s)| s.duration)
            .sum();
        let asleep = staged - awake;
        // Overlapping stages may add up past the time in bed.
        let total = self.in_bed.max(staged);

        let stages = self
            .stages
            .into_iter()
            .map(|(stage, acc)| SleepStageBreakdown {
                stage,
                stage_label: stage.label().to_string(),
                total_duration_seconds: acc.duration,
                total_duration_formatted: format_duration(acc.duration),
                occurrence_count: acc.occurrences,
                percentage_of_day: percentage(acc.duration, total),
                session_list: acc.sorted_items(|span| span.start_time),
            })
            .collect();

        Some(SleepDay {
            start_time: start.timestamp(),
            end_time: end.timestamp(),
            sessions: self.sessions,
            total_duration: total,
            total_duration_formatted: format_duration(total),
            asleep_duration: asleep,
            asleep_duration_formatted: format_duration(asleep),
            awake_duration: awake,
            sleep_percentage: percentage(asleep, total),
            stages,
        })
    }
}

/// Sessions bucketed by the local day they start on.
pub fn aggregate_sleep<F>(sessions: &[SleepSession], day_key: F) -> DayMap<SleepDay>
where
    F: Fn(DateTime<Utc>) -> DayKey,
{
    let mut days: BTreeMap<DayKey, SleepDayAccumulator> = BTreeMap::new();
    for session in sessions {
        if session.end <= session.start {
            continue;
        }
        days.entry(day_key(session.start))
            .or_default()
            .add_session(session);
    }

    days.into_iter()
        .filter_map(|(day, acc)| acc.finish().map(|summary| (day, summary)))
        .collect()
}

/// The most recent session on its own: latest start, ties going to the
/// later end.
pub fn aggregate_last_sleep(sessions: &[SleepSession]) -> Option<SleepDay> {
    let latest = sessions
        .iter()
        .filter(|s| s.end > s.start)
        .max_by_key(|s| (s.start, s.end))?;

    let mut acc = SleepDayAccumulator::default();
    acc.add_session(latest);
    acc.finish()
}

// ── Exercise ────────────────────────────────────────────

#[derive(Default)]
struct ExerciseDayAccumulator {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    sessions: u32,
    total: i64,
    types: BTreeMap<i32, BreakdownAccumulator<ExerciseEntry>>,
}

impl ExerciseDayAccumulator {
    fn add_session(&mut self, session: &ExerciseSession, duration: i64) {
        self.start = Some(self.start.map_or(session.start, |s| s.min(session.start)));
        self.end = Some(self.end.map_or(session.end, |e| e.max(session.end)));
        self.sessions += 1;
        self.total += duration;

        let entry = ExerciseEntry {
            start_time: session.start.timestamp(),
            end_time: session.end.timestamp(),
            duration,
            duration_formatted: format_duration(duration),
            exercise_type: session.exercise_type,
            exercise_name: exercise_name(session.exercise_type).to_string(),
            title: session.title.clone(),
            notes: session.notes.clone(),
            segments: session
                .segments
                .iter()
                .map(|seg| SegmentEntry {
                    start_time: seg.start.timestamp(),
                    end_time: seg.end.timestamp(),
                    repetitions: seg.repetitions,
                    segment_type: seg.segment_type,
                })
                .collect(),
        };
        self.types
            .entry(session.exercise_type)
            .or_default()
            .push(duration, entry);
    }

    fn finish(self) -> Option<ExerciseDay> {
        let (start, end) = (self.start?, self.end?);
        let total = self.total;

        let types = self
            .types
            .into_iter()
            .map(|(code, acc)| ExerciseTypeBreakdown {
                exercise_type: code,
                exercise_name: exercise_name(code).to_string(),
                total_duration_seconds: acc.duration,
                total_duration_formatted: format_duration(acc.duration),
                occurrence_count: acc.occurrences,
                percentage_of_day: percentage(acc.duration, total),
                session_list: acc.sorted_items(|e| e.start_time),
            })
            .collect();

        Some(ExerciseDay {
            start_time: start.timestamp(),
            end_time: end.timestamp(),
            total_sessions: self.sessions,
            total_duration: total,
            total_duration_formatted: format_duration(total),
            types,
        })
    }
}

pub fn aggregate_exercise<F>(sessions: &[ExerciseSession], day_key: F) -> DayMap<ExerciseDay>
where
    F: Fn(DateTime<Utc>) -> DayKey,
{
    let mut days: BTreeMap<DayKey, ExerciseDayAccumulator> = BTreeMap::new();
    for session in sessions {
        let duration = session.end.timestamp() - session.start.timestamp();
        if duration <= 0 {
            continue;
        }
        days.entry(day_key(session.start))
            .or_default()
            .add_session(session, duration);
    }

    days.into_iter()
        .filter_map(|(day, acc)| acc.finish().map(|summary| (day, summary)))
        .collect()
}
