use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::data::{
    BodyTemperatureRecord, CaloriesRecord, Category, ExerciseSession, HeartRateSample,
    HydrationRecord, OxygenSaturationRecord, RecordBatch, SleepSession, StepsRecord,
    WeightRecord,
};
use crate::time::TimeWindow;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The health store itself could not be reached. Worth retrying.
    #[error("health data service unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read {category} records: {message}")]
    Query { category: Category, message: String },
}

/// Read access to the platform health store.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Records of `category` that fall inside `window`.
    async fn query(&self, category: Category, window: TimeWindow)
        -> Result<RecordBatch, SourceError>;
}

// ── JSON export ─────────────────────────────────────────

/// Health data exported to a single JSON document, one list per category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthExport {
    pub sleep: Vec<SleepSession>,
    pub heart: Vec<HeartRateSample>,
    pub steps: Vec<StepsRecord>,
    pub weight: Vec<WeightRecord>,
    pub exercise: Vec<ExerciseSession>,
    pub oxygen: Vec<OxygenSaturationRecord>,
    pub hydration: Vec<HydrationRecord>,
    pub calories: Vec<CaloriesRecord>,
    pub temperature: Vec<BodyTemperatureRecord>,
}

impl HealthExport {
    /// Records of one category, restricted to `window`. Interval records
    /// are kept when they overlap it.
    pub fn select(&self, category: Category, window: &TimeWindow) -> RecordBatch {
        fn points<T: Clone>(records: &[T], keep: impl Fn(&T) -> bool) -> Vec<T> {
            records.iter().filter(|r| keep(*r)).cloned().collect()
        }

        match category {
            Category::Sleep => {
                RecordBatch::Sleep(points(&self.sleep, |r| window.overlaps(r.start, r.end)))
            }
            Category::HeartRate => {
                RecordBatch::HeartRate(points(&self.heart, |r| window.contains(r.time)))
            }
            Category::Steps => {
                RecordBatch::Steps(points(&self.steps, |r| window.overlaps(r.start, r.end)))
            }
            Category::Weight => {
                RecordBatch::Weight(points(&self.weight, |r| window.contains(r.time)))
            }
            Category::Exercise => RecordBatch::Exercise(points(&self.exercise, |r| {
                window.overlaps(r.start, r.end)
            })),
            Category::OxygenSaturation => {
                RecordBatch::OxygenSaturation(points(&self.oxygen, |r| window.contains(r.time)))
            }
            Category::Hydration => RecordBatch::Hydration(points(&self.hydration, |r| {
                window.overlaps(r.start, r.end)
            })),
            Category::TotalCalories => RecordBatch::TotalCalories(points(&self.calories, |r| {
                window.overlaps(r.start, r.end)
            })),
            Category::BodyTemperature => RecordBatch::BodyTemperature(points(
                &self.temperature,
                |r| window.contains(r.time),
            )),
        }
    }
}

/// Source backed by an export file, re-read on every query.
pub struct ExportFileSource {
    path: PathBuf,
}

impl ExportFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricSource for ExportFileSource {
    async fn query(
        &self,
        category: Category,
        window: TimeWindow,
    ) -> Result<RecordBatch, SourceError> {
        let json = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SourceError::Unavailable(format!("{}: {}", self.path.display(), e))
        })?;
        let export: HealthExport =
            serde_json::from_str(&json).map_err(|e| SourceError::Query {
                category,
                message: e.to_string(),
            })?;

        let batch = export.select(category, &window);
        debug!(%category, records = batch.len(), "read export records");
        Ok(batch)
    }
}
