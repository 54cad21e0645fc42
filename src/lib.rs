//! Aggregates personal health records into per-day summaries and publishes
//! them to a Home Assistant sensor on a schedule.

pub mod aggregate;
pub mod api;
pub mod config;
pub mod data;
pub mod snapshot;
pub mod source;
pub mod state;
pub mod sync;
pub mod time;

pub use api::{HomeAssistantClient, PublishOutcome, Publisher};
pub use data::{Category, CategorySummary, HealthSnapshot, RecordBatch};
pub use snapshot::SnapshotBuilder;
pub use source::{ExportFileSource, MetricSource, SourceError};
pub use state::{FileStore, MemoryStore, StateStore, SyncState};
pub use sync::{JobOutcome, RetryPolicy, SyncJob, SyncObserver, SyncPhase};
