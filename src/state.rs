use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::data::{Category, HealthSnapshot};
use crate::time::{clamp_sync_days, DEFAULT_SYNC_DAYS};

pub const DEFAULT_INTERVAL_SECS: u64 = 3600;
pub const MIN_INTERVAL_SECS: u64 = 900;

const SETTINGS_FILE: &str = "settings.json";
const CACHE_FILE: &str = "cache.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub timestamp: i64,
    pub message: String,
}

/// Everything needed to reach the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginConfig {
    pub base_url: String,
    pub token: String,
    pub sensor_id: String,
}

fn default_true() -> bool {
    true
}

fn default_sync_days() -> i64 {
    DEFAULT_SYNC_DAYS
}

fn default_interval() -> String {
    DEFAULT_INTERVAL_SECS.to_string()
}

/// Persisted sync settings and outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    #[serde(default = "default_sync_days")]
    pub sync_days: i64,
    /// Seconds, stored as a string.
    #[serde(default = "default_interval")]
    pub update_interval: String,
    #[serde(default)]
    pub enabled_categories: BTreeMap<Category, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<String>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            last_sync: None,
            last_error: None,
            auto_sync: true,
            sync_days: DEFAULT_SYNC_DAYS,
            update_interval: default_interval(),
            enabled_categories: BTreeMap::new(),
            url: None,
            token: None,
            sensor: None,
        }
    }
}

impl SyncState {
    /// Categories without an explicit toggle are enabled.
    pub fn is_enabled(&self, category: Category) -> bool {
        self.enabled_categories.get(&category).copied().unwrap_or(true)
    }

    pub fn enabled(&self) -> BTreeSet<Category> {
        Category::ALL
            .iter()
            .copied()
            .filter(|&c| self.is_enabled(c))
            .collect()
    }

    pub fn set_enabled(&mut self, category: Category, enabled: bool) {
        self.enabled_categories.insert(category, enabled);
    }

    pub fn sync_days(&self) -> i64 {
        clamp_sync_days(self.sync_days)
    }

    /// The scheduling period; unparsable values fall back to the default.
    pub fn interval(&self) -> Duration {
        let secs = self
            .update_interval
            .trim()
            .parse::<u64>()
            .unwrap_or(DEFAULT_INTERVAL_SECS);
        Duration::from_secs(secs.max(MIN_INTERVAL_SECS))
    }

    /// `None` until URL, token and sensor id are all non-blank.
    pub fn login(&self) -> Option<LoginConfig> {
        fn present(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        }

        Some(LoginConfig {
            base_url: present(&self.url)?,
            token: present(&self.token)?,
            sensor_id: present(&self.sensor)?,
        })
    }
}

/// Persistence for [`SyncState`] and the single cached snapshot.
///
/// `update` is a read-modify-write on the stored state; concurrent callers
/// are last-writer-wins per call.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<SyncState>;

    fn update(&self, apply: &dyn Fn(&mut SyncState)) -> Result<SyncState>;

    fn save_snapshot(&self, snapshot: &HealthSnapshot) -> Result<()>;

    fn load_snapshot(&self) -> Result<Option<HealthSnapshot>>;

    fn record_success(&self, at_ms: i64) -> Result<SyncState> {
        self.update(&|state| {
            state.last_sync = Some(at_ms);
            state.last_error = None;
        })
    }

    fn record_failure(&self, error: LastError) -> Result<SyncState> {
        self.update(&|state| state.last_error = Some(error.clone()))
    }
}

// ── File store ──────────────────────────────────────────

/// JSON files in one directory: `settings.json` and `cache.json`.
pub struct FileStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn settings_path(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE)
    }

    fn cache_path(&self) -> PathBuf {
        self.dir.join(CACHE_FILE)
    }

    fn read_state(&self) -> Result<SyncState> {
        let path = self.settings_path();
        if !path.exists() {
            return Ok(SyncState::default());
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        // Guards no data, so a poisoned lock is still usable.
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Replaces `path` with `contents` via a sibling temp file.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

impl StateStore for FileStore {
    fn load(&self) -> Result<SyncState> {
        let _guard = self.guard();
        self.read_state()
    }

    fn update(&self, apply: &dyn Fn(&mut SyncState)) -> Result<SyncState> {
        let _guard = self.guard();
        let mut state = self.read_state()?;
        apply(&mut state);
        let json = serde_json::to_string_pretty(&state)?;
        write_atomic(&self.settings_path(), &json)?;
        debug!(path = %self.settings_path().display(), "saved sync state");
        Ok(state)
    }

    fn save_snapshot(&self, snapshot: &HealthSnapshot) -> Result<()> {
        let _guard = self.guard();
        let json = serde_json::to_string_pretty(snapshot)?;
        write_atomic(&self.cache_path(), &json)
    }

    fn load_snapshot(&self) -> Result<Option<HealthSnapshot>> {
        let _guard = self.guard();
        let path = self.cache_path();
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let snapshot = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(snapshot))
    }
}

// ── In-memory store ─────────────────────────────────────

/// Store that never touches disk.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<SyncState>,
    snapshot: Mutex<Option<HealthSnapshot>>,
}

impl MemoryStore {
    pub fn new(state: SyncState) -> Self {
        Self {
            state: Mutex::new(state),
            snapshot: Mutex::new(None),
        }
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<SyncState> {
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn update(&self, apply: &dyn Fn(&mut SyncState)) -> Result<SyncState> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        apply(&mut state);
        Ok(state.clone())
    }

    fn save_snapshot(&self, snapshot: &HealthSnapshot) -> Result<()> {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<HealthSnapshot>> {
        Ok(self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}
