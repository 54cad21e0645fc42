use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::debug;

use crate::source::ExportFileSource;
use crate::state::{FileStore, StateStore};

const APP_DIR: &str = "healthsync";
const EXPORT_FILE: &str = "health_export.json";

/// Login values taken from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginOverrides {
    pub url: Option<String>,
    pub token: Option<String>,
    pub sensor: Option<String>,
}

impl LoginOverrides {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            url: var("HEALTHSYNC_URL"),
            token: var("HEALTHSYNC_TOKEN"),
            sensor: var("HEALTHSYNC_SENSOR"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.token.is_none() && self.sensor.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub export_path: PathBuf,
    pub login: LoginOverrides,
}

impl Config {
    /// Resolves paths, falling back to the platform data directory.
    pub fn load(data_dir: Option<PathBuf>, export_path: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => Self::default_data_dir()?,
        };
        let export_path = export_path.unwrap_or_else(|| data_dir.join(EXPORT_FILE));

        Ok(Config {
            data_dir,
            export_path,
            login: LoginOverrides::from_env(),
        })
    }

    pub fn default_data_dir() -> Result<PathBuf> {
        Ok(dirs::data_dir()
            .context("Failed to get data directory")?
            .join(APP_DIR))
    }

    /// Opens the settings store, persisting any login values from the
    /// environment first.
    pub fn store(&self) -> Result<FileStore> {
        let store = FileStore::new(&self.data_dir)?;
        if !self.login.is_empty() {
            let login = self.login.clone();
            store
                .update(&|state| {
                    if let Some(url) = &login.url {
                        state.url = Some(url.clone());
                    }
                    if let Some(token) = &login.token {
                        state.token = Some(token.clone());
                    }
                    if let Some(sensor) = &login.sensor {
                        state.sensor = Some(sensor.clone());
                    }
                })
                .context("Failed to store login from environment")?;
            debug!("applied login values from environment");
        }
        Ok(store)
    }

    pub fn source(&self) -> ExportFileSource {
        ExportFileSource::new(&self.export_path)
    }
}
