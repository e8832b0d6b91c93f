//! Runner configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RestamentError, RunResult};

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestamentConfig {
    /// Base URL of the application under test; every scenario url is appended to it
    pub endpoint: String,

    /// Directory the application writes uploaded files to
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,

    /// Where image diffs are written
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Where mismatching images are preserved for inspection
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Wall-clock budget per scenario
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Store connection; without it no table can be seeded or verified
    #[serde(default)]
    pub db: Option<DbConfig>,
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("tmp/images")
}

fn default_timeout_ms() -> u64 {
    5000
}

/// Database configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbConfig {
    /// SQLite file, or `:memory:`
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl DbConfig {
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Whether enough is set to open a connection
    pub fn is_complete(&self) -> bool {
        self.path
            .as_ref()
            .is_some_and(|p| !p.as_os_str().is_empty())
    }

    pub fn is_memory(&self) -> bool {
        self.path.as_deref() == Some(Path::new(":memory:"))
    }
}

impl RestamentConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            upload_dir: None,
            log_dir: None,
            artifact_dir: default_artifact_dir(),
            timeout_ms: default_timeout_ms(),
            db: None,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> RunResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| RestamentError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn with_upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = Some(dir.into());
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_db(mut self, db: DbConfig) -> Self {
        self.db = Some(db);
        self
    }

    /// Reject configurations no scenario could run against
    pub fn validate(&self) -> RunResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(RestamentError::Config("`endpoint` is required".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(RestamentError::Config("`timeout_ms` must be positive".to_string()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The db config, if it is complete enough to open
    pub fn complete_db(&self) -> Option<&DbConfig> {
        self.db.as_ref().filter(|db| db.is_complete())
    }
}
