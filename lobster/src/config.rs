//! Lobster configuration types and loading.
//!
//! A single `Config` root, default-filled at load time (spec §9 "Dynamic
//! configuration object"). Recognised sections: storage endpoint, workflow
//! list, category list, advanced options.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root Lobster configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Process-exclusive working directory and database location.
    pub storage: StorageConfig,

    /// Workflows to run, in declaration order.
    pub workflows: Vec<WorkflowConfig>,

    /// Resource categories shared across workflows.
    pub categories: Vec<CategoryConfig>,

    /// Advanced/tuning options.
    pub advanced: AdvancedConfig,
}

impl Config {
    /// Load configuration with fallback chain: explicit path, then
    /// `./lobster.yml`, then `$XDG_CONFIG_HOME/lobster/lobster.yml`, then
    /// built-in defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path)
                .context(format!("failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from("lobster.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("lobster").join("lobster.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("no config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("failed to parse config file")?;
        tracing::info!("loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn category(&self, name: &str) -> Option<&CategoryConfig> {
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn workflow(&self, label: &str) -> Option<&WorkflowConfig> {
        self.workflows.iter().find(|w| w.label == label)
    }
}

/// Where the working directory (and the embedded database within it) lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub workdir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("./lobster_workdir"),
        }
    }
}

/// Configuration-declared workflow entry; turned into `unitstore::Workflow`
/// at registration time once the dataset backend has supplied file counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub label: String,
    pub category: String,
    pub prerequisite: Option<String>,
    #[serde(rename = "merge-size-bytes")]
    pub merge_size_bytes: i64,
    #[serde(rename = "unit-chunk-size")]
    pub unit_chunk_size: u64,
    #[serde(rename = "output-filename")]
    pub output_filename: String,
}

/// A named resource class. The pseudo-category `"merge"` is reserved and
/// skipped during fair-share allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    pub cores: u32,
    #[serde(rename = "memory-mb")]
    pub memory_mb: u32,
    #[serde(rename = "runtime-s")]
    pub runtime_s: u32,
    #[serde(rename = "tasks-max")]
    pub tasks_max: Option<u32>,
}

/// Advanced/tuning options (spec §9, §10).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    #[serde(rename = "log-level")]
    pub log_level: String,

    /// Minimum cores of "payload" the scheduler keeps pre-provisioned,
    /// independent of the 10% hunger floor (spec §4.4).
    #[serde(rename = "payload-floor")]
    pub payload_floor: u32,

    #[serde(rename = "use-dashboard")]
    pub use_dashboard: bool,

    /// Named option resolving spec §9's implicit retry cap (default: 3).
    #[serde(rename = "retry-cap")]
    pub retry_cap: u32,

    #[serde(rename = "merge-cleanup")]
    pub merge_cleanup: bool,

    /// Tick period of the controller's obtain/release loop (spec §5).
    #[serde(rename = "cycle-interval-s")]
    pub cycle_interval_s: u64,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            payload_floor: 1,
            use_dashboard: false,
            retry_cap: 3,
            merge_cleanup: true,
            cycle_interval_s: 30,
        }
    }
}
