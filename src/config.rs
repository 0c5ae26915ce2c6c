//! Configuration for stagegate.
//!
//! Configuration sources (highest priority first):
//! 1. `STAGEGATE_HOME` environment variable (config at `$STAGEGATE_HOME/config.yaml`)
//! 2. Config file (`.stagegate/config.yaml`, searched from the current directory up)
//! 3. Defaults (`~/.stagegate`)
//!
//! Loading is explicit: callers hold the returned [`Config`] and pass it on.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{
    ApprovalSettings, ExecutionOptions, PipelineConfig, ScoringPolicy, SecuritySettings,
};

pub const HOME_ENV: &str = "STAGEGATE_HOME";
const CONFIG_DIR: &str = ".stagegate";
const CONFIG_FILE: &str = "config.yaml";

/// Config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub paths: PathsConfig,
    /// Options for pipelines that do not set their own
    #[serde(default)]
    pub pipeline: ExecutionOptions,
    #[serde(default)]
    pub scoring: ScoringPolicy,
    #[serde(default)]
    pub approval: ApprovalSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub events: EventSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to the config file's directory)
    #[serde(default)]
    pub home: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSettings {
    /// Buffer size of the in-process event broadcast
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Append every event to per-subject JSONL logs under `home/events`
    #[serde(default = "default_jsonl")]
    pub jsonl: bool,
}

fn default_broadcast_capacity() -> usize {
    1000
}
fn default_jsonl() -> bool {
    true
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            broadcast_capacity: default_broadcast_capacity(),
            jsonl: default_jsonl(),
        }
    }
}

impl Settings {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse settings")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Discover and load configuration from the environment and working directory
    pub fn load() -> Result<Config> {
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        let env_home = std::env::var_os(HOME_ENV).map(PathBuf::from);
        Self::load_from(&cwd, env_home)
    }

    /// Discovery with explicit inputs
    pub fn load_from(cwd: &Path, env_home: Option<PathBuf>) -> Result<Config> {
        if let Some(home) = env_home {
            let config_path = home.join(CONFIG_FILE);
            let (settings, config_file) = if config_path.exists() {
                (Self::from_file(&config_path)?, Some(config_path))
            } else {
                (Self::default(), None)
            };
            return Ok(Config {
                settings,
                home,
                config_file,
            });
        }

        if let Some(config_path) = find_config_file(cwd) {
            let settings = Self::from_file(&config_path)?;
            let config_dir = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
            let home = match &settings.paths.home {
                Some(home) => resolve_path(&config_dir, home),
                None => config_dir,
            };
            return Ok(Config {
                settings,
                home,
                config_file: Some(config_path),
            });
        }

        let home = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(CONFIG_DIR);
        let config_path = home.join(CONFIG_FILE);
        let (settings, config_file) = if config_path.exists() {
            (Self::from_file(&config_path)?, Some(config_path))
        } else {
            (Self::default(), None)
        };
        Ok(Config {
            settings,
            home,
            config_file,
        })
    }
}

/// Settings resolved against a home directory
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,
    /// Absolute path to engine state
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Config {
    /// Per-subject event logs (`home/events`)
    pub fn events_dir(&self) -> PathBuf {
        self.home.join("events")
    }

    /// Audit log (`home/audit.jsonl`)
    pub fn audit_log_path(&self) -> PathBuf {
        self.home.join("audit.jsonl")
    }

    /// Named pipelines (`home/pipelines/<name>.yaml`)
    pub fn pipeline_path(&self, name: &str) -> PathBuf {
        self.home.join("pipelines").join(format!("{}.yaml", name))
    }

    /// Load a pipeline by path or by name, filling in default options
    ///
    /// A pipeline document without an `options` block takes `settings.pipeline`.
    pub fn load_pipeline(&self, path_or_name: &str) -> Result<PipelineConfig> {
        let direct = PathBuf::from(path_or_name);
        let path = if direct.exists() {
            direct
        } else {
            self.pipeline_path(path_or_name)
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read pipeline: {}", path.display()))?;

        let mut document: serde_yaml::Value = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline: {}", path.display()))?;
        if let serde_yaml::Value::Mapping(map) = &mut document {
            let key = serde_yaml::Value::from("options");
            if !map.contains_key(&key) {
                map.insert(key, serde_yaml::to_value(&self.settings.pipeline)?);
            }
        }
        let pipeline: PipelineConfig = serde_yaml::from_value(document)
            .with_context(|| format!("Invalid pipeline: {}", path.display()))?;
        Ok(pipeline)
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}
