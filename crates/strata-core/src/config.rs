//! Configuration schema (strata.toml) and effective run options

use serde::{Deserialize, Serialize};
use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::node::ResourceType;

/// `[project]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project (root package) name
    #[serde(default = "default_project_name")]
    pub name: String,

    #[serde(default)]
    pub version: Option<String>,

    /// Directory artifacts are written to
    #[serde(default = "default_target_path")]
    pub target_path: PathBuf,
}

fn default_project_name() -> String {
    "my_project".to_string()
}

fn default_target_path() -> PathBuf {
    PathBuf::from("target")
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: default_project_name(),
            version: None,
            target_path: default_target_path(),
        }
    }
}

/// `[target]` section: the single target system of an invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target name (dev, prod, ...)
    #[serde(default = "default_target_name")]
    pub name: String,

    /// Adapter type (postgres, snowflake, ...)
    #[serde(rename = "type", default = "default_target_type")]
    pub target_type: String,

    #[serde(default)]
    pub database: Option<String>,

    #[serde(default = "default_schema")]
    pub schema: String,

    /// Worker thread budget
    #[serde(default = "default_threads")]
    pub threads: usize,
}

fn default_target_name() -> String {
    "dev".to_string()
}

fn default_target_type() -> String {
    "postgres".to_string()
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_threads() -> usize {
    4
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: default_target_name(),
            target_type: default_target_type(),
            database: None,
            schema: default_schema(),
            threads: default_threads(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub project: ProjectSection,

    #[serde(default)]
    pub target: TargetConfig,

    /// Project variables, readable through `var()`
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,

    #[serde(default = "default_true")]
    pub send_anonymous_usage_stats: bool,

    /// Per-invocation timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: PathBuf,
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: ProjectSection::default(),
            target: TargetConfig::default(),
            vars: BTreeMap::new(),
            send_anonymous_usage_stats: true,
            timeout_secs: None,
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

        let mut config = Self::from_toml(&contents)?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if config.target.threads == 0 {
            return Err(ConfigError::InvalidValue("target.threads must be at least 1".to_string()));
        }

        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Anonymized project id recorded in artifact metadata
    pub fn project_id(&self) -> String {
        anonymized_project_id(&self.project.name)
    }
}

/// MD5 of the project name, as 32 hex characters
pub fn anonymized_project_id(project_name: &str) -> String {
    hex::encode(Md5::digest(project_name.as_bytes()))
}

/// Effective options of one invocation
///
/// Serialized verbatim into the run-results `args` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub threads: usize,

    pub single_threaded: bool,

    /// Stop dispatching after the first error
    pub fail_fast: bool,

    pub full_refresh: bool,

    /// Node names or unique ids to include (empty = all)
    pub select: Vec<String>,

    /// Node names or unique ids to exclude
    pub exclude: Vec<String>,

    /// Restrict the selection to these kinds (empty = all)
    pub resource_types: Vec<ResourceType>,

    pub target_path: PathBuf,

    pub vars: BTreeMap<String, serde_json::Value>,

    pub write_json: bool,

    pub send_anonymous_usage_stats: bool,

    pub timeout_secs: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RunConfig {
    /// Derive run options from a project config
    pub fn from_config(config: &Config) -> Self {
        Self {
            threads: config.target.threads,
            single_threaded: false,
            fail_fast: false,
            full_refresh: false,
            select: Vec::new(),
            exclude: Vec::new(),
            resource_types: Vec::new(),
            target_path: config.project.target_path.clone(),
            vars: config.vars.clone(),
            write_json: true,
            send_anonymous_usage_stats: config.send_anonymous_usage_stats,
            timeout_secs: config.timeout_secs,
        }
    }

    /// Thread budget actually used by the scheduler
    pub fn effective_threads(&self) -> usize {
        if self.single_threaded {
            1
        } else {
            self.threads.max(1)
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.target.schema, "public");
        assert_eq!(config.target.threads, 4);
        assert!(config.send_anonymous_usage_stats);
    }

    #[test]
    fn parse_full_config() {
        let config = Config::from_toml(
            r#"
send_anonymous_usage_stats = false
timeout_secs = 30

[project]
name = "shop"
target_path = "out"

[target]
name = "prod"
type = "snowflake"
database = "analytics"
schema = "core"
threads = 8

[vars]
start_date = "2024-01-01"
"#,
        )
        .unwrap();

        assert_eq!(config.project.name, "shop");
        assert_eq!(config.project.target_path, PathBuf::from("out"));
        assert_eq!(config.target.target_type, "snowflake");
        assert_eq!(config.target.database.as_deref(), Some("analytics"));
        assert_eq!(config.vars["start_date"], serde_json::json!("2024-01-01"));
        assert!(!config.send_anonymous_usage_stats);

        let run = RunConfig::from_config(&config);
        assert_eq!(run.threads, 8);
        assert_eq!(run.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn zero_threads_rejected() {
        let result = Config::from_toml("[target]\nthreads = 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn single_threaded_overrides_budget() {
        let run = RunConfig {
            threads: 8,
            single_threaded: true,
            ..RunConfig::default()
        };
        assert_eq!(run.effective_threads(), 1);
    }

    #[test]
    fn project_id_is_md5_of_name() {
        assert_eq!(anonymized_project_id("test"), "098f6bcd4621d373cade4e832627b4f6");

        let config = Config::from_toml("[project]\nname = \"test\"\n").unwrap();
        assert_eq!(config.project_id(), "098f6bcd4621d373cade4e832627b4f6");
        assert_ne!(config.project_id(), anonymized_project_id("other"));
    }

    #[test]
    fn config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");

        let mut config = Config::default();
        config.project.name = "roundtrip".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.project.name, "roundtrip");
        assert_eq!(loaded.project_root, dir.path());
    }
}
