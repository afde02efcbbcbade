//! Configuration for the butler
//!
//! Load order, later wins:
//! 1. Built-in defaults
//! 2. `butler.yaml` (explicit path, or `<config_dir>/orion-butler/butler.yaml`)
//! 3. `.env` in the working directory
//! 4. `BUTLER_*` environment variables

use crate::agent::ModelTier;
use crate::auth::AuthConfig;
use crate::error::{ButlerError, Result};
use crate::permission::{MutatingPolicy, DEFAULT_CONFIRMATION_TIMEOUT};
use crate::session::DB_FILENAME;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const APP_DIR: &str = "orion-butler";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ButlerConfig {
    /// Holds auth.json, the session database and logs
    pub data_dir: PathBuf,

    /// Directory of agent override files (`<agent>.yaml`)
    pub agents_dir: Option<PathBuf>,

    /// Directory of prompt template overrides (`<name>.hbs`)
    pub prompts_dir: Option<PathBuf>,

    pub telemetry: TelemetryConfig,
    pub permissions: PermissionConfig,
    pub models: ModelConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Directory for log files; `<data_dir>/logs` when unset
    pub log_dir: Option<PathBuf>,

    /// Enable verbose logging
    pub verbose: bool,

    /// OTLP/HTTP endpoint for span export
    pub otel_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    pub mutating_policy: MutatingPolicy,
    pub confirmation_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub fast: String,
    pub deep: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database file; `<data_dir>/orion.db` when unset
    pub path: Option<PathBuf>,
}

impl Default for ButlerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            agents_dir: None,
            prompts_dir: None,
            telemetry: TelemetryConfig::default(),
            permissions: PermissionConfig::default(),
            models: ModelConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            mutating_policy: MutatingPolicy::default(),
            confirmation_timeout_secs: DEFAULT_CONFIRMATION_TIMEOUT.as_secs(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            fast: "claude-haiku".to_string(),
            deep: "claude-sonnet".to_string(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".orion-butler"))
}

impl ButlerConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join("butler.yaml"))
    }

    /// Load from file (explicit or default), then `.env` and environment
    ///
    /// An explicit path must exist; a missing default file is fine.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(p) => Self::from_file(&p)?,
                None => Self::default(),
            },
        };

        dotenvy::dotenv().ok();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ButlerError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = serde_yaml::from_str(&content).map_err(|e| {
            ButlerError::config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loaded butler config");
        Ok(config)
    }

    /// Apply `BUTLER_*` overrides from a variable lookup
    pub fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = var("BUTLER_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("BUTLER_LOG_DIR") {
            self.telemetry.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(endpoint) = var("BUTLER_OTEL_ENDPOINT") {
            self.telemetry.otel_endpoint = Some(endpoint);
        }
        if let Some(secs) = var("BUTLER_CONFIRMATION_TIMEOUT_SECS") {
            self.permissions.confirmation_timeout_secs = secs.trim().parse().map_err(|_| {
                ButlerError::config(format!(
                    "BUTLER_CONFIRMATION_TIMEOUT_SECS must be a number of seconds, got '{}'",
                    secs
                ))
            })?;
        }
        Ok(())
    }

    /// Set verbose logging
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.telemetry.verbose = verbose;
        self
    }

    pub fn with_data_dir(mut self, data_dir: PathBuf) -> Self {
        self.data_dir = data_dir;
        self
    }

    pub fn with_store_backend(mut self, backend: StoreBackend) -> Self {
        self.store.backend = backend;
        self
    }

    pub fn log_dir(&self) -> PathBuf {
        self.telemetry
            .log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DB_FILENAME))
    }

    pub fn auth_path(&self) -> PathBuf {
        AuthConfig::config_path(&self.data_dir)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.permissions.confirmation_timeout_secs)
    }

    /// Model name for a tier
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.models.fast,
            ModelTier::Deep => &self.models.deep,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ButlerConfig::default();
        assert_eq!(config.permissions.mutating_policy, MutatingPolicy::Warn);
        assert_eq!(config.confirmation_timeout(), Duration::from_secs(300));
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert!(config.database_path().ends_with(DB_FILENAME));
        assert!(config.log_dir().ends_with("logs"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("butler.yaml");
        std::fs::write(
            &path,
            "permissions:\n  mutating_policy: confirm\nstore:\n  backend: memory\nmodels:\n  deep: big-model\n",
        )
        .unwrap();

        let config = ButlerConfig::from_file(&path).unwrap();
        assert_eq!(config.permissions.mutating_policy, MutatingPolicy::Confirm);
        assert_eq!(config.permissions.confirmation_timeout_secs, 300);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.model_for(ModelTier::Deep), "big-model");
        assert_eq!(config.model_for(ModelTier::Fast), "claude-haiku");
    }

    #[test]
    fn test_bad_yaml_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("butler.yaml");
        std::fs::write(&path, "permissions:\n  mutating_policy: sometimes\n").unwrap();
        assert!(matches!(
            ButlerConfig::from_file(&path),
            Err(ButlerError::Configuration(_))
        ));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let temp = TempDir::new().unwrap();
        assert!(ButlerConfig::load(Some(&temp.path().join("nope.yaml"))).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("BUTLER_DATA_DIR", "/tmp/butler"),
            ("BUTLER_LOG_DIR", "/tmp/butler-logs"),
            ("BUTLER_OTEL_ENDPOINT", "http://localhost:4318"),
            ("BUTLER_CONFIRMATION_TIMEOUT_SECS", "60"),
        ]
        .into_iter()
        .collect();

        let mut config = ButlerConfig::default();
        config
            .apply_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/butler"));
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/butler-logs"));
        assert_eq!(config.telemetry.otel_endpoint.as_deref(), Some("http://localhost:4318"));
        assert_eq!(config.confirmation_timeout(), Duration::from_secs(60));
        assert_eq!(config.database_path(), PathBuf::from("/tmp/butler/orion.db"));
    }

    #[test]
    fn test_bad_timeout_env() {
        let mut config = ButlerConfig::default();
        let err = config
            .apply_env(|k| (k == "BUTLER_CONFIRMATION_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ButlerError::Configuration(_)));
    }
}
