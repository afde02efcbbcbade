//! Integration credentials
//!
//! Loads credentials from `<data_dir>/auth.json`, keyed by integration:
//!
//! ```json
//! {
//!   "slack": {"type": "api", "key": "xoxb-..."},
//!   "google_calendar": {"type": "oauth", "access_token": "...", "expires_at": "2026-01-01T00:00:00Z"}
//! }
//! ```
//!
//! An integration missing from the file falls back to `<INTEGRATION>_API_KEY`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Credential for one integration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthEntry {
    /// Simple API key authentication
    #[serde(rename = "api")]
    Api { key: String },
    /// OAuth tokens obtained by the desktop shell
    #[serde(rename = "oauth")]
    OAuth {
        access_token: String,
        #[serde(default)]
        refresh_token: Option<String>,
        #[serde(default)]
        expires_at: Option<DateTime<Utc>>,
    },
}

impl AuthEntry {
    /// Token to present to the integration
    pub fn secret(&self) -> &str {
        match self {
            AuthEntry::Api { key } => key,
            AuthEntry::OAuth { access_token, .. } => access_token,
        }
    }

    /// Usable at `now`: non-empty and, for OAuth, not expired unless refreshable
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        match self {
            AuthEntry::Api { key } => !key.is_empty(),
            AuthEntry::OAuth {
                access_token,
                refresh_token,
                expires_at,
            } => {
                let fresh = expires_at.map(|t| t > now).unwrap_or(true);
                !access_token.is_empty() && (fresh || refresh_token.is_some())
            }
        }
    }
}

/// Authentication configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthConfig {
    pub integrations: HashMap<String, AuthEntry>,
}

impl AuthConfig {
    /// Load auth config from a specific path; a missing file is empty
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: AuthConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Default location under the data directory
    pub fn config_path(data_dir: &Path) -> PathBuf {
        data_dir.join("auth.json")
    }

    /// Environment variable consulted when the file has no entry
    pub fn env_var_for(integration: &str) -> String {
        format!("{}_API_KEY", integration.to_uppercase().replace('-', "_"))
    }

    /// Get auth entry for an integration
    pub fn get(&self, integration: &str) -> Option<&AuthEntry> {
        self.integrations.get(integration)
    }

    /// Whether a usable credential exists in the file or the environment
    pub fn has_credential(&self, integration: &str) -> bool {
        if let Some(entry) = self.integrations.get(integration) {
            return entry.is_usable(Utc::now());
        }
        std::env::var(Self::env_var_for(integration))
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    }

    /// Builder: add an entry (tests and embedding shells)
    pub fn with_entry(mut self, integration: impl Into<String>, entry: AuthEntry) -> Self {
        self.integrations.insert(integration.into(), entry);
        self
    }

    /// Builder: add an API key entry
    pub fn with_api_key(self, integration: impl Into<String>, key: impl Into<String>) -> Self {
        self.with_entry(integration, AuthEntry::Api { key: key.into() })
    }

    /// List all configured integrations
    pub fn integrations(&self) -> impl Iterator<Item = &String> {
        self.integrations.keys()
    }
}
