//! Process bootstrap
//!
//! Builds the registry, catalog, store, gate and coordinator from a
//! `ButlerConfig`, and refuses to start when static configuration is
//! inconsistent.

use crate::agent::AgentRegistry;
use crate::auth::AuthConfig;
use crate::config::{ButlerConfig, StoreBackend};
use crate::coordinator::Coordinator;
use crate::error::{ButlerError, Result};
use crate::permission::{ConfirmationLedger, PermissionGate};
use crate::session::{InMemorySessionStore, SessionStore, SqliteSessionStore, StoreHealth};
use crate::templates::Templates;
use crate::tool::{ToolCatalog, ToolExecutor};
use crate::tools::{builtin_catalog, CredentialGuard, DryRunExecutor};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// A problem found by the startup check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ConsistencyIssue {
    /// Permitted tool missing from the catalog
    UnknownTool { agent: String, tool: String },
    /// Playbook step naming a tool missing from the catalog
    UnknownPlaybookTool {
        agent: String,
        intent: String,
        tool: String,
    },
    MissingCoordinator,
    /// `system_prompt` names no registered template
    UnresolvedPrompt { agent: String, template: String },
}

impl fmt::Display for ConsistencyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyIssue::UnknownTool { agent, tool } => {
                write!(f, "agent '{}' permits unknown tool '{}'", agent, tool)
            }
            ConsistencyIssue::UnknownPlaybookTool { agent, intent, tool } => write!(
                f,
                "agent '{}' playbook for '{}' uses unknown tool '{}'",
                agent, intent, tool
            ),
            ConsistencyIssue::MissingCoordinator => f.write_str("no butler agent is registered"),
            ConsistencyIssue::UnresolvedPrompt { agent, template } => write!(
                f,
                "agent '{}' references missing prompt template '{}'",
                agent, template
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencyReport {
    pub issues: Vec<ConsistencyIssue>,
}

impl ConsistencyReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }

    /// One `Configuration` error listing every issue
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            return Ok(());
        }
        let lines: Vec<String> = self.issues.iter().map(|i| format!("  - {}", i)).collect();
        Err(ButlerError::config(format!(
            "{} startup problem(s):\n{}",
            self.issues.len(),
            lines.join("\n")
        )))
    }
}

/// Every agent reference must resolve: tools, playbook steps, prompts
pub fn check_consistency(
    registry: &AgentRegistry,
    catalog: &ToolCatalog,
    templates: &Templates,
) -> ConsistencyReport {
    let mut issues = Vec::new();

    if registry.coordinator().is_err() {
        issues.push(ConsistencyIssue::MissingCoordinator);
    }

    for agent in registry.list_all() {
        for tool in agent.tools.iter().filter(|t| !catalog.contains(t)) {
            issues.push(ConsistencyIssue::UnknownTool {
                agent: agent.name.clone(),
                tool: tool.clone(),
            });
        }
        for (intent, steps) in &agent.playbook {
            for tool in steps.iter().filter(|t| !catalog.contains(t)) {
                issues.push(ConsistencyIssue::UnknownPlaybookTool {
                    agent: agent.name.clone(),
                    intent: intent.clone(),
                    tool: tool.clone(),
                });
            }
        }
        if !templates.has_template(&agent.system_prompt) {
            issues.push(ConsistencyIssue::UnresolvedPrompt {
                agent: agent.name.clone(),
                template: agent.system_prompt.clone(),
            });
        }
    }

    ConsistencyReport { issues }
}

/// Credential status of one integration
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationStatus {
    pub integration: String,
    pub connected: bool,
    /// Environment variable checked when auth.json has no entry
    pub env_var: String,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub integrations: Vec<IntegrationStatus>,
    pub store: Option<StoreHealth>,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.integrations.iter().all(|i| i.connected)
            && self.store.as_ref().map_or(true, |s| s.healthy)
    }

    pub fn missing(&self) -> impl Iterator<Item = &IntegrationStatus> {
        self.integrations.iter().filter(|i| !i.connected)
    }
}

pub struct Runtime {
    config: ButlerConfig,
    registry: Arc<AgentRegistry>,
    catalog: Arc<ToolCatalog>,
    credentials: Arc<AuthConfig>,
    store: Arc<dyn SessionStore>,
    ledger: Arc<ConfirmationLedger>,
    coordinator: Arc<Coordinator>,
}

impl Runtime {
    /// Bootstrap with the dry-run executor behind the credential guard
    pub fn bootstrap(config: ButlerConfig) -> Result<Self> {
        let credentials = Arc::new(load_credentials(&config)?);
        let executor = Arc::new(CredentialGuard::new(
            Arc::new(DryRunExecutor::new()),
            credentials.clone(),
        ));
        Self::assemble(config, credentials, executor)
    }

    /// Bootstrap with a caller-supplied executor
    pub fn bootstrap_with(config: ButlerConfig, executor: Arc<dyn ToolExecutor>) -> Result<Self> {
        let credentials = Arc::new(load_credentials(&config)?);
        Self::assemble(config, credentials, executor)
    }

    fn assemble(
        config: ButlerConfig,
        credentials: Arc<AuthConfig>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Result<Self> {
        let registry = Arc::new(AgentRegistry::load(config.agents_dir.as_deref())?);
        let catalog = Arc::new(builtin_catalog()?);
        let templates = Templates::load(config.prompts_dir.as_deref())?;
        check_consistency(&registry, &catalog, &templates).into_result()?;

        let store: Arc<dyn SessionStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(InMemorySessionStore::new()),
            StoreBackend::Sqlite => Arc::new(SqliteSessionStore::open(&config.database_path())?),
        };

        let ledger = Arc::new(ConfirmationLedger::new(config.confirmation_timeout()));
        let gate = Arc::new(
            PermissionGate::new(registry.clone(), catalog.clone(), store.clone())
                .with_policy(config.permissions.mutating_policy)
                .with_ledger(ledger.clone()),
        );
        let coordinator = Coordinator::new(
            registry.clone(),
            catalog.clone(),
            gate,
            store.clone(),
            executor,
        )?
        .with_templates(templates);

        info!(
            agents = registry.len(),
            tools = catalog.len(),
            store = ?config.store.backend,
            mutating_policy = ?config.permissions.mutating_policy,
            "Butler runtime ready"
        );

        Ok(Self {
            config,
            registry,
            catalog,
            credentials,
            store,
            ledger,
            coordinator: Arc::new(coordinator),
        })
    }

    pub fn config(&self) -> &ButlerConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<ConfirmationLedger> {
        &self.ledger
    }

    /// Credential status per integration, plus store health
    pub async fn readiness(&self) -> Result<Readiness> {
        let integrations: Vec<IntegrationStatus> = self
            .catalog
            .integrations()
            .into_iter()
            .map(|integration| IntegrationStatus {
                integration: integration.to_string(),
                connected: self.credentials.has_credential(integration),
                env_var: AuthConfig::env_var_for(integration),
                tools: self
                    .catalog
                    .list()
                    .filter(|t| t.integration.as_deref() == Some(integration))
                    .map(|t| t.id.clone())
                    .collect(),
            })
            .collect();

        for missing in integrations.iter().filter(|i| !i.connected) {
            warn!(integration = %missing.integration, "Integration has no credential");
        }

        Ok(Readiness {
            integrations,
            store: self.store.health().await?,
        })
    }
}

fn load_credentials(config: &ButlerConfig) -> Result<AuthConfig> {
    AuthConfig::load_from(&config.auth_path())
        .map_err(|e| ButlerError::config(format!("{:#}", e)))
}
