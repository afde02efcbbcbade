//! Agent registry
//!
//! Loads agents from:
//! 1. Built-in agents (butler, triage, scheduler, communicator, navigator, preference_learner)
//! 2. YAML overrides: `<agents_dir>/*.yaml`, replacing the built-in of the same name
//!
//! Built once at startup and never mutated afterwards; share it behind an `Arc`.

use super::builtins::get_builtin_agents;
use super::config::{AgentDefinition, AgentKind, Specificity};
use super::config_loader::load_agent_configs;
use crate::error::{ButlerError, Result};
use indexmap::IndexMap;
use std::path::Path;
use tracing::debug;

/// Immutable registry of agent definitions, in declaration order
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: IndexMap<String, AgentDefinition>,
}

impl AgentRegistry {
    /// Registry with built-in agents only
    pub fn builtin() -> Self {
        let agents = get_builtin_agents()
            .into_iter()
            .map(|a| (a.name.clone(), a))
            .collect();
        Self { agents }
    }

    /// Build from explicit definitions
    ///
    /// Every name must be a known agent kind and appear once.
    pub fn from_definitions(definitions: impl IntoIterator<Item = AgentDefinition>) -> Result<Self> {
        let mut agents = IndexMap::new();
        for def in definitions {
            if AgentKind::from_name(&def.name).is_none() {
                return Err(ButlerError::config(format!("unknown agent '{}'", def.name)));
            }
            if agents.contains_key(&def.name) {
                return Err(ButlerError::config(format!(
                    "agent '{}' is defined more than once",
                    def.name
                )));
            }
            agents.insert(def.name.clone(), def);
        }
        Ok(Self { agents })
    }

    /// Built-ins, then overrides from `agents_dir` (if given)
    ///
    /// An override replaces the built-in in place, so declaration order is kept.
    pub fn load(agents_dir: Option<&Path>) -> Result<Self> {
        let mut registry = Self::builtin();
        if let Some(dir) = agents_dir {
            for (name, config) in load_agent_configs(dir)? {
                debug!("Loaded YAML agent config: {}", name);
                registry.agents.insert(name, config);
            }
        }
        Ok(registry)
    }

    /// Get an agent by name, or fail with `DelegationTargetNotFound`
    pub fn lookup(&self, name: &str) -> Result<&AgentDefinition> {
        self.agents
            .get(name)
            .ok_or_else(|| ButlerError::DelegationTargetNotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.get(name)
    }

    /// All agents in declaration order
    pub fn list_all(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.values()
    }

    /// Agents the coordinator can delegate to (everything but the butler)
    pub fn delegates(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents
            .values()
            .filter(|a| a.kind() != Some(AgentKind::Butler))
    }

    /// The coordinating agent's own definition
    pub fn coordinator(&self) -> Result<&AgentDefinition> {
        self.agents
            .get(AgentKind::Butler.name())
            .ok_or_else(|| ButlerError::config("no butler agent is registered"))
    }

    /// Delegates whose intent patterns match, most specific first
    ///
    /// Ties keep declaration order.
    pub fn candidates_for(&self, intent: &str) -> Vec<(&AgentDefinition, Specificity)> {
        let mut matches: Vec<_> = self
            .delegates()
            .filter_map(|a| a.match_intent(intent).map(|s| (a, s)))
            .collect();
        // stable sort keeps declaration order for equal specificity
        matches.sort_by(|a, b| b.1.cmp(&a.1));
        matches
    }

    /// Best delegate for an intent, if any
    pub fn select_for(&self, intent: &str) -> Option<&AgentDefinition> {
        self.candidates_for(intent).into_iter().next().map(|(a, _)| a)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
