//! Handlebars templates for agent system prompts
//!
//! An agent's `system_prompt` field names a registered template. Built-in
//! templates are `butler` plus one per sub-agent name (all sharing the
//! generic agent prompt); `<prompts_dir>/*.hbs` files add or replace
//! templates by file stem.

use crate::agent::{AgentDefinition, AgentKind, AgentRegistry};
use crate::error::{ButlerError, Result};
use crate::tool::{SideEffect, ToolCatalog};
use handlebars::Handlebars;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

const BUTLER_TEMPLATE: &str = include_str!("templates/butler.hbs");
const AGENT_TEMPLATE: &str = include_str!("templates/agent.hbs");

/// Holds the handlebars templates
pub struct Templates {
    handlebars: Handlebars<'static>,
}

impl Templates {
    /// Built-in templates only
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        // prompts are plain text, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.register_helper("join", Box::new(join_helper));

        register(&mut handlebars, AgentKind::Butler.name(), BUTLER_TEMPLATE)?;
        for kind in AgentKind::ALL.into_iter().filter(|k| *k != AgentKind::Butler) {
            register(&mut handlebars, kind.name(), AGENT_TEMPLATE)?;
        }
        Ok(Self { handlebars })
    }

    /// Built-ins, then `*.hbs` overrides from `prompts_dir` (if given)
    pub fn load(prompts_dir: Option<&Path>) -> Result<Self> {
        let mut templates = Self::new()?;
        let dir = match prompts_dir {
            Some(dir) if dir.is_dir() => dir,
            _ => return Ok(templates),
        };

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("hbs"))
            .collect();
        paths.sort();

        for path in paths {
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            let source = std::fs::read_to_string(&path)?;
            register(&mut templates.handlebars, &name, &source)?;
            debug!(template = %name, "Loaded prompt template override");
        }
        Ok(templates)
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.handlebars.has_template(name)
    }

    /// Render a template by name with the given data
    pub fn render<T: Serialize>(&self, template_name: &str, data: &T) -> Result<String> {
        self.handlebars
            .render(template_name, data)
            .map_err(|e| ButlerError::config(format!("prompt '{}': {}", template_name, e)))
    }

    /// Render an agent's system prompt
    pub fn render_agent_prompt(
        &self,
        agent: &AgentDefinition,
        registry: &AgentRegistry,
        catalog: &ToolCatalog,
    ) -> Result<String> {
        let context = PromptContext::new(agent, registry, catalog);
        self.render(&agent.system_prompt, &context)
    }
}

fn register(handlebars: &mut Handlebars<'static>, name: &str, source: &str) -> Result<()> {
    handlebars
        .register_template_string(name, source)
        .map_err(|e| ButlerError::config(format!("template '{}' does not parse: {}", name, e)))
}

/// Data for rendering an agent prompt
#[derive(Serialize, Debug)]
pub struct PromptContext {
    pub agent_name: String,
    pub agent_title: String,
    pub description: String,
    pub model_tier: &'static str,
    pub today: String,
    pub tools: Vec<ToolLine>,
    /// Delegable agents; only filled for the butler
    pub delegates: Vec<DelegateLine>,
}

#[derive(Serialize, Debug)]
pub struct ToolLine {
    pub id: String,
    pub description: String,
    pub side_effect: &'static str,
    pub needs_confirmation: bool,
}

#[derive(Serialize, Debug)]
pub struct DelegateLine {
    pub name: String,
    pub description: String,
    pub intents: Vec<String>,
}

impl PromptContext {
    pub fn new(agent: &AgentDefinition, registry: &AgentRegistry, catalog: &ToolCatalog) -> Self {
        let tools = agent
            .tools
            .iter()
            .filter_map(|id| catalog.lookup(id))
            .map(|tool| ToolLine {
                id: tool.id.clone(),
                description: tool.description.clone(),
                side_effect: tool.side_effect.as_str(),
                needs_confirmation: tool.side_effect == SideEffect::Destructive,
            })
            .collect();

        let delegates = if agent.kind() == Some(AgentKind::Butler) {
            registry
                .delegates()
                .map(|d| DelegateLine {
                    name: d.name.clone(),
                    description: d.description.clone(),
                    intents: d.intents.iter().map(|p| p.as_str().to_string()).collect(),
                })
                .collect()
        } else {
            Vec::new()
        };

        Self {
            agent_name: agent.name.clone(),
            agent_title: agent.title().to_string(),
            description: agent.description.clone(),
            model_tier: agent.model_tier.as_str(),
            today: chrono::Local::now().format("%A, %B %d, %Y").to_string(),
            tools,
            delegates,
        }
    }
}

// Join an array of strings with a separator
handlebars::handlebars_helper!(join_helper: |arr: Json, sep: str| {
    arr.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join(sep)
        })
        .unwrap_or_default()
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin_catalog;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_templates_resolve_every_agent() {
        let templates = Templates::new().unwrap();
        for agent in AgentRegistry::builtin().list_all() {
            assert!(templates.has_template(&agent.system_prompt), "{}", agent.name);
        }
        assert!(!templates.has_template("ghost_prompt"));
    }

    #[test]
    fn test_butler_prompt_lists_delegates() {
        let templates = Templates::new().unwrap();
        let registry = AgentRegistry::builtin();
        let catalog = builtin_catalog().unwrap();
        let butler = registry.coordinator().unwrap();

        let rendered = templates.render_agent_prompt(butler, &registry, &catalog).unwrap();
        assert!(rendered.contains("**scheduler** (calendar.*)"));
        assert!(rendered.contains("**communicator** (message.*, email.send)"));
        assert!(rendered.contains("`get_preferences` [read_only]"));
    }

    #[test]
    fn test_agent_prompt_flags_destructive_tools() {
        let templates = Templates::new().unwrap();
        let registry = AgentRegistry::builtin();
        let catalog = builtin_catalog().unwrap();
        let communicator = registry.lookup("communicator").unwrap();

        let rendered = templates
            .render_agent_prompt(communicator, &registry, &catalog)
            .unwrap();
        assert!(rendered.contains("Communicator agent"));
        assert!(rendered.contains("`send_slack_message` [destructive] (needs confirmation)"));
        assert!(rendered.contains("`draft_email` [mutating]:"));
        assert!(!rendered.contains("## Specialists"));
    }

    #[test]
    fn test_override_directory() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("triage.hbs"), "Triage for {{agent_title}}").unwrap();
        std::fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let templates = Templates::load(Some(temp.path())).unwrap();
        let registry = AgentRegistry::builtin();
        let catalog = builtin_catalog().unwrap();
        let triage = registry.lookup("triage").unwrap();
        assert_eq!(
            templates.render_agent_prompt(triage, &registry, &catalog).unwrap(),
            "Triage for Triage"
        );
    }

    #[test]
    fn test_broken_override_is_config_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("triage.hbs"), "{{#each tools}}").unwrap();
        let err = Templates::load(Some(temp.path())).err().unwrap();
        assert!(matches!(err, ButlerError::Configuration(_)));
    }

    #[test]
    fn test_overrides_load_in_name_order() {
        let temp = TempDir::new().unwrap();
        for name in ["zeta", "alpha", "mid"] {
            std::fs::write(temp.path().join(format!("{}.hbs", name)), "{{#each tools}}").unwrap();
        }

        // the first broken file by name is the one reported
        let err = Templates::load(Some(temp.path())).err().unwrap();
        assert!(err.to_string().contains("'alpha'"), "{}", err);
    }
}
