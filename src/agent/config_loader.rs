//! Agent configuration loader
//!
//! Loads agent overrides from `<agents_dir>/*.yaml`. The file stem is the
//! agent name and must be one of the known agent kinds.

use super::config::{AgentDefinition, AgentKind};
use crate::error::{ButlerError, Result};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Load all agent overrides from a directory
///
/// A missing directory yields no overrides. An unreadable file, bad YAML or
/// an unknown agent name is a configuration error.
pub fn load_agent_configs(dir: &Path) -> Result<IndexMap<String, AgentDefinition>> {
    let mut configs = IndexMap::new();
    if !dir.is_dir() {
        return Ok(configs);
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    // read_dir order is platform dependent
    paths.sort();

    for path in paths {
        let name = match path.file_stem().and_then(|s| s.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };

        if configs.contains_key(&name) {
            return Err(ButlerError::config(format!(
                "agent '{}' is configured by more than one file in {}",
                name,
                dir.display()
            )));
        }
        if AgentKind::from_name(&name).is_none() {
            return Err(ButlerError::config(format!(
                "agent config {} names unknown agent '{}'",
                path.display(),
                name
            )));
        }

        let mut config = load_config_file(&path)?;
        config.name = name.clone();
        config.built_in = false;
        if config.system_prompt.is_empty() {
            config.system_prompt = name.clone();
        }
        debug!(agent = %name, path = %path.display(), "Loaded agent override");
        configs.insert(name, config);
    }

    Ok(configs)
}

/// Load a single agent definition from a YAML file
fn load_config_file(path: &Path) -> Result<AgentDefinition> {
    let content = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&content).map_err(|e| {
        ButlerError::config(format!("failed to parse {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ModelTier;
    use tempfile::TempDir;

    #[test]
    fn test_missing_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        let configs = load_agent_configs(&temp.path().join("nope")).unwrap();
        assert!(configs.is_empty());
    }

    #[test]
    fn test_load_single_config() {
        let temp = TempDir::new().unwrap();
        let config_content = r#"
description: "Calendar only"
model_tier: fast
tools: [get_calendar_events]
intents: ["calendar.*"]
"#;
        std::fs::write(temp.path().join("scheduler.yaml"), config_content).unwrap();
        std::fs::write(temp.path().join("README.md"), "ignored").unwrap();

        let configs = load_agent_configs(temp.path()).unwrap();
        assert_eq!(configs.len(), 1);

        let scheduler = configs.get("scheduler").unwrap();
        assert_eq!(scheduler.name, "scheduler");
        assert_eq!(scheduler.system_prompt, "scheduler");
        assert_eq!(scheduler.model_tier, ModelTier::Fast);
        assert!(!scheduler.built_in);
    }

    #[test]
    fn test_unknown_agent_name_rejected() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("ghost_agent.yaml"), "description: boo").unwrap();

        let err = load_agent_configs(temp.path()).unwrap_err();
        assert!(matches!(err, ButlerError::Configuration(_)));
    }

    #[test]
    fn test_bad_yaml_rejected() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("triage.yaml"), "tools: [unclosed").unwrap();

        let err = load_agent_configs(temp.path()).unwrap_err();
        assert!(matches!(err, ButlerError::Configuration(_)));
    }

    #[test]
    fn test_same_agent_in_yaml_and_yml_rejected() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("scheduler.yaml"), "model_tier: fast").unwrap();
        std::fs::write(temp.path().join("scheduler.yml"), "model_tier: deep").unwrap();

        let err = load_agent_configs(temp.path()).unwrap_err();
        assert!(matches!(err, ButlerError::Configuration(ref m) if m.contains("scheduler")));
    }

    #[test]
    fn test_configs_load_in_name_order() {
        let temp = TempDir::new().unwrap();
        for name in ["triage", "communicator", "scheduler"] {
            std::fs::write(temp.path().join(format!("{}.yaml", name)), "description: x").unwrap();
        }

        let configs = load_agent_configs(temp.path()).unwrap();
        let names: Vec<&str> = configs.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["communicator", "scheduler", "triage"]);
    }
}
