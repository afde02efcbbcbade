//! Agent system
//!
//! - `AgentDefinition`: name, permitted tools, model tier, intents, playbook
//! - `AgentRegistry`: built-ins plus YAML overrides, immutable after startup

mod builtins;
mod config;
pub mod config_loader;
mod registry;

pub use builtins::{builtin_agent, get_builtin_agents};
pub use config::*;
pub use registry::AgentRegistry;
