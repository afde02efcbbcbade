//! Tool catalog and the execution seam
//!
//! Tools are executed by an external system. The core only knows each
//! tool's contract and side-effect class, and calls out through
//! `ToolExecutor` once the permission gate has allowed the call.

use crate::error::{ButlerError, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Side-effect classification of a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    /// Only reads external state
    ReadOnly,
    /// Changes external state in a recoverable way
    Mutating,
    /// Irreversible or high-impact; always confirmed by the user first
    Destructive,
}

impl SideEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffect::ReadOnly => "read_only",
            SideEffect::Mutating => "mutating",
            SideEffect::Destructive => "destructive",
        }
    }
}

impl std::fmt::Display for SideEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invocation contract for a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub description: String,
    /// JSON schema for the arguments
    pub parameters: Value,
    pub side_effect: SideEffect,
    /// Integration that provides this capability (e.g. "google_calendar")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration: Option<String>,
}

impl ToolDefinition {
    pub fn new(id: impl Into<String>, side_effect: SideEffect) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
            side_effect,
            integration: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_integration(mut self, integration: impl Into<String>) -> Self {
        self.integration = Some(integration.into());
        self
    }
}

/// Static catalog of tool definitions, in declaration order
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: IndexMap<String, ToolDefinition>,
}

impl ToolCatalog {
    /// Build a catalog; duplicate ids are a configuration error
    pub fn from_definitions(definitions: impl IntoIterator<Item = ToolDefinition>) -> Result<Self> {
        let mut tools = IndexMap::new();
        for def in definitions {
            if tools.contains_key(&def.id) {
                return Err(ButlerError::config(format!(
                    "tool '{}' is defined more than once",
                    def.id
                )));
            }
            tools.insert(def.id.clone(), def);
        }
        Ok(Self { tools })
    }

    pub fn lookup(&self, tool_id: &str) -> Option<&ToolDefinition> {
        self.tools.get(tool_id)
    }

    pub fn classify(&self, tool_id: &str) -> Option<SideEffect> {
        self.tools.get(tool_id).map(|t| t.side_effect)
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.tools.contains_key(tool_id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Distinct integration bindings, in first-seen order
    pub fn integrations(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for integration in self.tools.values().filter_map(|t| t.integration.as_deref()) {
            if !seen.contains(&integration) {
                seen.push(integration);
            }
        }
        seen
    }
}

/// Context passed to the executor for one call
#[derive(Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    pub agent: String,
    pub cancellation: CancellationToken,
}

impl ToolContext {
    pub fn new(
        conversation_id: impl Into<String>,
        agent: impl Into<String>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            agent: agent.into(),
            cancellation,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("{integration} is unavailable: {detail}")]
    Unavailable { integration: String, detail: String },
    #[error("tool failed: {0}")]
    Failed(String),
    #[error("tool call cancelled")]
    Cancelled,
}

impl From<ToolError> for ButlerError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Unavailable { integration, detail } => {
                ButlerError::DependencyUnavailable { integration, detail }
            }
            ToolError::Failed(msg) => ButlerError::ToolFailed(msg),
            ToolError::Cancelled => ButlerError::Cancelled,
        }
    }
}

/// External tool-execution system
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        tool: &ToolDefinition,
        args: Value,
        ctx: &ToolContext,
    ) -> std::result::Result<Value, ToolError>;
}

/// Short human-readable form of a tool call, e.g. `send_email(to=sam@..., subject=Hi)`
pub fn humanize_call(tool_id: &str, args: &Value) -> String {
    format!("{}({})", tool_id, summarize_args(args))
}

/// Summarize args into a short string
fn summarize_args(args: &Value) -> String {
    match args {
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .take(2)
                .map(|(k, v)| {
                    let val = match v {
                        Value::String(s) => truncate(s, 30),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        _ => "...".to_string(),
                    };
                    format!("{}={}", k, val)
                })
                .collect();
            parts.join(", ")
        }
        Value::Null => String::new(),
        _ => "...".to_string(),
    }
}

/// Truncate a string with ellipsis, respecting char boundaries
pub(crate) fn truncate(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> ToolCatalog {
        ToolCatalog::from_definitions(vec![
            ToolDefinition::new("get_calendar_events", SideEffect::ReadOnly)
                .with_integration("google_calendar"),
            ToolDefinition::new("update_event", SideEffect::Mutating)
                .with_integration("google_calendar"),
            ToolDefinition::new("send_slack_message", SideEffect::Destructive)
                .with_integration("slack"),
        ])
        .unwrap()
    }

    #[test]
    fn test_lookup_and_classify() {
        let catalog = catalog();
        assert_eq!(catalog.classify("update_event"), Some(SideEffect::Mutating));
        assert_eq!(catalog.classify("nope"), None);
        assert!(catalog.lookup("get_calendar_events").is_some());
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = ToolCatalog::from_definitions(vec![
            ToolDefinition::new("a", SideEffect::ReadOnly),
            ToolDefinition::new("a", SideEffect::Mutating),
        ])
        .unwrap_err();
        assert!(matches!(err, ButlerError::Configuration(_)));
    }

    #[test]
    fn test_integrations_are_distinct_and_ordered() {
        assert_eq!(catalog().integrations(), vec!["google_calendar", "slack"]);
    }

    #[test]
    fn test_humanize_call() {
        let s = humanize_call("send_email", &json!({"to": "sam@example.com"}));
        assert_eq!(s, "send_email(to=sam@example.com)");
        assert_eq!(humanize_call("list_emails", &Value::Null), "list_emails()");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn test_side_effect_serde() {
        let s = serde_yaml::to_string(&SideEffect::Destructive).unwrap();
        assert_eq!(s.trim(), "destructive");
    }
}
