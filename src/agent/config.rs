//! Agent definition types
//!
//! An agent is a named, independently promptable unit with:
//! - An ordered set of permitted tool ids
//! - A model tier (fast vs deep reasoning)
//! - Intent patterns it accepts delegation for
//! - A playbook: the tool steps it runs for each intent

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The closed set of agents the butler knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Coordinator; handles turns directly or delegates
    Butler,
    Triage,
    Scheduler,
    Communicator,
    Navigator,
    PreferenceLearner,
}

impl AgentKind {
    /// All kinds in declaration order
    pub const ALL: [AgentKind; 6] = [
        AgentKind::Butler,
        AgentKind::Triage,
        AgentKind::Scheduler,
        AgentKind::Communicator,
        AgentKind::Navigator,
        AgentKind::PreferenceLearner,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AgentKind::Butler => "butler",
            AgentKind::Triage => "triage",
            AgentKind::Scheduler => "scheduler",
            AgentKind::Communicator => "communicator",
            AgentKind::Navigator => "navigator",
            AgentKind::PreferenceLearner => "preference_learner",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Human-facing title
    pub fn title(&self) -> &'static str {
        match self {
            AgentKind::Butler => "Butler",
            AgentKind::Triage => "Triage",
            AgentKind::Scheduler => "Scheduler",
            AgentKind::Communicator => "Communicator",
            AgentKind::Navigator => "Navigator",
            AgentKind::PreferenceLearner => "Preference Learner",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Model tier label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    #[default]
    Fast,
    /// Deep-reasoning model
    Deep,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Fast => "fast",
            ModelTier::Deep => "deep",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fast" => Some(ModelTier::Fast),
            "deep" => Some(ModelTier::Deep),
            _ => None,
        }
    }
}

/// How closely an intent pattern matched
///
/// Exact matches beat wildcards; longer wildcard prefixes beat shorter ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Specificity {
    pub exact: bool,
    pub prefix_len: usize,
}

impl Ord for Specificity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.exact
            .cmp(&other.exact)
            .then(self.prefix_len.cmp(&other.prefix_len))
    }
}

impl PartialOrd for Specificity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Intent pattern
///
/// - `calendar.schedule_meeting` matches exactly
/// - `calendar.*` matches anything under `calendar.`
/// - `*` matches everything
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentPattern(String);

impl IntentPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, intent: &str) -> Option<Specificity> {
        let pattern = self.0.as_str();
        if pattern == "*" {
            return Some(Specificity {
                exact: false,
                prefix_len: 0,
            });
        }

        match pattern.strip_suffix('*') {
            Some(prefix) => intent.starts_with(prefix).then_some(Specificity {
                exact: false,
                prefix_len: prefix.len(),
            }),
            None => (pattern == intent).then_some(Specificity {
                exact: true,
                prefix_len: pattern.len(),
            }),
        }
    }
}

impl From<&str> for IntentPattern {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Static definition of an agent
///
/// Immutable once the registry is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique name. When loading from YAML files, this is set from the filename.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Template reference for the system prompt (resolved by `Templates`)
    #[serde(default)]
    pub system_prompt: String,

    /// Permitted tool ids, in declaration order
    #[serde(default)]
    pub tools: IndexSet<String>,

    #[serde(default)]
    pub model_tier: ModelTier,

    /// Intents this agent accepts delegation for
    #[serde(default)]
    pub intents: Vec<IntentPattern>,

    /// Tool steps per intent. The `*` key is the fallback.
    #[serde(default)]
    pub playbook: IndexMap<String, Vec<String>>,

    #[serde(default, skip_serializing)]
    pub built_in: bool,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            system_prompt: name.clone(),
            name,
            description: String::new(),
            tools: IndexSet::new(),
            model_tier: ModelTier::Fast,
            intents: Vec::new(),
            playbook: IndexMap::new(),
            built_in: false,
        }
    }

    /// Create a built-in definition for a known kind
    pub fn builtin(kind: AgentKind) -> Self {
        let mut def = Self::new(kind.name());
        def.built_in = true;
        def
    }

    pub fn kind(&self) -> Option<AgentKind> {
        AgentKind::from_name(&self.name)
    }

    pub fn title(&self) -> &str {
        self.kind().map(|k| k.title()).unwrap_or(&self.name)
    }

    /// Is this tool in the permitted set?
    pub fn permits(&self, tool_id: &str) -> bool {
        self.tools.contains(tool_id)
    }

    /// Best match among this agent's intent patterns
    pub fn match_intent(&self, intent: &str) -> Option<Specificity> {
        self.intents.iter().filter_map(|p| p.matches(intent)).max()
    }

    /// Tool steps for an intent, falling back to the `*` entry
    pub fn steps_for(&self, intent: &str) -> &[String] {
        self.playbook
            .get(intent)
            .or_else(|| self.playbook.get("*"))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Builder: set description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Builder: set system prompt reference
    pub fn with_prompt(mut self, reference: impl Into<String>) -> Self {
        self.system_prompt = reference.into();
        self
    }

    /// Builder: set model tier
    pub fn with_model_tier(mut self, tier: ModelTier) -> Self {
        self.model_tier = tier;
        self
    }

    /// Builder: replace the permitted tool set
    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: add one permitted tool
    pub fn allow_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.insert(tool.into());
        self
    }

    /// Builder: accept delegation for an intent pattern
    pub fn handles(mut self, pattern: impl Into<String>) -> Self {
        self.intents.push(IntentPattern::new(pattern));
        self
    }

    /// Builder: set the tool steps for an intent
    pub fn with_steps<I, S>(mut self, intent: impl Into<String>, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.playbook
            .insert(intent.into(), steps.into_iter().map(Into::into).collect());
        self
    }
}
