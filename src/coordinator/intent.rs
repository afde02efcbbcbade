//! Intent classification
//!
//! Maps a user turn to a dotted intent category such as
//! `calendar.schedule_meeting`. Categories under `general.` are handled by
//! the coordinator itself; everything else is delegated.

use crate::error::{ButlerError, Result};
use regex::Regex;
use serde::Serialize;

/// Fallback category for turns no rule matches
pub const GENERAL_CHAT: &str = "general.chat";

const DIRECT_PREFIX: &str = "general.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Intent {
    pub category: String,
    /// Pattern that produced the category, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
}

impl Intent {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            matched_rule: None,
        }
    }

    /// Should the coordinator answer this itself?
    pub fn is_direct(&self) -> bool {
        self.category.starts_with(DIRECT_PREFIX)
    }
}

pub trait IntentClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Intent;
}

/// Ordered regex rules; the first match wins
pub struct KeywordClassifier {
    rules: Vec<(String, Regex)>,
}

impl KeywordClassifier {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Default rules for the built-in agents
    pub fn builtin() -> Result<Self> {
        let mut classifier = Self::empty();
        for (category, pattern) in BUILTIN_RULES {
            classifier = classifier.with_rule(*category, pattern)?;
        }
        Ok(classifier)
    }

    /// Append a rule; patterns match case-insensitively
    pub fn with_rule(mut self, category: impl Into<String>, pattern: &str) -> Result<Self> {
        let category = category.into();
        let regex = Regex::new(&format!("(?i){}", pattern)).map_err(|e| {
            ButlerError::config(format!("intent rule for '{}' does not compile: {}", category, e))
        })?;
        self.rules.push((category, regex));
        Ok(self)
    }
}

impl IntentClassifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Intent {
        self.rules
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(category, re)| Intent {
                category: category.clone(),
                matched_rule: Some(re.as_str().to_string()),
            })
            .unwrap_or_else(|| Intent::new(GENERAL_CHAT))
    }
}

// Order matters: more specific phrasings come before the catch-alls.
const BUILTIN_RULES: &[(&str, &str)] = &[
    ("general.help", r"^\s*(help|what can you do)\b"),
    ("general.preferences", r"\bwhat do you know about me\b"),
    ("preference.forget", r"\b(forget|stop remembering)\b"),
    ("preference.show", r"\b(my preferences|what do i prefer)\b"),
    ("preference.record", r"\b(i prefer|i like|i don't like|remember that)\b"),
    (
        "calendar.cancel",
        r"\b(cancel|delete|remove)\b.*\b(meeting|event|appointment|call)\b",
    ),
    (
        "calendar.reschedule",
        r"\b(reschedule|move|push|postpone)\b.*\b(meeting|event|appointment|call)\b",
    ),
    (
        "calendar.schedule_meeting",
        r"\b(schedule|book|set up|arrange)\b.*\b(meeting|call|appointment|event|1:1)\b",
    ),
    ("calendar.query", r"\b(calendar|agenda|schedule)\b|\bwhat('s| is) on\b"),
    ("email.send", r"\b(send|write|reply)\b.*\b(email|mail)\b"),
    ("message.list_channels", r"\bslack channels\b"),
    ("message.send", r"\b(slack|dm|ping)\b|\bsend .*\bmessage\b"),
    ("inbox.summary", r"\b(summarize|summary of)\b.*\b(inbox|email|mail)\b"),
    ("inbox.triage", r"\b(triage|inbox|unread)\b"),
    ("para.move", r"\b(move|file|archive)\b.*\b(note|folder|project|area|resource)\b"),
    ("para.create_folder", r"\b(create|new|make)\b.*\b(folder|project|area)\b"),
    ("notes.open", r"\bopen\b.*\b(note|doc|document|file)\b"),
    ("notes.search", r"\b(find|search|look up|where is)\b.*\b(note|notes|doc|document|file)\b"),
];
