//! Session records
//!
//! Everything the core persists is one of three append-only records:
//! conversation turns, delegation requests and audit records.

use crate::agent::ModelTier;
use crate::error::{ButlerError, Result};
use crate::permission::{DecisionKind, ReasonCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Longest accepted message id
pub const MAX_MESSAGE_ID_LEN: usize = 128;

/// What a conversation is about; decides its id and display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "project_id", rename_all = "snake_case")]
pub enum ConversationKind {
    /// One conversation per day
    Daily,
    Project(String),
    /// Inbox processing, one per day
    Inbox,
    Adhoc,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Daily => "daily",
            ConversationKind::Project(_) => "project",
            ConversationKind::Inbox => "inbox",
            ConversationKind::Adhoc => "adhoc",
        }
    }

    /// Deterministic id for daily, project and inbox conversations; fresh for ad hoc
    pub fn conversation_id(&self, now: DateTime<Utc>) -> String {
        match self {
            ConversationKind::Daily => format!("conv_daily_{}", now.format("%Y-%m-%d")),
            ConversationKind::Project(id) => format!("conv_proj_{}", id),
            ConversationKind::Inbox => format!("conv_inbox_{}", now.format("%Y-%m-%d")),
            ConversationKind::Adhoc => format!("conv_adhoc_{}", Uuid::new_v4()),
        }
    }

    pub fn display_name(&self, now: DateTime<Utc>) -> String {
        match self {
            ConversationKind::Daily => format!("Daily - {}", now.format("%B %d, %Y")),
            ConversationKind::Project(id) => format!("Project: {}", id),
            ConversationKind::Inbox => "Inbox Processing".to_string(),
            ConversationKind::Adhoc => format!("Session at {}", now.format("%H:%M")),
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        match self {
            ConversationKind::Project(id) => Some(id),
            _ => None,
        }
    }

    /// Rebuild from stored columns
    pub fn from_parts(kind: &str, project_id: Option<String>) -> Self {
        match (kind, project_id) {
            ("daily", _) => ConversationKind::Daily,
            ("project", Some(id)) => ConversationKind::Project(id),
            ("inbox", _) => ConversationKind::Inbox,
            _ => ConversationKind::Adhoc,
        }
    }
}

/// Parses `daily`, `inbox`, `adhoc` or `project:<id>`
impl FromStr for ConversationKind {
    type Err = ButlerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "daily" => Ok(ConversationKind::Daily),
            "inbox" => Ok(ConversationKind::Inbox),
            "adhoc" => Ok(ConversationKind::Adhoc),
            other => match other.strip_prefix("project:") {
                Some(id) if !id.is_empty() => {
                    validate_message_id(id)?;
                    Ok(ConversationKind::Project(id.to_string()))
                }
                _ => Err(ButlerError::InvalidInput(format!(
                    "unknown conversation kind '{}'",
                    other
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    /// Agent that produced an assistant turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled_by: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Tool calls an assistant turn reported on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<RecordedToolCall>,
}

/// One tool call as kept in the transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedToolCall {
    pub tool: String,
    pub summary: String,
    pub status: String,
}

impl ConversationTurn {
    pub fn user(id: impl Into<String>, conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            role: Role::User,
            content: content.into(),
            handled_by: None,
            created_at: Utc::now(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(
        conversation_id: impl Into<String>,
        handled_by: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            conversation_id: conversation_id.into(),
            role: Role::Assistant,
            content: content.into(),
            handled_by: Some(handled_by.into()),
            created_at: Utc::now(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<RecordedToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }
}

/// Where the coordinator routed a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "agent", rename_all = "snake_case")]
pub enum DelegationTarget {
    DirectHandle,
    Agent(String),
}

impl fmt::Display for DelegationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelegationTarget::DirectHandle => f.write_str("direct"),
            DelegationTarget::Agent(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRequest {
    pub id: String,
    pub conversation_id: String,
    /// User turn that caused the delegation
    pub turn_id: String,
    pub intent: String,
    pub target: DelegationTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_tier: Option<ModelTier>,
    pub created_at: DateTime<Utc>,
}

impl DelegationRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        turn_id: impl Into<String>,
        intent: impl Into<String>,
        target: DelegationTarget,
        model_tier: Option<ModelTier>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            turn_id: turn_id.into(),
            intent: intent.into(),
            target,
            model_tier,
            created_at: Utc::now(),
        }
    }
}

/// One authorization decision. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub conversation_id: String,
    pub agent: String,
    pub tool: String,
    pub decision: DecisionKind,
    pub reason: ReasonCode,
    pub warning: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_id: Option<String>,
    pub args_fingerprint: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum SessionRecord {
    Turn(ConversationTurn),
    Delegation(DelegationRequest),
    Audit(AuditRecord),
}

impl SessionRecord {
    pub fn conversation_id(&self) -> &str {
        match self {
            SessionRecord::Turn(t) => &t.conversation_id,
            SessionRecord::Delegation(d) => &d.conversation_id,
            SessionRecord::Audit(a) => &a.conversation_id,
        }
    }
}

/// Conversation metadata for listings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub kind: ConversationKind,
    pub display_name: String,
    pub started_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub message_count: usize,
}

impl ConversationSummary {
    pub(crate) fn open(id: impl Into<String>, kind: ConversationKind, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            display_name: kind.display_name(now),
            kind,
            started_at: now,
            last_active: now,
            message_count: 0,
        }
    }
}

/// Check a shell-supplied message id
///
/// 1-128 chars of alphanumerics, `-` and `_`; must start and end
/// alphanumeric; no two separators in a row.
pub fn validate_message_id(id: &str) -> Result<()> {
    let invalid = |why: &str| Err(ButlerError::InvalidInput(format!("message id {}", why)));

    if id.is_empty() {
        return invalid("cannot be empty");
    }
    if id.len() > MAX_MESSAGE_ID_LEN {
        return invalid("is too long (max 128 chars)");
    }
    if !id.chars().next().is_some_and(|c| c.is_alphanumeric()) {
        return invalid("must start with an alphanumeric character");
    }
    if !id.chars().last().is_some_and(|c| c.is_alphanumeric()) {
        return invalid("must end with an alphanumeric character");
    }

    let mut prev_separator = false;
    for c in id.chars() {
        let separator = c == '-' || c == '_';
        if separator && prev_separator {
            return invalid("cannot have consecutive separators");
        }
        if !separator && !c.is_alphanumeric() {
            return invalid("contains invalid characters");
        }
        prev_separator = separator;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn oct_16() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 9, 5, 0).unwrap()
    }

    #[test]
    fn test_deterministic_conversation_ids() {
        let now = oct_16();
        assert_eq!(ConversationKind::Daily.conversation_id(now), "conv_daily_2026-10-16");
        assert_eq!(ConversationKind::Inbox.conversation_id(now), "conv_inbox_2026-10-16");
        assert_eq!(
            ConversationKind::Project("launch".into()).conversation_id(now),
            "conv_proj_launch"
        );
        let a = ConversationKind::Adhoc.conversation_id(now);
        let b = ConversationKind::Adhoc.conversation_id(now);
        assert!(a.starts_with("conv_adhoc_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_names() {
        let now = oct_16();
        assert_eq!(ConversationKind::Daily.display_name(now), "Daily - October 16, 2026");
        assert_eq!(ConversationKind::Inbox.display_name(now), "Inbox Processing");
        assert_eq!(ConversationKind::Adhoc.display_name(now), "Session at 09:05");
        assert_eq!(
            ConversationKind::Project("launch".into()).display_name(now),
            "Project: launch"
        );
    }

    #[test]
    fn test_parse_conversation_kind() {
        assert_eq!("daily".parse::<ConversationKind>().unwrap(), ConversationKind::Daily);
        assert_eq!(
            "project:q4-plan".parse::<ConversationKind>().unwrap(),
            ConversationKind::Project("q4-plan".into())
        );
        assert!("project:".parse::<ConversationKind>().is_err());
        assert!("project:../etc".parse::<ConversationKind>().is_err());
        assert!("weekly".parse::<ConversationKind>().is_err());
    }

    #[test]
    fn test_valid_message_ids() {
        for id in ["a", "msg-123", "user_1-a", "A1b2C3"] {
            assert!(validate_message_id(id).is_ok(), "{id}");
        }
    }

    #[test]
    fn test_invalid_message_ids() {
        let too_long = "a".repeat(129);
        for id in ["", "-abc", "abc_", "a--b", "a_-b", "a/b", "../x", too_long.as_str()] {
            let err = validate_message_id(id).unwrap_err();
            assert!(matches!(err, ButlerError::InvalidInput(_)), "{id}");
        }
        assert!(validate_message_id(&"a".repeat(128)).is_ok());
    }

    #[test]
    fn test_delegation_target_serde() {
        let json = serde_json::to_value(DelegationTarget::Agent("scheduler".into())).unwrap();
        assert_eq!(json["type"], "agent");
        assert_eq!(json["agent"], "scheduler");
        assert_eq!(DelegationTarget::DirectHandle.to_string(), "direct");
    }
}
