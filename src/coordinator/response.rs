//! Turns in, responses out

use super::handler::ToolCallOutcome;
use crate::error::FailureKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A user turn as received from the shell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTurn {
    pub id: String,
    pub conversation_id: String,
    pub text: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl UserTurn {
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            text: text.into(),
            arguments: Map::new(),
        }
    }

    /// Turn with a freshly generated id
    pub fn generate(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(format!("msg_{}", Uuid::new_v4().simple()), conversation_id, text)
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Handled by the butler itself
    Answered,
    Delegated,
    AwaitingConfirmation {
        confirmation_id: String,
        expires_at: DateTime<Utc>,
    },
    Failed {
        kind: FailureKind,
    },
    Cancelled,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Answered => "answered",
            ResponseStatus::Delegated => "delegated",
            ResponseStatus::AwaitingConfirmation { .. } => "awaiting_confirmation",
            ResponseStatus::Failed { .. } => "failed",
            ResponseStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ResponseStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub conversation_id: String,
    pub turn_id: String,
    /// Agent that produced the message
    pub handled_by: String,
    #[serde(flatten)]
    pub status: ResponseStatus,
    pub message: String,
    pub tool_calls: Vec<ToolCallOutcome>,
}

impl Response {
    pub(crate) fn failed(
        conversation_id: impl Into<String>,
        turn_id: impl Into<String>,
        handled_by: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            turn_id: turn_id.into(),
            handled_by: handled_by.into(),
            status: ResponseStatus::Failed { kind },
            message: message.into(),
            tool_calls: Vec::new(),
        }
    }

    /// Confirmation the user must answer before the turn can finish
    pub fn pending_confirmation(&self) -> Option<&str> {
        match &self.status {
            ResponseStatus::AwaitingConfirmation { confirmation_id, .. } => Some(confirmation_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_ids_are_valid_message_ids() {
        let turn = UserTurn::generate("conv_daily_2026-10-16", "hi");
        crate::session::validate_message_id(&turn.id).unwrap();
        assert_ne!(turn.id, UserTurn::generate("c", "hi").id);
    }

    #[test]
    fn test_response_json_shape() {
        let response = Response::failed(
            "c",
            "t",
            "butler",
            FailureKind::DelegationTargetNotFound,
            "sorry",
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["kind"], "delegation_target_not_found");
        assert_eq!(value["tool_calls"], json!([]));
        assert!(response.pending_confirmation().is_none());
    }
}
