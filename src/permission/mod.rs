//! Permission gate
//!
//! Every tool call passes through `PermissionGate::authorize` before it
//! reaches the executor. The decision is a pure function of the agent's
//! permitted set, the tool's side-effect class, the mutating policy and
//! the state of any presented confirmation. Every call appends exactly one
//! audit record, whatever the outcome.

mod confirmation;

pub use confirmation::{
    spawn_expiry_sweeper, ConfirmationBinding, ConfirmationError, ConfirmationLedger,
    ConfirmationState, PendingConfirmation, DEFAULT_CONFIRMATION_TIMEOUT,
};

use crate::agent::AgentRegistry;
use crate::error::Result;
use crate::session::{AuditRecord, SessionRecord, SessionStore};
use crate::tool::{SideEffect, ToolCatalog};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

/// How mutating (non-destructive) tools are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MutatingPolicy {
    /// Allow silently
    Allow,
    /// Allow, flagging the call so the user is told
    #[default]
    Warn,
    /// Two-step confirmation, same as destructive tools
    Confirm,
}

/// Machine-readable reason attached to every decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    ReadOnly,
    MutatingWarned,
    MutatingAllowed,
    Confirmed,
    ConfirmationRequired,
    UnknownAgent,
    NotPermitted,
    UnknownTool,
    ConfirmationExpired,
    ConfirmationMismatch,
    ConfirmationDeclined,
    ConfirmationCancelled,
    ConfirmationUnknown,
}

impl ReasonCode {
    pub const ALL: [ReasonCode; 13] = [
        ReasonCode::ReadOnly,
        ReasonCode::MutatingWarned,
        ReasonCode::MutatingAllowed,
        ReasonCode::Confirmed,
        ReasonCode::ConfirmationRequired,
        ReasonCode::UnknownAgent,
        ReasonCode::NotPermitted,
        ReasonCode::UnknownTool,
        ReasonCode::ConfirmationExpired,
        ReasonCode::ConfirmationMismatch,
        ReasonCode::ConfirmationDeclined,
        ReasonCode::ConfirmationCancelled,
        ReasonCode::ConfirmationUnknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::ReadOnly => "read_only",
            ReasonCode::MutatingWarned => "mutating_warned",
            ReasonCode::MutatingAllowed => "mutating_allowed",
            ReasonCode::Confirmed => "confirmed",
            ReasonCode::ConfirmationRequired => "confirmation_required",
            ReasonCode::UnknownAgent => "unknown_agent",
            ReasonCode::NotPermitted => "not_permitted",
            ReasonCode::UnknownTool => "unknown_tool",
            ReasonCode::ConfirmationExpired => "confirmation_expired",
            ReasonCode::ConfirmationMismatch => "confirmation_mismatch",
            ReasonCode::ConfirmationDeclined => "confirmation_declined",
            ReasonCode::ConfirmationCancelled => "confirmation_cancelled",
            ReasonCode::ConfirmationUnknown => "confirmation_unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome class, as stored in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Allow,
    Deny,
    PendingConfirmation,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Allow => "allow",
            DecisionKind::Deny => "deny",
            DecisionKind::PendingConfirmation => "pending_confirmation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(DecisionKind::Allow),
            "deny" => Some(DecisionKind::Deny),
            "pending_confirmation" => Some(DecisionKind::PendingConfirmation),
            _ => None,
        }
    }
}

/// A proposed tool call
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    pub conversation_id: String,
    pub agent: String,
    pub tool: String,
    pub args: Value,
    /// Confirmation presented with a replayed call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<String>,
}

impl AuthorizationRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        agent: impl Into<String>,
        tool: impl Into<String>,
        args: Value,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            agent: agent.into(),
            tool: tool.into(),
            args,
            confirmation: None,
        }
    }

    pub fn with_confirmation(mut self, confirmation_id: impl Into<String>) -> Self {
        self.confirmation = Some(confirmation_id.into());
        self
    }

    fn binding(&self) -> ConfirmationBinding {
        ConfirmationBinding {
            conversation_id: self.conversation_id.clone(),
            agent: self.agent.clone(),
            tool: self.tool.clone(),
            args_fingerprint: args_fingerprint(&self.args),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow {
        reason: ReasonCode,
        /// Mutating call allowed under the `warn` policy
        warning: bool,
    },
    Deny {
        reason: ReasonCode,
    },
    PendingConfirmation {
        confirmation_id: String,
        expires_at: DateTime<Utc>,
    },
}

impl Decision {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Decision::Allow { .. } => DecisionKind::Allow,
            Decision::Deny { .. } => DecisionKind::Deny,
            Decision::PendingConfirmation { .. } => DecisionKind::PendingConfirmation,
        }
    }

    pub fn reason(&self) -> ReasonCode {
        match self {
            Decision::Allow { reason, .. } | Decision::Deny { reason } => *reason,
            Decision::PendingConfirmation { .. } => ReasonCode::ConfirmationRequired,
        }
    }

    fn warning(&self) -> bool {
        matches!(self, Decision::Allow { warning: true, .. })
    }

    fn allow(reason: ReasonCode) -> Self {
        Decision::Allow {
            reason,
            warning: false,
        }
    }

    fn deny(reason: ReasonCode) -> Self {
        Decision::Deny { reason }
    }
}

/// SHA-256 of the call arguments' compact JSON, hex encoded
///
/// serde_json maps are key-ordered, so equal arguments hash equally.
pub fn args_fingerprint(args: &Value) -> String {
    let digest = Sha256::digest(args.to_string().as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct PermissionGate {
    registry: Arc<AgentRegistry>,
    catalog: Arc<ToolCatalog>,
    store: Arc<dyn SessionStore>,
    ledger: Arc<ConfirmationLedger>,
    mutating_policy: MutatingPolicy,
}

impl PermissionGate {
    pub fn new(
        registry: Arc<AgentRegistry>,
        catalog: Arc<ToolCatalog>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            registry,
            catalog,
            store,
            ledger: Arc::new(ConfirmationLedger::default()),
            mutating_policy: MutatingPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: MutatingPolicy) -> Self {
        self.mutating_policy = policy;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<ConfirmationLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn ledger(&self) -> &Arc<ConfirmationLedger> {
        &self.ledger
    }

    pub fn mutating_policy(&self) -> MutatingPolicy {
        self.mutating_policy
    }

    /// Decide a tool call and append its audit record
    ///
    /// Fails only when the audit record cannot be written; no decision is
    /// returned without its record.
    pub async fn authorize(&self, request: &AuthorizationRequest) -> Result<Decision> {
        let decision = self.evaluate(request);
        let record = AuditRecord::new(request, &decision, args_fingerprint(&request.args));
        self.store.append(SessionRecord::Audit(record)).await?;

        match &decision {
            Decision::Deny { reason } => warn!(
                agent = %request.agent,
                tool = %request.tool,
                reason = %reason,
                "Tool call denied"
            ),
            _ => info!(
                agent = %request.agent,
                tool = %request.tool,
                decision = decision.kind().as_str(),
                reason = %decision.reason(),
                "Tool call authorized"
            ),
        }
        Ok(decision)
    }

    fn evaluate(&self, request: &AuthorizationRequest) -> Decision {
        let agent = match self.registry.get(&request.agent) {
            Some(agent) => agent,
            None => return Decision::deny(ReasonCode::UnknownAgent),
        };
        if !agent.permits(&request.tool) {
            return Decision::deny(ReasonCode::NotPermitted);
        }
        let side_effect = match self.catalog.classify(&request.tool) {
            Some(side_effect) => side_effect,
            None => return Decision::deny(ReasonCode::UnknownTool),
        };

        let needs_confirmation = match side_effect {
            SideEffect::ReadOnly => false,
            SideEffect::Mutating => self.mutating_policy == MutatingPolicy::Confirm,
            SideEffect::Destructive => true,
        };
        if needs_confirmation {
            return self.confirmation_decision(request);
        }

        match (side_effect, self.mutating_policy) {
            (SideEffect::ReadOnly, _) => Decision::allow(ReasonCode::ReadOnly),
            (_, MutatingPolicy::Warn) => Decision::Allow {
                reason: ReasonCode::MutatingWarned,
                warning: true,
            },
            _ => Decision::allow(ReasonCode::MutatingAllowed),
        }
    }

    fn confirmation_decision(&self, request: &AuthorizationRequest) -> Decision {
        let binding = request.binding();
        let confirmation_id = match &request.confirmation {
            Some(id) => id,
            None => {
                let pending = self.ledger.request(binding, request.args.clone());
                return Decision::PendingConfirmation {
                    confirmation_id: pending.id,
                    expires_at: pending.expires_at,
                };
            }
        };

        match self.ledger.redeem(confirmation_id, &binding) {
            Ok(()) => Decision::allow(ReasonCode::Confirmed),
            Err(ConfirmationError::StillPending { expires_at }) => Decision::PendingConfirmation {
                confirmation_id: confirmation_id.clone(),
                expires_at,
            },
            Err(ConfirmationError::Unknown(_)) => Decision::deny(ReasonCode::ConfirmationUnknown),
            Err(ConfirmationError::Expired) => Decision::deny(ReasonCode::ConfirmationExpired),
            Err(ConfirmationError::Mismatch) => Decision::deny(ReasonCode::ConfirmationMismatch),
            Err(ConfirmationError::Declined) => Decision::deny(ReasonCode::ConfirmationDeclined),
            Err(ConfirmationError::Cancelled) => Decision::deny(ReasonCode::ConfirmationCancelled),
            // a consumed confirmation cannot authorize a second call
            Err(ConfirmationError::AlreadyUsed) => Decision::deny(ReasonCode::ConfirmationUnknown),
        }
    }
}

impl AuditRecord {
    fn new(request: &AuthorizationRequest, decision: &Decision, args_fingerprint: String) -> Self {
        let confirmation_id = match decision {
            Decision::PendingConfirmation { confirmation_id, .. } => Some(confirmation_id.clone()),
            _ => request.confirmation.clone(),
        };
        AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: request.conversation_id.clone(),
            agent: request.agent.clone(),
            tool: request.tool.clone(),
            decision: decision.kind(),
            reason: decision.reason(),
            warning: decision.warning(),
            confirmation_id,
            args_fingerprint,
            timestamp: Utc::now(),
        }
    }
}
