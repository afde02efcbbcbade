//! Two-step confirmation ledger
//!
//! A destructive call first yields a pending confirmation. The user then
//! confirms or declines it, and the same call is presented again with the
//! confirmation id attached. Each confirmation is bound to one
//! (conversation, agent, tool, argument fingerprint) and is consumed once.
//!
//! States: `Pending -> Confirmed -> Consumed`, `Pending -> Declined`,
//! `Pending|Confirmed -> Expired`, `Pending|Confirmed -> Cancelled`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Default time a user has to answer
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(300);

const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationState {
    Pending,
    Confirmed,
    Consumed,
    Declined,
    Expired,
    Cancelled,
}

impl ConfirmationState {
    fn is_open(&self) -> bool {
        matches!(self, ConfirmationState::Pending | ConfirmationState::Confirmed)
    }
}

/// The exact call a confirmation authorizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationBinding {
    pub conversation_id: String,
    pub agent: String,
    pub tool: String,
    pub args_fingerprint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingConfirmation {
    pub id: String,
    pub binding: ConfirmationBinding,
    /// Arguments of the parked call, so it can be replayed after confirmation
    pub args: Value,
    pub state: ConfirmationState,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    deadline: Instant,
    /// When the entry reached a terminal state
    #[serde(skip)]
    settled_at: Option<Instant>,
}

impl PendingConfirmation {
    fn settle(&mut self, state: ConfirmationState, now: Instant) {
        self.state = state;
        self.settled_at = Some(now);
    }
}

/// Why a confirmation could not be used
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfirmationError {
    #[error("no confirmation with id {0}")]
    Unknown(String),
    #[error("confirmation is still waiting for the user")]
    StillPending { expires_at: DateTime<Utc> },
    #[error("confirmation expired")]
    Expired,
    #[error("confirmation belongs to a different call")]
    Mismatch,
    #[error("confirmation was declined")]
    Declined,
    #[error("confirmation was cancelled")]
    Cancelled,
    #[error("confirmation was already used")]
    AlreadyUsed,
}

impl ConfirmationError {
    fn from_state(state: ConfirmationState) -> Self {
        match state {
            ConfirmationState::Expired => ConfirmationError::Expired,
            ConfirmationState::Declined => ConfirmationError::Declined,
            ConfirmationState::Cancelled => ConfirmationError::Cancelled,
            _ => ConfirmationError::AlreadyUsed,
        }
    }
}

pub struct ConfirmationLedger {
    entries: Mutex<HashMap<String, PendingConfirmation>>,
    timeout: Duration,
}

impl ConfirmationLedger {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a new pending confirmation for a call
    pub fn request(&self, binding: ConfirmationBinding, args: Value) -> PendingConfirmation {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let entry = PendingConfirmation {
            id: format!("confirm_{}", Uuid::new_v4().simple()),
            binding,
            args,
            state: ConfirmationState::Pending,
            requested_at: now,
            expires_at,
            deadline: Instant::now()
                .checked_add(self.timeout)
                .unwrap_or_else(|| Instant::now() + FAR_FUTURE),
            settled_at: None,
        };

        info!(
            confirmation_id = %entry.id,
            tool = %entry.binding.tool,
            agent = %entry.binding.agent,
            "Waiting for user confirmation (timeout: {:?})",
            self.timeout
        );
        self.entries.lock().insert(entry.id.clone(), entry.clone());
        entry
    }

    /// User granted the confirmation
    pub fn confirm(
        &self,
        conversation_id: &str,
        id: &str,
    ) -> Result<PendingConfirmation, ConfirmationError> {
        self.answer(conversation_id, id, ConfirmationState::Confirmed)
    }

    /// User refused the confirmation
    pub fn decline(
        &self,
        conversation_id: &str,
        id: &str,
    ) -> Result<PendingConfirmation, ConfirmationError> {
        self.answer(conversation_id, id, ConfirmationState::Declined)
    }

    fn answer(
        &self,
        conversation_id: &str,
        id: &str,
        next: ConfirmationState,
    ) -> Result<PendingConfirmation, ConfirmationError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .filter(|e| e.binding.conversation_id == conversation_id)
            .ok_or_else(|| ConfirmationError::Unknown(id.to_string()))?;

        expire_if_due(entry, Instant::now());
        if entry.state != ConfirmationState::Pending {
            return Err(ConfirmationError::from_state(entry.state));
        }
        if next.is_open() {
            entry.state = next;
        } else {
            entry.settle(next, Instant::now());
        }
        debug!(confirmation_id = %id, state = ?next, "Confirmation answered");
        Ok(entry.clone())
    }

    /// Use a confirmation for a call; succeeds once, for the bound call only
    pub fn redeem(&self, id: &str, binding: &ConfirmationBinding) -> Result<(), ConfirmationError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| ConfirmationError::Unknown(id.to_string()))?;

        expire_if_due(entry, Instant::now());
        if entry.binding != *binding {
            return Err(ConfirmationError::Mismatch);
        }
        match entry.state {
            ConfirmationState::Pending => Err(ConfirmationError::StillPending {
                expires_at: entry.expires_at,
            }),
            ConfirmationState::Confirmed => {
                entry.settle(ConfirmationState::Consumed, Instant::now());
                Ok(())
            }
            other => Err(ConfirmationError::from_state(other)),
        }
    }

    pub fn get(&self, id: &str) -> Option<PendingConfirmation> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(id)?;
        expire_if_due(entry, Instant::now());
        Some(entry.clone())
    }

    /// Confirmations still waiting on the user in a conversation
    pub fn pending_for(&self, conversation_id: &str) -> Vec<PendingConfirmation> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let mut pending: Vec<_> = entries
            .values_mut()
            .filter(|e| e.binding.conversation_id == conversation_id)
            .filter_map(|e| {
                expire_if_due(e, now);
                (e.state == ConfirmationState::Pending).then(|| e.clone())
            })
            .collect();
        pending.sort_by_key(|e| e.requested_at);
        pending
    }

    /// Cancel every open confirmation in a conversation; returns how many
    pub fn cancel_conversation(&self, conversation_id: &str) -> usize {
        let now = Instant::now();
        let mut cancelled = 0;
        for entry in self.entries.lock().values_mut() {
            if entry.binding.conversation_id == conversation_id && entry.state.is_open() {
                entry.settle(ConfirmationState::Cancelled, now);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(conversation_id, cancelled, "Cancelled open confirmations");
        }
        cancelled
    }

    /// Expire everything past its deadline and drop entries that settled
    /// at least one timeout ago; returns how many expired
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        let mut expired = 0;
        entries.retain(|_, entry| {
            if expire_if_due(entry, now) {
                expired += 1;
                return true;
            }
            !entry
                .settled_at
                .is_some_and(|at| now.saturating_duration_since(at) >= self.timeout)
        });
        let pruned = before - entries.len();
        if expired > 0 || pruned > 0 {
            debug!(expired, pruned, "Swept confirmations");
        }
        expired
    }

    /// Number of tracked confirmations, settled ones included
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ConfirmationLedger {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIRMATION_TIMEOUT)
    }
}

/// Returns true when the entry moved to `Expired`
fn expire_if_due(entry: &mut PendingConfirmation, now: Instant) -> bool {
    if entry.state.is_open() && now >= entry.deadline {
        entry.settle(ConfirmationState::Expired, now);
        return true;
    }
    false
}

/// Periodically sweep expired confirmations until `shutdown` fires
pub fn spawn_expiry_sweeper(
    ledger: Arc<ConfirmationLedger>,
    period: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    ledger.sweep_expired();
                }
            }
        }
    })
}
