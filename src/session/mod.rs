//! Session store
//!
//! Append-only persistence for conversation turns, delegation requests
//! and audit records. Implementations serialize writes so records of one
//! conversation keep their append order.

mod memory;
mod records;
mod sqlite;

pub use memory::InMemorySessionStore;
pub use records::*;
pub use sqlite::{SqliteSessionStore, StoreHealth, DB_FILENAME};

use crate::error::{ButlerError, Result};
use async_trait::async_trait;

/// Turn ids are unique across the store
fn duplicate_turn(id: &str) -> ButlerError {
    ButlerError::InvalidInput(format!("turn id '{}' is already used", id))
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Get or create the conversation for a kind; returns its id
    async fn ensure_conversation(&self, kind: &ConversationKind) -> Result<String>;

    /// Append one record
    async fn append(&self, record: SessionRecord) -> Result<()> {
        self.append_all(vec![record]).await
    }

    /// Append several records, all or nothing
    ///
    /// A record for a conversation that does not exist yet opens an ad hoc one.
    /// A turn whose id is already stored rejects the batch with `InvalidInput`.
    async fn append_all(&self, records: Vec<SessionRecord>) -> Result<()>;

    async fn list_turns(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>>;

    async fn list_delegations(&self, conversation_id: &str) -> Result<Vec<DelegationRequest>>;

    /// Audit records in append order, optionally for one conversation
    async fn list_audit(&self, conversation_id: Option<&str>) -> Result<Vec<AuditRecord>>;

    /// Conversations by last activity, newest first
    async fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>>;

    /// Total number of records of every type
    async fn record_count(&self) -> Result<usize>;

    /// Backend health, when the backend has any to report
    async fn health(&self) -> Result<Option<StoreHealth>> {
        Ok(None)
    }
}
