//! In-memory session store

use super::{
    duplicate_turn, AuditRecord, ConversationKind, ConversationSummary, ConversationTurn,
    DelegationRequest, SessionRecord, SessionStore,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Default)]
struct Inner {
    conversations: IndexMap<String, ConversationSummary>,
    records: Vec<SessionRecord>,
}

impl Inner {
    fn has_turn(&self, id: &str) -> bool {
        self.records
            .iter()
            .any(|r| matches!(r, SessionRecord::Turn(t) if t.id == id))
    }

    fn touch(&mut self, record: &SessionRecord) {
        let now = Utc::now();
        let conversation_id = record.conversation_id().to_string();
        let summary = self
            .conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| ConversationSummary::open(conversation_id, ConversationKind::Adhoc, now));
        if let SessionRecord::Turn(turn) = record {
            summary.message_count += 1;
            summary.last_active = turn.created_at;
        }
    }
}

/// Process-local store; contents are lost on exit
#[derive(Default)]
pub struct InMemorySessionStore {
    inner: Mutex<Inner>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn ensure_conversation(&self, kind: &ConversationKind) -> Result<String> {
        let now = Utc::now();
        let id = kind.conversation_id(now);
        self.inner
            .lock()
            .conversations
            .entry(id.clone())
            .or_insert_with(|| ConversationSummary::open(id.clone(), kind.clone(), now));
        Ok(id)
    }

    async fn append_all(&self, records: Vec<SessionRecord>) -> Result<()> {
        // one lock for the batch keeps it atomic
        let mut inner = self.inner.lock();
        let mut batch = HashSet::new();
        for record in &records {
            if let SessionRecord::Turn(turn) = record {
                if inner.has_turn(&turn.id) || !batch.insert(turn.id.as_str()) {
                    return Err(duplicate_turn(&turn.id));
                }
            }
        }
        for record in records {
            inner.touch(&record);
            inner.records.push(record);
        }
        Ok(())
    }

    async fn list_turns(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>> {
        Ok(self
            .inner
            .lock()
            .records
            .iter()
            .filter_map(|r| match r {
                SessionRecord::Turn(t) if t.conversation_id == conversation_id => Some(t.clone()),
                _ => None,
            })
            .collect())
    }

    async fn list_delegations(&self, conversation_id: &str) -> Result<Vec<DelegationRequest>> {
        Ok(self
            .inner
            .lock()
            .records
            .iter()
            .filter_map(|r| match r {
                SessionRecord::Delegation(d) if d.conversation_id == conversation_id => {
                    Some(d.clone())
                }
                _ => None,
            })
            .collect())
    }

    async fn list_audit(&self, conversation_id: Option<&str>) -> Result<Vec<AuditRecord>> {
        Ok(self
            .inner
            .lock()
            .records
            .iter()
            .filter_map(|r| match r {
                SessionRecord::Audit(a)
                    if conversation_id.map_or(true, |c| a.conversation_id == c) =>
                {
                    Some(a.clone())
                }
                _ => None,
            })
            .collect())
    }

    async fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>> {
        let mut summaries: Vec<_> = self.inner.lock().conversations.values().cloned().collect();
        // stable: equal timestamps keep creation order
        summaries.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn record_count(&self) -> Result<usize> {
        Ok(self.inner.lock().records.len())
    }
}
