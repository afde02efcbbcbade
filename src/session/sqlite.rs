//! SQLite-backed session store
//!
//! One connection behind a mutex. The database runs in WAL mode and the
//! audit table rejects updates and deletes at the schema level.

use super::{
    duplicate_turn, AuditRecord, ConversationKind, ConversationSummary, ConversationTurn,
    DelegationRequest, DelegationTarget, Role, SessionRecord, SessionStore,
};
use crate::agent::ModelTier;
use crate::error::{ButlerError, Result};
use crate::permission::{DecisionKind, ReasonCode};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Database file name inside the data directory
pub const DB_FILENAME: &str = "orion.db";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        project_id TEXT,
        display_name TEXT NOT NULL,
        started_at TEXT NOT NULL,
        last_message_at TEXT NOT NULL,
        message_count INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS turns (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        conversation_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        handled_by TEXT,
        created_at TEXT NOT NULL,
        -- JSON array of recorded tool calls
        tool_calls TEXT NOT NULL DEFAULT '[]'
    );

    CREATE TABLE IF NOT EXISTS delegations (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        conversation_id TEXT NOT NULL,
        turn_id TEXT NOT NULL,
        intent TEXT NOT NULL,
        -- NULL means the coordinator handled the turn itself
        target_agent TEXT,
        model_tier TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS audit_log (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        conversation_id TEXT NOT NULL,
        agent TEXT NOT NULL,
        tool TEXT NOT NULL,
        decision TEXT NOT NULL,
        reason TEXT NOT NULL,
        warning INTEGER NOT NULL,
        confirmation_id TEXT,
        args_fingerprint TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_turns_conversation ON turns(conversation_id);
    CREATE INDEX IF NOT EXISTS idx_delegations_conversation ON delegations(conversation_id);
    CREATE INDEX IF NOT EXISTS idx_audit_conversation ON audit_log(conversation_id);
    CREATE INDEX IF NOT EXISTS idx_conversations_last ON conversations(last_message_at);

    CREATE TRIGGER IF NOT EXISTS audit_log_no_update BEFORE UPDATE ON audit_log
    BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;

    CREATE TRIGGER IF NOT EXISTS audit_log_no_delete BEFORE DELETE ON audit_log
    BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;
"#;

/// Result of a store health check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreHealth {
    pub path: Option<PathBuf>,
    pub journal_mode: String,
    pub wal_enabled: bool,
    pub conversations: usize,
    pub healthy: bool,
}

pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteSessionStore {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        apply_schema(&conn)?;
        info!(path = %path.display(), journal_mode = %mode, "Opened session store");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ButlerError::storage("session database lock poisoned"))
    }

    /// Journal mode and basic counts
    pub fn check_health(&self) -> Result<StoreHealth> {
        let conn = self.conn()?;
        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let conversations: i64 =
            conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        let wal_enabled = journal_mode.eq_ignore_ascii_case("wal");
        Ok(StoreHealth {
            // file databases are expected to be in WAL mode
            healthy: wal_enabled || self.path.is_none(),
            path: self.path.clone(),
            journal_mode,
            wal_enabled,
            conversations: conversations as usize,
        })
    }
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    // databases created before turns carried tool calls
    let columns: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('turns') WHERE name = 'tool_calls'",
        [],
        |row| row.get(0),
    )?;
    if columns == 0 {
        conn.execute_batch("ALTER TABLE turns ADD COLUMN tool_calls TEXT NOT NULL DEFAULT '[]'")?;
        debug!("Added tool_calls column to turns");
    }
    Ok(())
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn bad_value(idx: usize, what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown {} '{}'", what, raw).into(),
    )
}

fn insert_record(tx: &Transaction<'_>, record: &SessionRecord) -> Result<()> {
    let now = Utc::now();
    let conversation_id = record.conversation_id();
    tx.execute(
        r#"INSERT OR IGNORE INTO conversations
           (id, kind, project_id, display_name, started_at, last_message_at, message_count)
           VALUES (?1, ?2, NULL, ?3, ?4, ?4, 0)"#,
        params![
            conversation_id,
            ConversationKind::Adhoc.as_str(),
            ConversationKind::Adhoc.display_name(now),
            fmt_ts(&now)
        ],
    )?;

    match record {
        SessionRecord::Turn(turn) => {
            let taken = tx
                .query_row("SELECT 1 FROM turns WHERE id = ?1", params![turn.id], |_| Ok(()))
                .optional()?
                .is_some();
            if taken {
                return Err(duplicate_turn(&turn.id));
            }
            tx.execute(
                r#"INSERT INTO turns
                   (id, conversation_id, role, content, handled_by, created_at, tool_calls)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
                params![
                    turn.id,
                    turn.conversation_id,
                    turn.role.as_str(),
                    turn.content,
                    turn.handled_by,
                    fmt_ts(&turn.created_at),
                    serde_json::to_string(&turn.tool_calls)?
                ],
            )?;
            tx.execute(
                r#"UPDATE conversations
                   SET message_count = message_count + 1, last_message_at = ?2
                   WHERE id = ?1"#,
                params![turn.conversation_id, fmt_ts(&turn.created_at)],
            )?;
        }
        SessionRecord::Delegation(d) => {
            let target_agent = match &d.target {
                DelegationTarget::DirectHandle => None,
                DelegationTarget::Agent(name) => Some(name.as_str()),
            };
            tx.execute(
                r#"INSERT INTO delegations
                   (id, conversation_id, turn_id, intent, target_agent, model_tier, created_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
                params![
                    d.id,
                    d.conversation_id,
                    d.turn_id,
                    d.intent,
                    target_agent,
                    d.model_tier.map(|t| t.as_str()),
                    fmt_ts(&d.created_at)
                ],
            )?;
        }
        SessionRecord::Audit(a) => {
            tx.execute(
                r#"INSERT INTO audit_log
                   (id, conversation_id, agent, tool, decision, reason, warning,
                    confirmation_id, args_fingerprint, created_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
                params![
                    a.id,
                    a.conversation_id,
                    a.agent,
                    a.tool,
                    a.decision.as_str(),
                    a.reason.as_str(),
                    a.warning,
                    a.confirmation_id,
                    a.args_fingerprint,
                    fmt_ts(&a.timestamp)
                ],
            )?;
        }
    }
    Ok(())
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let decision: String = row.get(4)?;
    let reason: String = row.get(5)?;
    Ok(AuditRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        agent: row.get(2)?,
        tool: row.get(3)?,
        decision: DecisionKind::parse(&decision).ok_or_else(|| bad_value(4, "decision", &decision))?,
        reason: ReasonCode::parse(&reason).ok_or_else(|| bad_value(5, "reason", &reason))?,
        warning: row.get(6)?,
        confirmation_id: row.get(7)?,
        args_fingerprint: row.get(8)?,
        timestamp: ts_at(row, 9)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationSummary> {
    let kind: String = row.get(1)?;
    let project_id: Option<String> = row.get(2)?;
    Ok(ConversationSummary {
        id: row.get(0)?,
        kind: ConversationKind::from_parts(&kind, project_id),
        display_name: row.get(3)?,
        started_at: ts_at(row, 4)?,
        last_active: ts_at(row, 5)?,
        message_count: row.get::<_, i64>(6)? as usize,
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn ensure_conversation(&self, kind: &ConversationKind) -> Result<String> {
        let now = Utc::now();
        let id = kind.conversation_id(now);
        let conn = self.conn()?;

        let existing: Option<String> = conn
            .query_row("SELECT id FROM conversations WHERE id = ?1", [&id], |row| row.get(0))
            .optional()?;
        if existing.is_none() {
            conn.execute(
                r#"INSERT INTO conversations
                   (id, kind, project_id, display_name, started_at, last_message_at, message_count)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0)"#,
                params![
                    id,
                    kind.as_str(),
                    kind.project_id(),
                    kind.display_name(now),
                    fmt_ts(&now)
                ],
            )?;
            debug!(conversation_id = %id, "Created conversation");
        }
        Ok(id)
    }

    async fn append_all(&self, records: Vec<SessionRecord>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for record in &records {
            insert_record(&tx, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn list_turns(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, conversation_id, role, content, handled_by, created_at, tool_calls
               FROM turns WHERE conversation_id = ?1 ORDER BY seq"#,
        )?;
        let rows = stmt.query_map([conversation_id], |row| {
            let role: String = row.get(2)?;
            let tool_calls: String = row.get(6)?;
            Ok(ConversationTurn {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                role: Role::parse(&role).ok_or_else(|| bad_value(2, "role", &role))?,
                content: row.get(3)?,
                handled_by: row.get(4)?,
                created_at: ts_at(row, 5)?,
                tool_calls: serde_json::from_str(&tool_calls).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        6,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    async fn list_delegations(&self, conversation_id: &str) -> Result<Vec<DelegationRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, conversation_id, turn_id, intent, target_agent, model_tier, created_at
               FROM delegations WHERE conversation_id = ?1 ORDER BY seq"#,
        )?;
        let rows = stmt.query_map([conversation_id], |row| {
            let target_agent: Option<String> = row.get(4)?;
            let model_tier: Option<String> = row.get(5)?;
            Ok(DelegationRequest {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                turn_id: row.get(2)?,
                intent: row.get(3)?,
                target: match target_agent {
                    Some(name) => DelegationTarget::Agent(name),
                    None => DelegationTarget::DirectHandle,
                },
                model_tier: model_tier.as_deref().and_then(ModelTier::parse),
                created_at: ts_at(row, 6)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    async fn list_audit(&self, conversation_id: Option<&str>) -> Result<Vec<AuditRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, conversation_id, agent, tool, decision, reason, warning,
                      confirmation_id, args_fingerprint, created_at
               FROM audit_log
               WHERE ?1 IS NULL OR conversation_id = ?1
               ORDER BY seq"#,
        )?;
        let rows = stmt.query_map([conversation_id], audit_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    async fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, kind, project_id, display_name, started_at, last_message_at, message_count
               FROM conversations
               ORDER BY last_message_at DESC, rowid ASC
               LIMIT ?1"#,
        )?;
        let rows = stmt.query_map([limit as i64], summary_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    async fn record_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            r#"SELECT (SELECT COUNT(*) FROM turns)
                    + (SELECT COUNT(*) FROM delegations)
                    + (SELECT COUNT(*) FROM audit_log)"#,
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn health(&self) -> Result<Option<StoreHealth>> {
        self.check_health().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RecordedToolCall;
    use tempfile::TempDir;

    fn audit(conversation_id: &str, tool: &str) -> AuditRecord {
        AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            agent: "scheduler".into(),
            tool: tool.into(),
            decision: DecisionKind::Deny,
            reason: ReasonCode::NotPermitted,
            warning: false,
            confirmation_id: None,
            args_fingerprint: "00ff".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_file_store_uses_wal() {
        let temp = TempDir::new().unwrap();
        let store = SqliteSessionStore::open(&temp.path().join(DB_FILENAME)).unwrap();
        let health = store.health().await.unwrap().unwrap();
        assert!(health.wal_enabled);
        assert!(health.healthy);
        assert_eq!(health.conversations, 0);
    }

    #[tokio::test]
    async fn test_round_trip_records() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let conv = store.ensure_conversation(&ConversationKind::Daily).await.unwrap();

        store
            .append_all(vec![
                SessionRecord::Turn(ConversationTurn::user("m1", &conv, "move my 3pm")),
                SessionRecord::Audit(audit(&conv, "update_event")),
                SessionRecord::Delegation(DelegationRequest::new(
                    &conv,
                    "m1",
                    "calendar.reschedule",
                    DelegationTarget::Agent("scheduler".into()),
                    Some(ModelTier::Deep),
                )),
                SessionRecord::Turn(ConversationTurn::assistant(&conv, "scheduler", "Can't do that")),
            ])
            .await
            .unwrap();

        let turns = store.list_turns(&conv).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].handled_by.as_deref(), Some("scheduler"));

        let delegations = store.list_delegations(&conv).await.unwrap();
        assert_eq!(delegations[0].target, DelegationTarget::Agent("scheduler".into()));
        assert_eq!(delegations[0].model_tier, Some(ModelTier::Deep));

        let audit = store.list_audit(Some(&conv)).await.unwrap();
        assert_eq!(audit[0].reason, ReasonCode::NotPermitted);
        assert_eq!(store.list_audit(None).await.unwrap().len(), 1);
        assert_eq!(store.record_count().await.unwrap(), 4);

        let summary = &store.recent_conversations(5).await.unwrap()[0];
        assert_eq!(summary.id, conv);
        assert_eq!(summary.kind, ConversationKind::Daily);
        assert_eq!(summary.message_count, 2);
    }

    #[tokio::test]
    async fn test_turn_keeps_tool_calls() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let calls = vec![RecordedToolCall {
            tool: "list_events".into(),
            summary: "list your calendar events".into(),
            status: "executed".into(),
        }];
        store
            .append(SessionRecord::Turn(
                ConversationTurn::assistant("conv_a", "scheduler", "Here you go")
                    .with_tool_calls(calls.clone()),
            ))
            .await
            .unwrap();

        let turns = store.list_turns("conv_a").await.unwrap();
        assert_eq!(turns[0].tool_calls, calls);
    }

    #[tokio::test]
    async fn test_opens_database_without_tool_calls_column() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(DB_FILENAME);
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                r#"CREATE TABLE turns (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    conversation_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    handled_by TEXT,
                    created_at TEXT NOT NULL
                );
                INSERT INTO turns (id, conversation_id, role, content, handled_by, created_at)
                VALUES ('m1', 'conv_a', 'user', 'hi', NULL, '2026-01-05T09:00:00.000000Z');"#,
            )
            .unwrap();
        }

        let store = SqliteSessionStore::open(&path).unwrap();
        let turns = store.list_turns("conv_a").await.unwrap();
        assert_eq!(turns.len(), 1);
        assert!(turns[0].tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_writes_nothing() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let turn = ConversationTurn::user("dup", "conv_a", "hello");

        let err = store
            .append_all(vec![
                SessionRecord::Turn(turn.clone()),
                SessionRecord::Turn(turn),
            ])
            .await;
        assert!(err.is_err());
        assert_eq!(store.record_count().await.unwrap(), 0);
        assert!(store.recent_conversations(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_log_is_append_only() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store
            .append(SessionRecord::Audit(audit("conv_a", "send_email")))
            .await
            .unwrap();

        let conn = store.conn().unwrap();
        assert!(conn.execute("UPDATE audit_log SET reason = 'read_only'", []).is_err());
        assert!(conn.execute("DELETE FROM audit_log", []).is_err());
    }

    #[tokio::test]
    async fn test_recent_conversations_newest_first() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store
            .append(SessionRecord::Turn(ConversationTurn::user("m1", "conv_old", "a")))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .append(SessionRecord::Turn(ConversationTurn::user("m2", "conv_new", "b")))
            .await
            .unwrap();

        let recent = store.recent_conversations(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "conv_new");
    }

    #[tokio::test]
    async fn test_reopen_keeps_records() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(DB_FILENAME);
        {
            let store = SqliteSessionStore::open(&path).unwrap();
            store
                .append(SessionRecord::Audit(audit("conv_a", "send_email")))
                .await
                .unwrap();
        }
        let store = SqliteSessionStore::open(&path).unwrap();
        assert_eq!(store.list_audit(Some("conv_a")).await.unwrap().len(), 1);
    }
}
