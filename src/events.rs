//! Butler event types
//!
//! Events emitted while a turn is processed, for shells that render
//! progress. Sent over an unbounded channel; a closed receiver is ignored.

use crate::permission::{DecisionKind, ReasonCode};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Events emitted during turn processing
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ButlerEvent {
    // === Turn Lifecycle ===
    TurnStart {
        conversation_id: String,
        turn_id: String,
    },
    /// Intent assigned to the turn
    Classified {
        turn_id: String,
        intent: String,
    },
    TurnComplete {
        turn_id: String,
        status: String,
    },
    /// Turn cancelled by the user
    Cancelled {
        turn_id: String,
    },

    // === Delegation ===
    DelegationStart {
        agent: String,
        intent: String,
    },
    DelegationEnd {
        agent: String,
    },

    // === Tool Calls ===
    PermissionDecision {
        agent: String,
        tool: String,
        decision: DecisionKind,
        reason: ReasonCode,
    },
    /// A destructive call is parked until the user answers
    ConfirmationRequested {
        confirmation_id: String,
        agent: String,
        tool: String,
        summary: String,
        expires_at: DateTime<Utc>,
    },
    ToolCallStart {
        agent: String,
        tool: String,
        summary: String,
    },
    ToolCallEnd {
        agent: String,
        tool: String,
        is_error: bool,
        duration_ms: u64,
    },

    Error {
        error: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<ButlerEvent>;

/// Stream of butler events
pub type ButlerEventStream = Pin<Box<dyn Stream<Item = ButlerEvent> + Send>>;

/// Channel whose receiving half is already a stream
pub fn event_channel() -> (EventSender, ButlerEventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .boxed();
    (tx, stream)
}

pub(crate) fn emit(events: Option<&EventSender>, event: ButlerEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_delivers_in_order() {
        let (tx, mut stream) = event_channel();
        emit(
            Some(&tx),
            ButlerEvent::TurnStart {
                conversation_id: "c".into(),
                turn_id: "t".into(),
            },
        );
        emit(Some(&tx), ButlerEvent::Cancelled { turn_id: "t".into() });
        drop(tx);

        assert!(matches!(stream.next().await, Some(ButlerEvent::TurnStart { .. })));
        assert!(matches!(stream.next().await, Some(ButlerEvent::Cancelled { .. })));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_serialized_tag() {
        let json = serde_json::to_value(ButlerEvent::PermissionDecision {
            agent: "scheduler".into(),
            tool: "update_event".into(),
            decision: DecisionKind::Deny,
            reason: ReasonCode::NotPermitted,
        })
        .unwrap();
        assert_eq!(json["type"], "permission_decision");
        assert_eq!(json["reason"], "not_permitted");
    }

    #[test]
    fn test_emit_without_listener() {
        emit(None, ButlerEvent::Error { error: "x".into() });
        let (tx, stream) = event_channel();
        drop(stream);
        emit(Some(&tx), ButlerEvent::Error { error: "x".into() });
    }
}
