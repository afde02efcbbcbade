//! Sub-agent execution
//!
//! A delegated agent sees the world through a `ToolInvoker`: every call
//! it makes goes through the permission gate first, and only allowed
//! calls reach the executor.

use crate::agent::AgentDefinition;
use crate::error::Result;
use crate::events::{emit, ButlerEvent, EventSender};
use crate::permission::{AuthorizationRequest, Decision, PermissionGate, ReasonCode};
use crate::session::RecordedToolCall;
use crate::tool::{humanize_call, ToolCatalog, ToolContext, ToolError, ToolExecutor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Work handed to a sub-agent (or to the butler for direct handling)
#[derive(Debug, Clone)]
pub struct DelegatedTask {
    pub conversation_id: String,
    pub turn_id: String,
    pub intent: String,
    /// The user's words
    pub request: String,
    /// Structured arguments supplied by the shell
    pub arguments: Map<String, Value>,
    pub agent: AgentDefinition,
    /// Rendered system prompt
    pub system_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolCallStatus {
    Executed,
    Denied {
        reason: ReasonCode,
    },
    AwaitingConfirmation {
        confirmation_id: String,
        expires_at: DateTime<Utc>,
    },
    /// Integration not connected
    Unavailable {
        integration: String,
        detail: String,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Executed => "executed",
            ToolCallStatus::Denied { .. } => "denied",
            ToolCallStatus::AwaitingConfirmation { .. } => "awaiting_confirmation",
            ToolCallStatus::Unavailable { .. } => "unavailable",
            ToolCallStatus::Failed { .. } => "failed",
            ToolCallStatus::Cancelled => "cancelled",
        }
    }
}

/// Result of one attempted tool call
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallOutcome {
    pub tool: String,
    pub summary: String,
    #[serde(flatten)]
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Mutating call allowed under the `warn` policy
    pub warning: bool,
    pub duration_ms: u64,
}

impl ToolCallOutcome {
    fn new(tool: &str, args: &Value, status: ToolCallStatus) -> Self {
        Self {
            tool: tool.to_string(),
            summary: humanize_call(tool, args),
            status,
            output: None,
            warning: false,
            duration_ms: 0,
        }
    }

    pub fn is_executed(&self) -> bool {
        self.status == ToolCallStatus::Executed
    }

    /// Transcript entry for this call
    pub fn record(&self) -> RecordedToolCall {
        RecordedToolCall {
            tool: self.tool.clone(),
            summary: self.summary.clone(),
            status: self.status.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentOutcome {
    pub summary: String,
    pub calls: Vec<ToolCallOutcome>,
}

impl AgentOutcome {
    /// The call the agent stopped on, if it did not run to completion
    pub fn blocking_call(&self) -> Option<&ToolCallOutcome> {
        self.calls.last().filter(|c| !c.is_executed())
    }

    pub fn executed(&self) -> impl Iterator<Item = &ToolCallOutcome> {
        self.calls.iter().filter(|c| c.is_executed())
    }
}

/// Behaviour of one agent
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, task: &DelegatedTask, tools: &ToolInvoker) -> Result<AgentOutcome>;
}

/// Gate + executor bound to one agent in one conversation
pub struct ToolInvoker {
    gate: Arc<PermissionGate>,
    catalog: Arc<ToolCatalog>,
    executor: Arc<dyn ToolExecutor>,
    conversation_id: String,
    agent: String,
    cancel: CancellationToken,
    events: Option<EventSender>,
}

impl ToolInvoker {
    pub fn new(
        gate: Arc<PermissionGate>,
        catalog: Arc<ToolCatalog>,
        executor: Arc<dyn ToolExecutor>,
        conversation_id: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            gate,
            catalog,
            executor,
            conversation_id: conversation_id.into(),
            agent: agent.into(),
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: Option<EventSender>) -> Self {
        self.events = events;
        self
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Authorize and, if allowed, execute a tool call
    ///
    /// Denials, pending confirmations and tool failures come back as the
    /// outcome's status. `Err` means the audit record could not be written.
    pub async fn invoke(&self, tool: &str, args: Value) -> Result<ToolCallOutcome> {
        let request = AuthorizationRequest::new(&self.conversation_id, &self.agent, tool, args);
        self.run(request).await
    }

    /// Replay a parked call with the user's confirmation attached
    pub async fn invoke_confirmed(
        &self,
        tool: &str,
        args: Value,
        confirmation_id: &str,
    ) -> Result<ToolCallOutcome> {
        let request = AuthorizationRequest::new(&self.conversation_id, &self.agent, tool, args)
            .with_confirmation(confirmation_id);
        self.run(request).await
    }

    async fn run(&self, request: AuthorizationRequest) -> Result<ToolCallOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(ToolCallOutcome::new(
                &request.tool,
                &request.args,
                ToolCallStatus::Cancelled,
            ));
        }

        let decision = self.gate.authorize(&request).await?;
        emit(
            self.events.as_ref(),
            ButlerEvent::PermissionDecision {
                agent: self.agent.clone(),
                tool: request.tool.clone(),
                decision: decision.kind(),
                reason: decision.reason(),
            },
        );

        let warning = match decision {
            Decision::Allow { warning, .. } => warning,
            Decision::Deny { reason } => {
                return Ok(ToolCallOutcome::new(
                    &request.tool,
                    &request.args,
                    ToolCallStatus::Denied { reason },
                ));
            }
            Decision::PendingConfirmation {
                confirmation_id,
                expires_at,
            } => {
                let outcome = ToolCallOutcome::new(
                    &request.tool,
                    &request.args,
                    ToolCallStatus::AwaitingConfirmation {
                        confirmation_id: confirmation_id.clone(),
                        expires_at,
                    },
                );
                emit(
                    self.events.as_ref(),
                    ButlerEvent::ConfirmationRequested {
                        confirmation_id,
                        agent: self.agent.clone(),
                        tool: request.tool.clone(),
                        summary: outcome.summary.clone(),
                        expires_at,
                    },
                );
                return Ok(outcome);
            }
        };

        let mut outcome =
            ToolCallOutcome::new(&request.tool, &request.args, ToolCallStatus::Executed);
        outcome.warning = warning;

        // The gate only allows catalogued tools
        let definition = match self.catalog.lookup(&request.tool) {
            Some(def) => def,
            None => {
                outcome.status = ToolCallStatus::Failed {
                    error: format!("tool '{}' is not in the catalog", request.tool),
                };
                return Ok(outcome);
            }
        };

        emit(
            self.events.as_ref(),
            ButlerEvent::ToolCallStart {
                agent: self.agent.clone(),
                tool: request.tool.clone(),
                summary: outcome.summary.clone(),
            },
        );

        let ctx = ToolContext::new(&self.conversation_id, &self.agent, self.cancel.clone());
        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ToolError::Cancelled),
            result = self.executor.execute(definition, request.args, &ctx) => result,
        };
        outcome.duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                debug!(tool = %request.tool, duration_ms = outcome.duration_ms, "Tool executed");
                outcome.output = Some(output);
            }
            Err(ToolError::Unavailable { integration, detail }) => {
                warn!(tool = %request.tool, integration = %integration, "Integration unavailable");
                outcome.status = ToolCallStatus::Unavailable { integration, detail };
            }
            Err(ToolError::Failed(error)) => {
                warn!(tool = %request.tool, error = %error, "Tool failed");
                outcome.status = ToolCallStatus::Failed { error };
            }
            Err(ToolError::Cancelled) => {
                outcome.status = ToolCallStatus::Cancelled;
            }
        }

        emit(
            self.events.as_ref(),
            ButlerEvent::ToolCallEnd {
                agent: self.agent.clone(),
                tool: outcome.tool.clone(),
                is_error: !outcome.is_executed(),
                duration_ms: outcome.duration_ms,
            },
        );
        Ok(outcome)
    }
}

/// Runs the agent's playbook steps for the intent, in order
///
/// Stops at the first step that does not execute.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaybookAgent;

#[async_trait]
impl AgentHandler for PlaybookAgent {
    async fn handle(&self, task: &DelegatedTask, tools: &ToolInvoker) -> Result<AgentOutcome> {
        let steps = task.agent.steps_for(&task.intent);
        let mut calls = Vec::with_capacity(steps.len());

        for step in steps {
            let mut args = Map::new();
            args.insert("request".to_string(), Value::String(task.request.clone()));
            args.extend(task.arguments.clone());

            let outcome = tools.invoke(step, Value::Object(args)).await?;
            let stop = !outcome.is_executed();
            calls.push(outcome);
            if stop {
                break;
            }
        }

        let summary = describe(task.agent.title(), &calls);
        Ok(AgentOutcome { summary, calls })
    }
}

pub(super) fn describe(title: &str, calls: &[ToolCallOutcome]) -> String {
    let done: Vec<&str> = calls
        .iter()
        .filter(|c| c.is_executed())
        .map(|c| c.tool.as_str())
        .collect();
    let done_text = if done.is_empty() {
        String::new()
    } else {
        format!(" after running {}", done.join(", "))
    };

    let last = match calls.last() {
        Some(last) => last,
        None => return format!("{} had nothing to run for this request.", title),
    };

    match &last.status {
        ToolCallStatus::Executed => {
            let changed: Vec<&str> = calls
                .iter()
                .filter(|c| c.warning)
                .map(|c| c.tool.as_str())
                .collect();
            let mut text = format!("{} finished: {}.", title, done.join(", "));
            if !changed.is_empty() {
                text.push_str(&format!(" Note: {} made changes.", changed.join(", ")));
            }
            text
        }
        ToolCallStatus::Denied { reason } => format!(
            "{} was not allowed to run {} ({}){}.",
            title, last.tool, reason, done_text
        ),
        ToolCallStatus::AwaitingConfirmation { confirmation_id, .. } => format!(
            "{} wants to run {}{}. Reply `confirm {}` to go ahead or `decline {}` to stop.",
            title, last.summary, done_text, confirmation_id, confirmation_id
        ),
        ToolCallStatus::Unavailable { integration, .. } => {
            format!("{} could not reach {}{}.", title, integration, done_text)
        }
        ToolCallStatus::Failed { .. } => format!("{} hit an error in {}{}.", title, last.tool, done_text),
        ToolCallStatus::Cancelled => format!("{} stopped: the turn was cancelled.", title),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{builtin_agent, AgentKind, AgentRegistry};
    use crate::events::event_channel;
    use crate::session::{InMemorySessionStore, SessionStore};
    use crate::tools::{builtin_catalog, DryRunExecutor};
    use futures::StreamExt;
    use serde_json::json;

    struct Fixture {
        registry: Arc<AgentRegistry>,
        gate: Arc<PermissionGate>,
        catalog: Arc<ToolCatalog>,
        executor: Arc<DryRunExecutor>,
        store: Arc<InMemorySessionStore>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(AgentRegistry::builtin());
        let catalog = Arc::new(builtin_catalog().unwrap());
        let store = Arc::new(InMemorySessionStore::new());
        let gate = Arc::new(PermissionGate::new(registry.clone(), catalog.clone(), store.clone()));
        Fixture {
            registry,
            gate,
            catalog,
            executor: Arc::new(DryRunExecutor::new()),
            store,
        }
    }

    impl Fixture {
        fn invoker(&self, agent: &str) -> ToolInvoker {
            ToolInvoker::new(
                self.gate.clone(),
                self.catalog.clone(),
                self.executor.clone(),
                "conv_test",
                agent,
            )
        }

        fn task(&self, agent: &str, intent: &str) -> DelegatedTask {
            DelegatedTask {
                conversation_id: "conv_test".into(),
                turn_id: "turn-1".into(),
                intent: intent.into(),
                request: "do the thing".into(),
                arguments: Map::new(),
                agent: self.registry.lookup(agent).unwrap().clone(),
                system_prompt: String::new(),
            }
        }
    }

    #[tokio::test]
    async fn test_not_permitted_never_reaches_executor() {
        let f = fixture();
        let outcome = f.invoker("scheduler").invoke("send_email", json!({})).await.unwrap();
        assert_eq!(
            outcome.status,
            ToolCallStatus::Denied {
                reason: ReasonCode::NotPermitted
            }
        );
        assert!(f.executor.calls().is_empty());
        assert_eq!(f.store.list_audit(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mutating_call_executes_with_warning() {
        let f = fixture();
        let (tx, events) = event_channel();
        let invoker = f.invoker("scheduler").with_events(Some(tx));

        let outcome = invoker
            .invoke("create_event", json!({"title": "Lunch"}))
            .await
            .unwrap();
        assert!(outcome.is_executed());
        assert!(outcome.warning);
        assert_eq!(outcome.summary, "create_event(title=Lunch)");
        assert_eq!(f.executor.executed_tools(), vec!["create_event"]);

        drop(invoker);
        let kinds: Vec<String> = events
            .map(|e| serde_json::to_value(e).unwrap()["type"].as_str().unwrap().to_string())
            .collect()
            .await;
        assert_eq!(kinds, vec!["permission_decision", "tool_call_start", "tool_call_end"]);
    }

    #[tokio::test]
    async fn test_destructive_parks_then_replays() {
        let f = fixture();
        let invoker = f.invoker("communicator");
        let args = json!({"channel": "#team", "text": "running late"});

        let outcome = invoker.invoke("send_slack_message", args.clone()).await.unwrap();
        let id = match outcome.status {
            ToolCallStatus::AwaitingConfirmation { confirmation_id, .. } => confirmation_id,
            other => panic!("unexpected {other:?}"),
        };
        assert!(f.executor.calls().is_empty());

        f.gate.ledger().confirm("conv_test", &id).unwrap();
        let replay = invoker
            .invoke_confirmed("send_slack_message", args, &id)
            .await
            .unwrap();
        assert!(replay.is_executed());
        assert_eq!(f.executor.executed_tools(), vec!["send_slack_message"]);
    }

    #[tokio::test]
    async fn test_cancelled_invoker_skips_gate() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = f
            .invoker("scheduler")
            .with_cancellation(cancel)
            .invoke("get_calendar_events", json!({}))
            .await
            .unwrap();
        assert_eq!(outcome.status, ToolCallStatus::Cancelled);
        assert!(f.store.list_audit(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_playbook_stops_at_confirmation() {
        let f = fixture();
        let task = f.task("communicator", "email.send");
        let outcome = PlaybookAgent
            .handle(&task, &f.invoker("communicator"))
            .await
            .unwrap();

        assert_eq!(outcome.calls.len(), 2);
        assert!(outcome.calls[0].is_executed());
        assert!(matches!(
            outcome.blocking_call().map(|c| &c.status),
            Some(ToolCallStatus::AwaitingConfirmation { .. })
        ));
        assert!(outcome.summary.contains("after running draft_email"));
        assert_eq!(f.executor.executed_tools(), vec!["draft_email"]);
        assert_eq!(f.executor.calls()[0].args["request"], "do the thing");
    }

    #[tokio::test]
    async fn test_playbook_without_steps() {
        let f = fixture();
        let task = f.task("butler", "general.chat");
        let outcome = PlaybookAgent.handle(&task, &f.invoker("butler")).await.unwrap();
        assert!(outcome.calls.is_empty());
        assert!(outcome.blocking_call().is_none());
        assert_eq!(
            builtin_agent(AgentKind::Butler).steps_for("general.chat").len(),
            0
        );
    }
}
