//! Delegation coordinator
//!
//! Each user turn runs through four phases:
//! 1. Classify: validate and persist the user turn, assign an intent
//! 2. Decide: answer directly (`general.*`) or pick exactly one delegate
//! 3. Execute: run the agent's handler; its tool calls go through the gate
//! 4. Synthesize: build the response, persist delegation + reply together
//!
//! Per-turn errors never escape: they become a failed `Response` with a
//! user-facing explanation. Turns of one conversation run one at a time.

mod handler;
mod intent;
mod response;

pub use handler::{
    AgentHandler, AgentOutcome, DelegatedTask, PlaybookAgent, ToolCallOutcome, ToolCallStatus,
    ToolInvoker,
};
pub use intent::{Intent, IntentClassifier, KeywordClassifier, GENERAL_CHAT};
pub use response::{Response, ResponseStatus, UserTurn};

use crate::agent::{AgentDefinition, AgentKind, AgentRegistry};
use crate::error::{ButlerError, FailureKind, Result};
use crate::events::{emit, ButlerEvent, EventSender};
use crate::permission::{ConfirmationError, PermissionGate};
use crate::session::{
    validate_message_id, ConversationTurn, DelegationRequest, DelegationTarget, SessionRecord,
    SessionStore,
};
use crate::templates::Templates;
use crate::tool::{humanize_call, ToolCatalog, ToolExecutor};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

pub struct Coordinator {
    registry: Arc<AgentRegistry>,
    catalog: Arc<ToolCatalog>,
    gate: Arc<PermissionGate>,
    store: Arc<dyn SessionStore>,
    executor: Arc<dyn ToolExecutor>,
    templates: Templates,
    classifier: Arc<dyn IntentClassifier>,
    handlers: HashMap<AgentKind, Arc<dyn AgentHandler>>,
    default_handler: Arc<dyn AgentHandler>,
    /// One lock per conversation; later turns wait for earlier ones
    conversations: ConversationLocks,
}

impl Coordinator {
    /// Coordinator with the keyword classifier, built-in prompts and
    /// playbook handlers for every agent
    pub fn new(
        registry: Arc<AgentRegistry>,
        catalog: Arc<ToolCatalog>,
        gate: Arc<PermissionGate>,
        store: Arc<dyn SessionStore>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Result<Self> {
        Ok(Self {
            registry,
            catalog,
            gate,
            store,
            executor,
            templates: Templates::new()?,
            classifier: Arc::new(KeywordClassifier::builtin()?),
            handlers: HashMap::new(),
            default_handler: Arc::new(PlaybookAgent),
            conversations: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn with_classifier(mut self, classifier: impl IntentClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_templates(mut self, templates: Templates) -> Self {
        self.templates = templates;
        self
    }

    /// Replace the behaviour of one agent
    pub fn with_handler(mut self, kind: AgentKind, handler: Arc<dyn AgentHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn templates(&self) -> &Templates {
        &self.templates
    }

    /// Handle a turn without cancellation or progress events
    pub async fn handle(&self, turn: UserTurn) -> Response {
        self.handle_with(turn, CancellationToken::new(), None).await
    }

    /// Handle a turn; cancelling `cancel` aborts the in-flight tool call
    /// and cancels the conversation's open confirmations
    pub async fn handle_with(
        &self,
        turn: UserTurn,
        cancel: CancellationToken,
        events: Option<EventSender>,
    ) -> Response {
        let span = info_span!(
            "turn",
            conversation_id = %turn.conversation_id,
            turn_id = %turn.id
        );

        async {
            let lease = self.lease(&turn.conversation_id);
            let _serialized = lease.lock.lock().await;

            let response = match self.run_turn(&turn, &cancel, events.as_ref()).await {
                Ok(response) => response,
                Err(err) => {
                    // Nothing was stored for a turn that failed validation
                    let record = !matches!(err.kind(), FailureKind::InvalidInput);
                    self.fail(&turn.conversation_id, &turn.id, err, events.as_ref(), record)
                        .await
                }
            };

            info!(status = response.status.as_str(), handled_by = %response.handled_by, "Turn complete");
            emit(
                events.as_ref(),
                ButlerEvent::TurnComplete {
                    turn_id: turn.id.clone(),
                    status: response.status.as_str().to_string(),
                },
            );
            response
        }
        .instrument(span)
        .await
    }

    async fn run_turn(
        &self,
        turn: &UserTurn,
        cancel: &CancellationToken,
        events: Option<&EventSender>,
    ) -> Result<Response> {
        // === Classify ===
        validate_message_id(&turn.id)?;
        if turn.text.trim().is_empty() {
            return Err(ButlerError::InvalidInput("message is empty".to_string()));
        }
        emit(
            events,
            ButlerEvent::TurnStart {
                conversation_id: turn.conversation_id.clone(),
                turn_id: turn.id.clone(),
            },
        );
        self.store
            .append(SessionRecord::Turn(ConversationTurn::user(
                &turn.id,
                &turn.conversation_id,
                &turn.text,
            )))
            .await?;

        let intent = self.classifier.classify(&turn.text);
        info!(intent = %intent.category, "Turn classified");
        emit(
            events,
            ButlerEvent::Classified {
                turn_id: turn.id.clone(),
                intent: intent.category.clone(),
            },
        );

        // === Decide ===
        let (agent, target) = self.decide(&intent)?;
        if cancel.is_cancelled() {
            return Err(ButlerError::Cancelled);
        }

        // === Execute ===
        let task = DelegatedTask {
            conversation_id: turn.conversation_id.clone(),
            turn_id: turn.id.clone(),
            intent: intent.category.clone(),
            request: turn.text.clone(),
            arguments: turn.arguments.clone(),
            agent: agent.clone(),
            system_prompt: self
                .templates
                .render_agent_prompt(agent, &self.registry, &self.catalog)?,
        };
        let invoker = self
            .invoker(&turn.conversation_id, &agent.name)
            .with_cancellation(cancel.clone())
            .with_events(events.cloned());

        let delegated = matches!(target, DelegationTarget::Agent(_));
        if delegated {
            info!(agent = %agent.name, model_tier = agent.model_tier.as_str(), "Delegating turn");
            emit(
                events,
                ButlerEvent::DelegationStart {
                    agent: agent.name.clone(),
                    intent: intent.category.clone(),
                },
            );
        }
        let outcome = self.handler_for(agent).handle(&task, &invoker).await?;
        if delegated {
            emit(events, ButlerEvent::DelegationEnd { agent: agent.name.clone() });
        }

        let cancelled = outcome
            .blocking_call()
            .is_some_and(|c| c.status == ToolCallStatus::Cancelled);
        if cancel.is_cancelled() || cancelled {
            return Err(ButlerError::Cancelled);
        }

        // === Synthesize ===
        let (status, message) = if !delegated && outcome.calls.is_empty() {
            (ResponseStatus::Answered, self.direct_answer(&intent))
        } else {
            synthesize(&outcome, delegated)
        };

        let delegation = DelegationRequest::new(
            &turn.conversation_id,
            &turn.id,
            &intent.category,
            target,
            Some(agent.model_tier),
        );
        let reply = ConversationTurn::assistant(&turn.conversation_id, &agent.name, &message)
            .with_tool_calls(outcome.calls.iter().map(ToolCallOutcome::record).collect());
        self.store
            .append_all(vec![
                SessionRecord::Delegation(delegation),
                SessionRecord::Turn(reply),
            ])
            .await?;

        Ok(Response {
            conversation_id: turn.conversation_id.clone(),
            turn_id: turn.id.clone(),
            handled_by: agent.name.clone(),
            status,
            message,
            tool_calls: outcome.calls,
        })
    }

    fn decide(&self, intent: &Intent) -> Result<(&AgentDefinition, DelegationTarget)> {
        if intent.is_direct() {
            return Ok((self.registry.coordinator()?, DelegationTarget::DirectHandle));
        }
        match self.registry.select_for(&intent.category) {
            Some(agent) => {
                // The target must resolve in the registry
                let agent = self.registry.lookup(&agent.name)?;
                Ok((agent, DelegationTarget::Agent(agent.name.clone())))
            }
            None => {
                warn!(intent = %intent.category, "No agent accepts this intent");
                Err(ButlerError::DelegationTargetNotFound(intent.category.clone()))
            }
        }
    }

    fn direct_answer(&self, intent: &Intent) -> String {
        let specialists: Vec<String> = self
            .registry
            .delegates()
            .map(|a| a.title().to_lowercase())
            .collect();
        let intro = if intent.category == "general.help" {
            "Here's what I can do."
        } else {
            "Happy to help."
        };
        if specialists.is_empty() {
            return intro.to_string();
        }
        format!(
            "{} Ask me about your calendar, email, messages, notes or preferences and I'll hand it to the right specialist ({}).",
            intro,
            specialists.join(", ")
        )
    }

    /// Grant a parked confirmation and replay the call it was issued for
    pub async fn confirm(&self, conversation_id: &str, confirmation_id: &str) -> Response {
        self.confirm_with(conversation_id, confirmation_id, CancellationToken::new(), None)
            .await
    }

    /// Confirm and replay; cancelling `cancel` aborts the replayed call
    pub async fn confirm_with(
        &self,
        conversation_id: &str,
        confirmation_id: &str,
        cancel: CancellationToken,
        events: Option<EventSender>,
    ) -> Response {
        let span = info_span!("confirm", conversation_id, confirmation_id);
        async {
            let lease = self.lease(conversation_id);
            let _serialized = lease.lock.lock().await;

            let response = self
                .replay_confirmed(conversation_id, confirmation_id, &cancel, events.as_ref())
                .await;
            emit(
                events.as_ref(),
                ButlerEvent::TurnComplete {
                    turn_id: confirmation_id.to_string(),
                    status: response.status.as_str().to_string(),
                },
            );
            response
        }
        .instrument(span)
        .await
    }

    async fn replay_confirmed(
        &self,
        conversation_id: &str,
        confirmation_id: &str,
        cancel: &CancellationToken,
        events: Option<&EventSender>,
    ) -> Response {
        let pending = match self.gate.ledger().confirm(conversation_id, confirmation_id) {
            Ok(pending) => pending,
            Err(e) => return confirmation_failure(conversation_id, confirmation_id, e),
        };
        let binding = &pending.binding;
        info!(agent = %binding.agent, tool = %binding.tool, "Confirmation granted; replaying call");

        let invoker = self
            .invoker(conversation_id, &binding.agent)
            .with_cancellation(cancel.clone())
            .with_events(events.cloned());
        let call = match invoker
            .invoke_confirmed(&binding.tool, pending.args.clone(), confirmation_id)
            .await
        {
            Ok(call) => call,
            Err(err) => return self.fail(conversation_id, confirmation_id, err, events, true).await,
        };
        if cancel.is_cancelled() || call.status == ToolCallStatus::Cancelled {
            return self
                .fail(conversation_id, confirmation_id, ButlerError::Cancelled, events, false)
                .await;
        }

        let title = self
            .registry
            .get(&binding.agent)
            .map(|a| a.title().to_string())
            .unwrap_or_else(|| binding.agent.clone());
        let outcome = AgentOutcome {
            summary: handler::describe(&title, std::slice::from_ref(&call)),
            calls: vec![call],
        };
        let (status, message) = synthesize(&outcome, true);

        let reply = ConversationTurn::assistant(conversation_id, &binding.agent, &message)
            .with_tool_calls(outcome.calls.iter().map(ToolCallOutcome::record).collect());
        if let Err(e) = self.store.append(SessionRecord::Turn(reply)).await {
            return self.fail(conversation_id, confirmation_id, e, events, false).await;
        }

        Response {
            conversation_id: conversation_id.to_string(),
            turn_id: confirmation_id.to_string(),
            handled_by: binding.agent.clone(),
            status,
            message,
            tool_calls: outcome.calls,
        }
    }

    /// Refuse a parked confirmation; the call never runs
    pub async fn decline(&self, conversation_id: &str, confirmation_id: &str) -> Response {
        let lease = self.lease(conversation_id);
        let _serialized = lease.lock.lock().await;

        let pending = match self.gate.ledger().decline(conversation_id, confirmation_id) {
            Ok(pending) => pending,
            Err(e) => return confirmation_failure(conversation_id, confirmation_id, e),
        };
        let binding = &pending.binding;
        info!(conversation_id, confirmation_id, tool = %binding.tool, "Confirmation declined");

        let message = format!(
            "Okay, I won't run {}.",
            humanize_call(&binding.tool, &pending.args)
        );
        let reply = ConversationTurn::assistant(conversation_id, &binding.agent, &message);
        if let Err(e) = self.store.append(SessionRecord::Turn(reply)).await {
            return self.fail(conversation_id, confirmation_id, e, None, false).await;
        }

        Response {
            conversation_id: conversation_id.to_string(),
            turn_id: confirmation_id.to_string(),
            handled_by: binding.agent.clone(),
            status: ResponseStatus::Answered,
            message,
            tool_calls: Vec::new(),
        }
    }

    /// Turn an error into a user-visible response
    async fn fail(
        &self,
        conversation_id: &str,
        turn_id: &str,
        err: ButlerError,
        events: Option<&EventSender>,
        record: bool,
    ) -> Response {
        let handled_by = AgentKind::Butler.name();

        if matches!(err, ButlerError::Cancelled) {
            let cancelled = self.gate.ledger().cancel_conversation(conversation_id);
            info!(cancelled_confirmations = cancelled, "Turn cancelled");
            emit(events, ButlerEvent::Cancelled { turn_id: turn_id.to_string() });
            return Response {
                conversation_id: conversation_id.to_string(),
                turn_id: turn_id.to_string(),
                handled_by: handled_by.to_string(),
                status: ResponseStatus::Cancelled,
                message: "Stopped. Nothing else will run for that request.".to_string(),
                tool_calls: Vec::new(),
            };
        }

        let kind = err.kind();
        match kind {
            FailureKind::InvalidInput | FailureKind::DependencyUnavailable => {
                warn!(error = %err, "Turn failed")
            }
            _ => error!(error = %err, "Turn failed"),
        }

        let message = match &err {
            ButlerError::DependencyUnavailable { integration, detail } => {
                unavailable_message(integration, detail)
            }
            _ => kind.user_message().to_string(),
        };
        emit(events, ButlerEvent::Error { error: message.clone() });

        if record {
            let reply = ConversationTurn::assistant(conversation_id, handled_by, &message);
            if let Err(e) = self.store.append(SessionRecord::Turn(reply)).await {
                error!(error = %e, "Failed to record failure reply");
            }
        }

        Response::failed(conversation_id, turn_id, handled_by, kind, message)
    }

    fn invoker(&self, conversation_id: &str, agent: &str) -> ToolInvoker {
        ToolInvoker::new(
            self.gate.clone(),
            self.catalog.clone(),
            self.executor.clone(),
            conversation_id,
            agent,
        )
    }

    fn handler_for(&self, agent: &AgentDefinition) -> Arc<dyn AgentHandler> {
        agent
            .kind()
            .and_then(|kind| self.handlers.get(&kind))
            .cloned()
            .unwrap_or_else(|| self.default_handler.clone())
    }

    fn lease(&self, conversation_id: &str) -> ConversationLease<'_> {
        let lock = self
            .conversations
            .lock()
            .entry(conversation_id.to_string())
            .or_default()
            .clone();
        ConversationLease {
            locks: &self.conversations,
            conversation_id: conversation_id.to_string(),
            lock,
        }
    }

    #[cfg(test)]
    fn tracked_conversations(&self) -> usize {
        self.conversations.lock().len()
    }
}

type ConversationLocks = parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// A claim on a conversation's lock; the map entry goes away with the last claim
struct ConversationLease<'a> {
    locks: &'a ConversationLocks,
    conversation_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for ConversationLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // the map and this lease hold the only references
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.conversation_id);
        }
    }
}

/// Status and message for an agent outcome
fn synthesize(outcome: &AgentOutcome, delegated: bool) -> (ResponseStatus, String) {
    let blocking = match outcome.blocking_call() {
        Some(call) => call,
        None => {
            let status = if delegated {
                ResponseStatus::Delegated
            } else {
                ResponseStatus::Answered
            };
            return (status, outcome.summary.clone());
        }
    };

    match &blocking.status {
        ToolCallStatus::AwaitingConfirmation {
            confirmation_id,
            expires_at,
        } => (
            ResponseStatus::AwaitingConfirmation {
                confirmation_id: confirmation_id.clone(),
                expires_at: *expires_at,
            },
            outcome.summary.clone(),
        ),
        ToolCallStatus::Unavailable { integration, detail } => (
            ResponseStatus::Failed {
                kind: FailureKind::DependencyUnavailable,
            },
            unavailable_message(integration, detail),
        ),
        // Partial progress is still progress
        ToolCallStatus::Denied { .. } if outcome.executed().next().is_some() => {
            (ResponseStatus::Delegated, outcome.summary.clone())
        }
        ToolCallStatus::Denied { .. } => failed(FailureKind::AuthorizationDenied),
        ToolCallStatus::Failed { .. } => failed(FailureKind::Internal),
        ToolCallStatus::Cancelled => (ResponseStatus::Cancelled, outcome.summary.clone()),
        ToolCallStatus::Executed => (ResponseStatus::Delegated, outcome.summary.clone()),
    }
}

fn failed(kind: FailureKind) -> (ResponseStatus, String) {
    (ResponseStatus::Failed { kind }, kind.user_message().to_string())
}

fn unavailable_message(integration: &str, detail: &str) -> String {
    format!(
        "{} To connect {}: {}.",
        FailureKind::DependencyUnavailable.user_message(),
        integration,
        detail
    )
}

fn confirmation_failure(
    conversation_id: &str,
    confirmation_id: &str,
    err: ConfirmationError,
) -> Response {
    warn!(conversation_id, confirmation_id, error = %err, "Confirmation not usable");
    let message = match err {
        ConfirmationError::Unknown(_) => "I couldn't find that confirmation in this conversation.",
        ConfirmationError::Expired => {
            "That confirmation expired, so nothing was run. Ask again if you still want it."
        }
        _ => "That confirmation is no longer open.",
    };
    Response::failed(
        conversation_id,
        confirmation_id,
        AgentKind::Butler.name(),
        FailureKind::InvalidInput,
        message,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::builtin_agent;
    use crate::auth::AuthConfig;
    use crate::events::event_channel;
    use crate::permission::{ConfirmationState, DecisionKind, ReasonCode};
    use crate::session::{InMemorySessionStore, Role};
    use crate::tool::{ToolContext, ToolDefinition, ToolError};
    use crate::tools::{builtin_catalog, CredentialGuard, DryRunExecutor};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::Value;

    const CONV: &str = "conv_daily_2026-10-16";

    struct Fixture {
        coordinator: Arc<Coordinator>,
        store: Arc<InMemorySessionStore>,
        executor: Arc<DryRunExecutor>,
    }

    fn fixture_with(registry: AgentRegistry) -> Fixture {
        let executor = Arc::new(DryRunExecutor::new());
        let (coordinator, store) = build(registry, executor.clone());
        Fixture {
            coordinator: Arc::new(coordinator),
            store,
            executor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(AgentRegistry::builtin())
    }

    fn build(
        registry: AgentRegistry,
        executor: Arc<dyn ToolExecutor>,
    ) -> (Coordinator, Arc<InMemorySessionStore>) {
        let registry = Arc::new(registry);
        let catalog = Arc::new(builtin_catalog().unwrap());
        let store = Arc::new(InMemorySessionStore::new());
        let gate = Arc::new(PermissionGate::new(
            registry.clone(),
            catalog.clone(),
            store.clone(),
        ));
        let coordinator =
            Coordinator::new(registry, catalog, gate, store.clone(), executor).unwrap();
        (coordinator, store)
    }

    fn turn(id: &str, text: &str) -> UserTurn {
        UserTurn::new(id, CONV, text)
    }

    #[tokio::test]
    async fn test_general_chat_is_answered_directly() {
        let f = fixture();
        let response = f.coordinator.handle(turn("m1", "Good morning!")).await;

        assert_eq!(response.status, ResponseStatus::Answered);
        assert_eq!(response.handled_by, "butler");
        assert!(response.message.contains("scheduler"));

        let turns = f.store.list_turns(CONV).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].handled_by.as_deref(), Some("butler"));
        let delegations = f.store.list_delegations(CONV).await.unwrap();
        assert_eq!(delegations.len(), 1);
        assert_eq!(delegations[0].target, DelegationTarget::DirectHandle);
        assert_eq!(delegations[0].turn_id, "m1");
        assert!(f.store.list_audit(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_butler_uses_its_own_tools() {
        let f = fixture();
        let response = f
            .coordinator
            .handle(turn("m1", "What do you know about me?"))
            .await;
        assert_eq!(response.status, ResponseStatus::Answered);
        assert_eq!(f.executor.executed_tools(), vec!["get_preferences"]);
    }

    #[tokio::test]
    async fn test_calendar_query_is_delegated() {
        let f = fixture();
        let response = f
            .coordinator
            .handle(turn("m1", "What's on my calendar today?"))
            .await;

        assert_eq!(response.status, ResponseStatus::Delegated);
        assert_eq!(response.handled_by, "scheduler");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(f.executor.executed_tools(), vec!["get_calendar_events"]);

        let delegations = f.store.list_delegations(CONV).await.unwrap();
        assert_eq!(
            delegations[0].target,
            DelegationTarget::Agent("scheduler".into())
        );
        assert_eq!(delegations[0].intent, "calendar.query");
        let audit = f.store.list_audit(Some(CONV)).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].reason, ReasonCode::ReadOnly);
    }

    #[tokio::test]
    async fn test_no_matching_agent_fails_gracefully() {
        let registry = AgentRegistry::from_definitions(vec![
            builtin_agent(AgentKind::Butler),
            builtin_agent(AgentKind::Communicator),
        ])
        .unwrap();
        let f = fixture_with(registry);

        let response = f
            .coordinator
            .handle(turn("m1", "Schedule a meeting with Sam tomorrow"))
            .await;
        assert_eq!(
            response.status,
            ResponseStatus::Failed {
                kind: FailureKind::DelegationTargetNotFound
            }
        );
        assert_eq!(
            response.message,
            FailureKind::DelegationTargetNotFound.user_message()
        );
        assert!(!response.message.contains("calendar.schedule_meeting"));
        assert!(f.store.list_delegations(CONV).await.unwrap().is_empty());

        // the conversation carries on
        let next = f.coordinator.handle(turn("m2", "Good morning!")).await;
        assert_eq!(next.status, ResponseStatus::Answered);
        assert_eq!(f.store.list_turns(CONV).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_scheduler_denied_update_event() {
        let registry = AgentRegistry::from_definitions(vec![
            builtin_agent(AgentKind::Butler),
            AgentDefinition::new("scheduler")
                .with_tools(["get_calendar_events"])
                .handles("calendar.*")
                .with_steps("calendar.reschedule", ["update_event"]),
        ])
        .unwrap();
        let f = fixture_with(registry);

        let response = f
            .coordinator
            .handle(turn("m1", "Move my 3pm meeting to 4"))
            .await;
        assert_eq!(
            response.status,
            ResponseStatus::Failed {
                kind: FailureKind::AuthorizationDenied
            }
        );
        assert_eq!(
            response.tool_calls[0].status,
            ToolCallStatus::Denied {
                reason: ReasonCode::NotPermitted
            }
        );
        assert!(f.executor.calls().is_empty());

        let audit = f.store.list_audit(Some(CONV)).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].decision, DecisionKind::Deny);
        assert_eq!(audit[0].tool, "update_event");
    }

    #[tokio::test]
    async fn test_destructive_message_needs_confirmation() {
        let f = fixture();
        let response = f
            .coordinator
            .handle(turn("m1", "Slack the team that I'm running late"))
            .await;

        assert_eq!(response.handled_by, "communicator");
        let id = response.pending_confirmation().unwrap().to_string();
        assert!(response.message.contains(&format!("confirm {}", id)));
        assert!(f.executor.calls().is_empty());

        let confirmed = f.coordinator.confirm(CONV, &id).await;
        assert_eq!(confirmed.status, ResponseStatus::Delegated);
        assert_eq!(f.executor.executed_tools(), vec!["send_slack_message"]);
        assert_eq!(
            f.executor.calls()[0].args["request"],
            "Slack the team that I'm running late"
        );

        let reasons: Vec<_> = f
            .store
            .list_audit(Some(CONV))
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.reason)
            .collect();
        assert_eq!(
            reasons,
            vec![ReasonCode::ConfirmationRequired, ReasonCode::Confirmed]
        );

        // consumed: a second confirm does nothing
        let again = f.coordinator.confirm(CONV, &id).await;
        assert!(again.status.is_failure());
        assert_eq!(f.executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_confirmation_is_scoped_to_its_conversation() {
        let f = fixture();
        let response = f
            .coordinator
            .handle(turn("m1", "Slack the team that I'm running late"))
            .await;
        let id = response.pending_confirmation().unwrap().to_string();

        let other = f.coordinator.confirm("conv_inbox_2026-10-16", &id).await;
        assert!(other.status.is_failure());
        assert!(f.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_decline_never_runs_the_call() {
        let f = fixture();
        let response = f
            .coordinator
            .handle(turn("m1", "Slack the team that I'm running late"))
            .await;
        let id = response.pending_confirmation().unwrap().to_string();

        let declined = f.coordinator.decline(CONV, &id).await;
        assert_eq!(declined.status, ResponseStatus::Answered);
        assert!(declined.message.starts_with("Okay, I won't run send_slack_message("));
        assert_eq!(
            f.coordinator.gate().ledger().get(&id).unwrap().state,
            ConfirmationState::Declined
        );

        let confirmed = f.coordinator.confirm(CONV, &id).await;
        assert!(confirmed.status.is_failure());
        assert!(f.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_credential_is_explained() {
        let inner = Arc::new(DryRunExecutor::new());
        let guard = Arc::new(CredentialGuard::new(
            inner.clone(),
            Arc::new(AuthConfig::default()),
        ));
        let (coordinator, store) = build(AgentRegistry::builtin(), guard);

        let response = coordinator
            .handle(turn("m1", "What's on my calendar today?"))
            .await;
        assert_eq!(
            response.status,
            ResponseStatus::Failed {
                kind: FailureKind::DependencyUnavailable
            }
        );
        assert!(response.message.contains("GOOGLE_CALENDAR_API_KEY"));
        assert!(inner.calls().is_empty());
        // the delegation still happened and is on record
        assert_eq!(store.list_delegations(CONV).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_message_id_stores_nothing() {
        let f = fixture();
        let response = f.coordinator.handle(turn("bad id!", "Good morning")).await;
        assert_eq!(
            response.status,
            ResponseStatus::Failed {
                kind: FailureKind::InvalidInput
            }
        );
        assert_eq!(f.store.record_count().await.unwrap(), 0);
    }

    struct HangingExecutor;

    #[async_trait]
    impl ToolExecutor for HangingExecutor {
        async fn execute(
            &self,
            _tool: &ToolDefinition,
            _args: Value,
            _ctx: &ToolContext,
        ) -> std::result::Result<Value, ToolError> {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_tool_call_and_confirmations() {
        let (coordinator, _store) = build(AgentRegistry::builtin(), Arc::new(HangingExecutor));
        let coordinator = Arc::new(coordinator);

        let parked = coordinator
            .handle(turn("m1", "Slack the team that I'm running late"))
            .await;
        let parked_id = parked.pending_confirmation().unwrap().to_string();

        let (tx, mut events) = event_channel();
        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            async move {
                coordinator
                    .handle_with(turn("m2", "What's on my calendar today?"), cancel, Some(tx))
                    .await
            }
        });

        while let Some(event) = events.next().await {
            if matches!(event, ButlerEvent::ToolCallStart { .. }) {
                break;
            }
        }
        cancel.cancel();

        let response = running.await.unwrap();
        assert_eq!(response.status, ResponseStatus::Cancelled);
        assert_eq!(
            coordinator.gate().ledger().get(&parked_id).unwrap().state,
            ConfirmationState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_aborts_confirmed_replay() {
        let (coordinator, store) = build(AgentRegistry::builtin(), Arc::new(HangingExecutor));
        let coordinator = Arc::new(coordinator);

        let parked = coordinator
            .handle(turn("m1", "Slack the team that I'm running late"))
            .await;
        let parked_id = parked.pending_confirmation().unwrap().to_string();

        let (tx, mut events) = event_channel();
        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            let parked_id = parked_id.clone();
            async move {
                coordinator
                    .confirm_with(CONV, &parked_id, cancel, Some(tx))
                    .await
            }
        });

        while let Some(event) = events.next().await {
            if matches!(event, ButlerEvent::ToolCallStart { .. }) {
                break;
            }
        }
        cancel.cancel();

        let response = running.await.unwrap();
        assert_eq!(response.status, ResponseStatus::Cancelled);
        assert_eq!(response.turn_id, parked_id);
        assert_eq!(
            coordinator.gate().ledger().get(&parked_id).unwrap().state,
            ConfirmationState::Consumed
        );

        let rest: Vec<ButlerEvent> = events.collect().await;
        assert!(rest.iter().any(|e| matches!(e, ButlerEvent::Cancelled { .. })));
        assert!(rest
            .iter()
            .any(|e| matches!(e, ButlerEvent::TurnComplete { status, .. } if status == "cancelled")));
        // only the parked request's turns are on record
        assert_eq!(store.list_turns(CONV).await.unwrap().len(), 2);
        assert_eq!(coordinator.tracked_conversations(), 0);
    }

    #[tokio::test]
    async fn test_conversation_locks_are_released() {
        let f = fixture();
        let (a, b) = tokio::join!(
            f.coordinator.handle(turn("m1", "What's on my calendar today?")),
            f.coordinator
                .handle(UserTurn::new("m2", "conv_inbox_2026-10-16", "Triage my inbox")),
        );
        assert_eq!(a.status, ResponseStatus::Delegated);
        assert_eq!(b.status, ResponseStatus::Delegated);

        let parked = f
            .coordinator
            .handle(turn("m3", "Slack the team that I'm running late"))
            .await;
        let id = parked.pending_confirmation().unwrap().to_string();
        f.coordinator.decline(CONV, &id).await;
        f.coordinator.confirm(CONV, "confirm_missing").await;

        assert_eq!(f.coordinator.tracked_conversations(), 0);
    }

    #[tokio::test]
    async fn test_turn_arguments_reach_the_tool() {
        let f = fixture();
        let response = f
            .coordinator
            .handle(
                turn("m1", "Slack the team that I'm running late")
                    .with_argument("channel", Value::String("#general".into())),
            )
            .await;
        let id = response.pending_confirmation().unwrap().to_string();

        f.coordinator.confirm(CONV, &id).await;
        assert_eq!(f.executor.calls()[0].args["channel"], "#general");
    }

    #[tokio::test]
    async fn test_assistant_turn_records_tool_calls() {
        let f = fixture();
        f.coordinator
            .handle(turn("m1", "What's on my calendar today?"))
            .await;

        let turns = f.store.list_turns(CONV).await.unwrap();
        assert!(turns[0].tool_calls.is_empty());
        let calls = &turns[1].tool_calls;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool, "get_calendar_events");
        assert_eq!(calls[0].status, "executed");

        let parked = f
            .coordinator
            .handle(turn("m2", "Slack the team that I'm running late"))
            .await;
        let id = parked.pending_confirmation().unwrap().to_string();
        f.coordinator.confirm(CONV, &id).await;

        let turns = f.store.list_turns(CONV).await.unwrap();
        assert_eq!(turns[3].tool_calls[0].status, "awaiting_confirmation");
        assert_eq!(turns[4].tool_calls[0].tool, "send_slack_message");
        assert_eq!(turns[4].tool_calls[0].status, "executed");
    }

    #[tokio::test]
    async fn test_turns_in_one_conversation_do_not_interleave() {
        let f = fixture();
        let (a, b) = tokio::join!(
            f.coordinator.handle(turn("m1", "What's on my calendar today?")),
            f.coordinator.handle(turn("m2", "Triage my inbox")),
        );
        assert_eq!(a.status, ResponseStatus::Delegated);
        assert_eq!(b.status, ResponseStatus::Delegated);

        let roles: Vec<Role> = f
            .store
            .list_turns(CONV)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.role)
            .collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
    }
}
