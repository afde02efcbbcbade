//! Built-in agent definitions
//!
//! Built-in agents:
//! - `butler`: Coordinator; answers general chat directly, otherwise delegates
//! - `triage`: Inbox triage
//! - `scheduler`: Calendar queries and changes
//! - `communicator`: Outbound email and Slack messages
//! - `navigator`: Notes and PARA folders
//! - `preference_learner`: Records what the user likes and dislikes

use super::config::{AgentDefinition, AgentKind, ModelTier};

/// Get all built-in agents, in declaration order
pub fn get_builtin_agents() -> Vec<AgentDefinition> {
    AgentKind::ALL.into_iter().map(builtin_agent).collect()
}

/// Built-in definition for one kind
pub fn builtin_agent(kind: AgentKind) -> AgentDefinition {
    let def = AgentDefinition::builtin(kind);
    match kind {
        AgentKind::Butler => def
            .with_description(
                "Personal butler. Talks with the user, answers small requests itself \
                 and hands specialist work to the right agent.",
            )
            .with_model_tier(ModelTier::Deep)
            .with_tools(["get_preferences", "search_contacts"])
            .handles("general.*")
            .with_steps("general.preferences", ["get_preferences"]),

        // Triage agent - reads the inbox and files what it can
        AgentKind::Triage => def
            .with_description("Sorts the inbox: summarizes new mail and archives what's done.")
            .with_tools(["list_emails", "read_email", "archive_email", "draft_email"])
            .handles("inbox.*")
            .handles("email.triage")
            .with_steps("inbox.triage", ["list_emails", "archive_email"])
            .with_steps("inbox.summary", ["list_emails"])
            .with_steps("*", ["list_emails"]),

        // Scheduler agent - needs the deep tier for slot finding
        AgentKind::Scheduler => def
            .with_description("Reads and changes the calendar: finds slots, books, moves and cancels events.")
            .with_model_tier(ModelTier::Deep)
            .with_tools([
                "get_calendar_events",
                "find_free_slots",
                "create_event",
                "update_event",
                "delete_event",
                "search_contacts",
            ])
            .handles("calendar.*")
            .with_steps("calendar.query", ["get_calendar_events"])
            .with_steps("calendar.schedule_meeting", ["find_free_slots", "create_event"])
            .with_steps("calendar.reschedule", ["get_calendar_events", "update_event"])
            .with_steps("calendar.cancel", ["get_calendar_events", "delete_event"])
            .with_steps("*", ["get_calendar_events"]),

        AgentKind::Communicator => def
            .with_description("Writes and sends messages on the user's behalf over email and Slack.")
            .with_tools([
                "draft_email",
                "send_email",
                "list_slack_channels",
                "send_slack_message",
                "search_contacts",
            ])
            .handles("message.*")
            .handles("email.send")
            .with_steps("message.send", ["send_slack_message"])
            .with_steps("message.list_channels", ["list_slack_channels"])
            .with_steps("email.send", ["draft_email", "send_email"]),

        AgentKind::Navigator => def
            .with_description("Finds, opens and files notes across Projects, Areas, Resources and Archive.")
            .with_tools(["search_notes", "open_item", "move_item", "create_folder"])
            .handles("notes.*")
            .handles("para.*")
            .with_steps("notes.search", ["search_notes"])
            .with_steps("notes.open", ["search_notes", "open_item"])
            .with_steps("para.move", ["move_item"])
            .with_steps("para.create_folder", ["create_folder"])
            .with_steps("*", ["search_notes"]),

        AgentKind::PreferenceLearner => def
            .with_description("Remembers the user's preferences and forgets them on request.")
            .with_tools(["get_preferences", "record_preference", "forget_preference"])
            .handles("preference.*")
            .with_steps("preference.record", ["record_preference"])
            .with_steps("preference.forget", ["forget_preference"])
            .with_steps("preference.show", ["get_preferences"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_a_builtin() {
        let agents = get_builtin_agents();
        assert_eq!(agents.len(), AgentKind::ALL.len());
        for (def, kind) in agents.iter().zip(AgentKind::ALL) {
            assert_eq!(def.kind(), Some(kind));
            assert!(def.built_in);
            assert!(!def.description.is_empty());
        }
    }

    #[test]
    fn test_playbooks_only_use_permitted_tools() {
        for def in get_builtin_agents() {
            for (intent, steps) in &def.playbook {
                for step in steps {
                    assert!(
                        def.permits(step),
                        "{} playbook for {} uses unpermitted {}",
                        def.name,
                        intent,
                        step
                    );
                }
            }
        }
    }

    #[test]
    fn test_scheduler_is_deep_tier() {
        let scheduler = builtin_agent(AgentKind::Scheduler);
        assert_eq!(scheduler.model_tier, ModelTier::Deep);
        assert!(scheduler.match_intent("calendar.schedule_meeting").is_some());
    }
}
