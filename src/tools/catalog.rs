//! Built-in tool contracts
//!
//! Each tool is bound to the integration that executes it. Local tools
//! (notes, preferences) have no integration and need no credential.

use crate::error::Result;
use crate::tool::{SideEffect, ToolCatalog, ToolDefinition};
use serde_json::json;

pub const GOOGLE_CALENDAR: &str = "google_calendar";
pub const GMAIL: &str = "gmail";
pub const SLACK: &str = "slack";
pub const GOOGLE_CONTACTS: &str = "google_contacts";

/// Catalog of every built-in tool, grouped by capability
pub fn builtin_catalog() -> Result<ToolCatalog> {
    let mut tools = Vec::new();
    tools.extend(calendar_tools());
    tools.extend(email_tools());
    tools.extend(messaging_tools());
    tools.extend(contact_tools());
    tools.extend(note_tools());
    tools.extend(preference_tools());
    ToolCatalog::from_definitions(tools)
}

fn calendar_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new("get_calendar_events", SideEffect::ReadOnly)
            .with_description("List calendar events in a time range.")
            .with_integration(GOOGLE_CALENDAR)
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "start": { "type": "string", "description": "RFC 3339 start of range" },
                    "end": { "type": "string", "description": "RFC 3339 end of range" }
                },
                "required": []
            })),
        ToolDefinition::new("find_free_slots", SideEffect::ReadOnly)
            .with_description("Find open slots that fit a meeting of the given length.")
            .with_integration(GOOGLE_CALENDAR)
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "duration_minutes": { "type": "integer" },
                    "attendees": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["duration_minutes"]
            })),
        ToolDefinition::new("create_event", SideEffect::Mutating)
            .with_description("Create a calendar event.")
            .with_integration(GOOGLE_CALENDAR)
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "start": { "type": "string" },
                    "end": { "type": "string" },
                    "attendees": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["title", "start"]
            })),
        ToolDefinition::new("update_event", SideEffect::Mutating)
            .with_description("Change the time, title or attendees of an existing event.")
            .with_integration(GOOGLE_CALENDAR)
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "event_id": { "type": "string" },
                    "start": { "type": "string" },
                    "end": { "type": "string" }
                },
                "required": ["event_id"]
            })),
        ToolDefinition::new("delete_event", SideEffect::Destructive)
            .with_description("Delete an event and notify attendees.")
            .with_integration(GOOGLE_CALENDAR)
            .with_parameters(json!({
                "type": "object",
                "properties": { "event_id": { "type": "string" } },
                "required": ["event_id"]
            })),
    ]
}

fn email_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new("list_emails", SideEffect::ReadOnly)
            .with_description("List recent or unread emails.")
            .with_integration(GMAIL)
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "max_results": { "type": "integer" }
                },
                "required": []
            })),
        ToolDefinition::new("read_email", SideEffect::ReadOnly)
            .with_description("Read one email thread.")
            .with_integration(GMAIL)
            .with_parameters(json!({
                "type": "object",
                "properties": { "thread_id": { "type": "string" } },
                "required": ["thread_id"]
            })),
        ToolDefinition::new("draft_email", SideEffect::Mutating)
            .with_description("Save an email draft without sending it.")
            .with_integration(GMAIL)
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "to": { "type": "string" },
                    "subject": { "type": "string" },
                    "body": { "type": "string" }
                },
                "required": ["to"]
            })),
        ToolDefinition::new("archive_email", SideEffect::Mutating)
            .with_description("Archive emails out of the inbox.")
            .with_integration(GMAIL)
            .with_parameters(json!({
                "type": "object",
                "properties": { "thread_ids": { "type": "array", "items": { "type": "string" } } },
                "required": []
            })),
        ToolDefinition::new("send_email", SideEffect::Destructive)
            .with_description("Send an email. Cannot be unsent.")
            .with_integration(GMAIL)
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "to": { "type": "string" },
                    "subject": { "type": "string" },
                    "body": { "type": "string" }
                },
                "required": ["to", "body"]
            })),
    ]
}

fn messaging_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new("list_slack_channels", SideEffect::ReadOnly)
            .with_description("List Slack channels the user belongs to.")
            .with_integration(SLACK),
        ToolDefinition::new("send_slack_message", SideEffect::Destructive)
            .with_description("Post a Slack message to a channel or person.")
            .with_integration(SLACK)
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "channel": { "type": "string" },
                    "text": { "type": "string" }
                },
                "required": ["channel", "text"]
            })),
    ]
}

fn contact_tools() -> Vec<ToolDefinition> {
    vec![ToolDefinition::new("search_contacts", SideEffect::ReadOnly)
        .with_description("Look up people by name or email.")
        .with_integration(GOOGLE_CONTACTS)
        .with_parameters(json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        }))]
}

// PARA notes live locally
fn note_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new("search_notes", SideEffect::ReadOnly)
            .with_description("Search notes across Projects, Areas, Resources and Archive.")
            .with_parameters(json!({
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"]
            })),
        ToolDefinition::new("open_item", SideEffect::ReadOnly)
            .with_description("Open a note or folder.")
            .with_parameters(json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            })),
        ToolDefinition::new("move_item", SideEffect::Mutating)
            .with_description("Move a note or folder to another PARA location.")
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "destination": { "type": "string" }
                },
                "required": ["path", "destination"]
            })),
        ToolDefinition::new("create_folder", SideEffect::Mutating)
            .with_description("Create a project, area or resource folder.")
            .with_parameters(json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            })),
    ]
}

fn preference_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new("get_preferences", SideEffect::ReadOnly)
            .with_description("Read what the butler knows about the user's preferences."),
        ToolDefinition::new("record_preference", SideEffect::Mutating)
            .with_description("Remember a preference.")
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "key": { "type": "string" },
                    "value": { "type": "string" }
                },
                "required": ["key", "value"]
            })),
        ToolDefinition::new("forget_preference", SideEffect::Destructive)
            .with_description("Permanently forget a stored preference.")
            .with_parameters(json!({
                "type": "object",
                "properties": { "key": { "type": "string" } },
                "required": ["key"]
            })),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::get_builtin_agents;

    #[test]
    fn test_builtin_catalog_builds() {
        let catalog = builtin_catalog().unwrap();
        assert_eq!(catalog.classify("send_slack_message"), Some(SideEffect::Destructive));
        assert_eq!(catalog.classify("update_event"), Some(SideEffect::Mutating));
        assert_eq!(catalog.classify("list_emails"), Some(SideEffect::ReadOnly));
    }

    #[test]
    fn test_builtin_agents_reference_catalog_tools() {
        let catalog = builtin_catalog().unwrap();
        for agent in get_builtin_agents() {
            for tool in &agent.tools {
                assert!(catalog.contains(tool), "{} references {}", agent.name, tool);
            }
        }
    }

    #[test]
    fn test_local_tools_have_no_integration() {
        let catalog = builtin_catalog().unwrap();
        assert!(catalog.lookup("search_notes").unwrap().integration.is_none());
        assert_eq!(
            catalog.integrations(),
            vec![GOOGLE_CALENDAR, GMAIL, SLACK, GOOGLE_CONTACTS]
        );
    }
}
