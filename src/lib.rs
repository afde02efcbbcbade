//! Orion Butler - delegation and permission core for a personal assistant
//!
//! This crate provides:
//! - A static agent registry and tool catalog, checked for consistency at startup
//! - A permission gate with two-step confirmation for destructive tools
//! - A coordinator that answers a turn directly or delegates it to one sub-agent
//! - An append-only session store (in-memory or SQLite) with an audit trail
//! - CLI/REPL interface for trying it out

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod runtime;
pub mod telemetry;
pub mod templates;

// Delegation system
pub mod agent;
pub mod coordinator;
pub mod permission;
pub mod session;
pub mod tool;
pub mod tools;

pub use auth::{AuthConfig, AuthEntry};
pub use config::ButlerConfig;
pub use error::{ButlerError, FailureKind, Result};
pub use runtime::{check_consistency, ConsistencyReport, Readiness, Runtime};
pub use telemetry::{init_logging, TelemetryGuard};

pub use agent::{AgentDefinition, AgentKind, AgentRegistry, ModelTier};
pub use coordinator::{Coordinator, Response, ResponseStatus, UserTurn};
pub use events::{event_channel, ButlerEvent, ButlerEventStream};
pub use permission::{AuthorizationRequest, Decision, PermissionGate, ReasonCode};
pub use session::{ConversationKind, SessionStore};
pub use tool::{SideEffect, ToolCatalog, ToolDefinition, ToolExecutor};
