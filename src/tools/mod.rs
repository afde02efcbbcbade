//! Built-in tool catalog and executors
//!
//! - `builtin_catalog`: contracts for calendar, email, messaging, contacts, notes and preferences
//! - `DryRunExecutor`: acknowledges calls without side effects
//! - `CredentialGuard`: fails calls whose integration has no credential

mod catalog;
mod dry_run;
mod guard;

pub use catalog::{builtin_catalog, GMAIL, GOOGLE_CALENDAR, GOOGLE_CONTACTS, SLACK};
pub use dry_run::{DryRunExecutor, ExecutedCall};
pub use guard::CredentialGuard;
