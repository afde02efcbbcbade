//! Credential check in front of an executor
//!
//! A tool bound to an integration without a usable credential fails with
//! `ToolError::Unavailable` before the inner executor is called.

use crate::auth::AuthConfig;
use crate::tool::{ToolContext, ToolDefinition, ToolError, ToolExecutor};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct CredentialGuard {
    inner: Arc<dyn ToolExecutor>,
    credentials: Arc<AuthConfig>,
}

impl CredentialGuard {
    pub fn new(inner: Arc<dyn ToolExecutor>, credentials: Arc<AuthConfig>) -> Self {
        Self { inner, credentials }
    }
}

#[async_trait]
impl ToolExecutor for CredentialGuard {
    async fn execute(
        &self,
        tool: &ToolDefinition,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        if let Some(integration) = tool.integration.as_deref() {
            if !self.credentials.has_credential(integration) {
                return Err(ToolError::Unavailable {
                    integration: integration.to_string(),
                    detail: format!(
                        "no credential found; set {} or add \"{}\" to auth.json",
                        AuthConfig::env_var_for(integration),
                        integration
                    ),
                });
            }
        }
        self.inner.execute(tool, args, ctx).await
    }
}
