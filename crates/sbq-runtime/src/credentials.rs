//! Ambient credential resolution.
//!
//! Production code resolves identity through `azure_identity`'s default
//! credential chain (environment variables, managed identity, Azure CLI login).
//! The chain's precedence belongs to `azure_identity`; this module only adapts
//! it to the [`TokenSource`] seam used by the providers.

use crate::error::{OperationError, QueueError};
use async_trait::async_trait;
use azure_core::auth::TokenCredential;
use azure_identity::{DefaultAzureCredential, TokenCredentialOptions};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

#[cfg(test)]
#[path = "credentials_tests.rs"]
mod tests;

/// OAuth scope granting data-plane access to Service Bus namespaces
pub const SERVICE_BUS_SCOPE: &str = "https://servicebus.azure.net/.default";

/// Source of bearer tokens for the Service Bus data plane
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Obtain a bearer token valid for [`SERVICE_BUS_SCOPE`]
    async fn bearer_token(&self) -> Result<String, QueueError>;

    /// Short name used in logs
    fn kind(&self) -> &'static str;
}

/// Token source backed by an `azure_identity` credential
pub struct AzureIdentityTokenSource {
    credential: Arc<dyn TokenCredential>,
}

impl AzureIdentityTokenSource {
    /// Wrap an existing credential
    pub fn new(credential: Arc<dyn TokenCredential>) -> Self {
        Self { credential }
    }
}

impl fmt::Debug for AzureIdentityTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureIdentityTokenSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenSource for AzureIdentityTokenSource {
    async fn bearer_token(&self) -> Result<String, QueueError> {
        let token = self
            .credential
            .get_token(&[SERVICE_BUS_SCOPE])
            .await
            .map_err(map_identity_error)?;

        Ok(token.token.secret().to_string())
    }

    fn kind(&self) -> &'static str {
        "azure-identity"
    }
}

/// Token source that always returns the same token.
///
/// Used against local emulators and in tests.
#[derive(Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenSource")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn bearer_token(&self) -> Result<String, QueueError> {
        if self.token.is_empty() {
            return Err(QueueError::AuthenticationFailed {
                message: "static token is empty".to_string(),
            });
        }
        Ok(self.token.clone())
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}

/// Resolve ambient credentials from the hosting environment.
///
/// # Errors
///
/// Returns [`OperationError::AuthResolution`] when the default credential
/// chain cannot be constructed.
#[instrument]
pub fn resolve_credentials() -> Result<Arc<dyn TokenSource>, OperationError> {
    let credential = DefaultAzureCredential::create(TokenCredentialOptions::default()).map_err(
        |e| OperationError::AuthResolution {
            operation: "DefaultAzureCredential",
            source: map_identity_error(e),
        },
    )?;

    debug!("Resolved default Azure credential chain");
    Ok(Arc::new(AzureIdentityTokenSource::new(Arc::new(credential))))
}

/// Map an identity error to a queue error by inspecting its message
fn map_identity_error(error: azure_core::Error) -> QueueError {
    classify_identity_failure(&error.to_string())
}

pub(crate) fn classify_identity_failure(message: &str) -> QueueError {
    if message.contains("timeout") || message.contains("Timeout") {
        QueueError::ConnectionFailed {
            message: message.to_string(),
        }
    } else if message.contains("403") || message.contains("Forbidden") {
        QueueError::PermissionDenied {
            operation: format!("acquire token: {}", message),
        }
    } else {
        QueueError::AuthenticationFailed {
            message: message.to_string(),
        }
    }
}
