//! Provider types, configuration and resource naming.

use crate::error::ValidationError;
use crate::message::QueueName;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Namespace host template; `{env}` is replaced by the environment token.
pub const NAMESPACE_HOST_TEMPLATE: &str = "sbns-yym-{env}-usce.servicebus.windows.net";

/// Queue name template; `{env}` is replaced by the environment token.
pub const QUEUE_NAME_TEMPLATE: &str = "sbq-yym-{env}-usce";

/// Enumeration of supported queue providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    AzureServiceBus,
    InMemory,
}

impl ProviderType {
    /// Get maximum message size for provider
    pub fn max_message_size(&self) -> usize {
        match self {
            Self::AzureServiceBus => 256 * 1024, // Standard tier
            Self::InMemory => 10 * 1024 * 1024,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AzureServiceBus => write!(f, "AzureServiceBus"),
            Self::InMemory => write!(f, "InMemory"),
        }
    }
}

/// Namespace host and queue derived from one environment token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub environment: String,
    pub namespace_host: String,
    pub queue_name: QueueName,
}

impl ResourceNames {
    /// Substitute `environment` into the namespace and queue templates.
    ///
    /// An empty token is accepted and yields the degenerate names
    /// `sbns-yym--usce...` and `sbq-yym--usce`; the service rejects them later.
    pub fn for_environment(environment: &str) -> Result<Self, ValidationError> {
        let namespace_host = NAMESPACE_HOST_TEMPLATE.replace("{env}", environment);
        let queue_name = QueueName::new(QUEUE_NAME_TEMPLATE.replace("{env}", environment))?;

        Ok(Self {
            environment: environment.to_string(),
            namespace_host,
            queue_name,
        })
    }

    /// Whether the environment token was empty
    pub fn is_degenerate(&self) -> bool {
        self.environment.is_empty()
    }
}

/// Configuration for queue client initialization
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub provider: ProviderConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::InMemory(InMemoryConfig::default()),
        }
    }
}

/// Provider-specific configuration
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    AzureServiceBus(AzureServiceBusConfig),
    InMemory(InMemoryConfig),
}

impl ProviderConfig {
    /// Provider selected by this configuration
    pub fn provider_type(&self) -> ProviderType {
        match self {
            Self::AzureServiceBus(_) => ProviderType::AzureServiceBus,
            Self::InMemory(_) => ProviderType::InMemory,
        }
    }
}

/// Azure Service Bus configuration
#[derive(Debug, Clone)]
pub struct AzureServiceBusConfig {
    /// Fully qualified namespace host, e.g. `sbns-yym-dev-usce.servicebus.windows.net`
    pub namespace_host: String,
    /// Base URL override (emulators, tests); defaults to `https://{namespace_host}/`
    pub endpoint: Option<String>,
    /// Upper bound for a single HTTP exchange
    pub request_timeout: Duration,
}

impl AzureServiceBusConfig {
    /// Configuration for a namespace host with default settings
    pub fn for_namespace(namespace_host: impl Into<String>) -> Self {
        Self {
            namespace_host: namespace_host.into(),
            endpoint: None,
            request_timeout: Duration::seconds(90),
        }
    }
}

/// In-memory provider configuration
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    pub lock_duration: Duration,
    pub max_message_size: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::seconds(60),
            max_message_size: ProviderType::InMemory.max_message_size(),
        }
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
