//! # SBQ Runtime
//!
//! Queue runtime for the Service Bus courier: one message sent, one batch
//! received, printed and completed.
//!
//! This library provides:
//! - Ambient credential resolution through `azure_identity`
//! - An Azure Service Bus provider over the data-plane REST API
//! - An in-memory provider with the same peek-lock semantics
//! - Scoped sender and receiver links that are always closed
//! - Deadline and cancellation bounds for every remote call
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Message structures and receipt handles
//! - [`provider`] - Provider types, configuration and resource naming
//! - [`credentials`] - Token sources for the Service Bus data plane
//! - [`context`] - Operation deadlines and cancellation
//! - [`client`] - Client, link traits and the send/receive flow
//! - [`providers`] - Azure Service Bus and in-memory backends

pub mod client;
pub mod context;
pub mod credentials;
pub mod error;
pub mod message;
pub mod provider;
pub mod providers;

// Re-export commonly used types at crate root for convenience
pub use client::{
    CompletionFailure, QueueClient, QueueClientFactory, QueueProvider, ReceiveReport,
    ReceiverLink, SenderLink,
};
pub use context::OperationContext;
pub use credentials::{resolve_credentials, StaticTokenSource, TokenSource, SERVICE_BUS_SCOPE};
pub use error::{
    ConfigurationError, OperationError, QueueError, SerializationError, ValidationError,
};
pub use message::{
    AckPolicy, Message, MessageId, QueueName, ReceiptHandle, ReceiveOptions, ReceivedMessage,
    Timestamp, MAX_RECEIVE_BATCH,
};
pub use provider::{
    AzureServiceBusConfig, InMemoryConfig, ProviderConfig, ProviderType, QueueConfig,
    ResourceNames,
};
pub use providers::{AzureServiceBusProvider, InMemoryProvider};

// Re-exported so callers can cancel operations without a direct dependency
pub use tokio_util::sync::CancellationToken;
