//! Queue provider implementations.
//!
//! This module contains concrete implementations of the `QueueProvider`,
//! `SenderLink` and `ReceiverLink` traits for each backend.

pub mod azure;
pub mod memory;

pub use azure::{AzureError, AzureServiceBusProvider};
pub use memory::{InMemoryProvider, LinkStats};
