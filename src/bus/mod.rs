//! Message bus producer interface.
//!
//! The bus client itself lives outside this crate. The delivery pool is the
//! only component holding a `MessageBus`; everything else reaches the bus
//! through the pool.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::{InMemoryBus, PublishedMessage};

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishError {
    /// Broker unreachable, timeout, leader election and similar conditions
    #[error("transient publish failure: {0}")]
    Transient(String),

    /// Malformed record or destination rejection
    #[error("permanent publish failure: {0}")]
    Permanent(String),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }

    /// Error category for metrics and logs
    pub fn category(&self) -> &'static str {
        match self {
            PublishError::Transient(_) => "transient",
            PublishError::Permanent(_) => "permanent",
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, channel: &str, key: &str, payload: Bytes) -> Result<(), PublishError>;

    /// Releases the bus connection. Called once when the pipeline stops.
    async fn close(&self) -> Result<(), PublishError>;
}
