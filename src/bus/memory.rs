use super::{MessageBus, PublishError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub channel: String,
    pub key: String,
    pub payload: Bytes,
}

/// Bus that keeps every published message in memory.
///
/// Used by the demo binary and by tests; `set_available(false)` makes every
/// publish fail transiently until the bus is made available again.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    messages: Arc<RwLock<Vec<PublishedMessage>>>,
    unavailable: Arc<AtomicBool>,
    close_calls: Arc<AtomicUsize>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.read().clone()
    }

    pub fn messages_for_key(&self, key: &str) -> Vec<PublishedMessage> {
        self.messages
            .read()
            .iter()
            .filter(|message| message.key == key)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, channel: &str, key: &str, payload: Bytes) -> Result<(), PublishError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PublishError::Transient("in-memory bus unavailable".to_string()));
        }
        self.messages.write().push(PublishedMessage {
            channel: channel.to_string(),
            key: key.to_string(),
            payload,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_bus_records_messages() {
        let bus = InMemoryBus::new();
        bus.publish("market_trends", "segment:tech", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert_eq!(bus.len(), 1);
        assert_eq!(bus.messages_for_key("segment:tech")[0].channel, "market_trends");
    }

    #[tokio::test]
    async fn test_unavailable_bus_fails_transiently() {
        let bus = InMemoryBus::new();
        bus.set_available(false);

        let err = bus
            .publish("market_trends", "segment:tech", Bytes::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(bus.is_empty());
    }
}
