//! Delivery worker pool: ordered, retrying publication to the message bus.

pub mod attempt;
pub mod backoff;
pub mod pool;

pub use attempt::DeliveryAttempt;
pub use backoff::Backoff;
pub use pool::{DeliveryEvent, DeliveryPool, FallbackReason};
