use crate::bus::PublishError;
use crate::types::{ChannelName, Record};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// In-flight delivery state for one record.
///
/// Owned by the delivery pool from submission until the record is either
/// published or handed to the fallback store.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    record: Record,
    channel: ChannelName,
    attempt_count: u32,
    next_retry_at: Instant,
    first_failure_at: Option<DateTime<Utc>>,
    last_error: Option<PublishError>,
}

impl DeliveryAttempt {
    /// A fresh attempt with the full retry budget, due immediately.
    pub fn new(record: Record, channel: impl Into<ChannelName>) -> Self {
        Self {
            record,
            channel: channel.into(),
            attempt_count: 0,
            next_retry_at: Instant::now(),
            first_failure_at: None,
            last_error: None,
        }
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn partition_key(&self) -> &str {
        self.record.partition_key()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn next_retry_at(&self) -> Instant {
        self.next_retry_at
    }

    pub fn first_failure_at(&self) -> Option<DateTime<Utc>> {
        self.first_failure_at
    }

    pub fn last_error(&self) -> Option<&PublishError> {
        self.last_error.as_ref()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_retry_at <= now
    }

    /// Records a failed publish and schedules the next attempt `delay` after `now`.
    pub fn record_failure(&mut self, error: PublishError, now: Instant, delay: Duration) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.next_retry_at = now + delay;
        self.first_failure_at.get_or_insert_with(Utc::now);
        self.last_error = Some(error);
    }

    pub fn exceeds_budget(&self, max_retries: u32) -> bool {
        self.attempt_count > max_retries
    }

    pub fn into_record(self) -> Record {
        self.record
    }
}
