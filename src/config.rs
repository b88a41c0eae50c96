use crate::error::{PipelineError, Result};
use crate::types::SourceType;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub routing: RoutingConfig,
    pub enrichment: EnrichmentConfig,
    pub delivery: DeliveryConfig,
    pub retry: RetryConfig,
    pub fallback: FallbackConfig,
    pub shutdown: ShutdownConfig,
}

/// Destination channel per source type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub market_trend_channel: String,
    pub customer_interaction_channel: String,
    pub ecosystem_feedback_channel: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            market_trend_channel: "market_trends".to_string(),
            customer_interaction_channel: "customer_behavior".to_string(),
            ecosystem_feedback_channel: "ecosystem_feedback".to_string(),
        }
    }
}

impl RoutingConfig {
    pub fn channel_for(&self, source_type: SourceType) -> &str {
        match source_type {
            SourceType::MarketTrend => &self.market_trend_channel,
            SourceType::CustomerInteraction => &self.customer_interaction_channel,
            SourceType::EcosystemFeedback => &self.ecosystem_feedback_channel,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for source_type in SourceType::ALL {
            if self.channel_for(source_type).trim().is_empty() {
                return Err(PipelineError::InvalidConfig(format!(
                    "routing channel for {} must not be empty",
                    source_type
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    /// Upper bound on a single classifier call, independent of the publish timeout
    pub timeout_ms: u64,
    /// Scores strictly above this value are labelled positive
    pub positive_threshold: f64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 2_000,
            positive_threshold: 0.5,
        }
    }
}

impl EnrichmentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.timeout_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "enrichment.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if !self.positive_threshold.is_finite() {
            return Err(PipelineError::InvalidConfig(
                "enrichment.positive_threshold must be a finite number".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum number of publish calls in flight across all partition keys
    pub worker_concurrency: usize,
    /// Bound on each partition key's sub-queue; producers block beyond it
    pub per_key_queue_depth: usize,
    pub publish_timeout_ms: u64,
    /// Capacity of the delivery event broadcast channel
    pub event_buffer: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 16,
            per_key_queue_depth: 1024,
            publish_timeout_ms: 5_000,
            event_buffer: 1024,
        }
    }
}

impl DeliveryConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "delivery.worker_concurrency must be greater than 0".to_string(),
            ));
        }
        if self.per_key_queue_depth == 0 {
            return Err(PipelineError::InvalidConfig(
                "delivery.per_key_queue_depth must be greater than 0".to_string(),
            ));
        }
        // tokio's semaphore refuses more permits than this
        if self.per_key_queue_depth > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(PipelineError::InvalidConfig(
                "delivery.per_key_queue_depth exceeds the semaphore permit limit".to_string(),
            ));
        }
        if self.publish_timeout_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "delivery.publish_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(PipelineError::InvalidConfig(
                "delivery.event_buffer must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry budget and exponential backoff parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Failed publishes tolerated before a record moves to the fallback store
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the computed delay added as random jitter (0.0 disables)
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "retry.base_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(PipelineError::InvalidConfig(
                "retry.max_delay_ms must be >= retry.base_delay_ms".to_string(),
            ));
        }
        if !(self.multiplier >= 1.0) {
            return Err(PipelineError::InvalidConfig(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(PipelineError::InvalidConfig(
                "retry.jitter_ratio must be within [0.0, 1.0]".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FallbackBackend {
    Memory,
    File { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub backend: FallbackBackend,
    pub fsync_on_write: bool,
    pub replay_interval_ms: u64,
    pub replay_batch_size: usize,
    /// Removed entries tolerated in the log before it is rewritten
    pub compaction_threshold: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            backend: FallbackBackend::File {
                path: PathBuf::from("/tmp/amr-pipeline/fallback"),
            },
            fsync_on_write: true,
            replay_interval_ms: 30_000,
            replay_batch_size: 100,
            compaction_threshold: 10_000,
        }
    }
}

impl FallbackConfig {
    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replay_interval_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "fallback.replay_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.replay_batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "fallback.replay_batch_size must be greater than 0".to_string(),
            ));
        }
        if let FallbackBackend::File { path } = &self.backend {
            if path.as_os_str().is_empty() {
                return Err(PipelineError::InvalidConfig(
                    "fallback.backend.path must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Time in-flight deliveries get to resolve before they are flushed to the fallback store
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 10_000,
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.routing.validate()?;
        self.enrichment.validate()?;
        self.delivery.validate()?;
        self.retry.validate()?;
        self.fallback.validate()?;
        Ok(())
    }
}
