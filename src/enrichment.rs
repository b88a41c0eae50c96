//! Best-effort sentiment enrichment for customer interactions.
//!
//! A failing or slow classifier never fails the pipeline: the record is
//! forwarded unenriched and the failure is logged and counted.

use crate::config::EnrichmentConfig;
use crate::error::{PipelineError, Result};
use crate::metrics::PipelineMetrics;
use crate::types::{Enrichment, Record, SourceType};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Text classification capability provided by an external model.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Returns a sentiment score for `text`.
    async fn classify(&self, text: &str) -> Result<f64>;
}

pub struct EnrichmentStage {
    classifier: Option<Arc<dyn Classifier>>,
    config: EnrichmentConfig,
    metrics: Arc<PipelineMetrics>,
}

impl EnrichmentStage {
    pub fn new(
        classifier: Option<Arc<dyn Classifier>>,
        config: EnrichmentConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            classifier,
            config,
            metrics,
        }
    }

    pub async fn enrich(&self, mut record: Record) -> Record {
        if record.source_type() != SourceType::CustomerInteraction
            || record.enrichment().is_some()
            || !self.config.enabled
        {
            return record;
        }

        let Some(classifier) = self.classifier.as_ref() else {
            return record;
        };

        match self.classify(classifier.as_ref(), &record).await {
            Ok(score) => {
                let enrichment = Enrichment::from_score(score, self.config.positive_threshold);
                debug!(
                    target: "amr_pipeline::enrichment",
                    record_id = %record.id(),
                    score,
                    label = ?enrichment.label,
                    "Record enriched"
                );
                // Unreachable in practice: source type and emptiness were checked above
                if let Err(e) = record.set_enrichment(enrichment) {
                    warn!(target: "amr_pipeline::enrichment", record_id = %record.id(), "Enrichment discarded: {}", e);
                    return record;
                }
                self.metrics.enrichment_applied.inc();
            }
            Err(e) => {
                self.metrics.enrichment_failures.inc();
                warn!(
                    target: "amr_pipeline::enrichment",
                    record_id = %record.id(),
                    partition_key = record.partition_key(),
                    "Forwarding record unenriched: {}",
                    e
                );
            }
        }

        record
    }

    async fn classify(&self, classifier: &dyn Classifier, record: &Record) -> Result<f64> {
        let text = record.text();
        match timeout(self.config.timeout(), classifier.classify(&text)).await {
            Ok(Ok(score)) if score.is_finite() => Ok(score),
            Ok(Ok(score)) => Err(PipelineError::ClassifierUnavailable(format!(
                "classifier returned a non-finite score ({})",
                score
            ))),
            Ok(Err(PipelineError::ClassifierUnavailable(msg))) => {
                Err(PipelineError::ClassifierUnavailable(msg))
            }
            Ok(Err(e)) => Err(PipelineError::ClassifierUnavailable(e.to_string())),
            Err(_) => Err(PipelineError::ClassifierUnavailable(format!(
                "classifier timed out after {}ms",
                self.config.timeout_ms
            ))),
        }
    }
}
