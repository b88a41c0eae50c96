use crate::Result;
use prometheus::{IntCounter, IntGauge, Registry};
use std::sync::Arc;

pub struct PipelineMetrics {
    pub records_submitted: IntCounter,
    pub records_rejected: IntCounter,
    pub records_published: IntCounter,
    pub publish_retries: IntCounter,
    pub permanent_failures: IntCounter,
    pub fallback_transfers: IntCounter,
    pub fallback_persist_failures: IntCounter,
    pub records_replayed: IntCounter,
    pub enrichment_applied: IntCounter,
    pub enrichment_failures: IntCounter,
    pub in_flight: IntGauge,
    pub fallback_size: IntGauge,
    pub registry: Registry,
}

impl PipelineMetrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let records_submitted = IntCounter::new(
            "amr_records_submitted_total",
            "Records accepted from adapters",
        )?;
        let records_rejected = IntCounter::new(
            "amr_records_rejected_total",
            "Records rejected because the pipeline was shutting down",
        )?;
        let records_published = IntCounter::new(
            "amr_records_published_total",
            "Records acknowledged by the message bus",
        )?;
        let publish_retries = IntCounter::new(
            "amr_publish_retries_total",
            "Transient publish failures that were scheduled for retry",
        )?;
        let permanent_failures = IntCounter::new(
            "amr_permanent_failures_total",
            "Publish attempts rejected as non-retryable",
        )?;
        let fallback_transfers = IntCounter::new(
            "amr_fallback_transfers_total",
            "Records moved to the fallback store",
        )?;
        let fallback_persist_failures = IntCounter::new(
            "amr_fallback_persist_failures_total",
            "Records the fallback store failed to persist",
        )?;
        let records_replayed = IntCounter::new(
            "amr_records_replayed_total",
            "Fallback entries resubmitted for delivery",
        )?;
        let enrichment_applied = IntCounter::new(
            "amr_enrichment_applied_total",
            "Customer interactions enriched with a sentiment score",
        )?;
        let enrichment_failures = IntCounter::new(
            "amr_enrichment_failures_total",
            "Classifier failures or timeouts; the record was forwarded unenriched",
        )?;
        let in_flight = IntGauge::new(
            "amr_delivery_in_flight",
            "Delivery attempts queued or being published",
        )?;
        let fallback_size = IntGauge::new(
            "amr_fallback_size",
            "Entries held by the fallback store at the last observation",
        )?;

        registry.register(Box::new(records_submitted.clone()))?;
        registry.register(Box::new(records_rejected.clone()))?;
        registry.register(Box::new(records_published.clone()))?;
        registry.register(Box::new(publish_retries.clone()))?;
        registry.register(Box::new(permanent_failures.clone()))?;
        registry.register(Box::new(fallback_transfers.clone()))?;
        registry.register(Box::new(fallback_persist_failures.clone()))?;
        registry.register(Box::new(records_replayed.clone()))?;
        registry.register(Box::new(enrichment_applied.clone()))?;
        registry.register(Box::new(enrichment_failures.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(fallback_size.clone()))?;

        Ok(Arc::new(Self {
            records_submitted,
            records_rejected,
            records_published,
            publish_retries,
            permanent_failures,
            fallback_transfers,
            fallback_persist_failures,
            records_replayed,
            enrichment_applied,
            enrichment_failures,
            in_flight,
            fallback_size,
            registry,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.records_published.inc();
        metrics.in_flight.set(3);

        let families = metrics.registry.gather();
        assert_eq!(families.len(), 12);
        assert_eq!(metrics.records_published.get(), 1);
        assert_eq!(metrics.in_flight.get(), 3);
    }
}
