//! AMR pipeline demo - pushes one record per source through an in-memory bus
//!
//! Submits a market trend, a customer interaction and an ecosystem feedback
//! record, then drains and stops the pipeline. Set `AMR_FALLBACK_DIR` to use
//! the durable fallback store instead of the in-memory one.

use amr_pipeline::bus::InMemoryBus;
use amr_pipeline::config::FallbackBackend;
use amr_pipeline::enrichment::Classifier;
use amr_pipeline::{Pipeline, PipelineConfig, Record};
use anyhow::Context;
use async_trait::async_trait;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

/// Stand-in for the sentiment model: fraction of known positive words.
struct KeywordClassifier;

const POSITIVE_WORDS: &[&str] = &["great", "love", "good", "excellent", "well", "happy"];

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> amr_pipeline::Result<f64> {
        let words: Vec<String> = text
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        if words.is_empty() {
            return Ok(0.0);
        }
        let positive = words.iter().filter(|w| POSITIVE_WORDS.contains(&w.as_str())).count();
        Ok((positive as f64 * 2.0 / words.len() as f64).min(1.0))
    }
}

fn sample_records() -> Vec<Record> {
    vec![
        Record::market_trend(
            "Technology",
            r#"{"timestamp":"2023-10-05T12:00:00","sector":"Technology","trend":"Positive"}"#,
        ),
        Record::customer_interaction(
            "C1234",
            r#"{"customer_id":"C1234","text":"Great product! I love it!"}"#,
        ),
        Record::ecosystem_feedback(
            "positive",
            r#"{"timestamp":"2023-10-05T12:30:00","feedback_type":"positive","message":"Customers are responding well to new features"}"#,
        ),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut config = PipelineConfig::default();
    config.fallback.backend = match env::var("AMR_FALLBACK_DIR") {
        Ok(dir) => FallbackBackend::File { path: PathBuf::from(dir) },
        Err(_) => FallbackBackend::Memory,
    };

    let bus = Arc::new(InMemoryBus::new());
    let pipeline = Pipeline::builder()
        .config(config)
        .bus(bus.clone())
        .classifier(Arc::new(KeywordClassifier))
        .build()
        .await
        .context("failed to start pipeline")?;

    let submit_all = async {
        for record in sample_records() {
            let source = record.source_type();
            pipeline
                .submit(record)
                .await
                .with_context(|| format!("failed to submit {} record", source))?;
        }
        anyhow::Ok(())
    };

    tokio::select! {
        result = submit_all => result?,
        _ = signal::ctrl_c() => warn!("Received shutdown signal (Ctrl+C)"),
    }

    let report = pipeline.shutdown().await;
    info!(
        "Shutdown complete: drained_gracefully={}, flushed_to_fallback={}",
        report.drained_gracefully, report.flushed_to_fallback
    );

    for message in bus.messages() {
        info!(
            "Published to {} [{}]: {}",
            message.channel,
            message.key,
            String::from_utf8_lossy(&message.payload)
        );
    }

    Ok(())
}
