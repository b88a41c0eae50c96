//! Fallback replay: entries re-enter delivery with a fresh retry budget, are
//! routed again but not re-enriched, and are removed only once resubmitted.


use amr_pipeline::bus::PublishError;
use amr_pipeline::delivery::DeliveryEvent;
use amr_pipeline::fallback::{FallbackStore, FileFallbackStore, MemoryFallbackStore, ReplayReport};
use amr_pipeline::{Pipeline, PipelineConfig, PipelineError, Record};
use pipeline_test_utils::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;

fn failing_fast_config() -> PipelineConfig {
    let mut config = test_config();
    config.retry.max_retries = 1;
    config
}

#[tokio::test]
async fn test_replay_restores_full_retry_budget() {
    let bus = ScriptedBus::new();
    bus.fail_all(Some(PublishError::Transient("broker unreachable".to_string())));
    let store = Arc::new(MemoryFallbackStore::new());
    let pipeline = Pipeline::builder()
        .config(failing_fast_config())
        .bus(bus.clone())
        .fallback_store(store.clone())
        .build()
        .await
        .unwrap();
    let mut events = pipeline.subscribe();

    let record = Record::market_trend("tech", r#"{"trend":"Positive"}"#);
    pipeline.submit(record.clone()).await.unwrap();
    wait_for_fallback(&mut events, record.id()).await;

    let entries = store.drain_batch(10).await.unwrap();
    assert_eq!(entries[0].attempt_count, 2);

    // Destination recovers except for one more transient failure, which the
    // restored budget absorbs
    bus.fail_all(None);
    bus.fail_next("segment:tech", vec![PublishError::Transient("still warming up".to_string())]);

    let report = pipeline.replay_now().await.unwrap();
    assert_eq!(report, ReplayReport { resubmitted: 1, deferred: 0 });

    let retry = wait_for_event(&mut events, |e| matches!(e, DeliveryEvent::Retrying { .. })).await;
    assert!(matches!(retry, DeliveryEvent::Retrying { attempt_count: 1, .. }));
    let published = wait_for_published(&mut events, record.id()).await;
    assert!(matches!(published, DeliveryEvent::Published { attempt_count: 1, .. }));

    assert!(store.is_empty().await.unwrap());
    assert_eq!(pipeline.metrics().records_replayed.get(), 1);
    assert_eq!(bus.published_ids("segment:tech"), vec![record.id().to_string()]);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_replay_does_not_reenrich() {
    let bus = ScriptedBus::new();
    bus.fail_all(Some(PublishError::Transient("broker unreachable".to_string())));
    let classifier = ScriptedClassifier::scoring(0.8);
    classifier.fail_next(1);

    let pipeline = Pipeline::builder()
        .config(failing_fast_config())
        .bus(bus.clone())
        .classifier(classifier.clone())
        .fallback_store(Arc::new(MemoryFallbackStore::new()))
        .build()
        .await
        .unwrap();
    let mut events = pipeline.subscribe();

    let record = Record::customer_interaction("C5", r#"{"text":"love the new dashboard"}"#);
    pipeline.submit(record.clone()).await.unwrap();
    wait_for_fallback(&mut events, record.id()).await;
    assert_eq!(classifier.calls(), 1);

    bus.fail_all(None);
    pipeline.replay_now().await.unwrap();
    wait_for_published(&mut events, record.id()).await;

    // The classifier is healthy now, but replay skips enrichment
    assert_eq!(classifier.calls(), 1);
    let published = bus.published();
    assert_eq!(published.len(), 1);
    assert!(published[0].envelope.get("enrichment").is_none());
    assert_eq!(published[0].channel, "customer_behavior");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_replay_applies_current_routing_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let bus = ScriptedBus::new();
    bus.fail_all(Some(PublishError::Permanent("topic does not exist".to_string())));

    let record = Record::market_trend("energy", r#"{"sector":"Energy"}"#);
    {
        let store = Arc::new(FileFallbackStore::open(temp_dir.path(), true, 100).await.unwrap());
        let pipeline = Pipeline::builder()
            .config(test_config())
            .bus(bus.clone())
            .fallback_store(store)
            .build()
            .await
            .unwrap();
        let mut events = pipeline.subscribe();
        pipeline.submit(record.clone()).await.unwrap();
        wait_for_fallback(&mut events, record.id()).await;
        pipeline.shutdown().await;
    }

    // Operator fixes the destination by pointing market trends elsewhere
    bus.fail_all(None);
    let mut config = test_config();
    config.routing.market_trend_channel = "market_trends_v2".to_string();

    let store = Arc::new(FileFallbackStore::open(temp_dir.path(), true, 100).await.unwrap());
    let pipeline = Pipeline::builder()
        .config(config)
        .bus(bus.clone())
        .fallback_store(store.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(pipeline.snapshot().await.unwrap().fallback_size, 1);
    let mut events = pipeline.subscribe();

    pipeline.replay_now().await.unwrap();
    wait_for_published(&mut events, record.id()).await;

    let published = bus.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].channel, "market_trends_v2");
    assert_eq!(published[0].record_id(), record.id().to_string());
    assert!(store.is_empty().await.unwrap());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_replay_batch_is_bounded_and_oldest_first() {
    let bus = ScriptedBus::new();
    let store = Arc::new(MemoryFallbackStore::new());
    let records: Vec<Record> = (0..5)
        .map(|i| Record::market_trend("tech", format!(r#"{{"seq":{}}}"#, i)))
        .collect();
    for record in &records {
        store
            .put(record.clone(), 6, chrono::Utc::now(), Some(PublishError::Transient("down".to_string())))
            .await
            .unwrap();
    }

    let mut config = test_config();
    config.fallback.replay_batch_size = 2;
    let pipeline = Pipeline::builder()
        .config(config)
        .bus(bus.clone())
        .fallback_store(store.clone())
        .build()
        .await
        .unwrap();
    let mut events = pipeline.subscribe();

    let report = pipeline.replay_now().await.unwrap();
    assert_eq!(report.resubmitted, 2);
    wait_for_published(&mut events, records[1].id()).await;
    assert_eq!(store.len().await.unwrap(), 3);

    pipeline.replay_now().await.unwrap();
    pipeline.replay_now().await.unwrap();
    wait_for_published(&mut events, records[4].id()).await;

    let expected: Vec<String> = records.iter().map(|r| r.id().to_string()).collect();
    assert_eq!(bus.published_ids("segment:tech"), expected);
    assert!(store.is_empty().await.unwrap());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_replay_timer_delivers_without_operator() {
    let bus = ScriptedBus::new();
    let store = Arc::new(MemoryFallbackStore::new());
    let record = Record::ecosystem_feedback("survey", r#"{"message":"pricing is confusing"}"#);
    store.put(record.clone(), 3, chrono::Utc::now(), None).await.unwrap();

    let mut config = test_config();
    config.fallback.replay_interval_ms = 50;
    let pipeline = Pipeline::builder()
        .config(config)
        .bus(bus.clone())
        .fallback_store(store.clone())
        .build()
        .await
        .unwrap();
    let mut events = pipeline.subscribe();

    wait_for_published(&mut events, record.id()).await;
    assert_eq!(bus.published()[0].channel, "ecosystem_feedback");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_replay_refused_after_shutdown() {
    let bus = ScriptedBus::new();
    let store = Arc::new(MemoryFallbackStore::new());
    store.put(Record::market_trend("tech", "{}"), 6, chrono::Utc::now(), None).await.unwrap();

    let pipeline = Pipeline::builder()
        .config(test_config())
        .bus(bus.clone())
        .fallback_store(store.clone())
        .build()
        .await
        .unwrap();
    pipeline.shutdown().await;

    let result = pipeline.replay_now().await;
    assert!(matches!(result, Err(PipelineError::PipelineShuttingDown)));
    assert_eq!(store.len().await.unwrap(), 1);
}
