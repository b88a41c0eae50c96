//! End-to-end tests: enrichment, routing and ordered delivery through the
//! pipeline coordinator.


use amr_pipeline::bus::PublishError;
use amr_pipeline::delivery::{DeliveryEvent, FallbackReason};
use amr_pipeline::fallback::MemoryFallbackStore;
use amr_pipeline::{Pipeline, PipelineError, PipelineState, Record};
use pipeline_test_utils::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

async fn create_pipeline(bus: Arc<ScriptedBus>, classifier: Option<Arc<ScriptedClassifier>>) -> Pipeline {
    let mut builder = Pipeline::builder()
        .config(test_config())
        .bus(bus)
        .fallback_store(Arc::new(MemoryFallbackStore::new()));
    if let Some(classifier) = classifier {
        builder = builder.classifier(classifier);
    }
    builder.build().await.unwrap()
}

#[tokio::test]
async fn test_records_reach_their_source_channels() {
    let bus = ScriptedBus::new();
    let classifier = ScriptedClassifier::scoring(0.92);
    let pipeline = create_pipeline(bus.clone(), Some(classifier.clone())).await;

    let market = Record::market_trend("Technology", r#"{"sector":"Technology","trend":"Positive"}"#);
    let customer = Record::customer_interaction("C1234", r#"{"customer_id":"C1234","text":"Great product! I love it!"}"#);
    let feedback = Record::ecosystem_feedback("partners", r#"{"message":"Customers are responding well"}"#);

    for record in [market.clone(), customer.clone(), feedback.clone()] {
        pipeline.submit(record).await.unwrap();
    }
    let report = pipeline.shutdown().await;
    assert!(report.drained_gracefully);

    let published = bus.published();
    assert_eq!(published.len(), 3);

    let find = |id: String| published.iter().find(|p| p.record_id() == id).cloned().unwrap();
    assert_eq!(find(market.id().to_string()).channel, "market_trends");
    assert_eq!(find(feedback.id().to_string()).channel, "ecosystem_feedback");

    let customer_msg = find(customer.id().to_string());
    assert_eq!(customer_msg.channel, "customer_behavior");
    assert_eq!(customer_msg.key, "customer:C1234");
    assert_eq!(customer_msg.envelope["enrichment"]["label"], "positive");
    assert_eq!(customer_msg.envelope["payload"]["text"], "Great product! I love it!");

    // Only customer interactions are classified
    assert_eq!(classifier.calls(), 1);
    assert!(find(market.id().to_string()).envelope.get("enrichment").is_none());
    assert_eq!(pipeline.metrics().enrichment_applied.get(), 1);
}

#[tokio::test]
async fn test_failing_classifier_never_blocks_delivery() {
    let bus = ScriptedBus::new();
    let classifier = ScriptedClassifier::scoring(0.9);
    classifier.fail_next(1);
    let pipeline = create_pipeline(bus.clone(), Some(classifier.clone())).await;
    let mut events = pipeline.subscribe();

    let record = Record::customer_interaction("C77", r#"{"text":"where is my order"}"#);
    pipeline.submit(record.clone()).await.unwrap();
    wait_for_published(&mut events, record.id()).await;

    let published = bus.published();
    assert_eq!(published.len(), 1);
    assert!(published[0].envelope.get("enrichment").is_none());
    assert_eq!(pipeline.metrics().enrichment_failures.get(), 1);
    assert_eq!(pipeline.metrics().records_published.get(), 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_low_score_is_labelled_negative() {
    let bus = ScriptedBus::new();
    let pipeline = create_pipeline(bus.clone(), Some(ScriptedClassifier::scoring(0.5))).await;
    let mut events = pipeline.subscribe();

    let record = Record::customer_interaction("C9", r#"{"text":"it broke on day one"}"#);
    pipeline.submit(record.clone()).await.unwrap();
    wait_for_published(&mut events, record.id()).await;

    let published = bus.published();
    assert_eq!(published[0].envelope["enrichment"]["label"], "negative");
    assert_eq!(published[0].envelope["enrichment"]["score"], 0.5);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_same_key_order_holds_when_first_record_retries() {
    let bus = ScriptedBus::new();
    bus.fail_next("segment:tech", vec![PublishError::Transient("broker unreachable".to_string())]);
    let pipeline = create_pipeline(bus.clone(), None).await;
    let mut events = pipeline.subscribe();

    let records: Vec<Record> = ["A", "B", "C"]
        .iter()
        .map(|name| Record::market_trend("tech", format!(r#"{{"name":"{}"}}"#, name)))
        .collect();
    for record in &records {
        pipeline.submit(record.clone()).await.unwrap();
    }
    wait_for_published(&mut events, records[2].id()).await;

    let expected: Vec<String> = records.iter().map(|r| r.id().to_string()).collect();
    assert_eq!(bus.published_ids("segment:tech"), expected);
    assert_eq!(bus.attempts(), 4);
    assert_eq!(pipeline.metrics().publish_retries.get(), 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_keys_progress_independently() {
    let bus = ScriptedBus::new();
    bus.fail_next(
        "segment:slow",
        (0..3).map(|_| PublishError::Transient("partition leader moving".to_string())).collect(),
    );
    let pipeline = create_pipeline(bus.clone(), None).await;
    let mut events = pipeline.subscribe();

    let slow = Record::market_trend("slow", "{}");
    let fast = Record::market_trend("fast", "{}");
    pipeline.submit(slow.clone()).await.unwrap();
    pipeline.submit(fast.clone()).await.unwrap();

    wait_for_published(&mut events, fast.id()).await;
    wait_for_published(&mut events, slow.id()).await;

    let order: Vec<String> = bus.published().iter().map(|p| p.record_id()).collect();
    assert_eq!(order, vec![fast.id().to_string(), slow.id().to_string()]);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_permanent_failure_goes_to_fallback_after_one_attempt() {
    let bus = ScriptedBus::new();
    bus.fail_next("feedback:forum", vec![PublishError::Permanent("payload rejected".to_string())]);
    let pipeline = create_pipeline(bus.clone(), None).await;
    let mut events = pipeline.subscribe();

    let record = Record::ecosystem_feedback("forum", "not json at all");
    pipeline.submit(record.clone()).await.unwrap();

    let event = wait_for_fallback(&mut events, record.id()).await;
    assert!(matches!(
        event,
        DeliveryEvent::MovedToFallback { reason: FallbackReason::PermanentFailure, attempt_count: 1, .. }
    ));
    assert_eq!(bus.attempts(), 1);

    let entries = pipeline.fallback_store().drain_batch(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempt_count, 1);
    assert_eq!(entries[0].record, record);
    assert_eq!(pipeline.snapshot().await.unwrap().fallback_size, 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_retry_budget_exhaustion_goes_to_fallback() {
    let bus = ScriptedBus::new();
    bus.fail_all(Some(PublishError::Transient("broker unreachable".to_string())));
    let mut config = test_config();
    config.retry.max_retries = 3;
    let pipeline = Pipeline::builder()
        .config(config)
        .bus(bus.clone())
        .fallback_store(Arc::new(MemoryFallbackStore::new()))
        .build()
        .await
        .unwrap();
    let mut events = pipeline.subscribe();

    let record = Record::market_trend("tech", "{}");
    pipeline.submit(record.clone()).await.unwrap();

    let event = wait_for_fallback(&mut events, record.id()).await;
    assert!(matches!(
        event,
        DeliveryEvent::MovedToFallback { reason: FallbackReason::RetriesExhausted, attempt_count: 4, .. }
    ));
    assert_eq!(bus.attempts(), 4);

    let entries = pipeline.fallback_store().drain_batch(10).await.unwrap();
    assert_eq!(
        entries[0].last_error,
        Some(PublishError::Transient("broker unreachable".to_string()))
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_shows_blocked_key() {
    let bus = ScriptedBus::new();
    let gate = bus.close_gate();
    let pipeline = create_pipeline(bus.clone(), None).await;

    pipeline.submit(Record::market_trend("held", "{}")).await.unwrap();
    pipeline.submit(Record::market_trend("held", "{}")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let snapshot = pipeline.snapshot().await.unwrap();
    assert_eq!(snapshot.state, PipelineState::Running);
    assert_eq!(snapshot.in_flight, 2);
    assert_eq!(snapshot.queued, 2);
    assert_eq!(snapshot.queue_depths.get("segment:held"), Some(&2));

    gate.add_permits(1);
    let report = pipeline.shutdown().await;
    assert!(report.drained_gracefully);
    assert_eq!(bus.published().len(), 2);

    let rejected = pipeline.submit(Record::market_trend("held", "{}")).await;
    assert!(matches!(rejected, Err(PipelineError::PipelineShuttingDown)));
}
