mod common;

use common::*;
use event_gateway::kafka::TopicManager;
use event_gateway::{Backends, EventSubmission, Gateway, SessionState};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

async fn start_kafka_gateway(log: &Arc<DeliveryLog>) -> Gateway {
    let config = get_kafka_test_config();
    let backends = Backends::kafka(&config).await.unwrap();
    let gateway = Gateway::start(
        config,
        backends,
        Arc::new(RecordingHandler::new("kafka", log.clone())),
    )
    .await
    .unwrap();

    let mut state = gateway.watch_session();
    tokio::time::timeout(
        Duration::from_secs(30),
        state.wait_for(|s| matches!(s, SessionState::Consuming { partitions, .. } if !partitions.is_empty())),
    )
    .await
    .expect("gateway never received an assignment")
    .unwrap();
    gateway
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Run with: cargo test --test kafka_integration_test -- --ignored
async fn test_publish_and_consume_through_kafka() {
    tracing_subscriber::fmt()
        .with_env_filter("event_gateway=debug")
        .try_init()
        .ok();

    let log = Arc::new(DeliveryLog::default());
    let gateway = start_kafka_gateway(&log).await;

    let mut submitted = HashSet::new();
    for seq in 0..5 {
        let receipt = gateway
            .submit(EventSubmission::new(
                "order.created",
                json!({ "seq": seq }).as_object().cloned().unwrap(),
            ))
            .await
            .unwrap();
        assert!(receipt.offset >= 0);
        submitted.insert(receipt.event_id);
    }

    assert!(
        wait_until(Duration::from_secs(30), || {
            submitted.is_subset(&log.ids().into_iter().collect())
        })
        .await
    );
    assert_eq!(gateway.stats().messages_produced, 5);
    assert!(gateway.stats().messages_consumed >= 5);

    let report = gateway.shutdown(Duration::from_secs(10)).await;
    assert!(report.is_clean(), "{:?}", report.warnings);
    assert_eq!(gateway.session_state(), SessionState::Closed);

    let config = get_kafka_test_config();
    TopicManager::new(&config.kafka)
        .unwrap()
        .delete_topic(&config.kafka.topic)
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires running Kafka
async fn test_health_against_kafka() {
    let log = Arc::new(DeliveryLog::default());
    let gateway = start_kafka_gateway(&log).await;

    let report = gateway.health().await;
    assert!(report.broker_reachable, "{:?}", report.error);

    gateway.shutdown(Duration::from_secs(10)).await;
}
