//! Retry, circuit breaking and failure isolation on a running bus.

use std::sync::Arc;
use std::time::Duration;

use courier_core::headers;
use courier_core::{
    impl_message, BusBuilder, BusConfig, CircuitBreakerConfig, ConsumerDefinition, InMemoryTransport, RetryPolicy,
};
use courier_testing::{wait_until, RecordingConsumer};
use serde::{Deserialize, Serialize};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChargeCard {
    attempt: u32,
}

impl_message!(ChargeCard, "payments:ChargeCard");

#[tokio::test]
async fn test_open_circuit_rejects_without_calling_consumer() {
    let transport = InMemoryTransport::new();
    let gateway = RecordingConsumer::<ChargeCard>::with_definition(
        ConsumerDefinition::new("CardGateway").with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            reset_interval: Duration::from_secs(60),
        }),
    )
    .failing(100);
    let bus = BusBuilder::new()
        .transport(Arc::new(transport.clone()))
        .config(BusConfig::default().with_concurrency(1))
        .add_consumer::<ChargeCard, _>(gateway.clone())
        .build()
        .unwrap();
    bus.start().await.unwrap();

    for attempt in 0..5 {
        bus.publish(&ChargeCard { attempt }).await.unwrap();
    }

    let error_queue = transport.broker().queue("card-gateway_error");
    let mut codes = Vec::new();
    for _ in 0..5 {
        let faulted = tokio::time::timeout(WAIT, error_queue.dequeue())
            .await
            .unwrap()
            .unwrap();
        codes.push(
            faulted
                .headers()
                .get(headers::FAULT_EXCEPTION_TYPE)
                .unwrap_or_default()
                .to_string(),
        );
    }

    assert_eq!(gateway.len(), 3, "open circuit skips the consumer");
    assert_eq!(
        codes,
        [
            "consumer.exception",
            "consumer.exception",
            "consumer.exception",
            "courier.circuit_breaker_open",
            "courier.circuit_breaker_open",
        ]
    );
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn test_retry_recovers_from_transient_failures() {
    let transport = InMemoryTransport::new();
    let gateway = RecordingConsumer::<ChargeCard>::with_definition(
        ConsumerDefinition::new("FlakyGateway").with_retry(RetryPolicy::immediate(3)),
    )
    .failing(2);
    let bus = BusBuilder::new()
        .transport(Arc::new(transport.clone()))
        .config(BusConfig::default().with_concurrency(1))
        .add_consumer::<ChargeCard, _>(gateway.clone())
        .build()
        .unwrap();
    bus.start().await.unwrap();

    bus.publish(&ChargeCard { attempt: 0 }).await.unwrap();

    let received = gateway.wait_for(3, WAIT).await.unwrap();
    let attempts: Vec<u32> = received.iter().map(|r| r.retry_attempt).collect();
    assert_eq!(attempts, [0, 1, 2]);
    assert!(received
        .iter()
        .all(|r| r.envelope.message_id() == received[0].envelope.message_id()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gateway.len(), 3);
    assert_eq!(transport.broker().queue("flaky-gateway_error").depth(), 0);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn test_failing_consumer_does_not_block_its_neighbour() {
    let transport = InMemoryTransport::new();
    let broken = RecordingConsumer::<ChargeCard>::with_definition(
        ConsumerDefinition::new("BrokenLedger").with_endpoint_name("ledger"),
    )
    .failing(100);
    let healthy = RecordingConsumer::<ChargeCard>::with_definition(
        ConsumerDefinition::new("HealthyLedger").with_endpoint_name("ledger"),
    );
    let bus = BusBuilder::new()
        .transport(Arc::new(transport.clone()))
        .config(BusConfig::default().with_concurrency(2))
        .add_consumer::<ChargeCard, _>(broken.clone())
        .add_consumer::<ChargeCard, _>(healthy.clone())
        .build()
        .unwrap();
    bus.start().await.unwrap();

    for attempt in 0..3 {
        bus.publish(&ChargeCard { attempt }).await.unwrap();
    }

    let mut seen: Vec<ChargeCard> = healthy
        .wait_for(3, WAIT)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.message)
        .collect();
    seen.sort_by_key(|m| m.attempt);
    assert_eq!(
        seen,
        (0..3).map(|attempt| ChargeCard { attempt }).collect::<Vec<_>>()
    );

    let error_queue = transport.broker().queue("ledger_error");
    wait_until(WAIT, || async { error_queue.depth() == 3 })
        .await
        .unwrap();
    assert_eq!(broken.len(), 3);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn test_consumers_sharing_an_endpoint_keep_their_own_retry_policy() {
    let transport = InMemoryTransport::new();
    let patient = RecordingConsumer::<ChargeCard>::with_definition(
        ConsumerDefinition::new("PatientBilling")
            .with_endpoint_name("billing")
            .with_retry(RetryPolicy::immediate(3)),
    )
    .failing(2);
    let impatient = RecordingConsumer::<ChargeCard>::with_definition(
        ConsumerDefinition::new("ImpatientBilling")
            .with_endpoint_name("billing")
            .with_retry(RetryPolicy::None),
    )
    .failing(100);
    let bus = BusBuilder::new()
        .transport(Arc::new(transport.clone()))
        .config(BusConfig::default().with_concurrency(1))
        .add_consumer::<ChargeCard, _>(patient.clone())
        .add_consumer::<ChargeCard, _>(impatient.clone())
        .build()
        .unwrap();
    bus.start().await.unwrap();

    bus.publish(&ChargeCard { attempt: 0 }).await.unwrap();

    patient.wait_for(3, WAIT).await.unwrap();
    let error_queue = transport.broker().queue("billing_error");
    wait_until(WAIT, || async { error_queue.depth() == 1 })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(impatient.len(), 1, "no retries without a retry policy");
    assert_eq!(patient.len(), 3);
    bus.stop().await.unwrap();
}
