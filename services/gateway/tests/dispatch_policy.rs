//! Dispatcher policy: retry bounds, type filtering, destination ordering,
//! dead-lettering, and stop-on-exception.

use std::sync::Arc;
use std::time::Duration;

use envelope::MessageEnvelope;
use expr::ExpressionCache;
use tokio::sync::watch;

use fix_gateway::broker::{BrokerClient, ConsumerSettings, ProducerRecord};
use fix_gateway::consumer::InputWorker;
use fix_gateway::dispatch::{DispatchError, Dispatcher, SendState};
use fix_gateway::endpoint::{DirectRegistry, EndpointFactory, EndpointSink};
use fix_gateway::test_utils::{
    sample_raw_message, CollectorEndpoint, EventLogEndpoint, FlakyEndpoint, MemoryBroker,
    RefusingEndpoint, RejectingEndpoint,
};

fn enriched_envelope() -> MessageEnvelope {
    let mut envelope = MessageEnvelope::new(sample_raw_message());
    envelope.enrich();
    envelope
}

fn table(json: &str) -> Arc<routing::RoutingTable> {
    Arc::new(routing::from_json(json, &ExpressionCache::new()).unwrap())
}

struct Harness {
    broker: MemoryBroker,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
}

fn harness() -> Harness {
    let broker = MemoryBroker::new();
    let producer = broker.producer();
    let registry = Arc::new(DirectRegistry::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = Arc::new(Dispatcher::new(
        EndpointFactory::new(Arc::clone(&producer), registry),
        producer,
        shutdown_rx,
    ));
    Harness {
        broker,
        dispatcher,
        shutdown_tx,
    }
}

fn override_sink(harness: &Harness, base_uri: &str, sink: Arc<dyn EndpointSink>) {
    harness.dispatcher.endpoints().register_override(base_uri, sink);
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Retry-then-dead-letter, driven end to end through the input worker:
/// exactly maxRetries + 1 attempts spaced by at least retryDelay, one
/// dead-letter record, and the offset committed afterwards.
#[tokio::test]
async fn retry_exhaustion_dead_letters_and_commits() {
    let table = table(
        r#"{ "routes": [
            { "routeId": "R1", "type": "INPUT", "senderCompId": "GTWY", "targetCompId": "EXEC",
              "inputTopic": "fix.in",
              "destinationConfigs": [
                { "uri": "netty:tcp://localhost:19999", "maxRetries": 2, "retryDelay": 10,
                  "timeout": 1000 }
              ] }
        ] }"#,
    );
    let harness = harness();
    let refusing = Arc::new(RefusingEndpoint::new());
    override_sink(&harness, "netty:tcp://localhost:19999", refusing.clone());

    let route = table.route_by_id("R1").unwrap().clone();
    let group = route.consumer_group();

    let envelope = enriched_envelope();
    harness
        .broker
        .producer()
        .send(ProducerRecord::new("fix.in", envelope.encode().unwrap()))
        .await
        .unwrap();

    let consumer = harness
        .broker
        .subscribe("fix.in", ConsumerSettings::ordered(group.clone()))
        .await
        .unwrap();
    let worker = InputWorker::new(
        route,
        Arc::clone(&table),
        consumer,
        Arc::clone(&harness.dispatcher),
        harness.broker.producer(),
        harness.shutdown_tx.subscribe(),
    );
    let handle = tokio::spawn(worker.run());

    let broker = harness.broker.clone();
    let dlq = "dead-letter-r1-tcp---localhost-19999";
    wait_for("dead-letter record", || !broker.records(dlq).is_empty()).await;
    wait_for("commit", || broker.committed_offset(&group, "fix.in", 0) == Some(1)).await;

    assert_eq!(refusing.attempts(), 3);
    let times = refusing.attempt_times();
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(10));
    }

    let dead = broker.records(dlq);
    assert_eq!(dead.len(), 1);
    let dead_envelope = MessageEnvelope::decode(&dead[0].payload).unwrap();
    assert_eq!(dead_envelope.error_type.as_deref(), Some("NetworkError"));
    assert_eq!(dead_envelope.error_route_id.as_deref(), Some("R1"));
    assert!(dead_envelope.error_message.is_some());
    assert!(dead_envelope.error_timestamp.is_some());
    assert_eq!(dead_envelope.raw_message, envelope.raw_message);

    harness.shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker stops on shutdown")
        .unwrap();
}

/// Type filter: a destination whose msgTypes excludes the envelope's type
/// receives nothing, the wildcard destination receives the payload, and the
/// offset is committed.
#[tokio::test]
async fn type_filter_skips_silently() {
    let table = table(
        r#"{ "routes": [
            { "routeId": "R1", "type": "INPUT", "senderCompId": "GTWY", "targetCompId": "EXEC",
              "inputTopic": "fix.in",
              "destinationConfigs": [
                { "uri": "netty:tcp://localhost:19001", "msgTypes": ["8"] },
                { "uri": "netty:tcp://localhost:19002", "msgTypes": ["*"] }
              ] }
        ] }"#,
    );
    let harness = harness();
    let execs = Arc::new(CollectorEndpoint::new("execs"));
    let all = Arc::new(CollectorEndpoint::new("all"));
    override_sink(&harness, "netty:tcp://localhost:19001", execs.clone());
    override_sink(&harness, "netty:tcp://localhost:19002", all.clone());

    let route = table.route_by_id("R1").unwrap().clone();
    let group = route.consumer_group();
    harness
        .broker
        .producer()
        .send(ProducerRecord::new(
            "fix.in",
            enriched_envelope().encode().unwrap(),
        ))
        .await
        .unwrap();

    let consumer = harness
        .broker
        .subscribe("fix.in", ConsumerSettings::ordered(group.clone()))
        .await
        .unwrap();
    let worker = InputWorker::new(
        route,
        Arc::clone(&table),
        consumer,
        Arc::clone(&harness.dispatcher),
        harness.broker.producer(),
        harness.shutdown_tx.subscribe(),
    );
    let handle = tokio::spawn(worker.run());

    let broker = harness.broker.clone();
    wait_for("commit", || broker.committed_offset(&group, "fix.in", 0) == Some(1)).await;

    assert_eq!(execs.count(), 0);
    assert_eq!(all.count(), 1);
    assert_eq!(all.payloads()[0], sample_raw_message());

    harness.shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}

/// Destination order: the second destination starts strictly after the
/// first one completed, even when the first is slow.
#[tokio::test]
async fn destinations_are_dispatched_sequentially() {
    let table = table(
        r#"{ "routes": [
            { "routeId": "R1", "type": "INPUT", "senderCompId": "GTWY", "targetCompId": "EXEC",
              "destinationConfigs": [
                { "uri": "netty:tcp://localhost:19001" },
                { "uri": "netty:tcp://localhost:19002" }
              ] }
        ] }"#,
    );
    let harness = harness();
    let log = EventLogEndpoint::shared_log();
    override_sink(
        &harness,
        "netty:tcp://localhost:19001",
        Arc::new(EventLogEndpoint::new("d0", Arc::clone(&log), Duration::from_millis(50))),
    );
    override_sink(
        &harness,
        "netty:tcp://localhost:19002",
        Arc::new(EventLogEndpoint::new("d1", Arc::clone(&log), Duration::ZERO)),
    );

    let route = table.route_by_id("R1").unwrap();
    let report = harness
        .dispatcher
        .dispatch(route, &enriched_envelope())
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 2);
    let events: Vec<String> = log.lock().clone();
    assert_eq!(
        events,
        vec![
            "d0:start:ORDER123",
            "d0:end:ORDER123",
            "d1:start:ORDER123",
            "d1:end:ORDER123"
        ]
    );
}

/// Retry bound: attempts never exceed maxRetries + 1 even when the endpoint
/// keeps failing, and a still-failing endpoint dead-letters exactly once.
#[tokio::test]
async fn attempts_never_exceed_retry_budget() {
    let table = table(
        r#"{ "routes": [
            { "routeId": "R1", "type": "INPUT", "senderCompId": "GTWY", "targetCompId": "EXEC",
              "destinationConfigs": [
                { "uri": "netty:tcp://localhost:19001", "maxRetries": 2, "retryDelay": 5 }
              ] }
        ] }"#,
    );
    let harness = harness();
    let flaky = Arc::new(FlakyEndpoint::new(10));
    override_sink(&harness, "netty:tcp://localhost:19001", flaky.clone());

    let route = table.route_by_id("R1").unwrap();
    let report = harness
        .dispatcher
        .dispatch(route, &enriched_envelope())
        .await
        .unwrap();

    assert_eq!(flaky.attempts(), 3);
    assert_eq!(report.dead_lettered(), 1);
    assert_eq!(report.outcomes[0].attempts, 3);
    assert_eq!(report.outcomes[0].state, SendState::DeadLettered);
    assert_eq!(
        harness
            .broker
            .records("dead-letter-r1-tcp---localhost-19001")
            .len(),
        1
    );
}

/// A transient endpoint recovers within the retry budget: no dead-letter.
#[tokio::test]
async fn transient_failure_recovers_within_budget() {
    let table = table(
        r#"{ "routes": [
            { "routeId": "R1", "type": "INPUT", "senderCompId": "GTWY", "targetCompId": "EXEC",
              "destinationConfigs": [
                { "uri": "netty:tcp://localhost:19001", "maxRetries": 2, "retryDelay": 5 }
              ] }
        ] }"#,
    );
    let harness = harness();
    let flaky = Arc::new(FlakyEndpoint::new(1));
    override_sink(&harness, "netty:tcp://localhost:19001", flaky.clone());

    let route = table.route_by_id("R1").unwrap();
    let report = harness
        .dispatcher
        .dispatch(route, &enriched_envelope())
        .await
        .unwrap();

    assert_eq!(flaky.attempts(), 2);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(flaky.delivered().len(), 1);
    assert!(harness
        .broker
        .records("dead-letter-r1-tcp---localhost-19001")
        .is_empty());
}

/// Non-network failures skip the retry loop entirely.
#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let table = table(
        r#"{ "routes": [
            { "routeId": "R1", "type": "INPUT", "senderCompId": "GTWY", "targetCompId": "EXEC",
              "destinationConfigs": [
                { "uri": "netty:tcp://localhost:19001", "maxRetries": 5, "retryDelay": 5 }
              ] }
        ] }"#,
    );
    let harness = harness();
    let rejecting = Arc::new(RejectingEndpoint::new());
    override_sink(&harness, "netty:tcp://localhost:19001", rejecting.clone());

    let route = table.route_by_id("R1").unwrap();
    harness
        .dispatcher
        .dispatch(route, &enriched_envelope())
        .await
        .unwrap();

    assert_eq!(rejecting.attempts(), 1);
    let dead = harness.broker.records("dead-letter-r1-tcp---localhost-19001");
    assert_eq!(dead.len(), 1);
    let envelope = MessageEnvelope::decode(&dead[0].payload).unwrap();
    assert_eq!(
        envelope.error_type.as_deref(),
        Some("DestinationPermanentError")
    );
}

/// stopOnException aborts the remaining destinations after dead-lettering.
#[tokio::test]
async fn stop_on_exception_aborts_remaining_destinations() {
    let table = table(
        r#"{ "routes": [
            { "routeId": "R1", "type": "INPUT", "senderCompId": "GTWY", "targetCompId": "EXEC",
              "destinationConfigs": [
                { "uri": "netty:tcp://localhost:19001", "maxRetries": 0, "stopOnException": true },
                { "uri": "netty:tcp://localhost:19002" }
              ] }
        ] }"#,
    );
    let harness = harness();
    let rejecting = Arc::new(RejectingEndpoint::new());
    let next = Arc::new(CollectorEndpoint::new("next"));
    override_sink(&harness, "netty:tcp://localhost:19001", rejecting.clone());
    override_sink(&harness, "netty:tcp://localhost:19002", next.clone());

    let route = table.route_by_id("R1").unwrap();
    let result = harness.dispatcher.dispatch(route, &enriched_envelope()).await;

    assert!(matches!(result, Err(DispatchError::Aborted { .. })));
    assert_eq!(next.count(), 0);
    assert_eq!(
        harness
            .broker
            .records("dead-letter-r1-tcp---localhost-19001")
            .len(),
        1
    );
}

/// Without stopOnException the dispatcher continues past a dead-lettered
/// destination.
#[tokio::test]
async fn failure_without_stop_continues_to_next_destination() {
    let table = table(
        r#"{ "routes": [
            { "routeId": "R1", "type": "INPUT", "senderCompId": "GTWY", "targetCompId": "EXEC",
              "destinationConfigs": [
                { "uri": "netty:tcp://localhost:19001", "maxRetries": 0 },
                { "uri": "netty:tcp://localhost:19002" }
              ] }
        ] }"#,
    );
    let harness = harness();
    override_sink(
        &harness,
        "netty:tcp://localhost:19001",
        Arc::new(RejectingEndpoint::new()),
    );
    let next = Arc::new(CollectorEndpoint::new("next"));
    override_sink(&harness, "netty:tcp://localhost:19002", next.clone());

    let route = table.route_by_id("R1").unwrap();
    let report = harness
        .dispatcher
        .dispatch(route, &enriched_envelope())
        .await
        .unwrap();

    assert_eq!(report.dead_lettered(), 1);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(next.count(), 1);
}

/// A custom dead-letter topic on the destination wins over the derived name.
#[tokio::test]
async fn explicit_dead_letter_topic_is_used() {
    let table = table(
        r#"{ "routes": [
            { "routeId": "R1", "type": "INPUT", "senderCompId": "GTWY", "targetCompId": "EXEC",
              "destinationConfigs": [
                { "uri": "netty:tcp://localhost:19001", "maxRetries": 0,
                  "deadLetterTopic": "custom-dlq" }
              ] }
        ] }"#,
    );
    let harness = harness();
    override_sink(
        &harness,
        "netty:tcp://localhost:19001",
        Arc::new(RejectingEndpoint::new()),
    );

    let route = table.route_by_id("R1").unwrap();
    harness
        .dispatcher
        .dispatch(route, &enriched_envelope())
        .await
        .unwrap();

    assert_eq!(harness.broker.records("custom-dlq").len(), 1);
}
