//! Output flow: listener to broker topic with partition strategies.

use std::sync::Arc;
use std::time::Duration;

use envelope::MessageEnvelope;
use expr::ExpressionCache;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use fix_gateway::broker::{BrokerClient, HEADER_KAFKA_KEY, HEADER_KAFKA_PARTITION, HEADER_TYPE_ID};
use fix_gateway::supervisor::Supervisor;
use fix_gateway::test_utils::MemoryBroker;

const RAW: &str =
    "8=FIX.4.4\u{1}9=100\u{1}35=D\u{1}49=GTWY\u{1}56=EXEC\u{1}55=AAPL\u{1}11=ORDER123\u{1}10=000\u{1}";

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

async fn start(
    broker: &MemoryBroker,
    routes_json: &str,
) -> (Supervisor, Arc<routing::RoutingTable>, Arc<ExpressionCache>) {
    let expressions = Arc::new(ExpressionCache::new());
    let table = Arc::new(routing::from_json(routes_json, &expressions).unwrap());
    let supervisor = Supervisor::start(
        Arc::clone(&table),
        Arc::new(broker.clone()),
        Arc::clone(&expressions),
    )
    .await
    .unwrap();
    (supervisor, table, expressions)
}

/// KEY strategy: the expression value becomes the record key and the
/// kafka.KEY header.
#[tokio::test]
async fn key_strategy_sets_record_key() {
    let broker = MemoryBroker::new();
    let (supervisor, _table, _expressions) = start(
        &broker,
        r#"{ "routes": [
            { "routeId": "OUT1", "type": "OUTPUT", "senderCompId": "EXEC", "targetCompId": "GTWY",
              "outputTopic": "fix.out",
              "partitionStrategy": "KEY", "partitionExpression": "Symbol",
              "destinationConfigs": [ { "uri": "direct:keyin" } ] }
        ] }"#,
    )
    .await;

    let sender = supervisor.direct_registry().sender("keyin").unwrap();
    sender.send(RAW.to_string()).await.unwrap();

    wait_for("published record", || !broker.records("fix.out").is_empty()).await;
    let records = broker.records("fix.out");
    assert_eq!(records.len(), 1);
    let record = &records[0];

    assert_eq!(record.key.as_deref(), Some("AAPL"));
    let header = |name: &str| {
        record
            .headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    };
    assert_eq!(header(HEADER_KAFKA_KEY), Some("AAPL"));
    assert_eq!(header(HEADER_TYPE_ID), Some("fixMessageEnvelope"));
    assert_eq!(header("senderCompId"), Some("EXEC"));
    assert_eq!(header("targetCompId"), Some("GTWY"));
    assert_eq!(header("sessionId"), Some("FIX.4.4:EXEC->GTWY"));
    assert_eq!(header("routeId"), Some("OUT1"));
    assert_eq!(header("outputTopic"), Some("fix.out"));

    let envelope = MessageEnvelope::decode(&record.payload).unwrap();
    assert_eq!(envelope.session_id.as_deref(), Some("FIX.4.4:EXEC->GTWY"));
    assert_eq!(envelope.msg_type.as_deref(), Some("D"));
    assert_eq!(envelope.raw_message, RAW);

    supervisor.shutdown(Duration::from_secs(2)).await;
}

/// EXPR strategy: the expression's integer result selects the partition.
#[tokio::test]
async fn expr_strategy_sets_partition_number() {
    let broker = MemoryBroker::new();
    broker.create_topic("fix.out", 2, 1).await.unwrap();
    let (supervisor, _table, _expressions) = start(
        &broker,
        r#"{ "routes": [
            { "routeId": "OUT1", "type": "OUTPUT", "senderCompId": "EXEC", "targetCompId": "GTWY",
              "outputTopic": "fix.out",
              "partitionStrategy": "EXPR",
              "partitionExpression": "if (MsgType == 'D') { return 1; } else { return 0; }",
              "destinationConfigs": [ { "uri": "direct:exprin" } ] }
        ] }"#,
    )
    .await;

    let sender = supervisor.direct_registry().sender("exprin").unwrap();
    sender.send(RAW.to_string()).await.unwrap();

    wait_for("record in partition 1", || {
        !broker.records_in_partition("fix.out", 1).is_empty()
    })
    .await;
    assert!(broker.records_in_partition("fix.out", 0).is_empty());

    let record = &broker.records_in_partition("fix.out", 1)[0];
    let partition_header = record
        .headers
        .iter()
        .find(|(n, _)| n == HEADER_KAFKA_PARTITION)
        .map(|(_, v)| v.as_str());
    assert_eq!(partition_header, Some("1"));
    assert!(record.key.is_none());

    supervisor.shutdown(Duration::from_secs(2)).await;
}

/// NONE strategy: no key, no explicit partition.
#[tokio::test]
async fn none_strategy_publishes_without_key_or_partition() {
    let broker = MemoryBroker::new();
    let (supervisor, _table, _expressions) = start(
        &broker,
        r#"{ "routes": [
            { "routeId": "OUT1", "type": "OUTPUT", "senderCompId": "EXEC", "targetCompId": "GTWY",
              "outputTopic": "fix.out",
              "destinationConfigs": [ { "uri": "direct:nonein" } ] }
        ] }"#,
    )
    .await;

    let sender = supervisor.direct_registry().sender("nonein").unwrap();
    sender.send(RAW.to_string()).await.unwrap();

    wait_for("published record", || !broker.records("fix.out").is_empty()).await;
    let record = &broker.records("fix.out")[0];
    assert!(record.key.is_none());
    assert!(!record.headers.iter().any(|(n, _)| n == HEADER_KAFKA_KEY));
    assert!(!record
        .headers
        .iter()
        .any(|(n, _)| n == HEADER_KAFKA_PARTITION));

    supervisor.shutdown(Duration::from_secs(2)).await;
}

/// An expression that fails to evaluate publishes with default
/// partitioning instead of dropping the record.
#[tokio::test]
async fn evaluation_failure_falls_back_to_default_partitioning() {
    let broker = MemoryBroker::new();
    let (supervisor, _table, _expressions) = start(
        &broker,
        r#"{ "routes": [
            { "routeId": "OUT1", "type": "OUTPUT", "senderCompId": "EXEC", "targetCompId": "GTWY",
              "outputTopic": "fix.out",
              "partitionStrategy": "KEY", "partitionExpression": "NoSuchVariable",
              "destinationConfigs": [ { "uri": "direct:failin" } ] }
        ] }"#,
    )
    .await;

    let sender = supervisor.direct_registry().sender("failin").unwrap();
    sender.send(RAW.to_string()).await.unwrap();

    wait_for("published record", || !broker.records("fix.out").is_empty()).await;
    let record = &broker.records("fix.out")[0];
    assert!(record.key.is_none());

    supervisor.shutdown(Duration::from_secs(2)).await;
}

/// Payloads carrying literal unicode escapes for SOH are normalised
/// before the envelope is built.
#[tokio::test]
async fn escaped_payloads_are_normalised() {
    let broker = MemoryBroker::new();
    let (supervisor, _table, _expressions) = start(
        &broker,
        r#"{ "routes": [
            { "routeId": "OUT1", "type": "OUTPUT", "senderCompId": "EXEC", "targetCompId": "GTWY",
              "outputTopic": "fix.out",
              "destinationConfigs": [ { "uri": "direct:escin" } ] }
        ] }"#,
    )
    .await;

    let sender = supervisor.direct_registry().sender("escin").unwrap();
    sender
        .send("8=FIX.4.4\\u00019=12\\u000135=D\\u000110=000".to_string())
        .await
        .unwrap();

    wait_for("published record", || !broker.records("fix.out").is_empty()).await;
    let envelope = MessageEnvelope::decode(&broker.records("fix.out")[0].payload).unwrap();
    assert_eq!(envelope.raw_message, "8=FIX.4.4\u{1}9=12\u{1}35=D\u{1}10=000\u{1}");
    assert_eq!(envelope.msg_type.as_deref(), Some("D"));

    supervisor.shutdown(Duration::from_secs(2)).await;
}

/// Full TCP path: a FIX endpoint connects to the route's netty listener,
/// sends one payload per line, reads the OK acknowledgement, and the
/// envelope lands on the output topic.
#[tokio::test]
async fn tcp_listener_end_to_end() {
    // Reserve a port, then hand it to the supervisor.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let broker = MemoryBroker::new();
    let (supervisor, _table, _expressions) = start(
        &broker,
        &format!(
            r#"{{ "routes": [
                {{ "routeId": "OUT1", "type": "OUTPUT", "senderCompId": "EXEC", "targetCompId": "GTWY",
                  "outputTopic": "fix.out",
                  "destinationConfigs": [ {{ "uri": "netty:tcp://{addr}" }} ] }}
            ] }}"#
        ),
    )
    .await;

    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    client
        .write_all(format!("{RAW}\n").as_bytes())
        .await
        .unwrap();
    let mut ack = [0u8; 3];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack, b"OK\n");

    wait_for("published record", || !broker.records("fix.out").is_empty()).await;
    let envelope = MessageEnvelope::decode(&broker.records("fix.out")[0].payload).unwrap();
    assert_eq!(envelope.raw_message, RAW);

    supervisor.shutdown(Duration::from_secs(2)).await;
}
