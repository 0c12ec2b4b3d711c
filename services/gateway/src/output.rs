//! Output worker: wraps inbound FIX payloads in envelopes and publishes
//! them to the route's broker topic, applying the partition strategy.

use std::sync::Arc;

use envelope::MessageEnvelope;
use expr::ExpressionCache;
use routing::{PartitionStrategy, RouteConfig};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::broker::{
    BrokerProducer, ProducerRecord, HEADER_KAFKA_KEY, HEADER_KAFKA_PARTITION, HEADER_TYPE_ID,
    TYPE_ID_ENVELOPE,
};

pub struct OutputWorker {
    route: RouteConfig,
    listener_name: String,
    source: mpsc::Receiver<String>,
    producer: Arc<dyn BrokerProducer>,
    expressions: Arc<ExpressionCache>,
    shutdown: watch::Receiver<bool>,
}

impl OutputWorker {
    pub fn new(
        route: RouteConfig,
        listener_name: String,
        source: mpsc::Receiver<String>,
        producer: Arc<dyn BrokerProducer>,
        expressions: Arc<ExpressionCache>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            route,
            listener_name,
            source,
            producer,
            expressions,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(
            route_id = self.route.route_id,
            listener = self.listener_name,
            topic = self.route.resolved_output_topic(),
            "output worker started"
        );

        loop {
            let payload = tokio::select! {
                payload = self.source.recv() => payload,
                changed = self.shutdown.changed() => {
                    // A closed channel means the supervisor is gone.
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            match payload {
                Some(raw) => self.publish(raw).await,
                None => break,
            }
        }

        info!(
            route_id = self.route.route_id,
            listener = self.listener_name,
            "output worker stopped"
        );
    }

    async fn publish(&self, raw: String) {
        debug!(
            route_id = self.route.route_id,
            listener = self.listener_name,
            bytes = raw.len(),
            "received raw FIX payload"
        );

        let envelope = self.build_envelope(raw);
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(error) => {
                error!(route_id = self.route.route_id, %error, "failed to encode envelope");
                return;
            }
        };

        let output_topic = self.route.resolved_output_topic();
        let mut record = ProducerRecord::new(output_topic.clone(), payload)
            .with_header(HEADER_TYPE_ID, TYPE_ID_ENVELOPE)
            .with_header("senderCompId", self.route.sender_comp_id.clone())
            .with_header("targetCompId", self.route.target_comp_id.clone())
            .with_header(
                "sessionId",
                envelope.session_id.clone().unwrap_or_default(),
            )
            .with_header("routeId", self.route.route_id.clone())
            .with_header("outputTopic", output_topic.clone());

        self.apply_partitioning(&envelope, &mut record);

        match self.producer.send(record).await {
            Ok(()) => debug!(
                route_id = self.route.route_id,
                topic = output_topic,
                "envelope published"
            ),
            Err(error) => error!(
                route_id = self.route.route_id,
                topic = output_topic,
                %error,
                "failed to publish envelope"
            ),
        }
    }

    fn build_envelope(&self, raw: String) -> MessageEnvelope {
        let mut envelope = MessageEnvelope::new(fixwire::process_raw_message(&raw));
        envelope.session_id = Some(MessageEnvelope::session_id_for(
            &self.route.sender_comp_id,
            &self.route.target_comp_id,
        ));
        envelope.sender_comp_id = Some(self.route.sender_comp_id.clone());
        envelope.target_comp_id = Some(self.route.target_comp_id.clone());
        envelope.enrich();
        envelope
    }

    /// Resolve the partition strategy into a record key or an explicit
    /// partition. Evaluation failures are logged and the record goes out
    /// with default partitioning.
    fn apply_partitioning(&self, envelope: &MessageEnvelope, record: &mut ProducerRecord) {
        let strategy = self.route.partition_strategy;
        if strategy == PartitionStrategy::None {
            return;
        }
        let Some(expression) = self.route.partition_expression.as_deref() else {
            return;
        };
        if expression.trim().is_empty() {
            return;
        }

        let value = match self
            .expressions
            .evaluate_partition_expression(expression, envelope, None)
        {
            Ok(expr::Value::Null) => return,
            Ok(value) => value,
            Err(error) => {
                error!(
                    route_id = self.route.route_id,
                    expression,
                    %error,
                    "partition expression failed, publishing without key or partition"
                );
                return;
            }
        };

        match strategy {
            PartitionStrategy::Key => {
                let key = value.to_string();
                debug!(route_id = self.route.route_id, key, "setting partition key");
                record.headers.push((HEADER_KAFKA_KEY.to_string(), key.clone()));
                record.key = Some(key);
            }
            PartitionStrategy::Expr => match value.as_partition() {
                Some(partition) => {
                    debug!(route_id = self.route.route_id, partition, "setting partition number");
                    record
                        .headers
                        .push((HEADER_KAFKA_PARTITION.to_string(), partition.to_string()));
                    record.partition = Some(partition);
                }
                None => {
                    error!(
                        route_id = self.route.route_id,
                        result = %value,
                        "partition expression did not yield an integer, using default partitioning"
                    );
                }
            },
            PartitionStrategy::None => {}
        }
    }
}
