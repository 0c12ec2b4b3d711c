//! Ordered input consumer: one worker per INPUT route.
//!
//! The worker polls one record at a time, decodes and enriches the
//! envelope, dispatches it across the route's destinations, and only then
//! commits the offset. Per-partition FIFO follows from `maxPollRecords=1`
//! plus sequential dispatch plus commit-after-dispatch. Receivers must
//! tolerate at-least-once delivery: a crash between dispatch and commit
//! redelivers the record.

use std::sync::Arc;
use std::time::Duration;

use envelope::MessageEnvelope;
use routing::{GlobalErrorHandling, RouteConfig, RoutingTable};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConsumer, BrokerProducer, ConsumerRecord, ProducerRecord};
use crate::dispatch::{DispatchError, Dispatcher};

const POLL_TIMEOUT: Duration = Duration::from_millis(500);

pub struct InputWorker {
    route: RouteConfig,
    table: Arc<RoutingTable>,
    consumer: Box<dyn BrokerConsumer>,
    dispatcher: Arc<Dispatcher>,
    producer: Arc<dyn BrokerProducer>,
    global: GlobalErrorHandling,
    shutdown: watch::Receiver<bool>,
}

impl InputWorker {
    pub fn new(
        route: RouteConfig,
        table: Arc<RoutingTable>,
        consumer: Box<dyn BrokerConsumer>,
        dispatcher: Arc<Dispatcher>,
        producer: Arc<dyn BrokerProducer>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let global = table.global().clone();
        Self {
            route,
            table,
            consumer,
            dispatcher,
            producer,
            global,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(
            route_id = self.route.route_id,
            topic = self.route.resolved_input_topic(),
            group = self.route.consumer_group(),
            "input worker started"
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                polled = self.consumer.poll(POLL_TIMEOUT) => polled,
                changed = self.shutdown.changed() => {
                    // A closed channel means the supervisor is gone.
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match polled {
                Ok(Some(record)) => self.process(record).await,
                Ok(None) => {}
                Err(error) => {
                    error!(
                        route_id = self.route.route_id,
                        %error,
                        "poll failed, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(route_id = self.route.route_id, "input worker stopped");
    }

    async fn process(&mut self, record: ConsumerRecord) {
        debug!(
            route_id = self.route.route_id,
            partition = record.partition,
            offset = record.offset,
            "processing record"
        );

        let mut envelope = match MessageEnvelope::decode(&record.payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                // A poison record would block the partition forever; log it
                // and move the offset past it.
                error!(
                    route_id = self.route.route_id,
                    partition = record.partition,
                    offset = record.offset,
                    %error,
                    "envelope decode failed, committing past the record"
                );
                self.commit(&record).await;
                return;
            }
        };
        envelope.enrich();

        if envelope.raw_message.is_empty() {
            // Structurally valid envelope with nothing to deliver; treated
            // like a parse failure so the partition keeps moving.
            warn!(
                route_id = self.route.route_id,
                session_id = ?envelope.session_id,
                "envelope carries no raw message, committing without dispatch"
            );
            self.commit(&record).await;
            return;
        }

        let Some(route) = self.resolve_route(&envelope) else {
            warn!(
                route_id = self.route.route_id,
                sender = ?envelope.sender_comp_id,
                target = ?envelope.target_comp_id,
                "no destinations found for record, committing"
            );
            self.commit(&record).await;
            return;
        };

        // Redelivery loop for stopOnException aborts, mirroring the
        // route-level error handler: bounded re-attempts, then the global
        // dead-letter topic.
        let max_redeliveries = self.route.error_handling.max_redeliveries;
        let redelivery_delay = Duration::from_millis(self.route.error_handling.redelivery_delay);
        let mut delivery = 0u32;

        loop {
            match self.dispatcher.dispatch(&route, &envelope).await {
                Ok(report) => {
                    debug!(
                        route_id = self.route.route_id,
                        session_id = ?envelope.session_id,
                        succeeded = report.succeeded(),
                        dead_lettered = report.dead_lettered(),
                        skipped = report.skipped.len(),
                        "dispatch complete"
                    );
                    self.commit(&record).await;
                    return;
                }
                Err(DispatchError::Shutdown) => {
                    warn!(
                        route_id = self.route.route_id,
                        partition = record.partition,
                        offset = record.offset,
                        "dispatch interrupted by shutdown, offset left uncommitted"
                    );
                    return;
                }
                Err(DispatchError::Aborted {
                    uri,
                    message,
                    network,
                }) => {
                    if delivery >= max_redeliveries {
                        self.route_level_dead_letter(&envelope, &uri, &message, network)
                            .await;
                        self.commit(&record).await;
                        return;
                    }
                    delivery += 1;
                    warn!(
                        route_id = self.route.route_id,
                        uri,
                        delivery,
                        max_redeliveries,
                        "dispatch aborted, redelivering envelope"
                    );
                    let mut shutdown = self.shutdown.clone();
                    if *shutdown.borrow_and_update() {
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(redelivery_delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Destination resolution. Preferred path: this worker's route by id.
    /// The sender/target fall-back is kept for processors that predate
    /// route-id propagation and is flagged in logs.
    fn resolve_route(&self, envelope: &MessageEnvelope) -> Option<RouteConfig> {
        if let Some(route) = self.table.route_by_id(&self.route.route_id) {
            return Some(route.clone());
        }

        let sender = envelope.sender_comp_id.as_deref()?;
        let target = envelope.target_comp_id.as_deref()?;
        let route = self
            .table
            .find_matching(sender, target)
            .into_iter()
            .find(|route| route.direction == routing::RouteDirection::Input)?;
        warn!(
            route_id = self.route.route_id,
            matched = route.route_id,
            sender,
            target,
            "route id not found in table, using legacy sender/target matching"
        );
        Some(route.clone())
    }

    async fn route_level_dead_letter(
        &self,
        envelope: &MessageEnvelope,
        uri: &str,
        message: &str,
        network: bool,
    ) {
        let topic = self.global.default_dead_letter_topic.clone();
        let error_type = if network {
            "NetworkError"
        } else {
            "DestinationPermanentError"
        };
        error!(
            route_id = self.route.route_id,
            uri, topic, "redeliveries exhausted, sending envelope to global dead-letter topic"
        );

        let mut dead = envelope.clone();
        dead.set_error(message, error_type, self.route.route_id.as_str());
        match dead.encode() {
            Ok(payload) => {
                if let Err(error) = self.producer.send(ProducerRecord::new(topic, payload)).await {
                    error!(
                        route_id = self.route.route_id,
                        %error,
                        "failed to publish to global dead-letter topic"
                    );
                }
            }
            Err(error) => error!(
                route_id = self.route.route_id,
                %error,
                "failed to encode dead-letter envelope"
            ),
        }
    }

    async fn commit(&mut self, record: &ConsumerRecord) {
        if let Err(error) = self.consumer.commit(record).await {
            warn!(
                route_id = self.route.route_id,
                partition = record.partition,
                offset = record.offset,
                %error,
                "offset commit failed"
            );
        } else {
            debug!(
                route_id = self.route.route_id,
                partition = record.partition,
                offset = record.offset,
                "offset committed"
            );
        }
    }
}
