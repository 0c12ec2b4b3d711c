//! Supervisor: constructs workers from the routing table and owns their
//! lifecycle.
//!
//! Startup order: broker reachable, required topics ensured, shared
//! producer created, then one worker per INPUT route and one per OUTPUT
//! listener endpoint. Shutdown flips a watch signal, drains in-flight
//! dispatches bounded by a deadline, and closes the producer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use expr::ExpressionCache;
use routing::RoutingTable;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, BrokerProducer, ConsumerSettings};
use crate::consumer::InputWorker;
use crate::dispatch::Dispatcher;
use crate::endpoint::{DirectRegistry, EndpointFactory, EndpointScheme, EndpointUri};
use crate::error::GatewayError;
use crate::listener;
use crate::output::OutputWorker;

pub const TOPIC_PARTITIONS: i32 = 1;
pub const TOPIC_REPLICATION: i16 = 1;

/// Tunables for startup and shutdown. Defaults match production behaviour;
/// tests shrink the health-check window.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Total window for the startup broker health check.
    pub health_window: Duration,
    /// Pause between health-check attempts.
    pub health_interval: Duration,
    /// Capacity of each `direct:` listener channel.
    pub direct_capacity: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            health_window: Duration::from_secs(10),
            health_interval: Duration::from_secs(1),
            direct_capacity: 1024,
        }
    }
}

pub struct Supervisor {
    producer: Arc<dyn BrokerProducer>,
    registry: Arc<DirectRegistry>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    /// Bring the gateway up. Fails (and the process exits non-zero) when
    /// the broker is unreachable within the health window or a route
    /// cannot be constructed.
    pub async fn start(
        table: Arc<RoutingTable>,
        broker: Arc<dyn BrokerClient>,
        expressions: Arc<ExpressionCache>,
    ) -> Result<Self, GatewayError> {
        Self::start_with_options(table, broker, expressions, SupervisorOptions::default()).await
    }

    pub async fn start_with_options(
        table: Arc<RoutingTable>,
        broker: Arc<dyn BrokerClient>,
        expressions: Arc<ExpressionCache>,
        options: SupervisorOptions,
    ) -> Result<Self, GatewayError> {
        info!("🚀 starting FIX gateway supervisor");

        check_broker(broker.as_ref(), &options).await?;
        ensure_topics(broker.as_ref(), &table).await;

        let producer = broker.producer();
        let registry = Arc::new(DirectRegistry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Arc::new(Dispatcher::new(
            EndpointFactory::new(Arc::clone(&producer), Arc::clone(&registry)),
            Arc::clone(&producer),
            shutdown_rx.clone(),
        ));

        let mut workers: Vec<(String, JoinHandle<()>)> = Vec::new();

        for route in table.input_routes() {
            let topic = route.resolved_input_topic();
            let consumer = broker
                .subscribe(&topic, ConsumerSettings::ordered(route.consumer_group()))
                .await?;
            let worker = InputWorker::new(
                route.clone(),
                Arc::clone(&table),
                consumer,
                Arc::clone(&dispatcher),
                Arc::clone(&producer),
                shutdown_rx.clone(),
            );
            workers.push((
                format!("{}_INPUT", route.route_id),
                tokio::spawn(worker.run()),
            ));
        }

        for route in table.output_routes() {
            for (index, destination) in route.destination_configs.iter().enumerate() {
                let uri = EndpointUri::parse(&destination.build_complete_uri())
                    .map_err(GatewayError::Endpoint)?;
                let (source, listener_name) =
                    open_listener(&uri, &registry, &shutdown_rx, &options).await?;
                let worker = OutputWorker::new(
                    route.clone(),
                    listener_name.clone(),
                    source,
                    Arc::clone(&producer),
                    Arc::clone(&expressions),
                    shutdown_rx.clone(),
                );
                workers.push((
                    format!("{}_FROM_{}_{}", route.route_id, listener_name, index),
                    tokio::spawn(worker.run()),
                ));
            }
        }

        info!(workers = workers.len(), "✅ supervisor started");
        Ok(Self {
            producer,
            registry,
            shutdown_tx,
            workers,
        })
    }

    /// The in-process channel registry, for wiring `direct:` endpoints from
    /// embedding code and tests.
    pub fn direct_registry(&self) -> Arc<DirectRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn worker_names(&self) -> Vec<&str> {
        self.workers.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Graceful stop: signal shutdown, drain workers within `deadline`,
    /// then flush and drop the shared producer.
    pub async fn shutdown(self, deadline: Duration) {
        info!("supervisor shutting down");
        let _ = self.shutdown_tx.send(true);

        let stop_by = Instant::now() + deadline;
        for (name, handle) in self.workers {
            let remaining = stop_by.saturating_duration_since(Instant::now());
            let abort = handle.abort_handle();
            match tokio::time::timeout(remaining, handle).await {
                Ok(_) => debug!(worker = name, "worker stopped"),
                Err(_) => {
                    warn!(worker = name, "worker did not stop within deadline, aborting");
                    abort.abort();
                }
            }
        }

        if let Err(error) = self.producer.flush().await {
            warn!(%error, "producer flush failed during shutdown");
        }
        info!("supervisor stopped");
    }
}

async fn open_listener(
    uri: &EndpointUri,
    registry: &Arc<DirectRegistry>,
    shutdown: &watch::Receiver<bool>,
    options: &SupervisorOptions,
) -> Result<(tokio::sync::mpsc::Receiver<String>, String), GatewayError> {
    match uri.scheme {
        EndpointScheme::Netty => {
            let source = listener::spawn_tcp_listener(&uri.target, shutdown.clone()).await?;
            Ok((source, uri.target.replace([':', '/'], "_")))
        }
        EndpointScheme::Direct => {
            let source = registry.register(&uri.target, options.direct_capacity);
            Ok((source, uri.target.clone()))
        }
        EndpointScheme::Kafka => Err(GatewayError::Supervisor(format!(
            "kafka: URIs cannot be OUTPUT listeners (got 'kafka:{}'); consume the topic with an INPUT route instead",
            uri.target
        ))),
    }
}

/// Broker connectivity probe with a bounded retry window.
async fn check_broker(
    broker: &dyn BrokerClient,
    options: &SupervisorOptions,
) -> Result<(), GatewayError> {
    let started = Instant::now();
    let mut attempt = 1u32;
    loop {
        match broker.list_topics().await {
            Ok(_) => {
                info!(
                    attempts = attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "broker reachable"
                );
                return Ok(());
            }
            Err(error) => {
                if started.elapsed() >= options.health_window {
                    error!(
                        %error,
                        window_secs = options.health_window.as_secs(),
                        "broker unreachable, giving up"
                    );
                    return Err(GatewayError::Supervisor(format!(
                        "broker unreachable after {}s: {error}",
                        options.health_window.as_secs()
                    )));
                }
                warn!(attempt, %error, "broker connection attempt failed, retrying");
                attempt += 1;
                tokio::time::sleep(options.health_interval).await;
            }
        }
    }
}

/// Create any missing route/dead-letter topics. Creation failures are
/// logged, never fatal: topics may be auto-created downstream.
async fn ensure_topics(broker: &dyn BrokerClient, table: &RoutingTable) {
    let existing: HashSet<String> = match broker.list_topics().await {
        Ok(topics) => topics.into_iter().collect(),
        Err(error) => {
            warn!(%error, "could not list topics, skipping topic creation");
            return;
        }
    };

    for topic in table.required_topics() {
        if existing.contains(&topic) {
            continue;
        }
        match broker
            .create_topic(&topic, TOPIC_PARTITIONS, TOPIC_REPLICATION)
            .await
        {
            Ok(()) => info!(topic, "created topic"),
            Err(error) => warn!(topic, %error, "failed to create topic, it may be auto-created"),
        }
    }
}
