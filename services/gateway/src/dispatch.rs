//! Per-envelope destination dispatch with retry, dead-lettering, and
//! message-type filtering.
//!
//! Destinations of one envelope are always sent synchronously and in
//! configuration order; the next destination does not start until the
//! previous one terminated. The `parallelProcessing` flag in configuration
//! is accepted but never reorders this loop.

use std::sync::Arc;

use envelope::MessageEnvelope;
use routing::{DestinationConfig, RouteConfig};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerProducer, ProducerRecord};
use crate::endpoint::{EndpointError, EndpointFactory, EndpointScheme, EndpointUri};

/// Query parameters appended to `netty:` destinations when the caller did
/// not supply them. User-supplied values are never overridden.
pub const NETTY_DEFAULT_PARAMS: [(&str, &str); 5] = [
    ("connectTimeout", "2000"),
    ("requestTimeout", "2000"),
    ("disconnect", "true"),
    ("reuseChannel", "false"),
    ("sync", "true"),
];

/// Lifecycle of one destination send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Pending,
    InFlight,
    Success,
    RetryWait,
    DeadLettered,
    Aborted,
}

/// What happened at one destination.
#[derive(Debug, Clone)]
pub struct DestinationOutcome {
    pub uri: String,
    pub state: SendState,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Result of dispatching one envelope across a route's destinations.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<DestinationOutcome>,
    /// Destinations skipped by the message-type filter.
    pub skipped: Vec<String>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == SendState::Success)
            .count()
    }

    pub fn dead_lettered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == SendState::DeadLettered)
            .count()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A destination failed terminally and has `stopOnException` set; the
    /// remaining destinations were not attempted.
    #[error("destination '{uri}' failed and stopOnException is set: {message}")]
    Aborted {
        uri: String,
        message: String,
        /// Whether the underlying failure was network-classified.
        network: bool,
    },

    /// Shutdown interrupted the dispatch; the offset must not be committed.
    #[error("dispatch interrupted by shutdown")]
    Shutdown,
}

/// Sends one envelope to the destinations of one route.
#[derive(Debug)]
pub struct Dispatcher {
    endpoints: EndpointFactory,
    producer: Arc<dyn BrokerProducer>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        endpoints: EndpointFactory,
        producer: Arc<dyn BrokerProducer>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            endpoints,
            producer,
            shutdown,
        }
    }

    pub fn endpoints(&self) -> &EndpointFactory {
        &self.endpoints
    }

    /// Dispatch `envelope` to every matching destination of `route`, in
    /// declared order.
    pub async fn dispatch(
        &self,
        route: &RouteConfig,
        envelope: &MessageEnvelope,
    ) -> Result<DispatchReport, DispatchError> {
        let msg_type = envelope.msg_type.as_deref();
        let mut report = DispatchReport::default();

        for (index, destination) in route.destination_configs.iter().enumerate() {
            if !destination.matches_msg_type(msg_type) {
                debug!(
                    route_id = route.route_id,
                    index,
                    uri = destination.uri,
                    msg_type = msg_type.unwrap_or("<none>"),
                    allowed = ?destination.msg_types,
                    "skipping destination, message type not accepted"
                );
                report.skipped.push(destination.uri.clone());
                continue;
            }

            let outcome = self
                .send_with_retry(route, destination, index, envelope)
                .await;

            match outcome.state {
                SendState::Aborted => {
                    report.outcomes.push(outcome);
                    return Err(DispatchError::Shutdown);
                }
                SendState::DeadLettered if destination.stop_on_exception => {
                    let message = outcome.error.clone().unwrap_or_default();
                    let network = outcome
                        .error
                        .as_deref()
                        .map(crate::error::looks_like_network_error)
                        .unwrap_or(false);
                    let uri = outcome.uri.clone();
                    report.outcomes.push(outcome);
                    warn!(
                        route_id = route.route_id,
                        uri, "stopOnException set, aborting remaining destinations"
                    );
                    return Err(DispatchError::Aborted {
                        uri,
                        message,
                        network,
                    });
                }
                _ => report.outcomes.push(outcome),
            }
        }

        Ok(report)
    }

    /// Drive one destination through the send state machine.
    async fn send_with_retry(
        &self,
        route: &RouteConfig,
        destination: &DestinationConfig,
        index: usize,
        envelope: &MessageEnvelope,
    ) -> DestinationOutcome {
        let target = match resolve_target(destination) {
            Ok(target) => target,
            Err(error) => {
                // Unresolvable URI is permanent; straight to dead-letter.
                error!(
                    route_id = route.route_id,
                    index,
                    uri = destination.uri,
                    %error,
                    "destination URI invalid"
                );
                self.dead_letter(route, destination, envelope, &error.to_string(), false)
                    .await;
                return DestinationOutcome {
                    uri: destination.uri.clone(),
                    state: SendState::DeadLettered,
                    attempts: 0,
                    error: Some(error.to_string()),
                };
            }
        };

        let sink = self.endpoints.sink_for(&target);
        let uri = target.to_string();
        let max_attempts = destination.max_retries + 1;
        let timeout = std::time::Duration::from_millis(destination.timeout);
        let retry_delay = std::time::Duration::from_millis(destination.retry_delay);

        // PENDING -> IN_FLIGHT -> {SUCCESS | RETRY_WAIT -> IN_FLIGHT | DEAD_LETTERED | ABORTED}
        let mut attempts = 0u32;
        let mut last_error: Option<EndpointError> = None;

        while attempts < max_attempts {
            attempts += 1;

            let attempt = tokio::time::timeout(timeout, sink.send(&envelope.raw_message)).await;
            let error = match attempt {
                Ok(Ok(())) => {
                    debug!(
                        route_id = route.route_id,
                        index, uri, attempts, "sent to destination"
                    );
                    return DestinationOutcome {
                        uri,
                        state: SendState::Success,
                        attempts,
                        error: None,
                    };
                }
                Ok(Err(error)) => error,
                Err(_) => EndpointError::RequestTimeout {
                    addr: target.target.clone(),
                    timeout_ms: destination.timeout,
                },
            };

            let network = error.is_network();
            if network && attempts < max_attempts {
                warn!(
                    route_id = route.route_id,
                    index,
                    uri,
                    attempt = attempts,
                    %error,
                    retry_in_ms = destination.retry_delay,
                    "network error sending to destination, retrying"
                );
                last_error = Some(error);

                let mut shutdown = self.shutdown.clone();
                if *shutdown.borrow_and_update() {
                    return DestinationOutcome {
                        uri,
                        state: SendState::Aborted,
                        attempts,
                        error: last_error.map(|e| e.to_string()),
                    };
                }
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return DestinationOutcome {
                                uri,
                                state: SendState::Aborted,
                                attempts,
                                error: last_error.map(|e| e.to_string()),
                            };
                        }
                    }
                }
            } else {
                debug!(
                    route_id = route.route_id,
                    index,
                    uri,
                    attempt = attempts,
                    network,
                    %error,
                    "terminal destination failure"
                );
                last_error = Some(error);
                break;
            }
        }

        let (message, network) = match &last_error {
            Some(error) => (error.to_string(), error.is_network()),
            None => ("unknown error".to_string(), false),
        };
        error!(
            route_id = route.route_id,
            index,
            uri,
            attempts,
            max_attempts,
            error = message,
            "destination failed, dead-lettering envelope"
        );
        self.dead_letter(route, destination, envelope, &message, network)
            .await;

        DestinationOutcome {
            uri,
            state: SendState::DeadLettered,
            attempts,
            error: Some(message),
        }
    }

    /// Publish the envelope, error triple populated, to the destination's
    /// dead-letter topic. A failed dead-letter publish is logged; the
    /// dispatcher moves on either way.
    async fn dead_letter(
        &self,
        route: &RouteConfig,
        destination: &DestinationConfig,
        envelope: &MessageEnvelope,
        message: &str,
        network: bool,
    ) {
        let topic = destination.dead_letter_topic_for(&route.route_id);
        let error_type = if network {
            "NetworkError"
        } else {
            "DestinationPermanentError"
        };

        let mut dead = envelope.clone();
        dead.set_error(message, error_type, route.route_id.as_str());

        match dead.encode() {
            Ok(payload) => {
                match self
                    .producer
                    .send(ProducerRecord::new(topic.clone(), payload))
                    .await
                {
                    Ok(()) => info!(route_id = route.route_id, topic, "envelope dead-lettered"),
                    Err(error) => error!(
                        route_id = route.route_id,
                        topic,
                        %error,
                        "failed to publish dead-letter record"
                    ),
                }
            }
            Err(error) => error!(
                route_id = route.route_id,
                topic,
                %error,
                "failed to encode dead-letter envelope"
            ),
        }
    }
}

/// Full target URI for a destination: configured parameters plus, for
/// `netty:` endpoints, the historical defaults for anything unset.
pub fn resolve_target(destination: &DestinationConfig) -> Result<EndpointUri, EndpointError> {
    let mut uri = EndpointUri::parse(&destination.build_complete_uri())?;
    if uri.scheme == EndpointScheme::Netty {
        for (key, value) in NETTY_DEFAULT_PARAMS {
            uri.params
                .entry(key.to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    Ok(uri)
}
