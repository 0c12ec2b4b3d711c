//! Destination endpoints: URI parsing and the sinks behind each scheme.
//!
//! Three schemes are supported: `netty:tcp://host:port` for line-oriented
//! TCP endpoints, `kafka:<topic>` for re-routing to another broker topic
//! through the shared producer, and `direct:<name>` for in-process wiring.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{BrokerProducer, ProducerRecord};
use crate::error::looks_like_network_error;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EndpointError {
    #[error("connection to {addr} refused: {message}")]
    ConnectionRefused { addr: String, message: String },

    #[error("connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error("request to {addr} timed out after {timeout_ms}ms")]
    RequestTimeout { addr: String, timeout_ms: u64 },

    #[error("connection to {addr} lost: {message}")]
    ConnectionLost { addr: String, message: String },

    #[error("I/O error on {addr}: {message}")]
    Io { addr: String, message: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("invalid endpoint uri '{uri}': {message}")]
    InvalidUri { uri: String, message: String },

    #[error("no direct channel named '{0}'")]
    UnknownDirectChannel(String),

    #[error("{0}")]
    Other(String),
}

impl EndpointError {
    /// Transient, retryable failures. Typed network variants classify
    /// directly; free-form failures fall back to the token scan.
    pub fn is_network(&self) -> bool {
        match self {
            EndpointError::ConnectionRefused { .. }
            | EndpointError::ConnectTimeout { .. }
            | EndpointError::RequestTimeout { .. }
            | EndpointError::ConnectionLost { .. }
            | EndpointError::Io { .. } => true,
            EndpointError::SendFailed(message) | EndpointError::Other(message) => {
                looks_like_network_error(message)
            }
            EndpointError::InvalidUri { .. } | EndpointError::UnknownDirectChannel(_) => false,
        }
    }
}

/// Endpoint URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointScheme {
    Netty,
    Kafka,
    Direct,
}

/// A parsed destination or listener URI with its query parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointUri {
    pub scheme: EndpointScheme,
    /// `host:port` for netty, topic for kafka, channel name for direct.
    pub target: String,
    pub params: BTreeMap<String, String>,
}

impl EndpointUri {
    pub fn parse(uri: &str) -> Result<Self, EndpointError> {
        let invalid = |message: &str| EndpointError::InvalidUri {
            uri: uri.to_string(),
            message: message.to_string(),
        };

        let (base, query) = match uri.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (uri, None),
        };

        let (scheme, target) = if let Some(rest) = base.strip_prefix("netty:") {
            let addr = rest
                .strip_prefix("tcp://")
                .ok_or_else(|| invalid("netty endpoints must be netty:tcp://host:port"))?;
            if !addr.contains(':') {
                return Err(invalid("netty endpoint must include a port"));
            }
            (EndpointScheme::Netty, addr)
        } else if let Some(topic) = base.strip_prefix("kafka:") {
            (EndpointScheme::Kafka, topic)
        } else if let Some(name) = base.strip_prefix("direct:") {
            (EndpointScheme::Direct, name)
        } else {
            return Err(invalid(
                "unsupported scheme; expected netty:tcp://, kafka: or direct:",
            ));
        };

        if target.is_empty() {
            return Err(invalid("empty endpoint target"));
        }

        let mut params = BTreeMap::new();
        if let Some(query) = query {
            for pair in query.split('&') {
                if pair.is_empty() {
                    continue;
                }
                match pair.split_once('=') {
                    Some((key, value)) => {
                        params.insert(key.to_string(), value.to_string());
                    }
                    None => {
                        params.insert(pair.to_string(), String::new());
                    }
                }
            }
        }

        Ok(Self {
            scheme,
            target: target.to_string(),
            params,
        })
    }

    /// The URI without its query string; identifies the endpoint itself.
    pub fn base(&self) -> String {
        match self.scheme {
            EndpointScheme::Netty => format!("netty:tcp://{}", self.target),
            EndpointScheme::Kafka => format!("kafka:{}", self.target),
            EndpointScheme::Direct => format!("direct:{}", self.target),
        }
    }

    pub fn param_u64(&self, name: &str, default: u64) -> u64 {
        self.params
            .get(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn param_bool(&self, name: &str, default: bool) -> bool {
        self.params
            .get(name)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    }
}

impl std::fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base())?;
        let mut separator = '?';
        for (key, value) in &self.params {
            write!(f, "{separator}{key}={value}")?;
            separator = '&';
        }
        Ok(())
    }
}

/// A destination for raw FIX payloads.
#[async_trait]
pub trait EndpointSink: Send + Sync + Debug {
    async fn send(&self, payload: &str) -> Result<(), EndpointError>;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}

/// Line-oriented TCP sink. Connects on demand; one payload per line, an
/// optional `OK` reply line when `sync` is set.
#[derive(Debug)]
pub struct TcpEndpoint {
    addr: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    sync: bool,
    disconnect_after_send: bool,
    reuse_channel: bool,
    connection: Mutex<Option<BufReader<TcpStream>>>,
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
}

impl TcpEndpoint {
    pub fn from_uri(uri: &EndpointUri) -> Self {
        Self {
            addr: uri.target.clone(),
            connect_timeout: Duration::from_millis(uri.param_u64("connectTimeout", 2000)),
            request_timeout: Duration::from_millis(uri.param_u64("requestTimeout", 2000)),
            sync: uri.param_bool("sync", true),
            disconnect_after_send: uri.param_bool("disconnect", true),
            reuse_channel: uri.param_bool("reuseChannel", false),
            connection: Mutex::new(None),
            messages_sent: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
        }
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    async fn connect(&self) -> Result<BufReader<TcpStream>, EndpointError> {
        debug!(addr = self.addr, "connecting tcp endpoint");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| EndpointError::ConnectTimeout {
                addr: self.addr.clone(),
                timeout_ms: self.connect_timeout.as_millis() as u64,
            })?
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::ConnectionRefused => EndpointError::ConnectionRefused {
                    addr: self.addr.clone(),
                    message: error.to_string(),
                },
                _ => EndpointError::Io {
                    addr: self.addr.clone(),
                    message: error.to_string(),
                },
            })?;
        Ok(BufReader::new(stream))
    }

    async fn write_and_ack(
        &self,
        connection: &mut BufReader<TcpStream>,
        payload: &str,
    ) -> Result<(), EndpointError> {
        let io_error = |error: std::io::Error| EndpointError::ConnectionLost {
            addr: self.addr.clone(),
            message: error.to_string(),
        };

        let stream = connection.get_mut();
        stream.write_all(payload.as_bytes()).await.map_err(io_error)?;
        stream.write_all(b"\n").await.map_err(io_error)?;
        stream.flush().await.map_err(io_error)?;

        if self.sync {
            let mut reply = String::new();
            let read = tokio::time::timeout(self.request_timeout, connection.read_line(&mut reply))
                .await
                .map_err(|_| EndpointError::RequestTimeout {
                    addr: self.addr.clone(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })?
                .map_err(io_error)?;
            if read == 0 {
                return Err(EndpointError::ConnectionLost {
                    addr: self.addr.clone(),
                    message: "peer closed before acknowledging".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EndpointSink for TcpEndpoint {
    async fn send(&self, payload: &str) -> Result<(), EndpointError> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            match self.connect().await {
                Ok(connection) => *guard = Some(connection),
                Err(error) => {
                    self.messages_failed.fetch_add(1, Ordering::Relaxed);
                    return Err(error);
                }
            }
        }

        // The connection is present here by construction.
        let result = match guard.as_mut() {
            Some(connection) => self.write_and_ack(connection, payload).await,
            None => Err(EndpointError::Io {
                addr: self.addr.clone(),
                message: "no connection available".to_string(),
            }),
        };

        match result {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                if self.disconnect_after_send || !self.reuse_channel {
                    *guard = None;
                }
                Ok(())
            }
            Err(error) => {
                self.messages_failed.fetch_add(1, Ordering::Relaxed);
                *guard = None;
                Err(error)
            }
        }
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Registry of named in-process channels backing the `direct:` scheme.
///
/// Listener sides register a channel; sender sides look it up. Owned by the
/// supervisor, never ambient.
#[derive(Debug, Default)]
pub struct DirectRegistry {
    channels: DashMap<String, mpsc::Sender<String>>,
}

impl DirectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the channel for `name`, returning its receiving
    /// end.
    pub fn register(&self, name: &str, capacity: usize) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(capacity);
        if self.channels.insert(name.to_string(), tx).is_some() {
            warn!(name, "direct channel re-registered; previous receiver detached");
        } else {
            info!(name, "direct channel registered");
        }
        rx
    }

    pub fn sender(&self, name: &str) -> Option<mpsc::Sender<String>> {
        self.channels.get(name).map(|entry| entry.value().clone())
    }
}

/// Sink for `direct:<name>` in-process destinations.
#[derive(Debug)]
pub struct DirectEndpoint {
    name: String,
    registry: Arc<DirectRegistry>,
}

impl DirectEndpoint {
    pub fn new(name: impl Into<String>, registry: Arc<DirectRegistry>) -> Self {
        Self {
            name: name.into(),
            registry,
        }
    }
}

#[async_trait]
impl EndpointSink for DirectEndpoint {
    async fn send(&self, payload: &str) -> Result<(), EndpointError> {
        let sender = self
            .registry
            .sender(&self.name)
            .ok_or_else(|| EndpointError::UnknownDirectChannel(self.name.clone()))?;
        sender
            .send(payload.to_string())
            .await
            .map_err(|_| EndpointError::Other(format!("direct channel '{}' is closed", self.name)))
    }

    fn describe(&self) -> String {
        format!("direct:{}", self.name)
    }
}

/// Sink for `kafka:<topic>` destinations: re-routes the payload to another
/// broker topic through the shared producer.
#[derive(Debug)]
pub struct TopicEndpoint {
    topic: String,
    producer: Arc<dyn BrokerProducer>,
}

impl TopicEndpoint {
    pub fn new(topic: impl Into<String>, producer: Arc<dyn BrokerProducer>) -> Self {
        Self {
            topic: topic.into(),
            producer,
        }
    }
}

#[async_trait]
impl EndpointSink for TopicEndpoint {
    async fn send(&self, payload: &str) -> Result<(), EndpointError> {
        self.producer
            .send(ProducerRecord::new(self.topic.clone(), payload))
            .await
            .map_err(|error| EndpointError::SendFailed(error.to_string()))
    }

    fn describe(&self) -> String {
        format!("kafka:{}", self.topic)
    }
}

/// Builds and caches one sink per distinct destination URI.
#[derive(Debug)]
pub struct EndpointFactory {
    producer: Arc<dyn BrokerProducer>,
    registry: Arc<DirectRegistry>,
    sinks: DashMap<String, Arc<dyn EndpointSink>>,
    overrides: DashMap<String, Arc<dyn EndpointSink>>,
}

impl EndpointFactory {
    pub fn new(producer: Arc<dyn BrokerProducer>, registry: Arc<DirectRegistry>) -> Self {
        Self {
            producer,
            registry,
            sinks: DashMap::new(),
            overrides: DashMap::new(),
        }
    }

    /// Replace the sink behind a base URI (scheme + target, no query).
    /// Used by tests to inject failing or collecting endpoints.
    pub fn register_override(&self, base_uri: &str, sink: Arc<dyn EndpointSink>) {
        self.overrides.insert(base_uri.to_string(), sink);
    }

    pub fn sink_for(&self, uri: &EndpointUri) -> Arc<dyn EndpointSink> {
        if let Some(sink) = self.overrides.get(&uri.base()) {
            return Arc::clone(&sink);
        }
        let key = uri.to_string();
        if let Some(sink) = self.sinks.get(&key) {
            return Arc::clone(&sink);
        }
        let sink: Arc<dyn EndpointSink> = match uri.scheme {
            EndpointScheme::Netty => Arc::new(TcpEndpoint::from_uri(uri)),
            EndpointScheme::Kafka => {
                Arc::new(TopicEndpoint::new(uri.target.clone(), Arc::clone(&self.producer)))
            }
            EndpointScheme::Direct => {
                Arc::new(DirectEndpoint::new(uri.target.clone(), Arc::clone(&self.registry)))
            }
        };
        self.sinks.insert(key, Arc::clone(&sink));
        sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_netty_uri_with_params() {
        let uri = EndpointUri::parse("netty:tcp://localhost:9999?sync=true&connectTimeout=2000")
            .unwrap();
        assert_eq!(uri.scheme, EndpointScheme::Netty);
        assert_eq!(uri.target, "localhost:9999");
        assert_eq!(uri.param_bool("sync", false), true);
        assert_eq!(uri.param_u64("connectTimeout", 0), 2000);
        assert_eq!(uri.base(), "netty:tcp://localhost:9999");
    }

    #[test]
    fn parses_kafka_and_direct_uris() {
        let kafka = EndpointUri::parse("kafka:fix-dead-letter").unwrap();
        assert_eq!(kafka.scheme, EndpointScheme::Kafka);
        assert_eq!(kafka.target, "fix-dead-letter");

        let direct = EndpointUri::parse("direct:exec").unwrap();
        assert_eq!(direct.scheme, EndpointScheme::Direct);
        assert_eq!(direct.target, "exec");
    }

    #[test]
    fn rejects_bad_uris() {
        assert!(EndpointUri::parse("netty:udp://x:1").is_err());
        assert!(EndpointUri::parse("netty:tcp://noport").is_err());
        assert!(EndpointUri::parse("seda:x").is_err());
        assert!(EndpointUri::parse("direct:").is_err());
    }

    #[test]
    fn display_is_deterministic() {
        let uri = EndpointUri::parse("netty:tcp://h:1?b=2&a=1").unwrap();
        assert_eq!(uri.to_string(), "netty:tcp://h:1?a=1&b=2");
    }

    #[test]
    fn param_defaults_apply() {
        let uri = EndpointUri::parse("netty:tcp://h:1").unwrap();
        assert_eq!(uri.param_u64("connectTimeout", 2000), 2000);
        assert!(uri.param_bool("sync", true));
        assert!(!uri.param_bool("sync", false));
    }

    #[test]
    fn network_classification() {
        let refused = EndpointError::ConnectionRefused {
            addr: "h:1".into(),
            message: "refused".into(),
        };
        assert!(refused.is_network());
        assert!(EndpointError::RequestTimeout {
            addr: "h:1".into(),
            timeout_ms: 5
        }
        .is_network());
        assert!(EndpointError::SendFailed("socket reset by peer".into()).is_network());
        assert!(!EndpointError::SendFailed("schema mismatch".into()).is_network());
        assert!(!EndpointError::UnknownDirectChannel("x".into()).is_network());
        assert!(!EndpointError::InvalidUri {
            uri: "x".into(),
            message: "bad".into()
        }
        .is_network());
    }

    #[tokio::test]
    async fn direct_endpoint_round_trip() {
        let registry = Arc::new(DirectRegistry::new());
        let mut rx = registry.register("exec", 8);
        let endpoint = DirectEndpoint::new("exec", Arc::clone(&registry));
        endpoint.send("8=FIX.4.4\u{1}35=D\u{1}").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "8=FIX.4.4\u{1}35=D\u{1}");
    }

    #[tokio::test]
    async fn direct_endpoint_without_channel_is_permanent() {
        let registry = Arc::new(DirectRegistry::new());
        let endpoint = DirectEndpoint::new("nobody", registry);
        let error = endpoint.send("x").await.unwrap_err();
        assert!(matches!(error, EndpointError::UnknownDirectChannel(_)));
        assert!(!error.is_network());
    }

    #[tokio::test]
    async fn tcp_endpoint_refused_is_network() {
        // Bind then drop to obtain a port nothing is listening on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let uri = EndpointUri::parse(&format!("netty:tcp://{addr}?connectTimeout=500")).unwrap();
        let endpoint = TcpEndpoint::from_uri(&uri);
        let error = endpoint.send("8=FIX\u{1}").await.unwrap_err();
        assert!(error.is_network(), "got non-network error: {error}");
    }
}
