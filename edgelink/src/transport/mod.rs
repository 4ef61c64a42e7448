//! Connectivity layer between the agent and the broker.
//!
//! The agent talks to the outside world exclusively through the [`Transport`]
//! trait so that the backend can be chosen when the agent is constructed. Two
//! implementations are provided: [`mqtt::MqttTransport`] for real brokers and
//! [`loopback::LoopbackTransport`] for tests and offline bring-up.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::status::Result;

pub mod loopback;
pub mod mqtt;

/// Deadline applied when a caller passes [`Duration::ZERO`].
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

/// Keep-alive interval used for every broker session.
pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// MQTT quality-of-service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    pub fn from_u8(level: u8) -> Option<QosLevel> {
        match level {
            0 => Some(QosLevel::AtMostOnce),
            1 => Some(QosLevel::AtLeastOnce),
            2 => Some(QosLevel::ExactlyOnce),
            _ => None,
        }
    }
}

/// Protocol revision requested by the caller. The backends map each variant
/// distinctly; a backend that cannot speak a revision reports that instead of
/// silently substituting another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MqttVersion {
    #[default]
    Default,
    V3_1,
    V3_1_1,
}

/// TLS material for the broker connection.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Path to a PEM bundle of trusted roots. `None` uses the system store.
    pub trust_store: Option<PathBuf>,
    /// Path to the client certificate (PEM).
    pub client_cert: Option<PathBuf>,
    /// Path to the client private key (PEM, PKCS#8).
    pub client_key: Option<PathBuf>,
    /// Skip certificate validation.
    pub insecure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProxyType {
    Http,
    Socks5,
}

/// Proxy used for outbound connections. Backends that cannot express the
/// configured combination log it and connect directly.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    pub proxy_type: ProxyType,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Options accepted by [`Transport::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub client_id: String,
    pub host: String,
    /// TCP port. `0` selects 1883 for plain connections and 8883 under TLS.
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl: Option<TlsOptions>,
    pub proxy: Option<ProxyOptions>,
    pub version: MqttVersion,
}

impl ConnectOptions {
    pub fn effective_port(&self) -> u16 {
        if self.port != 0 {
            self.port
        } else if self.ssl.is_some() {
            8883
        } else {
            1883
        }
    }

    /// Broker URL re-materialized for every connection attempt.
    pub fn broker_url(&self) -> String {
        let scheme = if self.ssl.is_some() { "ssl" } else { "tcp" };
        format!("{}://{}:{}", scheme, self.host, self.effective_port())
    }
}

/// Snapshot of the connection state. `changed` reports whether the state
/// flipped since the previous call to [`Transport::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub changed: bool,
    pub changed_at: DateTime<Utc>,
}

/// Events surfaced by a transport. The receive path never blocks; messages
/// are copied into a bounded queue and drained by the agent scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An inbound publication on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// A QoS >= 1 publication was acknowledged by the broker.
    Delivered { message_id: u16 },
    /// The session ended. `unexpected` is true when the previous state was
    /// connected and the drop was not requested by us.
    Disconnected { unexpected: bool },
}

#[async_trait]
pub trait Transport: Send {
    /// Establishes a fresh session. A deadline of zero means
    /// [`DEFAULT_DEADLINE`].
    async fn connect(&mut self, opts: &ConnectOptions, deadline: Duration) -> Result<()>;

    /// Re-establishes the session without discarding broker-side state
    /// (clean-session off, same credentials).
    async fn reconnect(&mut self, opts: &ConnectOptions, deadline: Duration) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Publishes and returns the adapter-assigned message id.
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        retain: bool,
    ) -> Result<u16>;

    async fn subscribe(&mut self, topic: &str, qos: QosLevel) -> Result<()>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<()>;

    /// Connection-state triple. Reading clears the `changed` flag.
    fn status(&self) -> ConnectionStatus;

    /// Non-blocking drain of the event queue.
    fn try_event(&mut self) -> Option<TransportEvent>;
}

pub(crate) fn effective_deadline(deadline: Duration) -> Duration {
    if deadline.is_zero() {
        DEFAULT_DEADLINE
    } else {
        deadline
    }
}

/// Returns whether `topic` matches `filter`, supporting the trailing `#`
/// wildcard used by the agent's subscriptions.
pub(crate) fn topic_matches(filter: &str, topic: &str) -> bool {
    if let Some(prefix) = filter.strip_suffix("/#") {
        topic == prefix || topic.starts_with(&format!("{prefix}/"))
    } else {
        filter == topic
    }
}
