//! In-memory transport used by tests and offline bring-up.
//!
//! The loopback pair plays both sides of a broker session: the agent drives
//! the [`LoopbackTransport`] half through the [`Transport`] trait while the
//! [`LoopbackBroker`] half lets the other end inspect publications and inject
//! inbound messages.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::status::{AgentError, ErrorKind, Result};

use super::{
    topic_matches, ConnectOptions, ConnectionStatus, QosLevel, Transport, TransportEvent,
};

#[derive(Debug)]
struct BrokerInner {
    connected: bool,
    changed: bool,
    changed_at: DateTime<Utc>,
    refuse_connect: bool,
    subscriptions: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    inbound: VecDeque<(String, Vec<u8>)>,
    pending_disconnect: Option<bool>,
    next_msg_id: u16,
    connect_count: u32,
}

/// Scripting handle for the other end of a loopback session.
#[derive(Clone)]
pub struct LoopbackBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl LoopbackBroker {
    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().expect("loopback broker mutex poisoned")
    }

    /// Queues an inbound message for delivery to the agent.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        self.lock().inbound.push_back((topic.to_string(), payload.to_vec()));
    }

    /// Drains everything the agent has published so far.
    pub fn take_published(&self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut self.lock().published)
    }

    /// Drops the session as if the network had failed.
    pub fn drop_connection(&self) {
        let mut inner = self.lock();
        let was_connected = inner.connected;
        if was_connected {
            inner.changed = true;
            inner.changed_at = Utc::now();
        }
        inner.connected = false;
        inner.pending_disconnect = Some(was_connected);
    }

    /// Makes the next connection attempts fail until cleared.
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.lock().refuse_connect = refuse;
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connect_count
    }
}

pub struct LoopbackTransport {
    inner: Arc<Mutex<BrokerInner>>,
}

impl LoopbackTransport {
    /// Creates a connected pair: the transport half for the agent and the
    /// broker half for the test or tool driving it.
    pub fn new() -> (LoopbackTransport, LoopbackBroker) {
        let inner = Arc::new(Mutex::new(BrokerInner {
            connected: false,
            changed: false,
            changed_at: Utc::now(),
            refuse_connect: false,
            subscriptions: Vec::new(),
            published: Vec::new(),
            inbound: VecDeque::new(),
            pending_disconnect: None,
            next_msg_id: 0,
            connect_count: 0,
        }));
        (
            LoopbackTransport {
                inner: inner.clone(),
            },
            LoopbackBroker { inner },
        )
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().expect("loopback broker mutex poisoned")
    }

    fn connect_impl(&mut self, opts: &ConnectOptions) -> Result<()> {
        if opts.client_id.is_empty() {
            return Err(AgentError::new(ErrorKind::BadParameter, "client_id is required"));
        }
        let mut inner = self.lock();
        if inner.refuse_connect {
            return Err(AgentError::new(ErrorKind::Failure, "connection refused"));
        }
        if !inner.connected {
            inner.changed = true;
            inner.changed_at = Utc::now();
        }
        inner.connected = true;
        inner.connect_count += 1;
        Ok(())
    }

    fn ensure_connected(inner: &BrokerInner) -> Result<()> {
        if inner.connected {
            Ok(())
        } else {
            Err(AgentError::new(ErrorKind::NotInitialized, "not connected"))
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&mut self, opts: &ConnectOptions, _deadline: Duration) -> Result<()> {
        self.connect_impl(opts)
    }

    async fn reconnect(&mut self, opts: &ConnectOptions, _deadline: Duration) -> Result<()> {
        self.connect_impl(opts)
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut inner = self.lock();
        if inner.connected {
            inner.changed = true;
            inner.changed_at = Utc::now();
        }
        inner.connected = false;
        inner.pending_disconnect = Some(false);
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        _qos: QosLevel,
        _retain: bool,
    ) -> Result<u16> {
        let mut inner = self.lock();
        Self::ensure_connected(&inner)?;
        inner.published.push((topic.to_string(), payload.to_vec()));
        inner.next_msg_id = inner.next_msg_id.wrapping_add(1);
        if inner.next_msg_id == 0 {
            inner.next_msg_id = 1;
        }
        Ok(inner.next_msg_id)
    }

    async fn subscribe(&mut self, topic: &str, _qos: QosLevel) -> Result<()> {
        let mut inner = self.lock();
        Self::ensure_connected(&inner)?;
        if !inner.subscriptions.iter().any(|s| s == topic) {
            inner.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        let mut inner = self.lock();
        Self::ensure_connected(&inner)?;
        inner.subscriptions.retain(|s| s != topic);
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        let mut inner = self.lock();
        let snapshot = ConnectionStatus {
            connected: inner.connected,
            changed: inner.changed,
            changed_at: inner.changed_at,
        };
        inner.changed = false;
        snapshot
    }

    fn try_event(&mut self) -> Option<TransportEvent> {
        let mut inner = self.lock();
        if let Some(was_connected) = inner.pending_disconnect.take() {
            return Some(TransportEvent::Disconnected {
                unexpected: was_connected,
            });
        }
        while let Some((topic, payload)) = inner.inbound.pop_front() {
            if inner.subscriptions.iter().any(|f| topic_matches(f, &topic)) {
                return Some(TransportEvent::Message { topic, payload });
            }
            log::debug!("loopback dropping message on unsubscribed topic {topic:?}");
        }
        None
    }
}
