//! Broker connectivity over rumqttc.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport as RumqttcTransport,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::status::{AgentError, ErrorKind, Result};

use super::{
    effective_deadline, ConnectOptions, ConnectionStatus, MqttVersion, QosLevel, Transport,
    TransportEvent, KEEP_ALIVE,
};

/// Bound of the inbound event queue. The receive task copies packets here and
/// never blocks; when the agent falls this far behind, new messages are
/// dropped with a warning and redelivered by the broker at QoS 1.
const EVENT_QUEUE_BOUND: usize = 64;

struct StatusInner {
    connected: bool,
    changed: bool,
    changed_at: DateTime<Utc>,
}

pub struct MqttTransport {
    client: Option<AsyncClient>,
    status: Arc<Mutex<StatusInner>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: mpsc::Receiver<TransportEvent>,
    poll_cancel: Option<CancellationToken>,
    next_msg_id: u16,
}

impl MqttTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_BOUND);
        MqttTransport {
            client: None,
            status: Arc::new(Mutex::new(StatusInner {
                connected: false,
                changed: false,
                changed_at: Utc::now(),
            })),
            events_tx,
            events_rx,
            poll_cancel: None,
            next_msg_id: 0,
        }
    }

    fn assign_msg_id(&mut self) -> u16 {
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        if self.next_msg_id == 0 {
            self.next_msg_id = 1;
        }
        self.next_msg_id
    }

    fn client(&self) -> Result<&AsyncClient> {
        self.client
            .as_ref()
            .ok_or_else(|| AgentError::new(ErrorKind::NotInitialized, "transport not connected"))
    }

    async fn connect_impl(
        &mut self,
        opts: &ConnectOptions,
        deadline: Duration,
        clean_session: bool,
    ) -> Result<()> {
        if opts.client_id.is_empty() || opts.host.is_empty() {
            return Err(AgentError::new(
                ErrorKind::BadParameter,
                "client_id and host are required",
            ));
        }
        match opts.version {
            MqttVersion::Default | MqttVersion::V3_1_1 => {}
            MqttVersion::V3_1 => {
                log::error!("this broker backend speaks MQTT 3.1.1, version 3.1 was requested");
                return Err(AgentError::new(
                    ErrorKind::BadParameter,
                    "MQTT 3.1 is not supported by this backend",
                ));
            }
        }
        if let Some(proxy) = &opts.proxy {
            log::warn!(
                "ignoring unsupported proxy setting for broker connection: {}:{} ({:?})",
                proxy.host,
                proxy.port,
                proxy.proxy_type
            );
        }

        // Tear down any previous session before building a new one. The new
        // session gets its own status cell so that a lagging old task cannot
        // clobber the fresh connection state.
        self.teardown();
        let previous = self
            .status
            .lock()
            .expect("connection status mutex poisoned")
            .changed_at;
        self.status = Arc::new(Mutex::new(StatusInner {
            connected: false,
            changed: false,
            changed_at: previous,
        }));

        let url = opts.broker_url();
        log::debug!("connecting to {url}");

        let mut options = MqttOptions::new(&opts.client_id, &opts.host, opts.effective_port());
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(clean_session);
        if let (Some(username), Some(password)) = (&opts.username, &opts.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        if let Some(ssl) = &opts.ssl {
            let connector = build_tls_connector(ssl)?;
            options.set_transport(RumqttcTransport::Tls(TlsConfiguration::NativeConnector(
                connector,
            )));
        }

        let (client, eventloop) = AsyncClient::new(options, 10);

        let cancel = CancellationToken::new();
        let (connack_tx, connack_rx) = oneshot::channel();
        tokio::spawn(poll_session(
            eventloop,
            self.status.clone(),
            self.events_tx.clone(),
            cancel.clone(),
            connack_tx,
        ));

        self.client = Some(client);
        self.poll_cancel = Some(cancel);

        let deadline = effective_deadline(deadline);
        match tokio::time::timeout(deadline, connack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => {
                self.teardown();
                Err(e)
            }
            Ok(Err(_)) => {
                self.teardown();
                Err(AgentError::new(ErrorKind::Failure, "session ended before connack"))
            }
            Err(_) => {
                self.teardown();
                Err(AgentError::new(
                    ErrorKind::TimedOut,
                    format!("no connack from {url} within {deadline:?}"),
                ))
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(cancel) = self.poll_cancel.take() {
            cancel.cancel();
        }
        self.client = None;
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        MqttTransport::new()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self, opts: &ConnectOptions, deadline: Duration) -> Result<()> {
        self.connect_impl(opts, deadline, true).await
    }

    async fn reconnect(&mut self, opts: &ConnectOptions, deadline: Duration) -> Result<()> {
        self.connect_impl(opts, deadline, false).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        let client = self.client()?;
        client.disconnect().await?;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        retain: bool,
    ) -> Result<u16> {
        let client = self.client()?.clone();
        client
            .publish(topic, map_qos(qos), retain, payload.to_vec())
            .await?;
        Ok(self.assign_msg_id())
    }

    async fn subscribe(&mut self, topic: &str, qos: QosLevel) -> Result<()> {
        let client = self.client()?;
        client.subscribe(topic, map_qos(qos)).await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        let client = self.client()?;
        client.unsubscribe(topic).await?;
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        let mut inner = self.status.lock().expect("connection status mutex poisoned");
        let snapshot = ConnectionStatus {
            connected: inner.connected,
            changed: inner.changed,
            changed_at: inner.changed_at,
        };
        inner.changed = false;
        snapshot
    }

    fn try_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.try_recv().ok()
    }
}

fn map_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn build_tls_connector(ssl: &super::TlsOptions) -> Result<native_tls::TlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();
    if let Some(path) = &ssl.trust_store {
        let pem = fs::read(path)?;
        let cert = native_tls::Certificate::from_pem(&pem)
            .map_err(|e| AgentError::new(ErrorKind::BadParameter, format!("trust store: {e}")))?;
        builder.add_root_certificate(cert);
    }
    match (&ssl.client_cert, &ssl.client_key) {
        (Some(cert), Some(key)) => {
            let cert_pem = fs::read(cert)?;
            let key_pem = fs::read(key)?;
            let identity = native_tls::Identity::from_pkcs8(&cert_pem, &key_pem)
                .map_err(|e| AgentError::new(ErrorKind::BadParameter, format!("client identity: {e}")))?;
            builder.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(AgentError::new(
                ErrorKind::BadParameter,
                "client certificate and key must be configured together",
            ));
        }
    }
    if ssl.insecure {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    builder
        .build()
        .map_err(|e| AgentError::new(ErrorKind::Failure, format!("tls connector: {e}")))
}

/// Runs the rumqttc event loop for one session. The task exits on the first
/// connection error or on an outgoing disconnect; re-establishing the session
/// is the scheduler's job, never the transport's.
async fn poll_session(
    mut eventloop: rumqttc::EventLoop,
    status: Arc<Mutex<StatusInner>>,
    events_tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
    connack_tx: oneshot::Sender<Result<()>>,
) {
    let mut connack_tx = Some(connack_tx);

    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("broker session task stopping on cancellation");
                mark_disconnected(&status, &events_tx, false);
                return;
            }
            notification = eventloop.poll() => notification,
        };

        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    let mut inner = status.lock().expect("connection status mutex poisoned");
                    inner.connected = true;
                    inner.changed = true;
                    inner.changed_at = Utc::now();
                    drop(inner);
                    if let Some(tx) = connack_tx.take() {
                        _ = tx.send(Ok(()));
                    }
                } else {
                    log::warn!("broker refused connection: {:?}", ack.code);
                    if let Some(tx) = connack_tx.take() {
                        _ = tx.send(Err(AgentError::new(
                            ErrorKind::NoPermission,
                            format!("connection refused: {:?}", ack.code),
                        )));
                    }
                    mark_disconnected(&status, &events_tx, false);
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let event = TransportEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if events_tx.try_send(event).is_err() {
                    log::warn!(
                        "inbound event queue full, dropping message on {:?}",
                        publish.topic
                    );
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                _ = events_tx.try_send(TransportEvent::Delivered {
                    message_id: ack.pkid,
                });
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                log::debug!("broker session closed by disconnect request");
                mark_disconnected(&status, &events_tx, false);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                log::debug!("broker session error: {e}");
                if let Some(tx) = connack_tx.take() {
                    _ = tx.send(Err(AgentError::new(ErrorKind::Failure, e.to_string())));
                }
                mark_disconnected(&status, &events_tx, true);
                return;
            }
        }
    }
}

fn mark_disconnected(
    status: &Arc<Mutex<StatusInner>>,
    events_tx: &mpsc::Sender<TransportEvent>,
    failure: bool,
) {
    let mut inner = status.lock().expect("connection status mutex poisoned");
    let was_connected = inner.connected;
    if was_connected {
        inner.changed = true;
        inner.changed_at = Utc::now();
    }
    inner.connected = false;
    drop(inner);

    _ = events_tx.try_send(TransportEvent::Disconnected {
        unexpected: failure && was_connected,
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn rejects_mqtt_3_1() {
        let mut transport = MqttTransport::new();
        let opts = ConnectOptions {
            client_id: "dev".into(),
            host: "localhost".into(),
            version: MqttVersion::V3_1,
            ..ConnectOptions::default()
        };
        let err = transport
            .connect(&opts, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);
    }

    #[tokio::test]
    async fn rejects_missing_client_id() {
        let mut transport = MqttTransport::new();
        let opts = ConnectOptions {
            host: "localhost".into(),
            ..ConnectOptions::default()
        };
        let err = transport
            .connect(&opts, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);
    }

    #[tokio::test]
    async fn publish_before_connect_reports_not_initialized() {
        let mut transport = MqttTransport::new();
        let err = transport
            .publish("api", b"{}", QosLevel::AtLeastOnce, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }
}
