//! Agent scheduler and public entry point.
//!
//! The [`Agent`] owns the transport session, the codec, the registries and
//! the transfer engine. Its main loop ticks roughly once per second: it keeps
//! the session alive, drains outbound work, feeds inbound mailbox traffic to
//! the action dispatcher and persists unfinished transfers. Everything stops
//! when the shutdown token fires.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::actions::dispatch::ActionDispatcher;
use crate::actions::{ActionRegistry, CompletedRequest};
use crate::ota::OtaOrchestrator;
use crate::protocol::{self, Codec, Inbound};
use crate::status::{AgentError, ErrorKind, Result};
use crate::telemetry::{Sample, TelemetryRegistry};
use crate::transfer::persist::TransferStore;
use crate::transfer::{TransferConfig, TransferEngine};
use crate::transport::mqtt::MqttTransport;
use crate::transport::{
    ConnectOptions, MqttVersion, ProxyOptions, QosLevel, TlsOptions, Transport, TransportEvent,
};

pub mod config;
pub mod plugin;

use plugin::{Operation, Plugin, Step};

/// Cadence of the main loop.
const TICK: Duration = Duration::from_secs(1);

/// Deadline for one in-loop connection attempt.
const RECONNECT_DEADLINE: Duration = Duration::from_secs(1);

/// Connection loss is logged at most once per this window.
const LOSS_REPORT_WINDOW: Duration = Duration::from_secs(20);

/// Name of the sqlite file holding unfinished transfers.
const TRANSFER_DB_NAME: &str = "transfers.db";

/// Static configuration of one agent instance.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub device_id: String,
    /// Broker host. Ignored by transports that carry their own endpoint.
    pub host: String,
    /// Broker port; 0 selects the protocol default.
    pub port: u16,
    /// Application token presented as the MQTT password.
    pub token: Option<String>,
    pub ssl: Option<TlsOptions>,
    pub proxy: Option<ProxyOptions>,
    pub version: MqttVersion,
    /// Working directory for transfers, subprocess logs and update cycles.
    pub runtime_dir: PathBuf,
    /// QoS for agent-internal topics.
    pub qos: QosLevel,
    /// Override the caller's per-publish QoS with at-least-once.
    pub force_qos1: bool,
    /// Parallel transfer slots.
    pub workers: usize,
    /// Transfer attempts: 0 and 1 mean one try, -1 unlimited.
    pub max_retry: i32,
    /// Keep actions registered across shutdown.
    pub persistent_actions: bool,
    /// Persist unfinished transfers to disk and resume them on start.
    pub persist_transfers: bool,
}

impl AgentConfig {
    pub fn new(device_id: impl Into<String>, host: impl Into<String>) -> AgentConfig {
        AgentConfig {
            device_id: device_id.into(),
            host: host.into(),
            port: 0,
            token: None,
            ssl: None,
            proxy: None,
            version: MqttVersion::Default,
            runtime_dir: PathBuf::from("/var/lib/iot"),
            qos: QosLevel::AtLeastOnce,
            force_qos1: true,
            workers: crate::transfer::DEFAULT_WORKERS,
            max_retry: 3,
            persistent_actions: false,
            persist_transfers: true,
        }
    }
}

pub struct AgentBuilder {
    config: AgentConfig,
    transport: Option<Box<dyn Transport>>,
    plugins: Vec<Box<dyn Plugin>>,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig) -> AgentBuilder {
        AgentBuilder {
            config,
            transport: None,
            plugins: Vec::new(),
        }
    }

    /// Substitutes the transport backend, e.g. the loopback implementation.
    /// The default is the MQTT backend.
    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> AgentBuilder {
        self.transport = Some(transport);
        self
    }

    pub fn with_plugin(mut self, plugin: Box<dyn Plugin>) -> AgentBuilder {
        self.plugins.push(plugin);
        self
    }

    pub async fn build(self) -> Result<Agent> {
        if self.config.device_id.is_empty() {
            return Err(AgentError::new(ErrorKind::BadParameter, "device id is required"));
        }
        if self.config.workers == 0 {
            return Err(AgentError::new(
                ErrorKind::BadParameter,
                "at least one transfer worker is required",
            ));
        }

        std::fs::create_dir_all(&self.config.runtime_dir)?;

        // Assigned once per agent instance, never reused across restarts.
        let session_id = Uuid::new_v4().simple().to_string();

        let engine = TransferEngine::new(TransferConfig {
            workers: self.config.workers,
            max_retry: self.config.max_retry,
            proxy: self.config.proxy.clone(),
        });

        let store = if self.config.persist_transfers {
            let store = TransferStore::open(&self.config.runtime_dir.join(TRANSFER_DB_NAME)).await?;
            let unfinished = store.load().await?;
            if !unfinished.is_empty() {
                log::info!("resuming {} persisted transfers", unfinished.len());
                engine.restore(unfinished);
            }
            Some(store)
        } else {
            None
        };

        let ota = Arc::new(OtaOrchestrator::new(
            self.config.runtime_dir.clone(),
            engine.clone(),
        ));

        let actions = Arc::new(ActionRegistry::new());
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let dispatcher = ActionDispatcher::new(
            actions.clone(),
            completions_tx,
            self.config.runtime_dir.clone(),
        );

        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let telemetry = Arc::new(TelemetryRegistry::new(samples_tx, self.config.force_qos1));

        let transport = self
            .transport
            .unwrap_or_else(|| Box::new(MqttTransport::new()));
        let codec = Codec::new(&self.config.device_id, &session_id);

        Ok(Agent {
            codec,
            session_id,
            transport,
            actions,
            telemetry,
            dispatcher,
            engine,
            ota,
            store,
            samples_rx,
            completions_rx,
            plugins: self.plugins,
            shutdown: CancellationToken::new(),
            config: self.config,
            ever_connected: false,
            reconnect_count: 0,
            last_loss_report: None,
            last_persisted: None,
        })
    }
}

/// Cloneable handle onto a running agent, used by applications to register
/// actions and telemetry, start transfers and request shutdown.
#[derive(Clone)]
pub struct AgentHandle {
    device_id: String,
    session_id: String,
    actions: Arc<ActionRegistry>,
    telemetry: Arc<TelemetryRegistry>,
    transfers: TransferEngine,
    ota: Arc<OtaOrchestrator>,
    shutdown: CancellationToken,
}

impl AgentHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn thing_key(&self) -> String {
        protocol::compose_thing_key(&self.device_id, &self.session_id)
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn telemetry(&self) -> &TelemetryRegistry {
        &self.telemetry
    }

    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    pub fn ota(&self) -> Arc<OtaOrchestrator> {
        self.ota.clone()
    }

    /// Requests the agent loop to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub struct Agent {
    config: AgentConfig,
    session_id: String,
    transport: Box<dyn Transport>,
    codec: Codec,
    actions: Arc<ActionRegistry>,
    telemetry: Arc<TelemetryRegistry>,
    dispatcher: ActionDispatcher,
    engine: TransferEngine,
    ota: Arc<OtaOrchestrator>,
    store: Option<TransferStore>,
    samples_rx: UnboundedReceiver<Sample>,
    completions_rx: UnboundedReceiver<CompletedRequest>,
    plugins: Vec<Box<dyn Plugin>>,
    shutdown: CancellationToken,
    ever_connected: bool,
    reconnect_count: u32,
    last_loss_report: Option<DateTime<Utc>>,
    last_persisted: Option<Vec<String>>,
}

impl Agent {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            device_id: self.config.device_id.clone(),
            session_id: self.session_id.clone(),
            actions: self.actions.clone(),
            telemetry: self.telemetry.clone(),
            transfers: self.engine.clone(),
            ota: self.ota.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Runs the main loop until shutdown is requested.
    pub async fn run(mut self) -> Result<()> {
        log::info!(
            "agent for device {:?} starting (session {})",
            self.config.device_id,
            self.session_id
        );

        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick().await;
        }

        self.finish().await
    }

    async fn tick(&mut self) {
        self.run_plugins(Operation::Iteration);
        self.connect_check().await;
        self.drain_events().await;
        self.drain_samples().await;
        self.drain_completions().await;
        self.persist_transfers().await;
    }

    fn connect_options(&self) -> ConnectOptions {
        let thing_key =
            protocol::compose_thing_key(&self.config.device_id, &self.session_id);
        ConnectOptions {
            client_id: self.session_id.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            username: Some(thing_key),
            password: self.config.token.clone(),
            ssl: self.config.ssl.clone(),
            proxy: self.config.proxy.clone(),
            version: self.config.version,
        }
    }

    async fn connect_check(&mut self) {
        let status = self.transport.status();
        if status.connected {
            return;
        }

        let opts = self.connect_options();
        let result = if self.ever_connected {
            self.reconnect_count += 1;
            log::debug!("reconnect attempt {} to {}", self.reconnect_count, opts.broker_url());
            self.transport.reconnect(&opts, RECONNECT_DEADLINE).await
        } else {
            self.transport.connect(&opts, RECONNECT_DEADLINE).await
        };

        match result {
            Ok(()) => {
                self.ever_connected = true;
                self.reconnect_count = 0;
                self.last_loss_report = None;
                if let Err(e) = self.post_connect().await {
                    log::warn!("post-connect setup failed: {e}");
                }
            }
            Err(e) => {
                log::debug!("connection attempt failed: {e}");
                self.report_connection_loss(status.changed_at);
            }
        }
    }

    /// Subscriptions and the mailbox poll that follow every (re)connect.
    async fn post_connect(&mut self) -> Result<()> {
        self.codec.rebind(&self.config.device_id, &self.session_id);
        log::info!(
            "connected to the cloud as {:?}",
            self.codec.thing_key()
        );
        self.run_plugins(Operation::ClientConnect);

        self.transport
            .subscribe(protocol::REPLY_TOPIC_FILTER, self.config.qos)
            .await?;
        self.transport
            .subscribe(protocol::MAILBOX_NOTIFY_TOPIC, self.config.qos)
            .await?;

        let check = self.codec.encode_mailbox_check();
        self.transport
            .publish(protocol::API_TOPIC, &check, self.config.qos, false)
            .await?;

        self.telemetry.commit();
        Ok(())
    }

    fn report_connection_loss(&mut self, changed_at: DateTime<Utc>) {
        let now = Utc::now();
        let since_change = now.signed_duration_since(changed_at);
        let window =
            chrono::Duration::from_std(LOSS_REPORT_WINDOW).expect("constant window fits");
        if since_change < window {
            return;
        }
        if let Some(reported_at) = self.last_loss_report {
            if now.signed_duration_since(reported_at) < window {
                return;
            }
        }
        log::info!(
            "connection lost for {} seconds",
            since_change.num_seconds()
        );
        self.last_loss_report = Some(now);
    }

    async fn drain_events(&mut self) {
        while let Some(event) = self.transport.try_event() {
            match event {
                TransportEvent::Message { topic, payload } => {
                    self.handle_message(&topic, &payload).await;
                }
                TransportEvent::Delivered { message_id } => {
                    log::trace!("delivery confirmed for message {message_id}");
                }
                TransportEvent::Disconnected { unexpected } => {
                    if unexpected {
                        log::warn!("connection to the cloud dropped unexpectedly");
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        match self.codec.decode(topic, payload) {
            Ok(Inbound::MailboxActivity) => {
                log::debug!("mailbox activity for this thing, polling");
                let check = self.codec.encode_mailbox_check();
                if let Err(e) = self
                    .transport
                    .publish(protocol::API_TOPIC, &check, self.config.qos, false)
                    .await
                {
                    log::warn!("mailbox poll failed: {e}");
                }
            }
            Ok(Inbound::Requests(requests)) => {
                for request in requests {
                    if let Err(rejected) = self.dispatcher.submit(request) {
                        log::warn!(
                            "rejecting request {}: {}",
                            rejected.request.request_id,
                            rejected.error
                        );
                        self.acknowledge(&CompletedRequest {
                            request: rejected.request,
                            result: Err(rejected.error),
                        })
                        .await;
                    }
                }
            }
            Ok(Inbound::Ignored) => {}
            Err(e) => log::warn!("failed to parse message on {topic:?}: {e}"),
        }
    }

    async fn drain_samples(&mut self) {
        while let Ok(sample) = self.samples_rx.try_recv() {
            self.run_plugins(Operation::TelemetryPublish {
                key: &sample.key,
                value: &sample.value,
            });
            let payload = self
                .codec
                .encode_publish(&sample.key, &sample.value, Some(sample.ts));
            if let Err(e) = self
                .transport
                .publish(protocol::API_TOPIC, &payload, sample.qos, false)
                .await
            {
                log::warn!("publish of {:?} failed: {e}", sample.key);
            }
        }
    }

    async fn drain_completions(&mut self) {
        while let Ok(completed) = self.completions_rx.try_recv() {
            self.run_plugins(Operation::ActionComplete {
                request: &completed.request,
            });
            self.acknowledge(&completed).await;
        }
    }

    async fn acknowledge(&mut self, completed: &CompletedRequest) {
        let payload = self
            .codec
            .encode_mailbox_ack(&completed.request, &completed.result);
        if let Err(e) = self
            .transport
            .publish(protocol::API_TOPIC, &payload, self.config.qos, false)
            .await
        {
            log::error!(
                "acknowledgement of request {} failed: {e}",
                completed.request.request_id
            );
        }
    }

    async fn persist_transfers(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = self.engine.snapshot_unfinished();
        let fingerprint: Vec<String> = snapshot
            .iter()
            .map(|request| format!("{}|{}", request.url, request.local_path.display()))
            .collect();
        if self.last_persisted.as_ref() == Some(&fingerprint) {
            return;
        }
        match store.save(&snapshot).await {
            Ok(()) => self.last_persisted = Some(fingerprint),
            Err(e) => log::warn!("unable to persist transfers: {e}"),
        }
    }

    fn run_plugins(&mut self, op: Operation<'_>) {
        for step in [Step::Before, Step::During, Step::After] {
            for plugin in &mut self.plugins {
                if let Err(e) = plugin.execute(&op, step, TICK) {
                    log::warn!(
                        "plugin {:?} failed during {op:?} ({step:?}): {e}",
                        plugin.name()
                    );
                }
            }
        }
    }

    async fn finish(mut self) -> Result<()> {
        log::info!("agent shutting down");
        self.run_plugins(Operation::ClientDisconnect);

        if self.transport.status().connected {
            if let Err(e) = self.transport.disconnect().await {
                log::warn!("disconnect failed: {e}");
            }
        }

        if !self.config.persistent_actions {
            self.actions.deregister_all();
        }

        // Persist what is still unfinished, then stop the workers.
        self.persist_transfers().await;
        self.engine.cancel_all();
        Ok(())
    }
}
