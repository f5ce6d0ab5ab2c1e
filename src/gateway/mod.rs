//! # Gateway Facade
//!
//! [`SmsGateway`] is the one object the rest of the system talks to. It owns
//! the connection state, the AT engine of the current link and the outbound
//! queue, and reports everything that happens on a single tagged
//! [`GatewayEvent`] channel handed out at construction.
//!
//! ```rust,no_run
//! use smsgate::config::Config;
//! use smsgate::gateway::{QueuedMessage, SmsGateway};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let (gateway, mut events) = SmsGateway::new(config.gateway_config(), config.tuning());
//!     gateway.connect().await;
//!     gateway.queue_message(QueuedMessage::new("+15551234567", "Hello", "42"));
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Messages submitted while disconnected stay queued and drain as soon as a
//! `connect()` succeeds. A link lost mid-drain stops the drain before the next
//! message is taken.

pub mod queue;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{GatewayConfig, GatewayTuning};
use crate::logutil::preview;
use crate::metrics;
use crate::modem::at::{ReportStatus, UNKNOWN_OPERATOR};
use crate::modem::engine::{AtEngine, EngineEvent};
use crate::modem::error::{InitError, TransportError};
use crate::modem::transport::{ModemLink, ModemTransport};
use crate::validation::{validate_body, validate_phone};
use queue::OutboundQueue;

/// One submission to the outbound queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedMessage {
    pub phone: String,
    pub body: String,
    pub correlation_id: String,
}

impl QueuedMessage {
    pub fn new(
        phone: impl Into<String>,
        body: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            phone: phone.into(),
            body: body.into(),
            correlation_id: correlation_id.into(),
        }
    }

    /// A one-off message with a random correlation id.
    pub fn adhoc(phone: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(phone, body, uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Sent,
    Delivered,
    Failed,
}

/// Terminal result for one message attempt, or a later carrier status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcome {
    /// `None` for a status report that matches no send of this process.
    pub correlation_id: Option<String>,
    pub phone: String,
    pub outcome: Outcome,
    pub error: Option<String>,
    /// Network message reference assigned by the modem on submit.
    pub reference: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryOutcome {
    fn new(correlation_id: Option<String>, phone: String, outcome: Outcome) -> Self {
        Self {
            correlation_id,
            phone,
            outcome,
            error: None,
            reference: None,
            timestamp: Utc::now(),
        }
    }

    fn failed(msg: &QueuedMessage, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(Some(msg.correlation_id.clone()), msg.phone.clone(), Outcome::Failed)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Connected,
    Disconnected { reason: Option<String> },
    MessageProcessed(DeliveryOutcome),
    OptOut { phone: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub connected: bool,
    pub signal_strength: u8,
    pub sim_provider: String,
    pub queue_length: usize,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Init(#[from] InitError),
}

/// Opens the link for a connect attempt. Serial by default.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &GatewayConfig) -> Result<ModemLink, TransportError>;
}

pub struct SerialConnector;

#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, config: &GatewayConfig) -> Result<ModemLink, TransportError> {
        ModemTransport::open(config).await
    }
}

/// Where submitted work goes. Implemented by the gateway; the scheduler only
/// depends on this.
pub trait OutboundSink: Send + Sync {
    fn submit(&self, msg: QueuedMessage);
}

#[derive(Debug, Clone)]
struct LinkSnapshot {
    signal_strength: u8,
    operator: String,
    imsi: Option<String>,
}

impl Default for LinkSnapshot {
    fn default() -> Self {
        Self {
            signal_strength: 0,
            operator: UNKNOWN_OPERATOR.to_string(),
            imsi: None,
        }
    }
}

/// Who a network message reference was assigned to.
struct SentRecord {
    correlation_id: String,
    phone: String,
}

struct GatewayInner {
    config: GatewayConfig,
    tuning: GatewayTuning,
    connector: Box<dyn Connector>,
    connect_lock: tokio::sync::Mutex<()>,
    state: Mutex<ConnectionState>,
    engine: Mutex<Option<Arc<AtEngine>>>,
    queue: OutboundQueue,
    events: mpsc::UnboundedSender<GatewayEvent>,
    last_known: Mutex<LinkSnapshot>,
    references: Mutex<HashMap<u8, SentRecord>>,
}

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
pub struct SmsGateway {
    inner: Arc<GatewayInner>,
}

impl SmsGateway {
    /// Gateway over the configured serial port, plus its event stream.
    pub fn new(
        config: GatewayConfig,
        tuning: GatewayTuning,
    ) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        Self::with_connector(config, tuning, Box::new(SerialConnector))
    }

    pub fn with_connector(
        config: GatewayConfig,
        tuning: GatewayTuning,
        connector: Box<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(GatewayInner {
            config,
            tuning,
            connector,
            connect_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(ConnectionState::Disconnected),
            engine: Mutex::new(None),
            queue: OutboundQueue::new(),
            events: tx,
            last_known: Mutex::new(LinkSnapshot::default()),
            references: Mutex::new(HashMap::new()),
        });
        (Self { inner }, rx)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *locked(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn queue_length(&self) -> usize {
        self.inner.queue.len()
    }

    /// IMSI read during the last successful initialization.
    pub fn imsi(&self) -> Option<String> {
        locked(&self.inner.last_known).imsi.clone()
    }

    /// Open and initialize the modem. Failures are logged and leave the
    /// gateway disconnected; see [`SmsGateway::try_connect`] for the cause.
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(()) => true,
            Err(e) => {
                error!("SMS gateway connection failed: {}", e);
                false
            }
        }
    }

    pub async fn try_connect(&self) -> Result<(), GatewayError> {
        let inner = &self.inner;
        let _attempt = inner.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        inner.set_state(ConnectionState::Connecting);

        let link = match inner.connector.open(&inner.config).await {
            Ok(link) => link,
            Err(e) => {
                inner.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = AtEngine::start(link, inner.tuning.command_timeout, tx);
        tokio::spawn(forward_engine_events(
            Arc::downgrade(inner),
            Arc::downgrade(&engine),
            rx,
        ));

        let identity = match engine.initialize(inner.config.sim_pin()).await {
            Ok(identity) => identity,
            Err(e) => {
                engine.close();
                inner.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };
        {
            let mut last = locked(&inner.last_known);
            last.signal_strength = identity.signal_strength;
            last.imsi = identity.imsi.clone();
        }
        *locked(&inner.engine) = Some(engine);
        inner.set_state(ConnectionState::Connected);
        info!(
            "SMS gateway connected on {} (signal {}/31)",
            inner.config.port(),
            identity.signal_strength
        );
        inner.emit(GatewayEvent::Connected);

        if inner.queue.try_begin_drain() {
            debug!("Draining {} message(s) queued while offline", inner.queue.len());
            tokio::spawn(drain(inner.clone()));
        }
        Ok(())
    }

    /// Close the link. Queued messages stay queued.
    pub fn disconnect(&self) {
        let engine = locked(&self.inner.engine).take();
        if let Some(engine) = engine {
            engine.close();
            self.inner.set_state(ConnectionState::Disconnected);
            info!("SMS gateway disconnected");
            self.inner.emit(GatewayEvent::Disconnected { reason: None });
        }
    }

    /// Append to the outbound queue; starts the drain if none is active and the
    /// link is up. Every submission eventually yields one `MessageProcessed`.
    pub fn queue_message(&self, msg: QueuedMessage) {
        trace!(
            "Queueing {} for {}: {}",
            msg.correlation_id,
            msg.phone,
            preview(&msg.body, 40)
        );
        if self.inner.queue.push(msg, self.is_connected()) {
            tokio::spawn(drain(self.inner.clone()));
        }
    }

    /// Best-effort status. Live signal and operator queries fall back to the
    /// last known values when they fail.
    pub async fn get_status(&self) -> GatewayStatus {
        let engine = if self.is_connected() {
            locked(&self.inner.engine).clone()
        } else {
            None
        };
        let Some(engine) = engine else {
            return GatewayStatus {
                connected: false,
                signal_strength: 0,
                sim_provider: UNKNOWN_OPERATOR.to_string(),
                queue_length: self.queue_length(),
            };
        };

        match engine.signal_strength().await {
            Ok(signal) => locked(&self.inner.last_known).signal_strength = signal,
            Err(e) => debug!("Signal query failed, using last known value: {}", e),
        }
        match engine.operator().await {
            Ok(operator) => locked(&self.inner.last_known).operator = operator,
            Err(e) => debug!("Operator query failed, using last known value: {}", e),
        }
        let last = locked(&self.inner.last_known).clone();
        GatewayStatus {
            connected: self.is_connected(),
            signal_strength: last.signal_strength,
            sim_provider: last.operator,
            queue_length: self.queue_length(),
        }
    }
}

impl OutboundSink for SmsGateway {
    fn submit(&self, msg: QueuedMessage) {
        self.queue_message(msg);
    }
}

impl GatewayInner {
    fn set_state(&self, state: ConnectionState) {
        *locked(&self.state) = state;
    }

    fn emit(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }

    /// Engine for the drain, only while connected.
    fn live_engine(&self) -> Option<Arc<AtEngine>> {
        if *locked(&self.state) != ConnectionState::Connected {
            return None;
        }
        locked(&self.engine).clone()
    }

    /// Drop to disconnected if `engine` is still the current link.
    fn link_lost(&self, engine: &Weak<AtEngine>, reason: Option<String>) {
        {
            let mut current = locked(&self.engine);
            let is_current = current
                .as_ref()
                .is_some_and(|e| Weak::ptr_eq(engine, &Arc::downgrade(e)));
            if !is_current {
                return;
            }
            if let Some(e) = current.take() {
                e.close();
            }
        }
        self.set_state(ConnectionState::Disconnected);
        error!(
            "SMS gateway link lost: {}",
            reason.as_deref().unwrap_or("closed")
        );
        self.emit(GatewayEvent::Disconnected { reason });
    }

    async fn send_one(&self, engine: &Arc<AtEngine>, msg: QueuedMessage) -> DeliveryOutcome {
        let phone = match validate_phone(&msg.phone) {
            Ok(phone) => phone,
            Err(e) => return DeliveryOutcome::failed(&msg, e.to_string()),
        };
        if let Err(e) = validate_body(&msg.body) {
            return DeliveryOutcome::failed(&msg, e.to_string());
        }

        let started = Instant::now();
        match engine.send_sms(&phone, &msg.body).await {
            Ok(reference) => {
                metrics::observe_send_latency(started);
                if let Some(mr) = reference {
                    locked(&self.references).insert(
                        mr,
                        SentRecord {
                            correlation_id: msg.correlation_id.clone(),
                            phone: msg.phone.clone(),
                        },
                    );
                }
                debug!("Sent {} to {} (mr={:?})", msg.correlation_id, phone, reference);
                DeliveryOutcome {
                    reference,
                    ..DeliveryOutcome::new(Some(msg.correlation_id), msg.phone, Outcome::Sent)
                }
            }
            Err(e) => {
                warn!("Send of {} to {} failed: {}", msg.correlation_id, phone, e);
                if e.is_link_failure() {
                    self.link_lost(&Arc::downgrade(engine), Some(e.to_string()));
                }
                DeliveryOutcome::failed(&msg, format!("Failed to send SMS: {}", e))
            }
        }
    }

    fn on_status_report(&self, report: crate::modem::at::StatusReport) {
        let (outcome, error) = match report.verdict() {
            ReportStatus::Delivered => (Outcome::Delivered, None),
            ReportStatus::Failed(st) => (
                Outcome::Failed,
                Some(format!("carrier status report 0x{:02X}", st)),
            ),
            ReportStatus::Pending => {
                debug!("mr={} still pending at the SMSC", report.reference);
                return;
            }
        };
        let record = locked(&self.references).remove(&report.reference);
        let (correlation_id, phone) = match record {
            Some(r) => (Some(r.correlation_id), r.phone),
            None => {
                debug!("Status report mr={} matches no send", report.reference);
                (None, report.phone)
            }
        };
        match outcome {
            Outcome::Delivered => metrics::inc_sms_delivered(),
            _ => metrics::inc_sms_report_failed(),
        }
        self.emit(GatewayEvent::MessageProcessed(DeliveryOutcome {
            error,
            reference: Some(report.reference),
            ..DeliveryOutcome::new(correlation_id, phone, outcome)
        }));
    }
}

/// The drain loop. Exactly one runs per gateway at a time (see [`OutboundQueue`]).
async fn drain(inner: Arc<GatewayInner>) {
    loop {
        let Some(engine) = inner.live_engine() else {
            inner.queue.halt();
            // A connect may have landed between the check and the halt
            if inner.live_engine().is_some() && inner.queue.try_begin_drain() {
                continue;
            }
            debug!("Drain paused, {} message(s) held until reconnect", inner.queue.len());
            return;
        };
        let Some(msg) = inner.queue.next() else {
            return;
        };

        let outcome = inner.send_one(&engine, msg).await;
        match outcome.outcome {
            Outcome::Failed => metrics::inc_sms_failed(),
            _ => metrics::inc_sms_sent(),
        }
        inner.emit(GatewayEvent::MessageProcessed(outcome));

        tokio::time::sleep(inner.tuning.rate_limit).await;
    }
}

async fn forward_engine_events(
    inner: Weak<GatewayInner>,
    engine: Weak<AtEngine>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            EngineEvent::DeliveryReport(report) => inner.on_status_report(report),
            EngineEvent::OptOut { phone } => {
                metrics::inc_opt_outs();
                inner.emit(GatewayEvent::OptOut { phone });
            }
            EngineEvent::InboundMessage(sms) => {
                debug!("Ignoring inbound SMS from {}", sms.phone);
            }
            EngineEvent::Unsolicited(line) => trace!("Unclassified modem line: {}", line),
            EngineEvent::LinkClosed(reason) => {
                inner.link_lost(&engine, reason);
                return;
            }
        }
    }
}
