//! AT protocol engine: request/response over a half-duplex line protocol.
//!
//! At most one command is outstanding. Callers queue on `command_lock`; the
//! command in flight parks its reply sender in the single `pending` slot and
//! the reader task completes it when a terminal line (`OK`, `ERROR`, `>`)
//! arrives. Storage indications (`+CDSI`, `+CMTI`) are recognised by the reader
//! and handled on their own task, which reads the record through the same
//! lock like any other caller.
//!
//! A command that times out may still be answered later. The next command
//! first writes ESC and waits a short settle window with no slot installed, so
//! a late `OK` is dropped as unsolicited instead of completing the wrong turn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::at::{self, InboundSms, Notification, Registration, StatusReport, Terminal};
use super::error::{AtError, InitError, TransportError};
use super::transport::{ModemLink, ModemTransport, TransportEvent};
use crate::logutil::{escape_log, preview, redact_command};
use crate::metrics;

/// Upper bound on the quiet period after a timed-out command.
const RESYNC_SETTLE: Duration = Duration::from_millis(250);

/// Parsed output of the engine that is not a reply to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A stored status report was read and parsed.
    DeliveryReport(StatusReport),
    /// An inbound SMS matched an opt-out keyword.
    OptOut { phone: String },
    /// An inbound SMS that is not an opt-out.
    InboundMessage(InboundSms),
    /// A line that is neither a notification nor part of a command reply.
    Unsolicited(String),
    /// The reader saw the link end.
    LinkClosed(Option<String>),
}

/// What the initialization sequence learned about the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemIdentity {
    pub signal_strength: u8,
    pub registration: Option<Registration>,
    pub imsi: Option<String>,
}

struct PendingCommand {
    command: String,
    expect_prompt: bool,
    /// The previous line was an SMS-DELIVER header; the next one is message text.
    text_follows: bool,
    lines: Vec<String>,
    done: oneshot::Sender<Result<String, AtError>>,
}

pub struct AtEngine {
    transport: ModemTransport,
    command_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Option<PendingCommand>>,
    timeout: Duration,
    resync: AtomicBool,
    events: mpsc::UnboundedSender<EngineEvent>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl AtEngine {
    /// Take ownership of an open link and start routing its lines.
    pub fn start(
        link: ModemLink,
        timeout: Duration,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            transport: link.transport,
            command_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            timeout,
            resync: AtomicBool::new(false),
            events,
            reader: Mutex::new(None),
        });
        let handle = tokio::spawn(read_loop(Arc::downgrade(&engine), link.lines));
        *engine.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        engine
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn port_name(&self) -> &str {
        self.transport.port_name()
    }

    /// Send one command and wait for `OK` (resolves with the reply lines joined
    /// by `\n`) or an error line (fails with [`AtError::Protocol`]).
    pub async fn send_command(&self, command: &str) -> Result<String, AtError> {
        let _turn = self.command_lock.lock().await;
        self.exchange(format!("{}\r\n", command), command, false)
            .await
    }

    /// Submit one SMS: address the recipient, wait for the body prompt, then
    /// write the body terminated by Ctrl+Z. Both halves run under one turn so
    /// no other command can land between prompt and body.
    ///
    /// Returns the network message reference when the modem reports one.
    pub async fn send_sms(&self, phone: &str, body: &str) -> Result<Option<u8>, AtError> {
        let _turn = self.command_lock.lock().await;
        let address = at::address_recipient(phone);
        self.exchange(format!("{}\r", address), &address, true)
            .await?;
        let label = format!("{} <body>", address);
        match self.exchange(at::message_body(body), &label, false).await {
            Ok(reply) => Ok(at::parse_message_reference(&reply)),
            Err(e) => {
                if !e.is_link_failure() {
                    // ESC abandons a body the modem may still be waiting on
                    let _ = self.transport.write("\x1B");
                }
                Err(e)
            }
        }
    }

    /// Live signal quality, 0-31.
    pub async fn signal_strength(&self) -> Result<u8, AtError> {
        let reply = self.send_command(at::SIGNAL_QUALITY).await?;
        Ok(at::parse_signal_strength(&reply))
    }

    /// Live operator name, or the `Unknown` sentinel.
    pub async fn operator(&self) -> Result<String, AtError> {
        let reply = self.send_command(at::OPERATOR_SELECTION).await?;
        Ok(at::parse_operator(&reply))
    }

    /// Connect-time sequence. Each step must succeed before the next runs.
    pub async fn initialize(&self, sim_pin: Option<&str>) -> Result<ModemIdentity, InitError> {
        let step = |step: &'static str| move |source: AtError| InitError { step, source };

        self.send_command(at::ATTENTION)
            .await
            .map_err(step("responsiveness check"))?;
        self.send_command(at::TEXT_MODE)
            .await
            .map_err(step("text mode"))?;
        self.send_command(at::NEW_MESSAGE_INDICATIONS)
            .await
            .map_err(step("notification mode"))?;
        self.send_command(at::REQUEST_STATUS_REPORTS)
            .await
            .map_err(step("status report request"))?;
        if let Some(pin) = sim_pin {
            self.send_command(&at::unlock_sim(pin))
                .await
                .map_err(step("SIM unlock"))?;
        }
        let signal_strength = self
            .signal_strength()
            .await
            .map_err(step("signal strength"))?;
        let registration = at::parse_registration(
            &self
                .send_command(at::NETWORK_REGISTRATION)
                .await
                .map_err(step("network registration"))?,
        );
        let imsi = self
            .send_command(at::SUBSCRIBER_IDENTITY)
            .await
            .map_err(step("SIM identity"))?
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string);

        match registration {
            Some(r) if r.is_registered() => info!("Modem registered ({:?})", r),
            other => warn!("Modem not registered on a network ({:?})", other),
        }
        Ok(ModemIdentity {
            signal_strength,
            registration,
            imsi,
        })
    }

    /// Close the link, fail any waiting command and stop the reader.
    pub fn close(&self) {
        self.transport.close();
        self.fail_pending(|| AtError::NotConnected);
        if let Some(handle) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// One write + wait. Caller holds `command_lock`.
    async fn exchange(&self, raw: String, label: &str, expect_prompt: bool) -> Result<String, AtError> {
        if !self.transport.is_open() {
            return Err(AtError::NotConnected);
        }
        if self.resync.swap(false, Ordering::AcqRel) {
            self.settle().await;
        }
        let (tx, rx) = oneshot::channel();
        *self.slot() = Some(PendingCommand {
            command: label.to_string(),
            expect_prompt,
            text_follows: false,
            lines: Vec::new(),
            done: tx,
        });
        debug!("AT> {}", redact_command(label));
        if let Err(e) = self.transport.write(&raw) {
            self.slot().take();
            return Err(e.into());
        }
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AtError::NotConnected),
            Err(_) => {
                self.slot().take();
                self.resync.store(true, Ordering::Release);
                metrics::inc_command_timeouts();
                warn!(
                    "AT command {} got no terminal response within {}ms",
                    redact_command(label),
                    self.timeout.as_millis()
                );
                Err(AtError::Timeout {
                    command: redact_command(label),
                    after: self.timeout,
                })
            }
        }
    }

    /// Abandon whatever the modem may still be doing for a timed-out command
    /// and let its late reply drain with no command installed.
    async fn settle(&self) {
        debug!("Resynchronising modem after a timeout");
        let _ = self.transport.write("\x1B");
        tokio::time::sleep(RESYNC_SETTLE.min(self.timeout / 2)).await;
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<PendingCommand>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fail_pending(&self, err: impl FnOnce() -> AtError) {
        if let Some(p) = self.slot().take() {
            let _ = p.done.send(Err(err()));
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn route_line(self: &Arc<Self>, line: String) {
        if let Some(notification) = at::parse_notification(&line) {
            debug!("Modem indication: {}", escape_log(&line));
            tokio::spawn(self.clone().handle_notification(notification));
            return;
        }

        let mut slot = self.slot();
        if slot.is_none() {
            drop(slot);
            trace!("Unsolicited: {}", escape_log(&line));
            self.emit(EngineEvent::Unsolicited(line));
            return;
        }
        let Some(pending) = slot.as_mut() else {
            return;
        };
        if pending.text_follows {
            // Message text, even when it reads "OK" or starts with '>'
            pending.text_follows = false;
            pending.lines.push(line);
            return;
        }
        if line == pending.command {
            // Command echo (ATE1)
            return;
        }
        let outcome = match at::classify_terminal(&line) {
            Some(Terminal::Ok) => Ok(()),
            Some(Terminal::Error(detail)) => Err(detail),
            Some(Terminal::Prompt) if pending.expect_prompt => Ok(()),
            Some(Terminal::Prompt) | None => {
                pending.text_follows = at::announces_text(&line);
                pending.lines.push(line);
                return;
            }
        };
        if let Some(done) = slot.take() {
            let result = match outcome {
                Ok(()) => Ok(done.lines.join("\n")),
                Err(detail) => Err(AtError::Protocol {
                    command: redact_command(&done.command),
                    detail,
                }),
            };
            let _ = done.done.send(result);
        }
    }

    async fn handle_notification(self: Arc<Self>, notification: Notification) {
        let index = match notification {
            Notification::DeliveryReport { index, .. } => {
                match self.send_command(&at::read_record(index)).await {
                    Ok(reply) => match at::parse_status_report(&reply) {
                        Some(report) => {
                            debug!(
                                "Status report mr={} to {} st={}",
                                report.reference, report.phone, report.status
                            );
                            self.emit(EngineEvent::DeliveryReport(report));
                        }
                        None => warn!("Unparseable status report: {}", escape_log(&reply)),
                    },
                    Err(e) => warn!("Failed to read status report {}: {}", index, e),
                }
                index
            }
            Notification::InboundMessage { index, .. } => {
                match self.send_command(&at::read_record(index)).await {
                    Ok(reply) => match at::parse_inbound_sms(&reply) {
                        Some(sms) if at::is_opt_out(&sms.body) => {
                            info!("Opt-out received from {}", sms.phone);
                            self.emit(EngineEvent::OptOut { phone: sms.phone });
                        }
                        Some(sms) => {
                            debug!("Inbound SMS from {}: {}", sms.phone, preview(&sms.body, 40));
                            self.emit(EngineEvent::InboundMessage(sms));
                        }
                        None => warn!("Unparseable inbound SMS: {}", escape_log(&reply)),
                    },
                    Err(e) => warn!("Failed to read inbound SMS {}: {}", index, e),
                }
                index
            }
        };
        if let Err(e) = self.send_command(&at::delete_record(index)).await {
            debug!("Could not delete record {}: {}", index, e);
        }
    }
}

async fn read_loop(engine: Weak<AtEngine>, mut lines: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = lines.recv().await {
        let Some(engine) = engine.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Line(line) => engine.route_line(line),
            TransportEvent::Closed(reason) => {
                engine.transport.close();
                engine.fail_pending(|| AtError::Transport(TransportError::Closed));
                engine.emit(EngineEvent::LinkClosed(reason));
                return;
            }
        }
    }
    // Sender gone without a Closed marker
    if let Some(engine) = engine.upgrade() {
        engine.transport.close();
        engine.fail_pending(|| AtError::Transport(TransportError::Closed));
        engine.emit(EngineEvent::LinkClosed(None));
    }
}
