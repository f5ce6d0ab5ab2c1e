//! Scripted modem used by the integration tests.
//!
//! [`SimModem`] is the `Write` half of a link: every complete command written
//! to it is answered synchronously by pushing response lines into the
//! transport channel, the way a real modem's replies would arrive from the
//! reader thread. Behaviour is a small AT happy path that individual tests
//! override per command prefix.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use smsgate::config::{GatewayConfig, GatewayTuning};
use smsgate::gateway::{Connector, GatewayEvent, SmsGateway};
use smsgate::modem::{ModemLink, ModemTransport, TransportError, TransportEvent};

/// How the simulator answers a command prefix.
#[derive(Debug, Clone)]
pub enum Reply {
    Lines(Vec<String>),
    Error,
    Silent,
}

#[derive(Default)]
struct SimState {
    lines: Option<mpsc::UnboundedSender<TransportEvent>>,
    buf: Vec<u8>,
    awaiting_body: bool,
    written: Vec<String>,
    bodies: Vec<(String, Instant)>,
    overrides: Vec<(String, Reply)>,
    records: HashMap<u32, Vec<String>>,
    next_reference: u8,
    busy_body_error: bool,
}

#[derive(Clone, Default)]
pub struct SimModem {
    state: Arc<Mutex<SimState>>,
}

fn s(v: &str) -> String {
    v.to_string()
}

impl SimModem {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    /// Fresh link wired to this simulator.
    pub fn link(&self) -> ModemLink {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut st = self.lock();
            st.lines = Some(tx);
            st.buf.clear();
            st.awaiting_body = false;
        }
        ModemLink {
            transport: ModemTransport::new("sim", Box::new(self.clone())),
            lines: rx,
        }
    }

    /// Answer commands starting with `prefix` this way from now on.
    pub fn on(&self, prefix: &str, reply: Reply) {
        self.lock().overrides.insert(0, (prefix.to_string(), reply));
    }

    /// Reject the message body of every send.
    pub fn reject_bodies(&self) {
        self.lock().busy_body_error = true;
    }

    /// Push an unsolicited line as if the modem had emitted it.
    pub fn inject(&self, line: &str) {
        if let Some(tx) = &self.lock().lines {
            let _ = tx.send(TransportEvent::Line(line.to_string()));
        }
    }

    /// The device went away.
    pub fn unplug(&self) {
        if let Some(tx) = self.lock().lines.take() {
            let _ = tx.send(TransportEvent::Closed(Some(s("device unplugged"))));
        }
    }

    pub fn store_record(&self, index: u32, lines: &[&str]) {
        self.lock()
            .records
            .insert(index, lines.iter().map(|l| l.to_string()).collect());
    }

    /// Store an inbound SMS and announce it with `+CMTI`.
    pub fn receive_sms(&self, index: u32, from: &str, body: &str) {
        let header = format!("+CMGR: \"REC UNREAD\",\"{}\",,\"26/10/16,12:00:00+00\"", from);
        self.store_record(index, &[&header, body]);
        self.inject(&format!("+CMTI: \"SM\",{}", index));
    }

    /// Store a status report for `reference` and announce it with `+CDSI`.
    pub fn status_report(&self, index: u32, reference: u8, to: &str, st: u8) {
        let header = format!(
            "+CMGR: \"REC UNREAD\",6,{},\"{}\",145,\"26/10/16,12:00:00+00\",\"26/10/16,12:00:05+00\",{}",
            reference, to, st
        );
        self.store_record(index, &[&header]);
        self.inject(&format!("+CDSI: \"SR\",{}", index));
    }

    /// Every command and body written, in order. Bodies appear as `<body:...>`.
    pub fn written(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    /// Bodies accepted for sending, with the instant they were written.
    pub fn bodies(&self) -> Vec<(String, Instant)> {
        self.lock().bodies.clone()
    }

    pub fn has_record(&self, index: u32) -> bool {
        self.lock().records.contains_key(&index)
    }

    fn default_reply(st: &mut SimState, cmd: &str) -> Reply {
        let ok = |mut lines: Vec<String>| {
            lines.push(s("OK"));
            Reply::Lines(lines)
        };
        if cmd == "AT"
            || cmd.starts_with("AT+CMGF")
            || cmd.starts_with("AT+CNMI")
            || cmd.starts_with("AT+CSMP")
            || cmd.starts_with("AT+CPIN")
        {
            ok(vec![])
        } else if cmd == "AT+CSQ" {
            ok(vec![s("+CSQ: 17,99")])
        } else if cmd == "AT+CREG?" {
            ok(vec![s("+CREG: 0,1")])
        } else if cmd == "AT+CIMI" {
            ok(vec![s("310150123456789")])
        } else if cmd == "AT+COPS?" {
            ok(vec![s("+COPS: 0,0,\"SimTel\",7")])
        } else if cmd.starts_with("AT+CMGS=") {
            st.awaiting_body = true;
            Reply::Lines(vec![s(">")])
        } else if let Some(n) = cmd.strip_prefix("AT+CMGR=") {
            match n.parse::<u32>().ok().and_then(|i| st.records.get(&i)) {
                Some(lines) => ok(lines.clone()),
                None => Reply::Error,
            }
        } else if let Some(n) = cmd.strip_prefix("AT+CMGD=") {
            if let Ok(i) = n.parse::<u32>() {
                st.records.remove(&i);
            }
            ok(vec![])
        } else {
            Reply::Error
        }
    }

    fn answer(st: &mut SimState, cmd: &str) {
        let found = st
            .overrides
            .iter()
            .find(|(prefix, _)| cmd.starts_with(prefix.as_str()))
            .map(|(_, r)| r.clone());
        let reply = match found {
            Some(reply) => reply,
            None => Self::default_reply(st, cmd),
        };
        if cmd.starts_with("AT+CMGS=") && !matches!(reply, Reply::Lines(_)) {
            st.awaiting_body = false;
        }
        let lines = match reply {
            Reply::Lines(lines) => lines,
            Reply::Error => vec![s("ERROR")],
            Reply::Silent => return,
        };
        if let Some(tx) = &st.lines {
            for line in lines {
                let _ = tx.send(TransportEvent::Line(line));
            }
        }
    }

    fn answer_body(st: &mut SimState, body: String) {
        st.awaiting_body = false;
        st.written.push(format!("<body:{}>", body));
        let lines = if st.busy_body_error {
            vec![s("+CMS ERROR: 38")]
        } else {
            st.bodies.push((body, Instant::now()));
            st.next_reference = st.next_reference.wrapping_add(1);
            vec![format!("+CMGS: {}", st.next_reference), s("OK")]
        };
        if let Some(tx) = &st.lines {
            for line in lines {
                let _ = tx.send(TransportEvent::Line(line));
            }
        }
    }

    fn process(st: &mut SimState) {
        loop {
            while st.buf.first().is_some_and(|b| *b == b'\n') {
                st.buf.remove(0);
            }
            if st.awaiting_body {
                let Some(pos) = st.buf.iter().position(|b| *b == 0x1A || *b == 0x1B) else {
                    return;
                };
                let raw: Vec<u8> = st.buf.drain(..=pos).collect();
                let body = String::from_utf8_lossy(&raw[..pos]).to_string();
                if raw[pos] == 0x1B {
                    st.awaiting_body = false;
                    st.written.push(s("<ESC>"));
                } else {
                    Self::answer_body(st, body);
                }
            } else {
                if st.buf.first() == Some(&0x1B) {
                    st.buf.remove(0);
                    st.written.push(s("<ESC>"));
                    continue;
                }
                let Some(pos) = st.buf.iter().position(|b| *b == b'\r') else {
                    return;
                };
                let raw: Vec<u8> = st.buf.drain(..=pos).collect();
                let cmd = String::from_utf8_lossy(&raw[..pos]).to_string();
                st.written.push(cmd.clone());
                Self::answer(st, &cmd);
            }
        }
    }
}

impl Write for SimModem {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut st = self.lock();
        if st.lines.is_none() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated device gone",
            ));
        }
        st.buf.extend_from_slice(data);
        Self::process(&mut st);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Connector that hands out links to a [`SimModem`].
pub struct SimConnector {
    sim: SimModem,
    pub refuse: Arc<AtomicBool>,
}

impl SimConnector {
    pub fn new(sim: SimModem) -> Self {
        Self {
            sim,
            refuse: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn open(&self, config: &GatewayConfig) -> Result<ModemLink, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Open {
                port: config.port().to_string(),
                reason: s("No such file or directory"),
            });
        }
        Ok(self.sim.link())
    }
}

pub fn tuning(rate_limit_ms: u64) -> GatewayTuning {
    GatewayTuning {
        rate_limit: Duration::from_millis(rate_limit_ms),
        command_timeout: Duration::from_millis(300),
    }
}

/// Gateway over a fresh simulator, plus the refuse switch of its connector.
pub fn sim_gateway(
    sim: &SimModem,
    rate_limit_ms: u64,
) -> (
    SmsGateway,
    mpsc::UnboundedReceiver<GatewayEvent>,
    Arc<AtomicBool>,
) {
    let connector = SimConnector::new(sim.clone());
    let refuse = connector.refuse.clone();
    let (gateway, events) = SmsGateway::with_connector(
        GatewayConfig::new("sim", 115200, None),
        tuning(rate_limit_ms),
        Box::new(connector),
    );
    (gateway, events, refuse)
}

/// Next event, failing the test after two seconds.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<GatewayEvent>) -> GatewayEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for gateway event")
        .expect("gateway event channel closed")
}

/// Skip events until one matches.
pub async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<GatewayEvent>, mut pred: F) -> GatewayEvent
where
    F: FnMut(&GatewayEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}
