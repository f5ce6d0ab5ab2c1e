//! AT command encoding and response decoding (3GPP TS 27.005 / 27.007 text mode).
//!
//! Everything here is pure: builders return command strings, parsers take the
//! accumulated response text of one command (lines joined with `\n`, terminal
//! `OK` excluded) or a single unsolicited line.

use regex::Regex;
use std::sync::OnceLock;

/// Ctrl+Z, terminates an `AT+CMGS` body and submits the message.
pub const CTRL_Z: char = '\x1A';

/// Sentinel reported when the operator query yields no name.
pub const UNKNOWN_OPERATOR: &str = "Unknown";

pub const ATTENTION: &str = "AT";
pub const TEXT_MODE: &str = "AT+CMGF=1";
/// Inbound SMS stored and indicated with `+CMTI`; status reports stored and indicated with `+CDSI`.
pub const NEW_MESSAGE_INDICATIONS: &str = "AT+CNMI=2,1,0,2,0";
/// First octet 49 sets the status-report-request bit on every submitted SMS.
pub const REQUEST_STATUS_REPORTS: &str = "AT+CSMP=49,167,0,0";
pub const SIGNAL_QUALITY: &str = "AT+CSQ";
pub const NETWORK_REGISTRATION: &str = "AT+CREG?";
pub const SUBSCRIBER_IDENTITY: &str = "AT+CIMI";
pub const OPERATOR_SELECTION: &str = "AT+COPS?";

pub fn unlock_sim(pin: &str) -> String {
    format!("AT+CPIN=\"{}\"", pin)
}

pub fn address_recipient(phone: &str) -> String {
    format!("AT+CMGS=\"{}\"", phone)
}

/// Raw body write for the second half of a send; no `\r\n`, the modem submits on Ctrl+Z.
pub fn message_body(body: &str) -> String {
    format!("{}{}", body, CTRL_Z)
}

pub fn read_record(index: u32) -> String {
    format!("AT+CMGR={}", index)
}

pub fn delete_record(index: u32) -> String {
    format!("AT+CMGD={}", index)
}

/// How a response line ends the command that is waiting for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Ok,
    Error(String),
    /// The `>` body prompt that follows `AT+CMGS`.
    Prompt,
}

pub fn classify_terminal(line: &str) -> Option<Terminal> {
    let line = line.trim();
    if line == "OK" {
        Some(Terminal::Ok)
    } else if line == "ERROR" || line.starts_with("+CMS ERROR") || line.starts_with("+CME ERROR") {
        Some(Terminal::Error(line.to_string()))
    } else if line == ">" {
        Some(Terminal::Prompt)
    } else {
        None
    }
}

/// Unsolicited "new record stored" indications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `+CDSI: "<mem>",<index>`
    DeliveryReport { storage: String, index: u32 },
    /// `+CMTI: "<mem>",<index>`
    InboundMessage { storage: String, index: u32 },
}

fn cached(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static AT pattern compiles"))
}

fn storage_indication() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r#"^\+(CDSI|CMTI):\s*"(\w+)",\s*(\d+)"#)
}

pub fn parse_notification(line: &str) -> Option<Notification> {
    let caps = storage_indication().captures(line.trim())?;
    let storage = caps[2].to_string();
    let index = caps[3].parse().ok()?;
    match &caps[1] {
        "CDSI" => Some(Notification::DeliveryReport { storage, index }),
        _ => Some(Notification::InboundMessage { storage, index }),
    }
}

/// First integer of `+CSQ: <rssi>,<ber>`, 0-31. `99` (not detectable) and
/// anything unparseable yield 0.
pub fn parse_signal_strength(response: &str) -> u8 {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"\+CSQ:\s*(\d+),")
        .captures(response)
        .and_then(|c| c[1].parse::<u8>().ok())
        .filter(|rssi| *rssi <= 31)
        .unwrap_or(0)
}

/// Quoted operator name of `+COPS: <mode>,<format>,"<oper>"`, or [`UNKNOWN_OPERATOR`].
pub fn parse_operator(response: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r#"\+COPS:\s*\d+,\d+,"([^"]+)""#)
        .captures(response)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| UNKNOWN_OPERATOR.to_string())
}

/// Message reference from `+CMGS: <mr>`.
pub fn parse_message_reference(response: &str) -> Option<u8> {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"\+CMGS:\s*(\d+)")
        .captures(response)
        .and_then(|c| c[1].parse().ok())
}

/// Registration state from `+CREG: <n>,<stat>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    NotRegistered,
    Home,
    Searching,
    Denied,
    Unknown,
    Roaming,
}

impl Registration {
    pub fn is_registered(self) -> bool {
        matches!(self, Registration::Home | Registration::Roaming)
    }
}

pub fn parse_registration(response: &str) -> Option<Registration> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let stat: u8 = cached(&RE, r"\+CREG:\s*\d+,\s*(\d+)")
        .captures(response)?[1]
        .parse()
        .ok()?;
    Some(match stat {
        0 => Registration::NotRegistered,
        1 => Registration::Home,
        2 => Registration::Searching,
        3 => Registration::Denied,
        5 => Registration::Roaming,
        _ => Registration::Unknown,
    })
}

/// Split a header's comma-separated fields, honoring double quotes (timestamps contain commas).
fn split_fields(header: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in header.chars() {
        match ch {
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current).trim().to_string()),
            c => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

fn cmgr_header(response: &str) -> Option<(usize, Vec<String>)> {
    response.lines().enumerate().find_map(|(i, line)| {
        line.trim()
            .strip_prefix("+CMGR:")
            .map(|rest| (i, split_fields(rest)))
    })
}

/// True for the `+CMGR:` header of an SMS-DELIVER, whose next line is the
/// message text. A status report header carries a numeric `<fo>` there instead.
pub fn announces_text(line: &str) -> bool {
    line.trim()
        .strip_prefix("+CMGR:")
        .map(split_fields)
        .and_then(|fields| fields.get(1).map(|f| f.parse::<u8>().is_err()))
        .unwrap_or(false)
}

/// Sender and text of a stored SMS-DELIVER read with `AT+CMGR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSms {
    pub phone: String,
    pub body: String,
}

/// `+CMGR: "<stat>","<oa>",[<alpha>],"<scts>"` followed by the body line(s).
pub fn parse_inbound_sms(response: &str) -> Option<InboundSms> {
    let (header_idx, fields) = cmgr_header(response)?;
    let phone = fields.get(1)?.clone();
    if phone.is_empty() || !phone.chars().all(|c| c == '+' || c.is_ascii_digit()) {
        return None;
    }
    let body = response
        .lines()
        .skip(header_idx + 1)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    if body.is_empty() {
        return None;
    }
    Some(InboundSms { phone, body })
}

/// Carrier verdict carried by a status report's `<st>` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    /// 0x00-0x1F: transaction completed.
    Delivered,
    /// 0x20-0x3F: temporary error, the SC is still trying.
    Pending,
    /// 0x40 and above: permanent error or SC gave up.
    Failed(u8),
}

/// SMS-STATUS-REPORT read with `AT+CMGR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub reference: u8,
    pub phone: String,
    pub status: u8,
}

impl StatusReport {
    pub fn verdict(&self) -> ReportStatus {
        match self.status {
            0x00..=0x1F => ReportStatus::Delivered,
            0x20..=0x3F => ReportStatus::Pending,
            st => ReportStatus::Failed(st),
        }
    }
}

/// `+CMGR: "<stat>",<fo>,<mr>,"<ra>",<tora>,"<scts>","<dt>",<st>`
pub fn parse_status_report(response: &str) -> Option<StatusReport> {
    let (_, fields) = cmgr_header(response)?;
    if fields.len() < 8 {
        return None;
    }
    // <fo> is numeric for a status report; an SMS-DELIVER has a quoted address there
    fields[1].parse::<u8>().ok()?;
    let reference = fields[2].parse().ok()?;
    let status = fields[fields.len() - 1].parse().ok()?;
    Some(StatusReport {
        reference,
        phone: fields[3].clone(),
        status,
    })
}

/// Whole-word, case-insensitive opt-out detection.
///
/// `STOP`, `UNSUBSCRIBE`, `REMOVE` and `OPTOUT` match as single words, `OPT OUT`
/// as two consecutive words (so `OPT-OUT` matches too). Words are split on any
/// non-alphanumeric character, so `nonstop` or `removed` never match.
pub fn is_opt_out(body: &str) -> bool {
    let words: Vec<String> = body
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_uppercase())
        .collect();
    words.iter().enumerate().any(|(i, word)| match word.as_str() {
        "STOP" | "UNSUBSCRIBE" | "REMOVE" | "OPTOUT" => true,
        "OPT" => words.get(i + 1).is_some_and(|next| next == "OUT"),
        _ => false,
    })
}
