use std::time::Duration;
use thiserror::Error;

/// Failures of the physical serial link. Fatal to the connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The configured port could not be opened at all.
    #[error("failed to open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    /// Writing to an open port failed.
    #[error("serial write failed: {0}")]
    Write(#[from] std::io::Error),

    /// The link was closed locally or by the device.
    #[error("serial link closed")]
    Closed,
}

/// Failures of a single AT command exchange.
#[derive(Debug, Error)]
pub enum AtError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The modem answered `ERROR`, `+CMS ERROR` or `+CME ERROR`.
    #[error("command {command} failed: {detail}")]
    Protocol { command: String, detail: String },

    /// No terminal response arrived within the bound.
    #[error("command {command} timed out after {}ms", .after.as_millis())]
    Timeout { command: String, after: Duration },

    /// The engine has no live link (closed or never opened).
    #[error("modem not connected")]
    NotConnected,
}

impl AtError {
    /// True when the failure means the link itself is gone rather than one command failing.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, AtError::Transport(_) | AtError::NotConnected)
    }
}

/// A connect-time initialization step failed; the link is not usable.
#[derive(Debug, Error)]
#[error("modem initialization failed at {step}: {source}")]
pub struct InitError {
    pub step: &'static str,
    #[source]
    pub source: AtError,
}
