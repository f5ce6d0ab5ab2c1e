//! # Modem Module - Cellular Modem Communication
//!
//! Everything that speaks to the GSM modem over its serial link.
//!
//! - [`transport`] - opening the port, the reader thread and the line decoder
//! - [`at`] - AT command strings and parsers for the modem's text responses
//! - [`engine`] - one-command-at-a-time request/response engine on top of a link
//! - [`error`] - transport, command and initialization failures
//!
//! The engine is the only writer on an open link. It is driven either by a
//! real serial port ([`transport::ModemTransport::open`]) or by any
//! `std::io::Write` paired with a line channel, which is how the test suite
//! simulates a modem.

pub mod at;
pub mod engine;
pub mod error;
pub mod transport;

pub use engine::{AtEngine, EngineEvent, ModemIdentity};
pub use error::{AtError, InitError, TransportError};
pub use transport::{LineDecoder, ModemLink, ModemTransport, TransportEvent};
