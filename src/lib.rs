//! # smsgate - SMS Campaign Gateway for USB Cellular Modems
//!
//! smsgate drives a GSM/LTE modem over a serial link with the AT text-mode
//! command set and turns it into a small SMS gateway: a rate-limited outbound
//! queue, carrier delivery reports, opt-out detection on replies and timed
//! campaign execution.
//!
//! ## Features
//!
//! - **Half-duplex AT engine**: one command on the wire at a time, bounded waits, SIM PIN masked in logs.
//! - **Outbound queue**: FIFO with a single drain loop and a fixed gap between sends.
//! - **Delivery reports**: `+CDSI` status reports parsed and correlated to the original send.
//! - **Opt-out handling**: replies containing STOP, UNSUBSCRIBE, REMOVE or OPT OUT blacklist the sender.
//! - **Scheduler**: campaigns fire at their due time, with periodic reconciliation from storage.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smsgate::config::Config;
//! use smsgate::gateway::{QueuedMessage, SmsGateway};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?.with_env_overrides();
//!     let (gateway, _events) = SmsGateway::new(config.gateway_config(), config.tuning());
//!     if gateway.connect().await {
//!         gateway.queue_message(QueuedMessage::adhoc("+15551234567", "Hello from smsgate"));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`modem`] - serial transport, AT command set and the request/response engine
//! - [`gateway`] - connection lifecycle, outbound queue and gateway events
//! - [`scheduler`] - timed campaign execution
//! - [`storage`] - storage interface and the in-memory store
//! - [`dispatch`] - applies gateway events to storage
//! - [`config`] - configuration file and derived link parameters
//! - [`validation`] - phone number and message body checks
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │   Scheduler     │────▶│    Gateway      │ ← queue, status, events
//! └─────────────────┘     └─────────────────┘
//!          │                       │
//! ┌─────────────────┐     ┌─────────────────┐
//! │    Storage      │◀────│   AT Engine     │ ← one command in flight
//! │  (dispatcher)   │     └─────────────────┘
//! └─────────────────┘              │
//!                         ┌─────────────────┐
//!                         │ Serial Transport│
//!                         └─────────────────┘
//! ```

pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod logutil;
pub mod metrics;
pub mod modem;
pub mod scheduler;
pub mod storage;
pub mod validation;
