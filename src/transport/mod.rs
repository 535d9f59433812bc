//! Reliable message transport over the fragment layer.
//!
//! This module contains:
//! - [`config`]: transport configuration and validation
//! - [`stats`]: lock-free link counters
//! - [`tx`]: sending, NACK-served retransmission, acknowledged sends
//! - [`rx`]: receiving, gap detection and NACK emission
//!
//! A link endpoint is a [`Tx`]/[`Rx`] pair. The Rx is given the Tx so it can
//! emit NACK and ACK_REPLY fragments and forward the peer's ones:
//!
//! ```
//! use ble_reliable_link::sim::SimScheduler;
//! use ble_reliable_link::transport::{Rx, TransportConfig, Tx};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let scheduler = Arc::new(SimScheduler::new());
//! let config = TransportConfig::simulation();
//! let sink = |_packet: &[u8], _timeout: Duration| true;
//!
//! let tx = Tx::new(&config, Arc::new(sink), scheduler.clone()).unwrap();
//! let rx = Rx::new(&config, scheduler, Some(tx.clone()), |message: &[u8]| {
//!     println!("received {} bytes", message.len());
//!     true
//! })
//! .unwrap();
//!
//! tx.write(b"hello").unwrap();
//! # let _ = rx;
//! ```

mod config;
mod rx;
mod stats;
mod tx;

pub use config::{ConfigError, TransportConfig, DEFAULT_MTU, MAX_MTU, MAX_RETRANSMIT_HISTORY};
pub use rx::{MessageHandler, Rx};
pub use stats::{LinkStats, StatsSnapshot};
pub use tx::{DeliveryEvent, DeliveryObserver, MessageId, Tx, TxError};
