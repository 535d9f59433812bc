//! Reliable message transport for BLE links.
//!
//! BLE characteristic writes and notifications carry small packets, may be
//! lost or duplicated, and give no delivery confirmation. This library
//! carries arbitrarily large messages over such a link:
//!
//! - [`ble`]: fragment wire format, circular sequence numbers, fragmenter and
//!   reassembler. Pure data handling, no timers or I/O.
//! - [`transport`]: the [`Tx`]/[`Rx`] endpoint pair with NACK-driven
//!   selective retransmission and optional per-message acknowledgement.
//! - [`platform`]: the packet queue and timer traits the transport runs on,
//!   with tokio-backed implementations.
//! - [`sim`]: deterministic virtual-time scheduler and lossy link for testing.

pub mod ble;
pub mod platform;
pub mod sim;
pub mod transport;

// Re-export commonly used items
pub use ble::{Fragment, FragmentError, FragmentFlags, Fragmenter, Reassembler, SeqNum};
pub use platform::{QueueSink, Scheduler};
pub use transport::{
    DeliveryEvent, MessageHandler, MessageId, Rx, TransportConfig, Tx, TxError,
};

#[cfg(feature = "tokio-runtime")]
pub use platform::{ChannelQueue, TokioScheduler};
