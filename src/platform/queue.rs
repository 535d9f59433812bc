//! Outbound packet queue between the transport and the BLE link.
//!
//! The transport hands every encoded fragment to a [`QueueSink`]. What sits
//! behind it (a NimBLE notify call, a UART, a simulated lossy bridge) is not
//! the transport's concern; a rejected write is simply a lost packet that the
//! NACK/ACK machinery recovers.

use std::time::Duration;

/// Destination for encoded fragments.
///
/// `queue_write` must not block for longer than `timeout` and must not call
/// back into the transport that is writing.
pub trait QueueSink: Send + Sync {
    /// Queue one packet. Returns `false` if the packet was not accepted.
    fn queue_write(&self, bytes: &[u8], timeout: Duration) -> bool;
}

impl<F> QueueSink for F
where
    F: Fn(&[u8], Duration) -> bool + Send + Sync,
{
    fn queue_write(&self, bytes: &[u8], timeout: Duration) -> bool {
        self(bytes, timeout)
    }
}

#[cfg(feature = "tokio-runtime")]
pub use self::channel::{channel_queue, ChannelQueue, QueueReader};

#[cfg(feature = "tokio-runtime")]
mod channel {
    use super::QueueSink;
    use log::warn;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Write side of a bounded packet channel.
    #[derive(Debug, Clone)]
    pub struct ChannelQueue {
        tx: mpsc::Sender<Vec<u8>>,
    }

    /// Read side of a bounded packet channel.
    #[derive(Debug)]
    pub struct QueueReader {
        rx: mpsc::Receiver<Vec<u8>>,
    }

    /// Create a bounded packet queue holding at most `capacity` packets.
    pub fn channel_queue(capacity: usize) -> (ChannelQueue, QueueReader) {
        let (tx, rx) = mpsc::channel(capacity);
        (ChannelQueue { tx }, QueueReader { rx })
    }

    impl QueueSink for ChannelQueue {
        /// Non-blocking: a full queue rejects the packet immediately, so the
        /// timeout only bounds the caller's expectations.
        fn queue_write(&self, bytes: &[u8], _timeout: Duration) -> bool {
            match self.tx.try_send(bytes.to_vec()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Link queue full, dropping {} byte packet", bytes.len());
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        }
    }

    impl QueueReader {
        /// Wait for the next packet; `None` once every writer is gone.
        pub async fn recv(&mut self) -> Option<Vec<u8>> {
            self.rx.recv().await
        }

        /// Take the next packet if one is queued.
        pub fn try_recv(&mut self) -> Option<Vec<u8>> {
            self.rx.try_recv().ok()
        }

        /// Number of packets waiting.
        pub fn len(&self) -> usize {
            self.rx.len()
        }

        pub fn is_empty(&self) -> bool {
            self.rx.is_empty()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_channel_queue_roundtrip() {
            let (queue, mut reader) = channel_queue(4);
            assert!(queue.queue_write(&[1, 2, 3], Duration::ZERO));
            assert_eq!(reader.len(), 1);
            assert_eq!(reader.try_recv(), Some(vec![1, 2, 3]));
            assert!(reader.is_empty());
        }

        #[test]
        fn test_channel_queue_full_rejects() {
            let (queue, mut reader) = channel_queue(1);
            assert!(queue.queue_write(&[1], Duration::ZERO));
            assert!(!queue.queue_write(&[2], Duration::ZERO));
            assert_eq!(reader.try_recv(), Some(vec![1]));
            assert_eq!(reader.try_recv(), None);
        }

        #[test]
        fn test_closed_queue_rejects() {
            let (queue, reader) = channel_queue(1);
            drop(reader);
            assert!(!queue.queue_write(&[1], Duration::ZERO));
        }
    }
}
