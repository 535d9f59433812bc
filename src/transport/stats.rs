//! Link counters.
//!
//! Counters are plain atomics so the hot path never takes a lock. Tx and Rx
//! of one endpoint may share a single [`LinkStats`] through an `Arc`.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Traffic and recovery counters for one link endpoint.
#[derive(Debug, Default)]
pub struct LinkStats {
    /// Data fragments handed to the queue sink (retransmissions included).
    pub fragments_sent: AtomicUsize,
    /// Data fragments decoded from the link.
    pub fragments_received: AtomicUsize,
    /// Fragments resent in answer to a NACK or an ack timeout.
    pub retransmissions: AtomicUsize,
    /// NACK fragments emitted.
    pub nacks_sent: AtomicUsize,
    /// NACK fragments received from the peer.
    pub nacks_received: AtomicUsize,
    /// ACK_REPLY fragments emitted.
    pub acks_sent: AtomicUsize,
    /// Reliable sends confirmed by the peer.
    pub messages_delivered: AtomicUsize,
    /// Reliable sends that ran out of retries.
    pub messages_failed: AtomicUsize,
    /// Messages handed to the application.
    pub messages_received: AtomicUsize,
    /// Completed messages the application rejected.
    pub messages_rejected: AtomicUsize,
    /// Out-of-order fragments that opened or widened a gap.
    pub gaps: AtomicUsize,
    /// Gaps given up after the NAK timeout.
    pub gaps_abandoned: AtomicUsize,
    /// Packets dropped: malformed, stale, overflowed or refused by the sink.
    pub drops: AtomicUsize,
}

/// Point-in-time copy of [`LinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub fragments_sent: usize,
    pub fragments_received: usize,
    pub retransmissions: usize,
    pub nacks_sent: usize,
    pub nacks_received: usize,
    pub acks_sent: usize,
    pub messages_delivered: usize,
    pub messages_failed: usize,
    pub messages_received: usize,
    pub messages_rejected: usize,
    pub gaps: usize,
    pub gaps_abandoned: usize,
    pub drops: usize,
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter.
    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        StatsSnapshot {
            fragments_sent: load(&self.fragments_sent),
            fragments_received: load(&self.fragments_received),
            retransmissions: load(&self.retransmissions),
            nacks_sent: load(&self.nacks_sent),
            nacks_received: load(&self.nacks_received),
            acks_sent: load(&self.acks_sent),
            messages_delivered: load(&self.messages_delivered),
            messages_failed: load(&self.messages_failed),
            messages_received: load(&self.messages_received),
            messages_rejected: load(&self.messages_rejected),
            gaps: load(&self.gaps),
            gaps_abandoned: load(&self.gaps_abandoned),
            drops: load(&self.drops),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={} recv={} retrans={} nack_tx={} nack_rx={} ack_tx={} delivered={} failed={} \
             msgs={} rejected={} gaps={} abandoned={} drops={}",
            self.fragments_sent,
            self.fragments_received,
            self.retransmissions,
            self.nacks_sent,
            self.nacks_received,
            self.acks_sent,
            self.messages_delivered,
            self.messages_failed,
            self.messages_received,
            self.messages_rejected,
            self.gaps,
            self.gaps_abandoned,
            self.drops
        )
    }
}
