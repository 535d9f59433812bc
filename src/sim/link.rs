//! Lossy packet link for simulation.
//!
//! [`LossyLink`] is a [`QueueSink`] that carries packets to a receiver after
//! a fixed latency, applying a seeded fault model on the way:
//!
//! | Fault       | Description                                        |
//! |-------------|----------------------------------------------------|
//! | Loss        | Drop a packet with probability `loss_ratio`.       |
//! | Duplication | Deliver a packet twice with `duplicate_ratio`.     |
//! | Filter      | Drop packets matching a caller-supplied predicate. |
//!
//! Delivery always goes through the scheduler, never inline, so the sending
//! transport's lock is released before the receiver sees the packet.

use crate::platform::{lock, QueueSink, Scheduler};
use log::trace;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Receiver = Arc<dyn Fn(&[u8]) + Send + Sync>;
type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// Fault model of a [`LossyLink`].
#[derive(Debug, Clone)]
pub struct LinkFaults {
    /// Probability in `[0.0, 1.0]` that a packet is dropped.
    pub loss_ratio: f64,
    /// Probability in `[0.0, 1.0]` that a delivered packet arrives twice.
    pub duplicate_ratio: f64,
    /// Delay between queueing and delivery.
    pub latency: Duration,
}

impl Default for LinkFaults {
    fn default() -> Self {
        Self {
            loss_ratio: 0.0,
            duplicate_ratio: 0.0,
            latency: Duration::from_millis(5),
        }
    }
}

impl LinkFaults {
    pub fn with_loss(loss_ratio: f64) -> Self {
        Self {
            loss_ratio,
            ..Default::default()
        }
    }
}

/// Packet counters of a [`LossyLink`].
#[derive(Debug, Default)]
pub struct LinkCounters {
    pub queued: AtomicUsize,
    pub dropped: AtomicUsize,
    pub duplicated: AtomicUsize,
    pub delivered: AtomicUsize,
}

struct LinkState {
    faults: LinkFaults,
    rng_state: u32,
    receiver: Option<Receiver>,
    filter: Option<DropFilter>,
}

/// One direction of a simulated link.
pub struct LossyLink {
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<LinkState>,
    counters: Arc<LinkCounters>,
}

impl LossyLink {
    /// Create a link with the given fault model, seeded for reproducibility.
    pub fn new(scheduler: Arc<dyn Scheduler>, faults: LinkFaults, seed: u32) -> Self {
        Self {
            scheduler,
            state: Mutex::new(LinkState {
                faults,
                rng_state: if seed == 0 { 1 } else { seed },
                receiver: None,
                filter: None,
            }),
            counters: Arc::new(LinkCounters::default()),
        }
    }

    /// Attach the receiving end. Packets queued while unconnected are lost.
    pub fn connect<F>(&self, receiver: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        lock(&self.state).receiver = Some(Arc::new(receiver));
    }

    /// Detach the receiving end; later packets are lost.
    pub fn disconnect(&self) {
        lock(&self.state).receiver = None;
    }

    /// Drop every packet for which `filter` returns true.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: FnMut(&[u8]) -> bool + Send + 'static,
    {
        lock(&self.state).filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&self) {
        lock(&self.state).filter = None;
    }

    pub fn set_faults(&self, faults: LinkFaults) {
        lock(&self.state).faults = faults;
    }

    pub fn counters(&self) -> &LinkCounters {
        &self.counters
    }

    fn deliver_later(&self, receiver: &Receiver, bytes: &[u8], latency: Duration) {
        let receiver = Arc::clone(receiver);
        let counters = Arc::clone(&self.counters);
        let packet = bytes.to_vec();
        self.scheduler.schedule(
            latency,
            Box::new(move || {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                receiver(&packet);
            }),
        );
    }
}

impl LinkState {
    /// LCG step, same constants as Numerical Recipes.
    fn next_random(&mut self) -> u32 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(1664525)
            .wrapping_add(1013904223);
        self.rng_state
    }

    /// Uniform sample in `[0.0, 1.0)` from the high bits.
    fn sample(&mut self) -> f64 {
        f64::from(self.next_random() >> 8) / f64::from(1u32 << 24)
    }
}

impl QueueSink for LossyLink {
    fn queue_write(&self, bytes: &[u8], _timeout: Duration) -> bool {
        self.counters.queued.fetch_add(1, Ordering::Relaxed);

        let mut state = lock(&self.state);
        let filtered = state.filter.as_mut().is_some_and(|filter| filter(bytes));
        let lost = state.sample() < state.faults.loss_ratio;
        if filtered || lost {
            trace!("Link dropped {} byte packet", bytes.len());
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            // The radio accepted it; the air lost it
            return true;
        }
        let duplicate = state.sample() < state.faults.duplicate_ratio;
        let latency = state.faults.latency;
        let Some(receiver) = state.receiver.clone() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return true;
        };
        drop(state);

        self.deliver_later(&receiver, bytes, latency);
        if duplicate {
            self.counters.duplicated.fetch_add(1, Ordering::Relaxed);
            self.deliver_later(&receiver, bytes, latency);
        }
        true
    }
}
