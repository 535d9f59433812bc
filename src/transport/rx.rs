//! Receive half of a link endpoint.
//!
//! [`Rx`] decodes packets from the link and routes them:
//!
//! - NACK and ACK_REPLY control fragments go to the paired [`Tx`]
//! - data fragments go to the [`Reassembler`]
//! - completed messages go to the [`MessageHandler`]; accepted messages that
//!   asked for it are acknowledged with an ACK_REPLY through the paired Tx
//! - a resent STOP of a message already accepted is acknowledged again
//!   instead of being delivered twice; a rejected message is forgotten so
//!   its resend is reassembled and offered to the handler again
//!
//! # Gap timer
//!
//! With NACKs enabled, a single one-shot timer watches reassembly progress:
//!
//! | Condition                       | Action                                      |
//! |---------------------------------|---------------------------------------------|
//! | gap open for `nack_gap_timeout` | NACK the expected sequence, repeat each period |
//! | collecting, silent `nak_timeout`| NACK the expected sequence (lost tail)      |
//! | episode older than `nak_timeout`| abandon the partial message, skip the gap   |
//!
//! Any progress of the expected sequence ends the current episode.

use super::config::{ConfigError, TransportConfig};
use super::stats::LinkStats;
use super::tx::Tx;
use crate::ble::{
    is_ack_reply_packet, is_nack_packet, CompletedMessage, Fragment, FragmentFlags, Reassembler,
    ReassemblyError, ReassemblyEvent, SeqNum,
};
use crate::platform::{lock, Scheduler, TimerId};
use log::{debug, info, warn};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Consumer of reassembled messages.
pub trait MessageHandler: Send + Sync {
    /// Take a completed message. Returning `false` rejects it (e.g. a failed
    /// checksum): it is not acknowledged, so a reliable sender retries.
    fn on_completed_message(&self, message: &[u8]) -> bool;
}

impl<F> MessageHandler for F
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    fn on_completed_message(&self, message: &[u8]) -> bool {
        self(message)
    }
}

type RxOverride = Arc<dyn Fn(&ReassemblyError) + Send + Sync>;

#[derive(Debug)]
struct GapTimer {
    /// Last time the expected sequence advanced.
    last_progress: Instant,
    /// Start of the current recovery episode.
    episode_since: Option<Instant>,
    last_nack: Option<Instant>,
    armed: Option<(TimerId, Instant)>,
}

impl GapTimer {
    fn new(now: Instant) -> Self {
        Self {
            last_progress: now,
            episode_since: None,
            last_nack: None,
            armed: None,
        }
    }

    fn end_episode(&mut self) {
        self.episode_since = None;
        self.last_nack = None;
    }
}

struct RxState {
    reassembler: Reassembler,
    nacks_enabled: bool,
    nack_gap_timeout: Duration,
    nak_timeout: Duration,
    gap: GapTimer,
    override_hook: Option<RxOverride>,
}

struct RxShared {
    state: Mutex<RxState>,
    scheduler: Arc<dyn Scheduler>,
    paired_tx: Option<Tx>,
    handler: Box<dyn MessageHandler>,
    stats: Arc<LinkStats>,
}

/// Work collected under the lock and performed after releasing it.
#[derive(Default)]
struct Followup {
    events: Vec<ReassemblyEvent>,
    nack: Option<SeqNum>,
    /// STOP of an already accepted message the peer sent again.
    ack_again: Option<SeqNum>,
    hook: Option<RxOverride>,
}

/// Receive half of a link endpoint. Cloning yields another handle to the
/// same receiver.
#[derive(Clone)]
pub struct Rx {
    shared: Arc<RxShared>,
}

impl fmt::Debug for Rx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Rx")
            .field("reassembler", &state.reassembler)
            .field("nacks_enabled", &state.nacks_enabled)
            .field("gap", &state.gap)
            .finish()
    }
}

impl Rx {
    /// Create a receiver.
    ///
    /// `paired_tx` carries the NACK and ACK_REPLY fragments this side emits
    /// and receives the peer's. Without it, control traffic is dropped.
    /// Counters are shared with the paired Tx when there is one.
    pub fn new<H>(
        config: &TransportConfig,
        scheduler: Arc<dyn Scheduler>,
        paired_tx: Option<Tx>,
        handler: H,
    ) -> Result<Self, ConfigError>
    where
        H: MessageHandler + 'static,
    {
        config.validate()?;

        let stats = paired_tx
            .as_ref()
            .map(Tx::stats_handle)
            .unwrap_or_default();
        let mut reassembler =
            Reassembler::with_limits(config.assembly_capacity, config.max_held_fragments);
        reassembler.set_hold_gaps(config.nacks_enabled);

        let state = RxState {
            reassembler,
            nacks_enabled: config.nacks_enabled,
            nack_gap_timeout: config.nack_gap_timeout,
            nak_timeout: config.nak_timeout,
            gap: GapTimer::new(scheduler.now()),
            override_hook: None,
        };

        Ok(Self {
            shared: Arc::new(RxShared {
                state: Mutex::new(state),
                scheduler,
                paired_tx,
                handler: Box::new(handler),
                stats,
            }),
        })
    }

    /// Feed one packet received from the link.
    pub fn on_ble_phys_rx(&self, bytes: &[u8]) {
        let fragment = match Fragment::from_bytes(bytes) {
            Ok(fragment) => fragment,
            Err(e) => {
                warn!("Discarding malformed packet: {}", e);
                LinkStats::bump(&self.shared.stats.drops);
                return;
            }
        };

        if is_nack_packet(fragment.flags) {
            match &self.shared.paired_tx {
                Some(tx) => tx.on_nack(fragment.seq),
                None => debug!("NACK {} with no paired tx", fragment.seq),
            }
            return;
        }
        if is_ack_reply_packet(fragment.flags) {
            match &self.shared.paired_tx {
                Some(tx) => tx.on_ack_reply(fragment.seq),
                None => debug!("ACK_REPLY {} with no paired tx", fragment.seq),
            }
            return;
        }

        LinkStats::bump(&self.shared.stats.fragments_received);
        let seq = fragment.seq;
        let wants_ack = fragment.is_stop() && fragment.flags.contains(FragmentFlags::ACK_REQUEST);
        let followup = {
            let mut state = lock(&self.shared.state);
            let now = self.shared.scheduler.now();
            let before = state.reassembler.expected_seq();

            let events = state.reassembler.reassemble_fragment(fragment);
            let repeated = events.iter().any(|event| {
                matches!(
                    event,
                    ReassemblyEvent::Error(ReassemblyError::DuplicateOrStale(s)) if *s == seq
                )
            });
            let ack_again = wants_ack && repeated && state.reassembler.completed_stop(seq);
            if state.reassembler.expected_seq() != before {
                state.gap.last_progress = now;
                state.gap.end_episode();
            }
            if state.reassembler.has_gap() && state.gap.episode_since.is_none() {
                state.gap.episode_since = Some(now);
            }
            if !state.reassembler.has_gap() && !state.reassembler.is_collecting() {
                state.gap.end_episode();
            }
            self.rearm(&mut state, now);

            Followup {
                events,
                nack: None,
                ack_again: ack_again.then_some(seq),
                hook: state.override_hook.clone(),
            }
        };
        self.run(followup);
    }

    /// Turn NACK emission on or off.
    ///
    /// While enabled, a plain START ahead of a gap is held instead of
    /// abandoning the missing fragments.
    pub fn enable_nacks(&self, enabled: bool) {
        let mut state = lock(&self.shared.state);
        state.nacks_enabled = enabled;
        state.reassembler.set_hold_gaps(enabled);
        let now = self.shared.scheduler.now();
        if !enabled {
            state.gap.end_episode();
        } else if state.reassembler.has_gap() && state.gap.episode_since.is_none() {
            state.gap.episode_since = Some(now);
        }
        self.rearm(&mut state, now);
    }

    /// Discard the message in progress and stop the gap timer.
    pub fn flush(&self) {
        let mut state = lock(&self.shared.state);
        state.reassembler.flush();
        self.reset_timer(&mut state);
    }

    /// Flush and expect sequence 0 next (link reset).
    pub fn reset_seq_num(&self) {
        let mut state = lock(&self.shared.state);
        state.reassembler.reset_seq_num(SeqNum::ZERO);
        self.reset_timer(&mut state);
    }

    pub fn set_nack_gap_timeout(&self, timeout: Duration) {
        let mut state = lock(&self.shared.state);
        state.nack_gap_timeout = timeout;
        let now = self.shared.scheduler.now();
        self.rearm(&mut state, now);
    }

    pub fn set_nak_timeout(&self, timeout: Duration) {
        let mut state = lock(&self.shared.state);
        state.nak_timeout = timeout;
        let now = self.shared.scheduler.now();
        self.rearm(&mut state, now);
    }

    /// Install a diagnostic hook called for every reassembly error.
    ///
    /// The hook runs after the receiver's lock is released.
    pub fn set_override<F>(&self, hook: F)
    where
        F: Fn(&ReassemblyError) + Send + Sync + 'static,
    {
        lock(&self.shared.state).override_hook = Some(Arc::new(hook));
    }

    pub fn clear_override(&self) {
        lock(&self.shared.state).override_hook = None;
    }

    pub fn expected_seq(&self) -> SeqNum {
        lock(&self.shared.state).reassembler.expected_seq()
    }

    pub fn is_collecting(&self) -> bool {
        lock(&self.shared.state).reassembler.is_collecting()
    }

    pub fn has_gap(&self) -> bool {
        lock(&self.shared.state).reassembler.has_gap()
    }

    /// True while the gap timer is scheduled.
    pub fn gap_timer_armed(&self) -> bool {
        lock(&self.shared.state).gap.armed.is_some()
    }

    pub fn stats(&self) -> &LinkStats {
        &self.shared.stats
    }

    pub fn paired_tx(&self) -> Option<&Tx> {
        self.shared.paired_tx.as_ref()
    }

    fn downgrade(&self) -> Weak<RxShared> {
        Arc::downgrade(&self.shared)
    }

    fn reset_timer(&self, state: &mut RxState) {
        if let Some((timer, _)) = state.gap.armed.take() {
            self.shared.scheduler.cancel(timer);
        }
        state.gap = GapTimer::new(self.shared.scheduler.now());
    }

    /// When the gap timer has to fire next, if at all.
    fn next_deadline(state: &RxState) -> Option<Instant> {
        if !state.nacks_enabled {
            return None;
        }
        let gap = &state.gap;
        if let Some(since) = gap.episode_since {
            let nack_at = gap.last_nack.unwrap_or(since) + state.nack_gap_timeout;
            return Some(nack_at.min(since + state.nak_timeout));
        }
        if state.reassembler.is_collecting() {
            return Some(gap.last_progress + state.nak_timeout);
        }
        None
    }

    /// Point the one-shot timer at the next deadline.
    fn rearm(&self, state: &mut RxState, now: Instant) {
        let deadline = Self::next_deadline(state);
        if let (Some((_, armed_at)), Some(deadline)) = (state.gap.armed, deadline) {
            if armed_at == deadline {
                return;
            }
        }
        if let Some((timer, _)) = state.gap.armed.take() {
            self.shared.scheduler.cancel(timer);
        }
        let Some(deadline) = deadline else {
            return;
        };

        let weak = self.downgrade();
        let timer = self.shared.scheduler.schedule(
            deadline.saturating_duration_since(now),
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    Rx { shared }.on_gap_timer();
                }
            }),
        );
        state.gap.armed = Some((timer, deadline));
    }

    fn on_gap_timer(&self) {
        let followup = {
            let mut state = lock(&self.shared.state);
            state.gap.armed = None;
            let now = self.shared.scheduler.now();
            let mut followup = Followup {
                hook: state.override_hook.clone(),
                ..Default::default()
            };

            if !state.nacks_enabled {
                return;
            }
            let expected = state.reassembler.expected_seq();
            let nack_gap_timeout = state.nack_gap_timeout;
            let nak_timeout = state.nak_timeout;

            match state.gap.episode_since {
                Some(since) if now >= since + nak_timeout => {
                    warn!(
                        "No recovery for {} within {:?}, abandoning gap",
                        expected, nak_timeout
                    );
                    LinkStats::bump(&self.shared.stats.gaps_abandoned);
                    followup.events = state.reassembler.skip_gap();
                    state.gap.last_progress = now;
                    state.gap.end_episode();
                    if state.reassembler.has_gap() {
                        state.gap.episode_since = Some(now);
                    }
                }
                Some(since) => {
                    let nack_at = state.gap.last_nack.unwrap_or(since) + nack_gap_timeout;
                    if now >= nack_at {
                        followup.nack = Some(expected);
                        state.gap.last_nack = Some(now);
                    }
                }
                None => {
                    let stalled = now >= state.gap.last_progress + nak_timeout;
                    if state.reassembler.is_collecting() && stalled {
                        info!("Message stalled at {}, requesting it", expected);
                        followup.nack = Some(expected);
                        state.gap.episode_since = Some(now);
                        state.gap.last_nack = Some(now);
                    }
                }
            }

            self.rearm(&mut state, now);
            followup
        };
        self.run(followup);
    }

    /// Deliver events and emit control traffic with no lock held.
    fn run(&self, followup: Followup) {
        if let Some(missing) = followup.nack {
            match &self.shared.paired_tx {
                Some(tx) => {
                    debug!("Sending NACK for {}", missing);
                    tx.send_nack(missing);
                }
                None => debug!("Gap at {} but no paired tx to NACK with", missing),
            }
        }

        if let (Some(stop), Some(tx)) = (followup.ack_again, &self.shared.paired_tx) {
            debug!("Message ending at {} sent again, re-acknowledging", stop);
            tx.send_ack_reply(stop);
        }

        for event in followup.events {
            match event {
                ReassemblyEvent::Completed(message) => self.deliver(message),
                ReassemblyEvent::Error(e) => {
                    let counter = match e {
                        ReassemblyError::SequenceGap { .. } => &self.shared.stats.gaps,
                        _ => &self.shared.stats.drops,
                    };
                    LinkStats::bump(counter);
                    if let Some(hook) = &followup.hook {
                        hook(&e);
                    }
                }
            }
        }
    }

    fn deliver(&self, message: CompletedMessage) {
        LinkStats::bump(&self.shared.stats.messages_received);
        if !self.shared.handler.on_completed_message(&message.data) {
            debug!(
                "Handler rejected {} byte message ending at {}",
                message.data.len(),
                message.last_seq
            );
            LinkStats::bump(&self.shared.stats.messages_rejected);
            lock(&self.shared.state)
                .reassembler
                .forget_completed(message.first_seq);
            return;
        }
        if !message.ack_requested {
            return;
        }
        match &self.shared.paired_tx {
            Some(tx) => tx.send_ack_reply(message.last_seq),
            None => warn!(
                "Message ending at {} wants an ack but there is no paired tx",
                message.last_seq
            ),
        }
    }
}
