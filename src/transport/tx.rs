//! Transmit half of a link endpoint.
//!
//! [`Tx`] fragments outgoing messages and hands the fragments to a
//! [`QueueSink`]. Two send modes exist:
//!
//! - [`Tx::write`]: fire-and-forget. Fragments are still retained in a
//!   bounded history so the peer can NACK individual losses.
//! - [`Tx::write_with_ack`]: every fragment carries ACK_REQUEST and the send
//!   is tracked until the peer's ACK_REPLY names its STOP fragment. Each
//!   message timeout without an ACK resends the whole fragment run under its
//!   original sequence numbers with RETRANS set, so a peer that already has
//!   the message recognises the repeat and only acknowledges it again. Once
//!   the retry budget is spent the send is reported as failed.
//!
//! ```text
//!            write_with_ack         ACK_REPLY
//!   Idle ───────────────▶ AwaitingAck ──────────▶ Delivered
//!                            │   ▲
//!                    timeout │   │ resend (RETRANS)
//!                            ▼   │
//!                          Retrying ── retries spent ──▶ Failed
//! ```
//!
//! With a non-zero connection interval, packets are paced: one leaves per
//! interval, driven by the scheduler.

use super::config::{ConfigError, TransportConfig};
use super::stats::LinkStats;
use crate::ble::{Fragment, FragmentError, FragmentFlags, Fragmenter, SeqNum};
use crate::platform::{lock, QueueSink, Scheduler, TimerId};
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Identifier of a reliable send, unique per [`Tx`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Errors reported by [`Tx`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    /// Nothing to send.
    EmptyMessage,
    /// Message exceeds the peer's assembly capacity or needs more fragments
    /// than the retransmit history holds.
    MessageTooLarge { len: usize, max: usize },
    /// No ACK_REPLY after the first attempt and `retries` resends.
    AckTimeoutExhausted { retries: u32 },
    /// Fragmentation failed.
    Fragment(FragmentError),
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "message is empty"),
            Self::MessageTooLarge { len, max } => {
                write!(f, "message of {} bytes exceeds limit of {}", len, max)
            }
            Self::AckTimeoutExhausted { retries } => {
                write!(f, "no acknowledgement after {} retries", retries)
            }
            Self::Fragment(e) => write!(f, "fragmentation failed: {}", e),
        }
    }
}

impl std::error::Error for TxError {}

impl From<FragmentError> for TxError {
    fn from(e: FragmentError) -> Self {
        match e {
            FragmentError::EmptyMessage => Self::EmptyMessage,
            other => Self::Fragment(other),
        }
    }
}

/// Final outcome of a reliable send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Delivered(MessageId),
    Failed(MessageId, TxError),
}

/// Receives the outcome of every [`Tx::write_with_ack`].
///
/// Called from scheduler callbacks or from the receive path, never with the
/// transport's lock held.
pub trait DeliveryObserver: Send + Sync {
    fn on_delivery(&self, event: DeliveryEvent);
}

impl<F> DeliveryObserver for F
where
    F: Fn(DeliveryEvent) + Send + Sync,
{
    fn on_delivery(&self, event: DeliveryEvent) {
        self(event)
    }
}

/// Per-message state of a reliable send.
struct ReliableSend {
    /// The fragment run as first sent; every attempt resends it unchanged.
    fragments: Vec<Fragment>,
    len: usize,
    retries_left: u32,
    attempts: u32,
    stop: SeqNum,
    last_sent: Instant,
    deadline: Instant,
    timer: Option<TimerId>,
}

struct TxState {
    fragmenter: Fragmenter,
    history: VecDeque<Fragment>,
    history_limit: usize,
    max_message_len: usize,
    reliable: HashMap<MessageId, ReliableSend>,
    next_message_id: u64,
    max_ack_retries: u32,
    message_timeout: Duration,
    connection_interval: Duration,
    queue_timeout: Duration,
    paced: VecDeque<Vec<u8>>,
    pacing_timer: Option<TimerId>,
    observer: Option<Arc<dyn DeliveryObserver>>,
}

struct TxShared {
    state: Mutex<TxState>,
    sink: Arc<dyn QueueSink>,
    scheduler: Arc<dyn Scheduler>,
    stats: Arc<LinkStats>,
}

/// Transmit half of a link endpoint. Cloning yields another handle to the
/// same transmitter.
#[derive(Clone)]
pub struct Tx {
    shared: Arc<TxShared>,
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Tx")
            .field("next_seq", &state.fragmenter.next_seq_num())
            .field("pending_reliable", &state.reliable.len())
            .field("paced", &state.paced.len())
            .finish()
    }
}

impl Tx {
    /// Create a transmitter writing to `sink`.
    pub fn new(
        config: &TransportConfig,
        sink: Arc<dyn QueueSink>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self, ConfigError> {
        Self::with_stats(config, sink, scheduler, Arc::new(LinkStats::new()))
    }

    /// Create a transmitter that records into shared counters.
    pub fn with_stats(
        config: &TransportConfig,
        sink: Arc<dyn QueueSink>,
        scheduler: Arc<dyn Scheduler>,
        stats: Arc<LinkStats>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let fragmenter = Fragmenter::try_new(config.mtu)
            .map_err(|_| ConfigError::InvalidConfig("mtu must be > header size"))?;

        let state = TxState {
            fragmenter,
            history: VecDeque::with_capacity(config.retransmit_history),
            history_limit: config.retransmit_history,
            // Every fragment of a message must stay NACK-servable
            max_message_len: config
                .assembly_capacity
                .min(config.retransmit_history * config.max_payload()),
            reliable: HashMap::new(),
            next_message_id: 1,
            max_ack_retries: config.max_ack_retries,
            message_timeout: config.message_timeout,
            connection_interval: config.connection_interval,
            queue_timeout: config.queue_timeout,
            paced: VecDeque::new(),
            pacing_timer: None,
            observer: None,
        };

        Ok(Self {
            shared: Arc::new(TxShared {
                state: Mutex::new(state),
                sink,
                scheduler,
                stats,
            }),
        })
    }

    /// Send a message without delivery confirmation.
    pub fn write(&self, message: &[u8]) -> Result<(), TxError> {
        let mut state = lock(&self.shared.state);
        check_len(&state, message)?;
        let run = self.send_run(&mut state, message, FragmentFlags::empty())?;
        let (first, last) = span(&run);
        debug!("Queued {} bytes as {} ..= {}", message.len(), first, last);
        Ok(())
    }

    /// Send a message and track it until the peer acknowledges it.
    ///
    /// Returns as soon as the first attempt is queued. The outcome is
    /// reported to the [`DeliveryObserver`].
    pub fn write_with_ack(&self, message: &[u8]) -> Result<MessageId, TxError> {
        let mut state = lock(&self.shared.state);
        check_len(&state, message)?;

        let id = MessageId(state.next_message_id);
        state.next_message_id += 1;

        let fragments = self.send_run(&mut state, message, FragmentFlags::ACK_REQUEST)?;
        let (first, stop) = span(&fragments);
        let now = self.shared.scheduler.now();
        let wait = ack_wait(&state);
        let timer = self.schedule_ack_timeout(id, wait);
        let retries_left = state.max_ack_retries;

        state.reliable.insert(
            id,
            ReliableSend {
                fragments,
                len: message.len(),
                retries_left,
                attempts: 1,
                stop,
                last_sent: now,
                deadline: now + wait,
                timer: Some(timer),
            },
        );
        info!(
            "{}: sending {} bytes as {} ..= {}, awaiting ack",
            id,
            message.len(),
            first,
            stop
        );
        Ok(id)
    }

    /// Resend the retained fragment `seq` with RETRANS set.
    ///
    /// NACKs for sequences no longer (or never) retained are ignored.
    pub fn on_nack(&self, seq: SeqNum) {
        LinkStats::bump(&self.shared.stats.nacks_received);
        let mut state = lock(&self.shared.state);

        let Some(fragment) = state.history.iter().rev().find(|f| f.seq == seq) else {
            debug!("NACK for {} not in retransmit history, ignoring", seq);
            return;
        };
        let resend = fragment.as_retransmission();
        debug!("NACK {}: retransmitting", seq);
        LinkStats::bump(&self.shared.stats.retransmissions);
        self.transmit(&mut state, &resend);
    }

    /// Complete the reliable send whose attempt ended at `stop_seq`.
    pub fn on_ack_reply(&self, stop_seq: SeqNum) {
        let (event, observer) = {
            let mut state = lock(&self.shared.state);
            let found = state
                .reliable
                .iter()
                .find(|(_, send)| send.stop == stop_seq)
                .map(|(id, _)| *id);
            let Some(id) = found else {
                debug!("ACK_REPLY {} matches no pending send", stop_seq);
                return;
            };
            let Some(send) = state.reliable.remove(&id) else {
                return;
            };
            if let Some(timer) = send.timer {
                self.shared.scheduler.cancel(timer);
            }
            let rtt = self.shared.scheduler.now().saturating_duration_since(send.last_sent);
            info!(
                "{}: delivered after {} attempt(s), {:?} since last send",
                id, send.attempts, rtt
            );
            LinkStats::bump(&self.shared.stats.messages_delivered);
            (DeliveryEvent::Delivered(id), state.observer.clone())
        };

        if let Some(observer) = observer {
            observer.on_delivery(event);
        }
    }

    /// Ask the peer to resend data fragment `missing`.
    pub fn send_nack(&self, missing: SeqNum) {
        LinkStats::bump(&self.shared.stats.nacks_sent);
        let mut state = lock(&self.shared.state);
        self.transmit(&mut state, &Fragment::nack(missing));
    }

    /// Acknowledge the peer's message that ended at `stop_seq`.
    pub fn send_ack_reply(&self, stop_seq: SeqNum) {
        LinkStats::bump(&self.shared.stats.acks_sent);
        let mut state = lock(&self.shared.state);
        self.transmit(&mut state, &Fragment::ack_reply(stop_seq));
    }

    /// Drop all in-flight work: pending reliable sends, retry timers and
    /// packets still waiting for their pacing slot.
    ///
    /// No delivery events are emitted for dropped sends. The sequence counter
    /// is left alone. Safe to call repeatedly.
    pub fn flush_tx(&self) {
        let mut state = lock(&self.shared.state);
        let scheduler = &self.shared.scheduler;

        let dropped = state.reliable.len();
        for (_, send) in state.reliable.drain() {
            if let Some(timer) = send.timer {
                scheduler.cancel(timer);
            }
        }
        if let Some(timer) = state.pacing_timer.take() {
            scheduler.cancel(timer);
        }
        let unsent = state.paced.len();
        state.paced.clear();
        state.history.clear();

        if dropped > 0 || unsent > 0 {
            info!(
                "Flushed tx: {} reliable send(s), {} unsent packet(s)",
                dropped, unsent
            );
        }
    }

    /// Sequence number the next data fragment will carry.
    pub fn get_next_seq_num(&self) -> SeqNum {
        lock(&self.shared.state).fragmenter.next_seq_num()
    }

    /// Restart the sequence counter at 0 (link reset).
    ///
    /// Retained fragments are forgotten since their sequence numbers are
    /// about to be reused.
    pub fn reset_seq_num(&self) {
        let mut state = lock(&self.shared.state);
        state.fragmenter.reset_seq_num();
        state.history.clear();
    }

    pub fn set_max_ack_retries(&self, retries: u32) {
        lock(&self.shared.state).max_ack_retries = retries;
    }

    /// Change the ACK wait for attempts started from now on.
    pub fn change_message_timeout(&self, timeout: Duration) {
        lock(&self.shared.state).message_timeout = timeout;
    }

    /// Change packet pacing. Zero sends immediately, releasing anything still
    /// waiting for a slot.
    pub fn change_connection_interval(&self, interval: Duration) {
        let mut state = lock(&self.shared.state);
        state.connection_interval = interval;
        if !interval.is_zero() {
            return;
        }
        if let Some(timer) = state.pacing_timer.take() {
            self.shared.scheduler.cancel(timer);
        }
        while let Some(packet) = state.paced.pop_front() {
            self.queue_now(&state, &packet);
        }
    }

    pub fn set_delivery_observer<O>(&self, observer: O)
    where
        O: DeliveryObserver + 'static,
    {
        lock(&self.shared.state).observer = Some(Arc::new(observer));
    }

    /// Number of reliable sends still awaiting an ACK_REPLY.
    pub fn pending_reliable(&self) -> usize {
        lock(&self.shared.state).reliable.len()
    }

    /// Packets waiting for a pacing slot.
    pub fn queued_packets(&self) -> usize {
        lock(&self.shared.state).paced.len()
    }

    pub fn stats(&self) -> &LinkStats {
        &self.shared.stats
    }

    /// Shared handle to the counters, for pairing with an [`Rx`](super::Rx).
    pub fn stats_handle(&self) -> Arc<LinkStats> {
        Arc::clone(&self.shared.stats)
    }

    fn downgrade(&self) -> Weak<TxShared> {
        Arc::downgrade(&self.shared)
    }

    fn upgrade(shared: &Weak<TxShared>) -> Option<Self> {
        shared.upgrade().map(|shared| Self { shared })
    }

    /// Fragment `message`, transmit every fragment and retain it for NACKs.
    fn send_run(
        &self,
        state: &mut TxState,
        message: &[u8],
        flags: FragmentFlags,
    ) -> Result<Vec<Fragment>, TxError> {
        let mut fragments = Vec::with_capacity(state.fragmenter.fragment_count(message.len()));
        state
            .fragmenter
            .fragmentize(message, flags, |fragment| fragments.push(fragment))?;

        for fragment in &fragments {
            self.transmit(state, fragment);
            keep_for_nack(state, fragment.clone());
        }
        Ok(fragments)
    }

    /// Send now, or wait for a pacing slot.
    fn transmit(&self, state: &mut TxState, fragment: &Fragment) {
        if !fragment.is_control() {
            LinkStats::bump(&self.shared.stats.fragments_sent);
        }
        let packet = fragment.to_bytes();

        if state.connection_interval.is_zero() {
            self.queue_now(state, &packet);
        } else if state.pacing_timer.is_none() {
            // Idle link: this packet takes the current slot
            self.queue_now(state, &packet);
            state.pacing_timer = Some(self.schedule_pacing(state.connection_interval));
        } else {
            state.paced.push_back(packet);
        }
    }

    fn queue_now(&self, state: &TxState, packet: &[u8]) {
        if !self.shared.sink.queue_write(packet, state.queue_timeout) {
            warn!("Queue rejected {} byte packet", packet.len());
            LinkStats::bump(&self.shared.stats.drops);
        }
    }

    fn schedule_pacing(&self, interval: Duration) -> TimerId {
        let weak = self.downgrade();
        self.shared.scheduler.schedule(
            interval,
            Box::new(move || {
                if let Some(tx) = Tx::upgrade(&weak) {
                    tx.on_pacing_slot();
                }
            }),
        )
    }

    fn on_pacing_slot(&self) {
        let mut state = lock(&self.shared.state);
        state.pacing_timer = None;
        let Some(packet) = state.paced.pop_front() else {
            return;
        };
        self.queue_now(&state, &packet);
        state.pacing_timer = Some(self.schedule_pacing(state.connection_interval));
    }

    fn schedule_ack_timeout(&self, id: MessageId, wait: Duration) -> TimerId {
        let weak = self.downgrade();
        self.shared.scheduler.schedule(
            wait,
            Box::new(move || {
                if let Some(tx) = Tx::upgrade(&weak) {
                    tx.on_ack_timeout(id);
                }
            }),
        )
    }

    fn on_ack_timeout(&self, id: MessageId) {
        let (event, observer) = {
            let mut state = lock(&self.shared.state);
            let Some(mut send) = state.reliable.remove(&id) else {
                return;
            };
            send.timer = None;

            if send.retries_left == 0 {
                let retries = send.attempts - 1;
                error!(
                    "{}: no ack after {} attempt(s), giving up on {} bytes",
                    id,
                    send.attempts,
                    send.len
                );
                LinkStats::bump(&self.shared.stats.messages_failed);
                let event = DeliveryEvent::Failed(id, TxError::AckTimeoutExhausted { retries });
                (event, state.observer.clone())
            } else {
                send.retries_left -= 1;
                send.attempts += 1;
                for fragment in &send.fragments {
                    self.transmit(&mut state, &fragment.as_retransmission());
                    // Keep the run NACK-servable even if newer sends pushed it out
                    keep_for_nack(&mut state, fragment.clone());
                }
                let (first, stop) = span(&send.fragments);
                warn!(
                    "{}: ack timeout, resending {} ..= {} (attempt {}, {} retries left)",
                    id, first, stop, send.attempts, send.retries_left
                );
                self.shared
                    .stats
                    .retransmissions
                    .fetch_add(send.fragments.len(), Ordering::Relaxed);
                let now = self.shared.scheduler.now();
                let wait = ack_wait(&state);
                send.last_sent = now;
                send.deadline = now + wait;
                send.timer = Some(self.schedule_ack_timeout(id, wait));
                state.reliable.insert(id, send);
                return;
            }
        };

        if let Some(observer) = observer {
            observer.on_delivery(event);
        }
    }

    /// Deadline of the reliable send `id`, if it is still pending.
    pub fn ack_deadline(&self, id: MessageId) -> Option<Instant> {
        lock(&self.shared.state).reliable.get(&id).map(|send| send.deadline)
    }
}

/// Sequence span `first ..= last` of a fragment run.
fn span(run: &[Fragment]) -> (SeqNum, SeqNum) {
    let first = run.first().map_or(SeqNum::ZERO, |f| f.seq);
    let last = run.last().map_or(first, |f| f.seq);
    (first, last)
}

/// Add `fragment` to the bounded retransmit history, replacing an older copy
/// under the same sequence.
fn keep_for_nack(state: &mut TxState, fragment: Fragment) {
    state.history.retain(|held| held.seq != fragment.seq);
    if state.history.len() == state.history_limit {
        state.history.pop_front();
    }
    state.history.push_back(fragment);
}

fn check_len(state: &TxState, message: &[u8]) -> Result<(), TxError> {
    if message.is_empty() {
        return Err(TxError::EmptyMessage);
    }
    if message.len() > state.max_message_len {
        return Err(TxError::MessageTooLarge {
            len: message.len(),
            max: state.max_message_len,
        });
    }
    Ok(())
}

/// ACK wait for an attempt: the message timeout plus the time queued packets
/// need to leave a paced link.
fn ack_wait(state: &TxState) -> Duration {
    let backlog = u32::try_from(state.paced.len()).unwrap_or(u32::MAX);
    state.message_timeout + state.connection_interval.saturating_mul(backlog)
}
