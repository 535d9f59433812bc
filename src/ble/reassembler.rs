//! Reassembling fragments back into messages.
//!
//! The [`Reassembler`] owns a capacity-bounded assembly buffer and an
//! *expected sequence* cursor. Only the fragment whose sequence equals the
//! cursor is ever applied to the buffer, so a completed message is always
//! built from a contiguous run `START ..= STOP`.
//!
//! Fragments that arrive ahead of the cursor open a *gap*. They are kept in a
//! small holding area (bounded by `max_held`) without touching the buffer.
//! Once the missing fragment arrives as a RETRANS answer to a NACK, the held
//! fragments that became contiguous are applied in order. A plain
//! (non-RETRANS) fragment at the cursor is applied but does not release the
//! held ones; the gap stays open until the peer retransmits.
//!
//! # State machine
//!
//! ```text
//!                 START (seq == expected)
//! WaitingForStart ───────────────────────▶ Collecting
//!        ▲                                    │
//!        └──── STOP / overflow / flush ◀──────┘
//! ```
//!
//! While waiting with no gap open, a START anywhere on the circle begins a
//! new message and moves the cursor to it, so a peer whose counter was reset
//! (or never matched ours) is picked up at once. The only exception is a
//! repeat of a recently completed message, which is reported as stale.
//!
//! A START arriving while collecting abandons the partial message and starts
//! over. Other fragments behind the cursor are stale duplicates and are
//! dropped.
//!
//! Every decision is reported as a [`ReassemblyEvent`]; nothing here is fatal.

use super::fragment::{Fragment, FragmentFlags};
use super::sequence::SeqNum;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Default maximum number of out-of-order fragments held while a gap is open.
pub const DEFAULT_MAX_HELD: usize = 64;

/// Completed messages remembered to recognise their repeats.
const RECENT_RUNS: usize = 16;

/// Reassembly state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    /// No message in progress; only a START fragment can begin one.
    WaitingForStart,
    /// A START was applied; collecting until STOP.
    Collecting,
}

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    /// Message bytes.
    pub data: Vec<u8>,
    /// Sequence number of the START fragment.
    pub first_seq: SeqNum,
    /// Sequence number of the STOP fragment.
    pub last_seq: SeqNum,
    /// The sender asked for an ACK_REPLY.
    pub ack_requested: bool,
}

/// Sequence span `first ..= last` of a completed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CompletedRun {
    first: SeqNum,
    last: SeqNum,
}

impl CompletedRun {
    fn contains(&self, seq: SeqNum) -> bool {
        SeqNum::distance(seq, self.first) >= 0 && SeqNum::distance(self.last, seq) >= 0
    }
}

/// Non-fatal reassembly diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    /// A fragment arrived ahead of the expected sequence; it is held, not applied.
    SequenceGap { expected: SeqNum, received: SeqNum },
    /// The message outgrew the assembly buffer and was dropped.
    BufferOverflow { capacity: usize },
    /// Fragment was already consumed or is already held.
    DuplicateOrStale(SeqNum),
    /// A non-START fragment arrived while no message was in progress.
    MissingStart(SeqNum),
    /// The holding area is full; the out-of-order fragment was dropped.
    HoldingAreaFull(SeqNum),
}

impl fmt::Display for ReassemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SequenceGap { expected, received } => {
                write!(f, "sequence gap: expected {}, received {}", expected, received)
            }
            Self::BufferOverflow { capacity } => {
                write!(f, "message exceeds assembly buffer of {} bytes", capacity)
            }
            Self::DuplicateOrStale(seq) => write!(f, "duplicate or stale fragment {}", seq),
            Self::MissingStart(seq) => write!(f, "fragment {} without a preceding START", seq),
            Self::HoldingAreaFull(seq) => write!(f, "holding area full, dropped fragment {}", seq),
        }
    }
}

impl std::error::Error for ReassemblyError {}

/// Outcome of feeding one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyEvent {
    Completed(CompletedMessage),
    Error(ReassemblyError),
}

impl ReassemblyEvent {
    /// The completed message, if this event carries one.
    pub fn into_completed(self) -> Option<CompletedMessage> {
        match self {
            Self::Completed(message) => Some(message),
            Self::Error(_) => None,
        }
    }
}

/// Diagnostic hook invoked for every [`ReassemblyError`].
pub type OverrideFn = Box<dyn FnMut(&ReassemblyError) + Send>;

/// Rebuilds messages from fragments arriving in any order.
pub struct Reassembler {
    /// Assembly buffer; never grows beyond `capacity`.
    buffer: Vec<u8>,
    capacity: usize,
    state: ReassemblyState,
    /// Next sequence number that may be applied.
    expected: SeqNum,
    /// Sequence of the START fragment of the message being collected.
    first_seq: SeqNum,
    /// Out-of-order fragments ahead of `expected`.
    held: HashMap<SeqNum, Fragment>,
    max_held: usize,
    /// Hold (instead of resync on) a plain START that arrives ahead of the cursor.
    hold_gaps: bool,
    /// Most recent completed messages, oldest first.
    recent: VecDeque<CompletedRun>,
    override_fn: Option<OverrideFn>,
}

impl fmt::Debug for Reassembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reassembler")
            .field("state", &self.state)
            .field("expected", &self.expected)
            .field("buffered", &self.buffer.len())
            .field("capacity", &self.capacity)
            .field("held", &self.held.len())
            .finish()
    }
}

impl Reassembler {
    /// Create a reassembler with an assembly buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self::with_limits(capacity, DEFAULT_MAX_HELD)
    }

    /// Create a reassembler with a custom holding-area limit.
    pub fn with_limits(capacity: usize, max_held: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            state: ReassemblyState::WaitingForStart,
            expected: SeqNum::ZERO,
            first_seq: SeqNum::ZERO,
            held: HashMap::new(),
            max_held,
            hold_gaps: true,
            recent: VecDeque::with_capacity(RECENT_RUNS),
            override_fn: None,
        }
    }

    /// Install a diagnostic hook called for every reassembly error.
    pub fn set_override<F>(&mut self, hook: F)
    where
        F: FnMut(&ReassemblyError) + Send + 'static,
    {
        self.override_fn = Some(Box::new(hook));
    }

    /// Remove the diagnostic hook.
    pub fn clear_override(&mut self) {
        self.override_fn = None;
    }

    /// Choose what a plain START ahead of the cursor does while a message is
    /// in progress or a gap is open.
    ///
    /// With `true` it is held like any other out-of-order fragment, so the
    /// fragments in front of it can still be recovered. With `false` it
    /// abandons whatever was missing and restarts at its sequence.
    pub fn set_hold_gaps(&mut self, hold: bool) {
        self.hold_gaps = hold;
    }

    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    pub fn is_collecting(&self) -> bool {
        self.state == ReassemblyState::Collecting
    }

    /// Next sequence number that will be applied.
    pub fn expected_seq(&self) -> SeqNum {
        self.expected
    }

    /// True while out-of-order fragments are waiting for a missing one.
    pub fn has_gap(&self) -> bool {
        !self.held.is_empty()
    }

    /// Number of held out-of-order fragments.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Bytes currently buffered for the message in progress.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True if `seq` is the STOP of a recently completed message.
    pub fn completed_stop(&self, seq: SeqNum) -> bool {
        self.recent.iter().any(|run| run.last == seq)
    }

    /// Forget the completed message that started at `first_seq`, so a
    /// retransmission of it is reassembled again instead of treated as stale.
    pub fn forget_completed(&mut self, first_seq: SeqNum) {
        self.recent.retain(|run| run.first != first_seq);
    }

    /// Feed one data fragment.
    ///
    /// Returns the messages completed by this fragment, including any held
    /// fragments it made contiguous, plus diagnostics in arrival order.
    pub fn reassemble_fragment(&mut self, fragment: Fragment) -> Vec<ReassemblyEvent> {
        let mut events = Vec::new();

        if fragment.is_control() {
            debug!("Ignoring control fragment {} in reassembler", fragment.seq);
            return events;
        }

        let retrans = fragment.is_retrans();
        let before = self.expected;
        match self.process(fragment) {
            Ok(Some(message)) => events.push(ReassemblyEvent::Completed(message)),
            Ok(None) => {}
            Err(e) => events.push(ReassemblyEvent::Error(e)),
        }
        // Held fragments are only released by a retransmission closing the gap
        if retrans && self.expected != before {
            self.drain_held(&mut events);
        }
        self.report(&events);
        events
    }

    /// Discard the message in progress and all held fragments.
    ///
    /// The expected-sequence cursor is kept.
    pub fn flush(&mut self) {
        if self.is_collecting() || self.has_gap() {
            debug!(
                "Flushing reassembler ({} bytes buffered, {} held)",
                self.buffer.len(),
                self.held.len()
            );
        }
        self.reset_buffer();
        self.held.clear();
    }

    /// Flush and move the cursor to `seq` (after a link reset).
    pub fn reset_seq_num(&mut self, seq: SeqNum) {
        self.flush();
        self.recent.clear();
        self.expected = seq;
    }

    /// Give up on the missing fragment(s) of the current gap.
    ///
    /// The partial message is discarded and the cursor jumps to the oldest
    /// held fragment. Whatever becomes contiguous from there is applied, so
    /// later complete messages are still delivered.
    pub fn skip_gap(&mut self) -> Vec<ReassemblyEvent> {
        let mut events = Vec::new();
        let oldest = self
            .held
            .keys()
            .copied()
            .min_by_key(|seq| SeqNum::distance(*seq, self.expected));

        if self.is_collecting() {
            warn!(
                "Abandoning partial message started at {} ({} bytes)",
                self.first_seq,
                self.buffer.len()
            );
        }
        self.reset_buffer();

        if let Some(seq) = oldest {
            debug!("Skipping gap {} -> {}", self.expected, seq);
            self.forget_skipped(seq);
            self.expected = seq;
            self.drain_held(&mut events);
        }
        self.report(&events);
        events
    }

    fn process(&mut self, fragment: Fragment) -> Result<Option<CompletedMessage>, ReassemblyError> {
        let distance = SeqNum::distance(fragment.seq, self.expected);

        if distance != 0 && fragment.is_start() && !self.is_collecting() && !self.has_gap() {
            if self.recent.iter().any(|run| run.contains(fragment.seq)) {
                return Err(ReassemblyError::DuplicateOrStale(fragment.seq));
            }
            self.resync(fragment.seq);
            return self.apply(fragment);
        }

        if distance < 0 {
            return Err(ReassemblyError::DuplicateOrStale(fragment.seq));
        }

        if distance > 0 {
            let resync = fragment.is_start() && (fragment.is_retrans() || !self.hold_gaps);
            if !resync {
                return self.hold(fragment);
            }
            self.resync(fragment.seq);
        }

        // The arriving copy supersedes a held one at the same sequence
        self.held.remove(&fragment.seq);
        self.apply(fragment)
    }

    /// Apply a fragment whose sequence equals the cursor.
    fn apply(&mut self, fragment: Fragment) -> Result<Option<CompletedMessage>, ReassemblyError> {
        let seq = fragment.seq;
        // The cursor is sweeping over this sequence again; older runs using it are gone
        self.recent.retain(|run| !run.contains(seq));

        if fragment.is_start() {
            if self.is_collecting() {
                warn!(
                    "START {} while collecting message from {}, restarting",
                    seq, self.first_seq
                );
            }
            self.reset_buffer();
            self.state = ReassemblyState::Collecting;
            self.first_seq = seq;
        } else if !self.is_collecting() {
            self.expected = seq.next();
            return Err(ReassemblyError::MissingStart(seq));
        }

        self.expected = seq.next();

        if self.buffer.len() + fragment.payload.len() > self.capacity {
            warn!(
                "Message from {} overflows {} byte buffer, dropping",
                self.first_seq, self.capacity
            );
            self.reset_buffer();
            return Err(ReassemblyError::BufferOverflow {
                capacity: self.capacity,
            });
        }
        self.buffer.extend_from_slice(&fragment.payload);

        if !fragment.is_stop() {
            return Ok(None);
        }

        let message = CompletedMessage {
            data: self.buffer.to_vec(),
            first_seq: self.first_seq,
            last_seq: seq,
            ack_requested: fragment.flags.contains(FragmentFlags::ACK_REQUEST),
        };
        debug!(
            "Reassembled {} bytes ({} ..= {})",
            message.data.len(),
            message.first_seq,
            message.last_seq
        );
        if self.recent.len() == RECENT_RUNS {
            self.recent.pop_front();
        }
        self.recent.push_back(CompletedRun {
            first: message.first_seq,
            last: seq,
        });
        self.reset_buffer();
        Ok(Some(message))
    }

    fn hold(&mut self, fragment: Fragment) -> Result<Option<CompletedMessage>, ReassemblyError> {
        let seq = fragment.seq;
        if self.held.contains_key(&seq) {
            return Err(ReassemblyError::DuplicateOrStale(seq));
        }
        if self.held.len() >= self.max_held {
            return Err(ReassemblyError::HoldingAreaFull(seq));
        }
        self.held.insert(seq, fragment);
        Err(ReassemblyError::SequenceGap {
            expected: self.expected,
            received: seq,
        })
    }

    /// Jump the cursor forward to `seq`, dropping everything before it.
    fn resync(&mut self, seq: SeqNum) {
        debug!("Resynchronising {} -> {}", self.expected, seq);
        self.forget_skipped(seq);
        self.reset_buffer();
        self.expected = seq;
        self.held.retain(|held, _| SeqNum::distance(*held, seq) > 0);
    }

    /// Drop remembered runs starting in `expected .. to` when the cursor
    /// jumps forward over them.
    fn forget_skipped(&mut self, to: SeqNum) {
        let from = self.expected;
        if SeqNum::distance(to, from) <= 0 {
            return;
        }
        self.recent.retain(|run| {
            SeqNum::distance(run.first, from) < 0 || SeqNum::distance(run.first, to) >= 0
        });
    }

    fn drain_held(&mut self, events: &mut Vec<ReassemblyEvent>) {
        while let Some(next) = self.held.remove(&self.expected) {
            match self.apply(next) {
                Ok(Some(message)) => events.push(ReassemblyEvent::Completed(message)),
                Ok(None) => {}
                Err(e) => events.push(ReassemblyEvent::Error(e)),
            }
        }
    }

    fn reset_buffer(&mut self) {
        self.buffer.clear();
        self.state = ReassemblyState::WaitingForStart;
    }

    fn report(&mut self, events: &[ReassemblyEvent]) {
        let Some(hook) = self.override_fn.as_mut() else {
            return;
        };
        for event in events {
            if let ReassemblyEvent::Error(e) = event {
                hook(e);
            }
        }
    }
}
