//! Splitting outgoing messages into MTU-sized fragments.
//!
//! BLE characteristic writes are limited to the negotiated MTU (20 bytes by
//! default, up to 512 after negotiation). The [`Fragmenter`] cuts a message
//! into runs of fragments and stamps each one with the next value of its
//! sequence counter. The counter persists across messages: sequence numbers
//! count fragments, not messages.
//!
//! # Example
//!
//! ```
//! use ble_reliable_link::ble::{Fragmenter, FragmentFlags};
//!
//! let mut fragmenter = Fragmenter::new(8); // 6-byte payloads
//! let fragments = fragmenter.fragment(b"hello world").unwrap();
//! assert_eq!(fragments.len(), 2);
//! assert!(fragments[0].flags.contains(FragmentFlags::START));
//! assert!(fragments[1].flags.contains(FragmentFlags::STOP));
//! ```

use super::fragment::{Fragment, FragmentError, FragmentFlags, HEADER_SIZE};
use super::sequence::SeqNum;

/// Splits messages into fragments.
#[derive(Debug)]
pub struct Fragmenter {
    /// Maximum fragment size (including header).
    mtu: usize,
    /// Next sequence number to use.
    next_seq: SeqNum,
}

impl Fragmenter {
    /// Create a new fragmenter with the given MTU, starting at sequence 0.
    ///
    /// # Panics
    ///
    /// Panics if MTU is less than HEADER_SIZE + 1 (minimum 3 bytes).
    pub fn new(mtu: usize) -> Self {
        Self::try_new(mtu).expect("MTU must be greater than header size")
    }

    /// Try to create a new fragmenter with the given MTU.
    pub fn try_new(mtu: usize) -> Result<Self, FragmentError> {
        Self::with_start_seq(mtu, SeqNum::ZERO)
    }

    /// Create a fragmenter whose first fragment uses `start_seq`.
    pub fn with_start_seq(mtu: usize, start_seq: SeqNum) -> Result<Self, FragmentError> {
        if mtu <= HEADER_SIZE {
            return Err(FragmentError::MtuTooSmall(mtu));
        }
        Ok(Self {
            mtu,
            next_seq: start_seq,
        })
    }

    /// Maximum payload bytes per fragment.
    pub fn max_payload(&self) -> usize {
        self.mtu - HEADER_SIZE
    }

    /// The configured MTU.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Number of fragments a message of `len` bytes needs.
    pub fn fragment_count(&self, len: usize) -> usize {
        len.div_ceil(self.max_payload())
    }

    /// Sequence number the next fragment will carry.
    pub fn next_seq_num(&self) -> SeqNum {
        self.next_seq
    }

    /// Restart the counter at 0 (used after a link reset).
    pub fn reset_seq_num(&mut self) {
        self.next_seq = SeqNum::ZERO;
    }

    /// Move the counter so the next fragment emitted carries `seq`.
    pub fn set_next_seq_num(&mut self, seq: SeqNum) {
        self.next_seq = seq;
    }

    /// Split `message` into fragments, handing each to `emit` in order.
    ///
    /// The first fragment carries START, the last carries STOP; a message that
    /// fits into a single fragment carries both. `extra_flags` (e.g. RETRANS,
    /// ACK_REQUEST) are added to every fragment. `emit` is called
    /// synchronously; no I/O happens here.
    ///
    /// Returns the sequence numbers of the first and last fragment.
    pub fn fragmentize<F>(
        &mut self,
        message: &[u8],
        extra_flags: FragmentFlags,
        mut emit: F,
    ) -> Result<(SeqNum, SeqNum), FragmentError>
    where
        F: FnMut(Fragment),
    {
        if message.is_empty() {
            return Err(FragmentError::EmptyMessage);
        }

        let first = self.next_seq;
        let mut last = first;
        let mut chunks = message.chunks(self.max_payload()).peekable();
        let mut is_first = true;

        while let Some(chunk) = chunks.next() {
            let mut flags = extra_flags;
            if is_first {
                flags |= FragmentFlags::START;
                is_first = false;
            }
            if chunks.peek().is_none() {
                flags |= FragmentFlags::STOP;
            }

            last = self.next_seq;
            emit(Fragment::new(flags, self.next_seq, chunk.to_vec()));
            self.next_seq = self.next_seq.next();
        }

        Ok((first, last))
    }

    /// Convenience wrapper collecting the fragments of `message`.
    pub fn fragment(&mut self, message: &[u8]) -> Result<Vec<Fragment>, FragmentError> {
        let mut fragments = Vec::with_capacity(self.fragment_count(message.len()));
        self.fragmentize(message, FragmentFlags::empty(), |f| fragments.push(f))?;
        Ok(fragments)
    }
}
