//! Fragment wire format.
//!
//! Each fragment written to the BLE characteristic has a 2-byte header:
//! ```text
//! [flags: 1 byte][sequence: 1 byte][payload: N bytes]
//! ```
//!
//! Flags:
//! - Bit 0: START - first fragment of a message
//! - Bit 1: STOP - last fragment of a message
//! - Bit 2: NACK - request to resend the fragment named by `sequence`
//! - Bit 3: RETRANS - this fragment is a resend of previously sent data
//! - Bit 4: ACK_REPLY - the message ending at `sequence` was received
//! - Bit 5: ACK_REQUEST - the receiver must answer with ACK_REPLY
//!
//! Bits 6 and 7 are reserved and must be zero.
//!
//! NACK and ACK_REPLY fragments are control fragments: they carry no payload
//! and their sequence field refers to a data fragment instead of consuming a
//! sequence number of their own.

use super::sequence::SeqNum;
use bitflags::bitflags;

/// Header size in bytes (flags + sequence).
pub const HEADER_SIZE: usize = 2;

bitflags! {
    /// Header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FragmentFlags: u8 {
        /// First fragment of a message.
        const START = 0x01;
        /// Last fragment of a message.
        const STOP = 0x02;
        /// Negative acknowledgement for the named sequence.
        const NACK = 0x04;
        /// Resend of previously transmitted data.
        const RETRANS = 0x08;
        /// Acknowledgement of a complete reliable message.
        const ACK_REPLY = 0x10;
        /// Sender expects an ACK_REPLY for this message.
        const ACK_REQUEST = 0x20;
    }
}

impl FragmentFlags {
    /// Flags that mark a control fragment rather than message data.
    pub const CONTROL: FragmentFlags = FragmentFlags::NACK.union(FragmentFlags::ACK_REPLY);
}

/// Returns true if the flags mark a NACK control fragment.
pub fn is_nack_packet(flags: FragmentFlags) -> bool {
    flags.contains(FragmentFlags::NACK)
}

/// Returns true if the flags mark an ACK_REPLY control fragment.
pub fn is_ack_reply_packet(flags: FragmentFlags) -> bool {
    flags.contains(FragmentFlags::ACK_REPLY)
}

/// Returns true if the flags mark a retransmitted data fragment.
pub fn is_retrans_packet(flags: FragmentFlags) -> bool {
    flags.contains(FragmentFlags::RETRANS)
}

/// Read the flags of a raw packet without decoding the rest.
///
/// Returns `None` for packets shorter than the header or with reserved bits
/// set. Handy for bridges that only need [`is_nack_packet`] and friends.
pub fn peek_flags(bytes: &[u8]) -> Option<FragmentFlags> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    FragmentFlags::from_bits(bytes[0])
}

/// A single fragment of a larger message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Header flags.
    pub flags: FragmentFlags,
    /// Sequence number (wraps around).
    pub seq: SeqNum,
    /// Payload data (without header).
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Create a new fragment.
    pub fn new(flags: FragmentFlags, seq: SeqNum, payload: Vec<u8>) -> Self {
        Self {
            flags,
            seq,
            payload,
        }
    }

    /// Build a NACK asking the peer to resend `missing`.
    pub fn nack(missing: SeqNum) -> Self {
        Self::new(FragmentFlags::NACK, missing, Vec::new())
    }

    /// Build an ACK_REPLY for the message whose STOP fragment was `stop_seq`.
    pub fn ack_reply(stop_seq: SeqNum) -> Self {
        Self::new(FragmentFlags::ACK_REPLY, stop_seq, Vec::new())
    }

    #[inline]
    pub fn is_start(&self) -> bool {
        self.flags.contains(FragmentFlags::START)
    }

    #[inline]
    pub fn is_stop(&self) -> bool {
        self.flags.contains(FragmentFlags::STOP)
    }

    #[inline]
    pub fn is_retrans(&self) -> bool {
        is_retrans_packet(self.flags)
    }

    /// True for NACK and ACK_REPLY fragments.
    #[inline]
    pub fn is_control(&self) -> bool {
        self.flags.intersects(FragmentFlags::CONTROL)
    }

    /// Copy of this fragment marked as a retransmission.
    pub fn as_retransmission(&self) -> Self {
        Self {
            flags: self.flags | FragmentFlags::RETRANS,
            seq: self.seq,
            payload: self.payload.clone(),
        }
    }

    /// Size on the wire (header + payload).
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize fragment to bytes (header + payload).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.push(self.flags.bits());
        bytes.push(self.seq.value());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Serialize fragment into provided buffer.
    ///
    /// Returns the number of bytes written, or error if buffer too small.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize, FragmentError> {
        let total_len = self.encoded_len();
        if buf.len() < total_len {
            return Err(FragmentError::BufferTooSmall);
        }
        buf[0] = self.flags.bits();
        buf[1] = self.seq.value();
        buf[HEADER_SIZE..total_len].copy_from_slice(&self.payload);
        Ok(total_len)
    }

    /// Deserialize fragment from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FragmentError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FragmentError::TooShort(bytes.len()));
        }
        let flags =
            FragmentFlags::from_bits(bytes[0]).ok_or(FragmentError::ReservedFlags(bytes[0]))?;
        Ok(Self {
            flags,
            seq: SeqNum::new(bytes[1]),
            payload: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Errors that can occur while building or decoding fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// Packet is too short to contain a header (malformed).
    TooShort(usize),
    /// Reserved flag bits are set (malformed).
    ReservedFlags(u8),
    /// MTU is too small to fit header plus at least one byte.
    MtuTooSmall(usize),
    /// Message is empty.
    EmptyMessage,
    /// Buffer too small for serialization.
    BufferTooSmall,
}

impl FragmentError {
    /// True for the decode errors that make a received packet unusable.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::TooShort(_) | Self::ReservedFlags(_))
    }
}

impl std::fmt::Display for FragmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort(len) => {
                write!(f, "malformed fragment: {} bytes is shorter than the header", len)
            }
            Self::ReservedFlags(bits) => {
                write!(f, "malformed fragment: reserved flag bits set ({:#04x})", bits)
            }
            Self::MtuTooSmall(mtu) => {
                write!(f, "MTU {} too small (minimum: {})", mtu, HEADER_SIZE + 1)
            }
            Self::EmptyMessage => write!(f, "cannot fragment empty message"),
            Self::BufferTooSmall => write!(f, "buffer too small for fragment"),
        }
    }
}

impl std::error::Error for FragmentError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_serialize_deserialize() {
        let flags = FragmentFlags::START | FragmentFlags::STOP;
        let fragment = Fragment::new(flags, SeqNum::new(42), vec![1, 2, 3]);
        let bytes = fragment.to_bytes();

        assert_eq!(bytes, vec![0x03, 42, 1, 2, 3]);

        let decoded = Fragment::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, fragment);
    }

    #[test]
    fn test_fragment_write_to_buffer() {
        let fragment = Fragment::new(FragmentFlags::START, SeqNum::new(1), vec![10, 20, 30]);
        let mut buf = [0u8; 10];

        let len = fragment.write_to(&mut buf).unwrap();
        assert_eq!(len, 5);
        assert_eq!(&buf[..5], &[0x01, 1, 10, 20, 30]);

        let mut small_buf = [0u8; 2];
        assert_eq!(fragment.write_to(&mut small_buf), Err(FragmentError::BufferTooSmall));
    }

    #[test]
    fn test_fragment_from_bytes_malformed() {
        assert_eq!(Fragment::from_bytes(&[]), Err(FragmentError::TooShort(0)));
        assert_eq!(Fragment::from_bytes(&[0x01]), Err(FragmentError::TooShort(1)));
        // Exactly header size is OK (empty payload)
        assert!(Fragment::from_bytes(&[0x01, 0]).is_ok());

        let err = Fragment::from_bytes(&[0x80, 0, 1]).unwrap_err();
        assert_eq!(err, FragmentError::ReservedFlags(0x80));
        assert!(err.is_malformed());
        assert!(!FragmentError::EmptyMessage.is_malformed());
    }

    #[test]
    fn test_classifiers() {
        let nack = Fragment::nack(SeqNum::new(7));
        assert!(is_nack_packet(nack.flags));
        assert!(!is_ack_reply_packet(nack.flags));
        assert!(nack.is_control());
        assert!(nack.payload.is_empty());

        let ack = Fragment::ack_reply(SeqNum::new(9));
        assert!(is_ack_reply_packet(ack.flags));
        assert!(!is_nack_packet(ack.flags));
        assert!(ack.is_control());

        let data = Fragment::new(FragmentFlags::START, SeqNum::new(0), vec![1]);
        assert!(!data.is_control());
        assert!(!is_retrans_packet(data.flags));
        assert!(is_retrans_packet(data.as_retransmission().flags));
    }

    #[test]
    fn test_retransmission_keeps_seq_and_payload() {
        let flags = FragmentFlags::STOP | FragmentFlags::ACK_REQUEST;
        let data = Fragment::new(flags, SeqNum::new(200), vec![4, 5]);
        let resend = data.as_retransmission();
        assert_eq!(resend.seq, data.seq);
        assert_eq!(resend.payload, data.payload);
        assert!(resend.is_stop());
        assert!(resend.flags.contains(FragmentFlags::ACK_REQUEST));
        assert!(resend.is_retrans());
    }

    #[test]
    fn test_peek_flags() {
        let bytes = Fragment::nack(SeqNum::new(3)).to_bytes();
        assert_eq!(peek_flags(&bytes), Some(FragmentFlags::NACK));
        assert_eq!(peek_flags(&[0x04]), None);
        assert_eq!(peek_flags(&[0xC0, 0]), None);
    }
}
