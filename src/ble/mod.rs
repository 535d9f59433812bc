//! BLE link framing.
//!
//! This module contains the protocol pieces that do not depend on timers or
//! I/O: the circular sequence space, the fragment wire format, and the
//! fragmenter/reassembler pair that carries messages larger than the BLE MTU.

mod fragment;
mod fragmenter;
mod reassembler;
mod sequence;

pub use fragment::{
    is_ack_reply_packet, is_nack_packet, is_retrans_packet, peek_flags, Fragment, FragmentError,
    FragmentFlags, HEADER_SIZE,
};
pub use fragmenter::Fragmenter;
pub use reassembler::{
    CompletedMessage, OverrideFn, Reassembler, ReassemblyError, ReassemblyEvent, ReassemblyState,
    DEFAULT_MAX_HELD,
};
pub use sequence::{SeqNum, SEQNUM_RANGE};
