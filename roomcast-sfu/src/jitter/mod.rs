//! Retransmission buffering
//!
//! Every forwarded RTP packet is kept for a short while in a per-SSRC ring
//! buffer so that NACKs from subscribers can be answered by the SFU itself
//! instead of travelling all the way back to the publisher. The same buffer
//! notices gaps in the publisher's stream and produces NACKs of its own.

mod buffer;
mod handler;
mod nack;
mod store;

pub use buffer::SequenceRingBuffer;
pub use handler::{new_retransmit_handler, JitterHandler, NoopJitterHandler, RetransmitHandler};
pub use nack::{add_blp, create_nack_pair, packet_list, sub_blp, NACK_PAIR_SPAN};
pub use store::JitterStore;

/// Slots per ring buffer, one for every 16-bit sequence number
pub const BUFFER_SIZE: usize = 1 << 16;

/// Sequence numbers covered by one loss-detection window
pub const DEFAULT_NACK_WINDOW_SIZE: u16 = 17;

/// Two seconds of a 90 kHz media clock
pub const DEFAULT_EVICTION_THRESHOLD: u32 = 180_000;
