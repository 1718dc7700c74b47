//! SSRC-keyed registry of ring buffers

use parking_lot::Mutex;
use std::collections::HashMap;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use webrtc::rtp::packet::Packet;

use super::buffer::SequenceRingBuffer;
use super::{DEFAULT_EVICTION_THRESHOLD, DEFAULT_NACK_WINDOW_SIZE};

/// Ring buffers for every SSRC currently being forwarded.
///
/// One lock covers the whole map. `remove_buffer` does not stop a push that
/// is already in flight for the same SSRC; such a push recreates the buffer
/// and it lives until the next removal.
pub struct JitterStore {
    buffers: Mutex<HashMap<u32, SequenceRingBuffer>>,
    nack_window_size: u16,
    eviction_threshold: u32,
}

impl JitterStore {
    #[must_use]
    pub fn new(nack_window_size: u16, eviction_threshold: u32) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            nack_window_size,
            eviction_threshold,
        }
    }

    /// Buffer a packet, creating the SSRC's ring on first use
    pub fn push_rtp(&self, packet: &Packet) -> Option<TransportLayerNack> {
        let mut buffers = self.buffers.lock();
        buffers
            .entry(packet.header.ssrc)
            .or_insert_with(|| {
                SequenceRingBuffer::with_settings(self.nack_window_size, self.eviction_threshold)
            })
            .push(packet.clone())
    }

    #[must_use]
    pub fn get_packet(&self, ssrc: u32, seq: u16) -> Option<Packet> {
        self.buffers
            .lock()
            .get(&ssrc)
            .and_then(|buffer| buffer.get_packet(seq))
            .cloned()
    }

    /// Returns whether a buffer existed for the SSRC
    pub fn remove_buffer(&self, ssrc: u32) -> bool {
        self.buffers.lock().remove(&ssrc).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }
}

impl Default for JitterStore {
    fn default() -> Self {
        Self::new(DEFAULT_NACK_WINDOW_SIZE, DEFAULT_EVICTION_THRESHOLD)
    }
}
