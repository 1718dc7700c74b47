//! Per-SSRC ring of recently forwarded RTP packets

use webrtc::rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
use webrtc::rtp::packet::Packet;

use super::nack::{add_blp, NACK_PAIR_SPAN};
use super::{BUFFER_SIZE, DEFAULT_EVICTION_THRESHOLD, DEFAULT_NACK_WINDOW_SIZE};

/// Sequence distances at or beyond this are treated as "behind"
const HALF_SEQ_RANGE: u16 = 0x8000;

/// Timestamp distances at or beyond this are treated as "in the future"
const HALF_TS_RANGE: u32 = 0x8000_0000;

/// Fixed-size ring indexed directly by RTP sequence number.
///
/// Sequence numbers and timestamps wrap, so every distance is computed with
/// wrapping subtraction.
pub struct SequenceRingBuffer {
    slots: Box<[Option<Box<Packet>>]>,
    initialized: bool,
    ssrc: u32,
    last_pushed: u16,
    last_nacked: u16,
    last_cleared: u16,
    last_cleared_timestamp: u32,
    nack_window_size: u16,
    eviction_threshold: u32,
}

impl SequenceRingBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_NACK_WINDOW_SIZE, DEFAULT_EVICTION_THRESHOLD)
    }

    /// A window smaller than two sequence numbers cannot contain a gap
    #[must_use]
    pub fn with_settings(nack_window_size: u16, eviction_threshold: u32) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(BUFFER_SIZE).collect(),
            initialized: false,
            ssrc: 0,
            last_pushed: 0,
            last_nacked: 0,
            last_cleared: 0,
            last_cleared_timestamp: 0,
            nack_window_size: nack_window_size.max(2),
            eviction_threshold: eviction_threshold.max(1),
        }
    }

    /// Store a packet, evict expired ones and check the loss window.
    ///
    /// Returns a NACK naming the gaps of the window that just completed, if
    /// there were any.
    pub fn push(&mut self, packet: Packet) -> Option<TransportLayerNack> {
        let seq = packet.header.sequence_number;
        let timestamp = packet.header.timestamp;

        if !self.initialized {
            self.initialized = true;
            self.ssrc = packet.header.ssrc;
            self.last_nacked = seq;
            self.last_cleared = seq.wrapping_sub(1);
            self.last_cleared_timestamp = timestamp;
        }

        self.slots[usize::from(seq)] = Some(Box::new(packet));
        self.last_pushed = seq;

        self.clear_old_packets(timestamp, seq);
        self.check_loss_window(seq)
    }

    /// Look up a stored packet
    #[must_use]
    pub fn get_packet(&self, seq: u16) -> Option<&Packet> {
        self.slots[usize::from(seq)].as_deref()
    }

    #[must_use]
    pub const fn ssrc(&self) -> u32 {
        self.ssrc
    }

    #[must_use]
    pub const fn last_pushed(&self) -> Option<u16> {
        if self.initialized {
            Some(self.last_pushed)
        } else {
            None
        }
    }

    fn is_expired(&self, now: u32, then: u32) -> bool {
        let age = now.wrapping_sub(then);
        age >= self.eviction_threshold && age < HALF_TS_RANGE
    }

    // Assumes timestamps grow with sequence numbers: the walk stops at the
    // first stored packet that is still young enough, even if older ones
    // (reordered) sit behind it.
    fn clear_old_packets(&mut self, timestamp: u32, seq: u16) {
        if !self.is_expired(timestamp, self.last_cleared_timestamp) {
            return;
        }

        let mut i = self.last_cleared.wrapping_add(1);
        while i != seq {
            if let Some(stored) = self.slots[usize::from(i)].as_deref() {
                let stored_timestamp = stored.header.timestamp;
                if !self.is_expired(timestamp, stored_timestamp) {
                    break;
                }
                self.slots[usize::from(i)] = None;
                self.last_cleared_timestamp = stored_timestamp;
            }
            self.last_cleared = i;
            i = i.wrapping_add(1);
        }
    }

    fn check_loss_window(&mut self, seq: u16) -> Option<TransportLayerNack> {
        let distance = seq.wrapping_sub(self.last_nacked);
        if distance >= HALF_SEQ_RANGE || distance < self.nack_window_size - 1 {
            return None;
        }
        self.last_nacked = seq;

        let mut nacks = Vec::new();
        let mut chunk_start = seq.wrapping_sub(self.nack_window_size - 1);
        let mut remaining = self.nack_window_size;
        while remaining > 0 {
            let len = remaining.min(NACK_PAIR_SPAN);
            if let Some(pair) = self.scan_chunk(chunk_start, len) {
                nacks.push(pair);
            }
            chunk_start = chunk_start.wrapping_add(len);
            remaining -= len;
        }

        if nacks.is_empty() {
            return None;
        }

        Some(TransportLayerNack {
            sender_ssrc: self.ssrc,
            media_ssrc: self.ssrc,
            nacks,
        })
    }

    fn scan_chunk(&self, start: u16, len: u16) -> Option<NackPair> {
        let mut pair: Option<NackPair> = None;
        for offset in 0..len {
            let sn = start.wrapping_add(offset);
            if self.slots[usize::from(sn)].is_some() {
                continue;
            }
            match pair.as_mut() {
                Some(pair) => pair.lost_packets = add_blp(pair.packet_id, sn, pair.lost_packets),
                None => {
                    pair = Some(NackPair {
                        packet_id: sn,
                        lost_packets: 0,
                    });
                }
            }
        }
        pair
    }
}

impl Default for SequenceRingBuffer {
    fn default() -> Self {
        Self::new()
    }
}
