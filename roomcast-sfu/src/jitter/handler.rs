//! Retransmission handling on top of the jitter store

use std::sync::Arc;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use webrtc::rtp::packet::Packet;

use super::nack::{create_nack_pair, packet_list};
use super::store::JitterStore;
use crate::config::SfuConfig;

/// Answers NACKs from buffered packets
pub trait RetransmitHandler: Send + Sync {
    /// Buffer a packet received from a publisher.
    /// Returns a NACK for gaps this buffer noticed in the publisher's stream.
    fn handle_rtp(&self, packet: &Packet) -> Option<TransportLayerNack>;

    /// Split a NACK into packets that can be resent right away and a
    /// residual NACK for whatever is no longer buffered.
    fn handle_nack(&self, nack: &TransportLayerNack) -> (Vec<Packet>, Option<TransportLayerNack>);

    /// Forget everything buffered for an SSRC
    fn remove_buffer(&self, ssrc: u32);
}

/// Pick the handler variant for a router
#[must_use]
pub fn new_retransmit_handler(config: &SfuConfig) -> Arc<dyn RetransmitHandler> {
    if config.jitter_buffer_enabled {
        Arc::new(JitterHandler::new(JitterStore::new(
            config.nack_window_size,
            config.eviction_threshold,
        )))
    } else {
        Arc::new(NoopJitterHandler)
    }
}

pub struct JitterHandler {
    store: JitterStore,
}

impl JitterHandler {
    #[must_use]
    pub const fn new(store: JitterStore) -> Self {
        Self { store }
    }

    #[must_use]
    pub const fn store(&self) -> &JitterStore {
        &self.store
    }
}

impl RetransmitHandler for JitterHandler {
    fn handle_rtp(&self, packet: &Packet) -> Option<TransportLayerNack> {
        self.store.push_rtp(packet)
    }

    fn handle_nack(&self, nack: &TransportLayerNack) -> (Vec<Packet>, Option<TransportLayerNack>) {
        let mut retransmit = Vec::new();
        let mut residual = Vec::new();

        for pair in &nack.nacks {
            let mut missing = Vec::new();
            for seq in packet_list(pair) {
                match self.store.get_packet(nack.media_ssrc, seq) {
                    Some(packet) => retransmit.push(packet),
                    None => missing.push(seq),
                }
            }
            residual.extend(create_nack_pair(&missing));
        }

        let residual = (!residual.is_empty()).then(|| TransportLayerNack {
            sender_ssrc: nack.sender_ssrc,
            media_ssrc: nack.media_ssrc,
            nacks: residual,
        });

        (retransmit, residual)
    }

    fn remove_buffer(&self, ssrc: u32) {
        self.store.remove_buffer(ssrc);
    }
}

/// Used when jitter buffering is disabled: nothing is buffered and NACKs
/// are neither answered nor forwarded
pub struct NoopJitterHandler;

impl RetransmitHandler for NoopJitterHandler {
    fn handle_rtp(&self, _packet: &Packet) -> Option<TransportLayerNack> {
        None
    }

    fn handle_nack(&self, _nack: &TransportLayerNack) -> (Vec<Packet>, Option<TransportLayerNack>) {
        (Vec::new(), None)
    }

    fn remove_buffer(&self, _ssrc: u32) {}
}
