//! Room-scoped forwarding
//!
//! A [`ForwardingRouter`] owns the transports of one room and moves media
//! between them:
//! - Track events become `add_track`/`remove_track` calls on every other member
//! - RTP is buffered for retransmission and fanned out to every other member
//! - Subscriber feedback (REMB, PLI, NACK) is answered or routed to the publisher
//! - Data messages are broadcast

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtcp::receiver_report::ReceiverReport;
use webrtc::rtcp::sender_report::SenderReport;
use webrtc::rtcp::source_description::SourceDescription;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use webrtc::rtp::packet::Packet;

use crate::bandwidth::TrackBitrateEstimators;
use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::jitter::{new_retransmit_handler, RetransmitHandler};
use crate::track::{Track, TrackEvent, TrackMetadata, UserTrack};
use crate::transport::{RtcpPacket, Transport, TransportStreams};
use crate::types::{ClientId, RoomId};

/// Forwarding statistics of one room
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Number of registered transports
    pub transports: usize,
    /// Number of tracks currently forwarded
    pub publications: usize,
    /// RTP packets delivered to subscribers
    pub rtp_packets_forwarded: u64,
    /// RTP payload bytes delivered to subscribers
    pub rtp_bytes_forwarded: u64,
    /// RTCP packets routed to publishers (REMB, PLI, residual NACK)
    pub rtcp_packets_forwarded: u64,
    /// NACKs received from subscribers
    pub nacks_received: u64,
    /// Packets resent from the jitter buffer
    pub packets_retransmitted: u64,
    /// NACKs raised by the jitter buffer itself
    pub self_nacks_sent: u64,
    /// Writes that failed on some destination
    pub delivery_failures: u64,
}

#[derive(Default)]
struct RouterCounters {
    rtp_packets_forwarded: AtomicU64,
    rtp_bytes_forwarded: AtomicU64,
    rtcp_packets_forwarded: AtomicU64,
    nacks_received: AtomicU64,
    packets_retransmitted: AtomicU64,
    self_nacks_sent: AtomicU64,
    delivery_failures: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// A track some member publishes
struct Publication {
    client_id: ClientId,
    track: Arc<dyn Track>,
}

#[derive(Default)]
struct RouterState {
    transports: HashMap<ClientId, Arc<dyn Transport>>,
    /// Publisher of every forwarded SSRC
    source_by_ssrc: HashMap<u32, Publication>,
    estimators: TrackBitrateEstimators,
}

impl RouterState {
    fn others(&self, client_id: &ClientId) -> Vec<Arc<dyn Transport>> {
        self.transports
            .iter()
            .filter(|(id, _)| *id != client_id)
            .map(|(_, transport)| Arc::clone(transport))
            .collect()
    }

    fn source(&self, ssrc: u32) -> Option<Arc<dyn Transport>> {
        let publication = self.source_by_ssrc.get(&ssrc)?;
        self.transports.get(&publication.client_id).cloned()
    }
}

/// Fan-out engine for one room
pub struct ForwardingRouter {
    room_id: RoomId,
    retransmit: Arc<dyn RetransmitHandler>,
    state: Mutex<RouterState>,
    /// Serializes track fan-out with the bootstrap of newcomers
    lifecycle: tokio::sync::Mutex<()>,
    counters: RouterCounters,
}

impl ForwardingRouter {
    #[must_use]
    pub fn new(room_id: RoomId, config: &SfuConfig) -> Arc<Self> {
        debug!(
            room_id = %room_id,
            jitter_buffer = config.jitter_buffer_enabled,
            "Creating forwarding router"
        );

        Arc::new(Self {
            room_id,
            retransmit: new_retransmit_handler(config),
            state: Mutex::new(RouterState::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            counters: RouterCounters::default(),
        })
    }

    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Join a transport and advertise the tracks other members already publish
    pub async fn add(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<()> {
        let existing = self.register(Arc::clone(&transport))?;
        self.bootstrap(&transport, existing).await;
        Ok(())
    }

    /// Register a transport and start its workers.
    ///
    /// Returns the tracks the newcomer still has to be sent. The snapshot is
    /// taken under the same lock as the insertion, so a track published
    /// concurrently reaches the newcomer either here or through the regular
    /// fan-out, never both.
    pub(crate) fn register(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<Vec<Arc<dyn Track>>> {
        let client_id = transport.client_id().clone();

        let mut state = self.state.lock();
        if state.transports.contains_key(&client_id) {
            return Err(Error::AlreadyRegistered(client_id));
        }
        let streams = transport
            .take_streams()
            .ok_or_else(|| Error::StreamsTaken(client_id.clone()))?;

        let existing: Vec<Arc<dyn Track>> = state
            .source_by_ssrc
            .values()
            .filter(|publication| publication.client_id != client_id)
            .map(|publication| Arc::clone(&publication.track))
            .collect();
        state.transports.insert(client_id.clone(), Arc::clone(&transport));

        info!(
            room_id = %self.room_id,
            client_id = %client_id,
            transports = state.transports.len(),
            "Transport joined room"
        );
        drop(state);

        self.spawn_workers(transport, streams);
        Ok(existing)
    }

    /// Send the tracks returned by [`Self::register`] to the newcomer.
    ///
    /// A track unpublished since the snapshot was taken is skipped; its
    /// removal has already been fanned out to the newcomer.
    pub(crate) async fn bootstrap(&self, transport: &Arc<dyn Transport>, tracks: Vec<Arc<dyn Track>>) {
        let _lifecycle = self.lifecycle.lock().await;
        for track in tracks {
            if !self.is_published(&track) {
                debug!(
                    room_id = %self.room_id,
                    client_id = %transport.client_id(),
                    track_id = %track.id(),
                    "Track unpublished before join completed"
                );
                continue;
            }
            if let Err(e) = transport.add_track(track).await {
                self.delivery_failed(transport.client_id(), "add_track", &e);
            }
        }
    }

    fn is_published(&self, track: &Arc<dyn Track>) -> bool {
        self.state
            .lock()
            .source_by_ssrc
            .get(&track.ssrc())
            .is_some_and(|publication| Arc::ptr_eq(&publication.track, track))
    }

    /// Drop a transport and its bandwidth reports.
    ///
    /// Tracks it published are withdrawn by its own track events.
    pub fn remove(&self, client_id: &ClientId) -> bool {
        let mut state = self.state.lock();
        let removed = state.transports.remove(client_id).is_some();
        state.estimators.remove_receiver_estimations(client_id);

        if removed {
            info!(
                room_id = %self.room_id,
                client_id = %client_id,
                transports = state.transports.len(),
                "Transport left room"
            );
        }
        removed
    }

    /// Tracks the SFU currently sends to one member
    pub async fn get_tracks_metadata(&self, client_id: &ClientId) -> Option<Vec<TrackMetadata>> {
        let transport = self.state.lock().transports.get(client_id).cloned()?;
        Some(transport.tracks_metadata().await)
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.state.lock().transports.len()
    }

    #[must_use]
    pub fn publication_count(&self) -> usize {
        self.state.lock().source_by_ssrc.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().transports.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let (transports, publications) = {
            let state = self.state.lock();
            (state.transports.len(), state.source_by_ssrc.len())
        };
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        RouterStats {
            transports,
            publications,
            rtp_packets_forwarded: load(&self.counters.rtp_packets_forwarded),
            rtp_bytes_forwarded: load(&self.counters.rtp_bytes_forwarded),
            rtcp_packets_forwarded: load(&self.counters.rtcp_packets_forwarded),
            nacks_received: load(&self.counters.nacks_received),
            packets_retransmitted: load(&self.counters.packets_retransmitted),
            self_nacks_sent: load(&self.counters.self_nacks_sent),
            delivery_failures: load(&self.counters.delivery_failures),
        }
    }

    fn spawn_workers(self: &Arc<Self>, transport: Arc<dyn Transport>, streams: TransportStreams) {
        let done = transport.done();
        self.spawn_track_worker(Arc::clone(&transport), streams.track_events, done.clone());
        self.spawn_rtp_worker(Arc::clone(&transport), streams.rtp, done.clone());
        self.spawn_rtcp_worker(Arc::clone(&transport), streams.rtcp, done.clone());
        self.spawn_message_worker(transport, streams.messages, done);
    }

    fn spawn_track_worker(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        mut events: mpsc::Receiver<TrackEvent>,
        done: CancellationToken,
    ) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let client_id = transport.client_id().clone();
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => router.handle_track_event(&client_id, event).await,
                        None => break,
                    },
                    () = done.cancelled() => break,
                }
            }

            // Teardown removals are usually queued right before `done` fires
            while let Ok(event) = events.try_recv() {
                router.handle_track_event(&client_id, event).await;
            }
            router.withdraw_publications(&client_id).await;

            debug!(room_id = %router.room_id, client_id = %client_id, "Track worker stopped");
        });
    }

    fn spawn_rtp_worker(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        mut rtp: mpsc::Receiver<Packet>,
        done: CancellationToken,
    ) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    packet = rtp.recv() => match packet {
                        Some(packet) => router.handle_rtp(&transport, &packet).await,
                        None => break,
                    },
                    () = done.cancelled() => break,
                }
            }
            debug!(room_id = %router.room_id, client_id = %transport.client_id(), "RTP worker stopped");
        });
    }

    fn spawn_rtcp_worker(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        mut rtcp: mpsc::Receiver<RtcpPacket>,
        done: CancellationToken,
    ) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    packet = rtcp.recv() => match packet {
                        Some(packet) => {
                            if let Err(e) = router.handle_rtcp(&transport, packet.as_ref()).await {
                                debug!(
                                    room_id = %router.room_id,
                                    client_id = %transport.client_id(),
                                    error = %e,
                                    "RTCP not routed"
                                );
                            }
                        }
                        None => break,
                    },
                    () = done.cancelled() => break,
                }
            }
            debug!(room_id = %router.room_id, client_id = %transport.client_id(), "RTCP worker stopped");
        });
    }

    fn spawn_message_worker(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        mut messages: mpsc::Receiver<DataChannelMessage>,
        done: CancellationToken,
    ) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = messages.recv() => match message {
                        Some(message) => router.handle_message(transport.client_id(), message).await,
                        None => break,
                    },
                    () = done.cancelled() => break,
                }
            }
            debug!(room_id = %router.room_id, client_id = %transport.client_id(), "Message worker stopped");
        });
    }

    async fn handle_track_event(&self, publisher: &ClientId, event: TrackEvent) {
        match event {
            TrackEvent::Added(track) => self.add_track(publisher, track).await,
            TrackEvent::Removed(track) => self.remove_track(publisher, track.as_ref()).await,
        }
    }

    async fn add_track(&self, publisher: &ClientId, track: Arc<dyn Track>) {
        let track = UserTrack::wrap(track, publisher, &self.room_id);
        let ssrc = track.ssrc();
        let _lifecycle = self.lifecycle.lock().await;

        let destinations = {
            let mut state = self.state.lock();
            if let Some(existing) = state.source_by_ssrc.get(&ssrc) {
                if existing.client_id == *publisher && existing.track.id() == track.id() {
                    debug!(room_id = %self.room_id, client_id = %publisher, ssrc, "Track already published");
                    return;
                }
                warn!(
                    room_id = %self.room_id,
                    ssrc,
                    previous = %existing.client_id,
                    publisher = %publisher,
                    "SSRC republished"
                );
            }
            state.source_by_ssrc.insert(
                ssrc,
                Publication {
                    client_id: publisher.clone(),
                    track: Arc::clone(&track),
                },
            );
            state.others(publisher)
        };

        info!(
            room_id = %self.room_id,
            client_id = %publisher,
            track_id = %track.id(),
            ssrc,
            kind = ?track.kind(),
            subscribers = destinations.len(),
            "Track published"
        );

        for destination in destinations {
            if let Err(e) = destination.add_track(Arc::clone(&track)).await {
                self.delivery_failed(destination.client_id(), "add_track", &e);
            }
        }
    }

    async fn remove_track(&self, publisher: &ClientId, track: &dyn Track) {
        let ssrc = track.ssrc();
        let _lifecycle = self.lifecycle.lock().await;

        let destinations = {
            let mut state = self.state.lock();
            match state.source_by_ssrc.get(&ssrc) {
                Some(publication) if publication.client_id == *publisher => {}
                _ => return,
            }
            state.source_by_ssrc.remove(&ssrc);
            state.estimators.remove(ssrc);
            state.others(publisher)
        };
        self.retransmit.remove_buffer(ssrc);

        info!(
            room_id = %self.room_id,
            client_id = %publisher,
            track_id = %track.id(),
            ssrc,
            "Track unpublished"
        );

        for destination in destinations {
            if let Err(e) = destination.remove_track(track.id()).await {
                self.delivery_failed(destination.client_id(), "remove_track", &e);
            }
        }
    }

    /// Unpublish whatever a departed client did not remove itself
    async fn withdraw_publications(&self, client_id: &ClientId) {
        let leftover: Vec<Arc<dyn Track>> = self
            .state
            .lock()
            .source_by_ssrc
            .values()
            .filter(|publication| publication.client_id == *client_id)
            .map(|publication| Arc::clone(&publication.track))
            .collect();

        for track in leftover {
            self.remove_track(client_id, track.as_ref()).await;
        }
    }

    async fn handle_rtp(&self, from: &Arc<dyn Transport>, packet: &Packet) {
        let ssrc = packet.header.ssrc;
        let destinations = {
            let state = self.state.lock();
            match state.source_by_ssrc.get(&ssrc) {
                Some(publication) if publication.client_id == *from.client_id() => state.others(from.client_id()),
                _ => {
                    debug!(
                        room_id = %self.room_id,
                        client_id = %from.client_id(),
                        ssrc,
                        "Dropping RTP for a stream the client does not publish"
                    );
                    return;
                }
            }
        };

        if let Some(nack) = self.retransmit.handle_rtp(packet) {
            bump(&self.counters.self_nacks_sent, 1);
            if let Err(e) = from.write_rtcp(&[Box::new(nack)]).await {
                self.delivery_failed(from.client_id(), "write_rtcp", &e);
            }
        }

        let bytes = packet.payload.len() as u64;
        for destination in destinations {
            match destination.write_rtp(packet).await {
                Ok(_) => {
                    bump(&self.counters.rtp_packets_forwarded, 1);
                    bump(&self.counters.rtp_bytes_forwarded, bytes);
                }
                Err(e) => self.delivery_failed(destination.client_id(), "write_rtp", &e),
            }
        }
    }

    async fn handle_rtcp(
        &self,
        from: &Arc<dyn Transport>,
        packet: &(dyn webrtc::rtcp::packet::Packet + Send + Sync),
    ) -> Result<()> {
        let any = packet.as_any();

        if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
            self.handle_remb(from.client_id(), remb).await;
        } else if let Some(pli) = any.downcast_ref::<PictureLossIndication>() {
            let source = self
                .state
                .lock()
                .source(pli.media_ssrc)
                .ok_or(Error::SourceNotFound(pli.media_ssrc))?;
            self.forward_rtcp(&source, packet.cloned()).await;
        } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
            self.handle_nack(from, nack).await;
        } else if any.is::<SourceDescription>() || any.is::<ReceiverReport>() || any.is::<SenderReport>() {
            // Reports stay between each peer and the SFU
        } else {
            debug!(
                room_id = %self.room_id,
                client_id = %from.client_id(),
                packet = ?packet.header(),
                "Ignoring unsupported RTCP packet"
            );
        }
        Ok(())
    }

    async fn handle_remb(&self, receiver: &ClientId, remb: &ReceiverEstimatedMaximumBitrate) {
        let (sources, bound) = {
            let mut state = self.state.lock();

            let mut ssrcs = Vec::with_capacity(remb.ssrcs.len());
            let mut publishers: Vec<ClientId> = Vec::new();
            for ssrc in &remb.ssrcs {
                if let Some(publication) = state.source_by_ssrc.get(ssrc) {
                    ssrcs.push(*ssrc);
                    if !publishers.contains(&publication.client_id) {
                        publishers.push(publication.client_id.clone());
                    }
                }
            }
            // Every SSRC is gone: the tracks went away mid-flight
            if publishers.is_empty() {
                return;
            }

            let bound = state.estimators.estimate(receiver, &ssrcs, remb.bitrate as u64);
            let sources: Vec<Arc<dyn Transport>> = publishers
                .iter()
                .filter_map(|publisher| state.transports.get(publisher).cloned())
                .collect();
            (sources, bound)
        };

        let adjusted = ReceiverEstimatedMaximumBitrate {
            bitrate: bound as f32,
            ..remb.clone()
        };
        for source in sources {
            self.forward_rtcp(&source, Box::new(adjusted.clone())).await;
        }
    }

    async fn handle_nack(&self, requester: &Arc<dyn Transport>, nack: &TransportLayerNack) {
        bump(&self.counters.nacks_received, 1);
        let (found, residual) = self.retransmit.handle_nack(nack);

        for packet in &found {
            match requester.write_rtp(packet).await {
                Ok(_) => bump(&self.counters.packets_retransmitted, 1),
                Err(e) => self.delivery_failed(requester.client_id(), "write_rtp", &e),
            }
        }

        if let Some(residual) = residual {
            let source = self.state.lock().source(nack.media_ssrc);
            match source {
                Some(source) => self.forward_rtcp(&source, Box::new(residual)).await,
                None => debug!(
                    room_id = %self.room_id,
                    media_ssrc = nack.media_ssrc,
                    "No source for residual NACK"
                ),
            }
        }
    }

    async fn forward_rtcp(&self, destination: &Arc<dyn Transport>, packet: RtcpPacket) {
        match destination.write_rtcp(&[packet]).await {
            Ok(()) => bump(&self.counters.rtcp_packets_forwarded, 1),
            Err(e) => self.delivery_failed(destination.client_id(), "write_rtcp", &e),
        }
    }

    async fn handle_message(&self, from: &ClientId, message: DataChannelMessage) {
        let destinations = self.state.lock().others(from);
        for destination in destinations {
            if let Err(e) = destination.send(message.clone()).await {
                self.delivery_failed(destination.client_id(), "send", &e);
            }
        }
    }

    fn delivery_failed(&self, destination: &ClientId, operation: &'static str, error: &Error) {
        bump(&self.counters.delivery_failures, 1);
        warn!(
            room_id = %self.room_id,
            client_id = %destination,
            operation,
            error = %error,
            "Delivery failed"
        );
    }
}
