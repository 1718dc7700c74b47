//! In-process transport
//!
//! Connects a participant that lives in the same process, such as a relay
//! bridging two rooms or a bot. The [`PipeRemote`] half plays the client:
//! it publishes tracks, injects RTP/RTCP/messages and observes everything
//! the SFU sends.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::rtp::packet::Packet;

use super::{InboundStreams, LocalTrack, RtcpPacket, Transport, TransportStreams, EVENT_CHANNEL_CAPACITY};
use crate::error::{Error, Result};
use crate::track::{Track, TrackEvent, TrackMetadata};
use crate::types::{ClientId, TrackId};

/// Something the SFU did to a pipe transport
pub enum PipeEvent {
    TrackAdded(Arc<dyn Track>),
    TrackRemoved(TrackId),
    Rtp(Packet),
    Rtcp(Vec<RtcpPacket>),
    Message(DataChannelMessage),
}

impl PipeEvent {
    /// Short name of the event, for logs and assertions
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TrackAdded(_) => "track_added",
            Self::TrackRemoved(_) => "track_removed",
            Self::Rtp(_) => "rtp",
            Self::Rtcp(_) => "rtcp",
            Self::Message(_) => "message",
        }
    }
}

struct SentTrack {
    mid: String,
    track: Arc<dyn Track>,
}

/// SFU side of an in-process pipe
pub struct PipeTransport {
    client_id: ClientId,
    outbound: mpsc::UnboundedSender<PipeEvent>,
    sent: Mutex<Vec<SentTrack>>,
    next_mid: Mutex<u32>,
    remote_tracks_rx: Mutex<Option<mpsc::Receiver<Arc<dyn Track>>>>,
    inbound: InboundStreams,
    done: CancellationToken,
}

/// Client side of an in-process pipe
pub struct PipeRemote {
    client_id: ClientId,
    remote_tracks_tx: mpsc::Sender<Arc<dyn Track>>,
    rtp_tx: mpsc::Sender<Packet>,
    rtcp_tx: mpsc::Sender<RtcpPacket>,
    track_events_tx: mpsc::Sender<TrackEvent>,
    messages_tx: mpsc::Sender<DataChannelMessage>,
    outbound_rx: mpsc::UnboundedReceiver<PipeEvent>,
    published: HashMap<TrackId, Arc<dyn Track>>,
    done: CancellationToken,
}

impl PipeTransport {
    /// Create both halves of a pipe
    #[must_use]
    pub fn new(client_id: ClientId) -> (Arc<Self>, PipeRemote) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (remote_tracks_tx, remote_tracks_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (rtp_tx, rtp_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (rtcp_tx, rtcp_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (track_events_tx, track_events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (messages_tx, messages_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let done = CancellationToken::new();

        let transport = Arc::new(Self {
            client_id: client_id.clone(),
            outbound,
            sent: Mutex::new(Vec::new()),
            next_mid: Mutex::new(0),
            remote_tracks_rx: Mutex::new(Some(remote_tracks_rx)),
            inbound: InboundStreams::new(rtp_rx, rtcp_rx, track_events_rx, messages_rx),
            done: done.clone(),
        });

        let remote = PipeRemote {
            client_id,
            remote_tracks_tx,
            rtp_tx,
            rtcp_tx,
            track_events_tx,
            messages_tx,
            outbound_rx,
            published: HashMap::new(),
            done,
        };

        (transport, remote)
    }

    fn deliver(&self, event: PipeEvent) -> Result<()> {
        self.outbound
            .send(event)
            .map_err(|_| Error::TransportClosed(self.client_id.clone()))
    }
}

#[async_trait]
impl Transport for PipeTransport {
    fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    async fn add_track(&self, track: Arc<dyn Track>) -> Result<LocalTrack> {
        self.deliver(PipeEvent::TrackAdded(Arc::clone(&track)))?;

        let mid = {
            let mut next_mid = self.next_mid.lock();
            let mid = next_mid.to_string();
            *next_mid += 1;
            mid
        };

        let local = LocalTrack {
            track_id: track.id().clone(),
            ssrc: track.ssrc(),
        };
        self.sent.lock().push(SentTrack { mid, track });
        Ok(local)
    }

    async fn remove_track(&self, track_id: &TrackId) -> Result<()> {
        self.sent.lock().retain(|sent| sent.track.id() != track_id);
        self.deliver(PipeEvent::TrackRemoved(track_id.clone()))
    }

    async fn write_rtp(&self, packet: &Packet) -> Result<usize> {
        let size = packet.payload.len();
        self.deliver(PipeEvent::Rtp(packet.clone()))?;
        Ok(size)
    }

    async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<()> {
        let packets = packets.iter().map(|packet| packet.cloned()).collect();
        self.deliver(PipeEvent::Rtcp(packets))
    }

    async fn send(&self, message: DataChannelMessage) -> Result<()> {
        self.deliver(PipeEvent::Message(message))
    }

    fn take_remote_tracks(&self) -> Option<mpsc::Receiver<Arc<dyn Track>>> {
        self.remote_tracks_rx.lock().take()
    }

    fn take_rtp(&self) -> Option<mpsc::Receiver<Packet>> {
        self.inbound.take_rtp()
    }

    fn take_rtcp(&self) -> Option<mpsc::Receiver<RtcpPacket>> {
        self.inbound.take_rtcp()
    }

    fn take_track_events(&self) -> Option<mpsc::Receiver<TrackEvent>> {
        self.inbound.take_track_events()
    }

    fn take_messages(&self) -> Option<mpsc::Receiver<DataChannelMessage>> {
        self.inbound.take_messages()
    }

    fn take_streams(&self) -> Option<TransportStreams> {
        self.inbound.take_all()
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    async fn tracks_metadata(&self) -> Vec<TrackMetadata> {
        self.sent
            .lock()
            .iter()
            .map(|sent| TrackMetadata::from_track(sent.track.as_ref(), Some(sent.mid.clone())))
            .collect()
    }
}

impl PipeRemote {
    #[must_use]
    pub const fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Start publishing a track
    pub async fn publish(&mut self, track: Arc<dyn Track>) -> Result<()> {
        // Nobody has to listen for raw remote tracks
        let _ = self.remote_tracks_tx.try_send(Arc::clone(&track));
        self.published.insert(track.id().clone(), Arc::clone(&track));
        self.emit(TrackEvent::Added(track)).await
    }

    /// Stop publishing a track
    pub async fn unpublish(&mut self, track_id: &TrackId) -> Result<()> {
        match self.published.remove(track_id) {
            Some(track) => self.emit(TrackEvent::Removed(track)).await,
            None => Err(Error::TrackNotFound(track_id.to_string())),
        }
    }

    pub async fn send_rtp(&self, packet: Packet) -> Result<()> {
        self.rtp_tx
            .send(packet)
            .await
            .map_err(|_| Error::TransportClosed(self.client_id.clone()))
    }

    pub async fn send_rtcp(&self, packet: RtcpPacket) -> Result<()> {
        self.rtcp_tx
            .send(packet)
            .await
            .map_err(|_| Error::TransportClosed(self.client_id.clone()))
    }

    pub async fn send_message(&self, message: DataChannelMessage) -> Result<()> {
        self.messages_tx
            .send(message)
            .await
            .map_err(|_| Error::TransportClosed(self.client_id.clone()))
    }

    /// Wait for the next thing the SFU sends to this client
    pub async fn recv(&mut self) -> Option<PipeEvent> {
        self.outbound_rx.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<PipeEvent> {
        self.outbound_rx.try_recv().ok()
    }

    /// Tear the pipe down: unpublish every track, then fire `done`
    pub async fn close(mut self) {
        let tracks: Vec<_> = self.published.drain().map(|(_, track)| track).collect();
        for track in tracks {
            if let Err(e) = self.emit(TrackEvent::Removed(track)).await {
                debug!(client_id = %self.client_id, error = %e, "Track removal not delivered");
            }
        }
        self.done.cancel();
    }

    async fn emit(&self, event: TrackEvent) -> Result<()> {
        self.track_events_tx
            .send(event)
            .await
            .map_err(|_| Error::TransportClosed(self.client_id.clone()))
    }
}
