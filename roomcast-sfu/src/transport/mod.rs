//! The participant-facing side of the engine
//!
//! A [`Transport`] is whatever connects one participant to the SFU. The
//! router only ever talks to this trait; negotiation, encryption and the
//! actual sockets live behind it.

mod peer;
mod pipe;

pub use peer::PeerTransport;
pub use pipe::{PipeEvent, PipeRemote, PipeTransport};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::rtp::packet::Packet;

use crate::error::Result;
use crate::track::{Track, TrackEvent, TrackMetadata};
use crate::types::{ClientId, TrackId};

/// RTCP packet as produced and consumed by `webrtc`
pub type RtcpPacket = Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>;

/// Capacity of the inbound event channels every transport exposes
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Handle for a track a transport started sending to its client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub track_id: TrackId,
    /// SSRC the client receives the track under
    pub ssrc: u32,
}

/// Every inbound stream the router consumes
pub struct TransportStreams {
    pub rtp: mpsc::Receiver<Packet>,
    pub rtcp: mpsc::Receiver<RtcpPacket>,
    pub track_events: mpsc::Receiver<TrackEvent>,
    pub messages: mpsc::Receiver<DataChannelMessage>,
}

#[derive(Default)]
struct Slots {
    rtp: Option<mpsc::Receiver<Packet>>,
    rtcp: Option<mpsc::Receiver<RtcpPacket>>,
    track_events: Option<mpsc::Receiver<TrackEvent>>,
    messages: Option<mpsc::Receiver<DataChannelMessage>>,
}

/// Take-once holder for the inbound streams of a transport
pub(crate) struct InboundStreams(Mutex<Slots>);

impl InboundStreams {
    pub(crate) fn new(
        rtp: mpsc::Receiver<Packet>,
        rtcp: mpsc::Receiver<RtcpPacket>,
        track_events: mpsc::Receiver<TrackEvent>,
        messages: mpsc::Receiver<DataChannelMessage>,
    ) -> Self {
        Self(Mutex::new(Slots {
            rtp: Some(rtp),
            rtcp: Some(rtcp),
            track_events: Some(track_events),
            messages: Some(messages),
        }))
    }

    pub(crate) fn take_rtp(&self) -> Option<mpsc::Receiver<Packet>> {
        self.0.lock().rtp.take()
    }

    pub(crate) fn take_rtcp(&self) -> Option<mpsc::Receiver<RtcpPacket>> {
        self.0.lock().rtcp.take()
    }

    pub(crate) fn take_track_events(&self) -> Option<mpsc::Receiver<TrackEvent>> {
        self.0.lock().track_events.take()
    }

    pub(crate) fn take_messages(&self) -> Option<mpsc::Receiver<DataChannelMessage>> {
        self.0.lock().messages.take()
    }

    /// All four streams, or none of them if any is already gone
    pub(crate) fn take_all(&self) -> Option<TransportStreams> {
        let mut slots = self.0.lock();
        if slots.rtp.is_none()
            || slots.rtcp.is_none()
            || slots.track_events.is_none()
            || slots.messages.is_none()
        {
            return None;
        }

        Some(TransportStreams {
            rtp: slots.rtp.take()?,
            rtcp: slots.rtcp.take()?,
            track_events: slots.track_events.take()?,
            messages: slots.messages.take()?,
        })
    }
}

/// A connected participant.
///
/// The `take_*` methods hand out the receiving end of the transport's
/// inbound streams. Each can be taken once; later calls return `None`.
/// Streams end when the transport is torn down.
#[async_trait]
pub trait Transport: Send + Sync {
    fn client_id(&self) -> &ClientId;

    /// Start sending a track to this client. RTCP the client sends back
    /// about the track shows up on the transport's RTCP stream.
    async fn add_track(&self, track: Arc<dyn Track>) -> Result<LocalTrack>;

    async fn remove_track(&self, track_id: &TrackId) -> Result<()>;

    async fn write_rtp(&self, packet: &Packet) -> Result<usize>;

    async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<()>;

    /// Send a data message to this client
    async fn send(&self, message: DataChannelMessage) -> Result<()>;

    /// Raw remote tracks this client publishes. The router works from
    /// [`Transport::take_track_events`] instead; this is for callers that need
    /// the tracks themselves.
    fn take_remote_tracks(&self) -> Option<mpsc::Receiver<Arc<dyn Track>>> {
        None
    }

    /// RTP packets of every track this client publishes
    fn take_rtp(&self) -> Option<mpsc::Receiver<Packet>>;

    /// RTCP this client sends about tracks it receives
    fn take_rtcp(&self) -> Option<mpsc::Receiver<RtcpPacket>>;

    /// Publish/unpublish events for this client's tracks
    fn take_track_events(&self) -> Option<mpsc::Receiver<TrackEvent>>;

    /// Data messages from this client
    fn take_messages(&self) -> Option<mpsc::Receiver<DataChannelMessage>>;

    /// Take the RTP, RTCP, track event and message streams together.
    /// Returns `None` and leaves every stream in place if any one of them
    /// was already taken.
    fn take_streams(&self) -> Option<TransportStreams>;

    /// Cancelled exactly once, when the transport is torn down
    fn done(&self) -> CancellationToken;

    /// Tracks this transport currently sends to its client
    async fn tracks_metadata(&self) -> Vec<TrackMetadata>;
}
