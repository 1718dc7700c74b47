//! Track model
//!
//! A track describes one published media stream. Tracks reach subscribers
//! wrapped in a [`UserTrack`], which tags them with the publishing client
//! and the room so the subscriber side can tell whose media it is.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_remote::TrackRemote;

use crate::types::{ClientId, RoomId, TrackId};

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// Who published a track and where
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackIdentity {
    pub client_id: ClientId,
    pub room_id: RoomId,
}

/// One media stream as seen by the forwarding engine
pub trait Track: Send + Sync + fmt::Debug {
    fn id(&self) -> &TrackId;

    fn stream_id(&self) -> &str;

    fn ssrc(&self) -> u32;

    fn kind(&self) -> TrackKind;

    fn payload_type(&self) -> u8;

    fn codec(&self) -> &RTCRtpCodecCapability;

    /// Publisher identity, for tracks that carry one
    fn identity(&self) -> Option<&TrackIdentity> {
        None
    }
}

/// A bare track, as received from a publisher
#[derive(Debug, Clone)]
pub struct SimpleTrack {
    id: TrackId,
    stream_id: String,
    ssrc: u32,
    kind: TrackKind,
    payload_type: u8,
    codec: RTCRtpCodecCapability,
}

impl SimpleTrack {
    #[must_use]
    pub fn new(
        id: TrackId,
        stream_id: impl Into<String>,
        ssrc: u32,
        payload_type: u8,
        codec: RTCRtpCodecCapability,
    ) -> Self {
        let kind = if codec.mime_type.to_lowercase().starts_with("audio/") {
            TrackKind::Audio
        } else {
            TrackKind::Video
        };

        Self {
            id,
            stream_id: stream_id.into(),
            ssrc,
            kind,
            payload_type,
            codec,
        }
    }

    /// Snapshot the description of a negotiated remote track
    #[must_use]
    pub fn from_remote(remote: &TrackRemote) -> Self {
        let parameters = remote.codec();
        Self {
            id: TrackId::new(remote.id()),
            stream_id: remote.stream_id(),
            ssrc: remote.ssrc(),
            kind: TrackKind::from(remote.kind()),
            payload_type: remote.payload_type(),
            codec: parameters.capability,
        }
    }
}

impl Track for SimpleTrack {
    fn id(&self) -> &TrackId {
        &self.id
    }

    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn payload_type(&self) -> u8 {
        self.payload_type
    }

    fn codec(&self) -> &RTCRtpCodecCapability {
        &self.codec
    }
}

/// A track tagged with the identity of its publisher
#[derive(Debug)]
pub struct UserTrack {
    inner: Arc<dyn Track>,
    identity: TrackIdentity,
}

impl UserTrack {
    /// Tag `track` unless it already carries an identity
    #[must_use]
    pub fn wrap(track: Arc<dyn Track>, client_id: &ClientId, room_id: &RoomId) -> Arc<dyn Track> {
        if track.identity().is_some() {
            return track;
        }

        Arc::new(Self {
            inner: track,
            identity: TrackIdentity {
                client_id: client_id.clone(),
                room_id: room_id.clone(),
            },
        })
    }
}

impl Track for UserTrack {
    fn id(&self) -> &TrackId {
        self.inner.id()
    }

    fn stream_id(&self) -> &str {
        self.inner.stream_id()
    }

    fn ssrc(&self) -> u32 {
        self.inner.ssrc()
    }

    fn kind(&self) -> TrackKind {
        self.inner.kind()
    }

    fn payload_type(&self) -> u8 {
        self.inner.payload_type()
    }

    fn codec(&self) -> &RTCRtpCodecCapability {
        self.inner.codec()
    }

    fn identity(&self) -> Option<&TrackIdentity> {
        Some(&self.identity)
    }
}

/// Track lifecycle reported by a transport for the tracks its client publishes
#[derive(Debug, Clone)]
pub enum TrackEvent {
    Added(Arc<dyn Track>),
    Removed(Arc<dyn Track>),
}

/// What a transport currently sends to its client, for the signaling layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    /// Media section id, once negotiated
    pub mid: Option<String>,
    pub kind: TrackKind,
    pub stream_id: String,
    /// Publishing client
    pub user_id: Option<ClientId>,
}

impl TrackMetadata {
    #[must_use]
    pub fn from_track(track: &dyn Track, mid: Option<String>) -> Self {
        Self {
            mid,
            kind: track.kind(),
            stream_id: track.stream_id().to_string(),
            user_id: track.identity().map(|identity| identity.client_id.clone()),
        }
    }
}
