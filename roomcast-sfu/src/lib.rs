//! Roomcast SFU (Selective Forwarding Unit)
//!
//! This crate is the media forwarding core of a WebRTC SFU. Every participant
//! publishes its media once; the SFU forwards it to the other participants of
//! the same room and keeps feedback (NACK, PLI, REMB) flowing the other way.
//!
//! ## Architecture
//!
//! - **`RoomRegistry`**: Creates one router per active room and removes it when empty
//! - **`ForwardingRouter`**: Fans out tracks, RTP, RTCP feedback and data messages in a room
//! - **`Transport`**: One connected participant (`PeerTransport`, `PipeTransport`)
//! - **`SequenceRingBuffer`** / **`JitterStore`**: Recent packets per SSRC, for NACK handling
//! - **`TrackBitrateEstimators`**: Minimum REMB bound across the receivers of a stream
//!
//! Negotiation (SDP, ICE, DTLS) and signaling happen outside this crate; they
//! hand over a connected transport.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_sfu::{ClientId, PeerTransport, RoomId, RoomRegistry, SfuConfig};
//!
//! let registry = RoomRegistry::new(SfuConfig::load(Some("roomcast.toml"))?);
//!
//! // After the offer/answer exchange with the client
//! let transport = PeerTransport::new(ClientId::generate(), peer_connection);
//! registry.add(RoomId::from("lobby"), transport).await?;
//! ```

mod bandwidth;
mod config;
mod error;
pub mod jitter;
pub mod logging;
mod registry;
mod router;
mod track;
pub mod transport;
mod types;

pub use bandwidth::{BandwidthEstimator, TrackBitrateEstimators};
pub use config::{LoggingConfig, SfuConfig};
pub use error::{Error, Result};
pub use jitter::{JitterStore, RetransmitHandler, SequenceRingBuffer};
pub use registry::{RegistryStats, RoomRegistry};
pub use router::{ForwardingRouter, RouterStats};
pub use track::{SimpleTrack, Track, TrackEvent, TrackIdentity, TrackKind, TrackMetadata, UserTrack};
pub use transport::{
    LocalTrack, PeerTransport, PipeEvent, PipeRemote, PipeTransport, RtcpPacket, Transport, TransportStreams,
};
pub use types::{ClientId, RoomId, TrackId};
