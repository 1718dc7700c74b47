//! Error types for the forwarding engine

use crate::types::{ClientId, RoomId};
use thiserror::Error;

/// SFU error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Transport closed: {0}")]
    TransportClosed(ClientId),

    #[error("Event streams of transport {0} were already taken")]
    StreamsTaken(ClientId),

    #[error("Transport already registered: {0}")]
    AlreadyRegistered(ClientId),

    #[error("Track not found: {0}")]
    TrackNotFound(String),

    #[error("No source transport for SSRC {0}")]
    SourceNotFound(u32),

    #[error("Data channel not ready for {0}")]
    DataChannelNotReady(ClientId),

    #[error("Maximum number of rooms reached: {0}")]
    RoomLimitReached(usize),

    #[error("Room {room_id} is full (limit {limit})")]
    RoomFull { room_id: RoomId, limit: usize },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result type for SFU operations
pub type Result<T> = std::result::Result<T, Error>;
