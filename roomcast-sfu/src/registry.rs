//! Room registry - one forwarding router per active room
//!
//! This module provides:
//! - Lazy router creation on the first join of a room
//! - Room and per-room transport limits
//! - Leave handling driven by each transport's `done` signal
//! - Removal of rooms once their last transport has left

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::router::ForwardingRouter;
use crate::track::TrackMetadata;
use crate::transport::Transport;
use crate::types::{ClientId, RoomId};

/// Registry-wide statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of active rooms
    pub active_rooms: usize,
    /// Total number of transports across all rooms
    pub total_transports: usize,
}

/// Entry point for the signaling layer
pub struct RoomRegistry {
    config: Arc<SfuConfig>,
    rooms: Mutex<HashMap<RoomId, Arc<ForwardingRouter>>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(config: SfuConfig) -> Arc<Self> {
        info!(
            jitter_buffer = config.jitter_buffer_enabled,
            max_rooms = config.max_rooms,
            max_transports_per_room = config.max_transports_per_room,
            "Room registry initialized"
        );

        Arc::new(Self {
            config: Arc::new(config),
            rooms: Mutex::new(HashMap::new()),
        })
    }

    /// Join `transport` to a room, creating the room on first use.
    ///
    /// The transport leaves when its `done` token is cancelled.
    pub async fn add(self: &Arc<Self>, room_id: RoomId, transport: Arc<dyn Transport>) -> Result<()> {
        let client_id = transport.client_id().clone();

        let (router, existing) = {
            let mut rooms = self.rooms.lock();

            let (router, created) = match rooms.get(&room_id) {
                Some(router) => (Arc::clone(router), false),
                None => {
                    // Enforce room limit (0 = unlimited)
                    if self.config.max_rooms > 0 && rooms.len() >= self.config.max_rooms {
                        warn!(
                            current_rooms = rooms.len(),
                            max_rooms = self.config.max_rooms,
                            "Room limit reached"
                        );
                        return Err(Error::RoomLimitReached(self.config.max_rooms));
                    }
                    (ForwardingRouter::new(room_id.clone(), &self.config), true)
                }
            };

            // Enforce transport limit (0 = unlimited)
            let limit = self.config.max_transports_per_room;
            if limit > 0 && router.transport_count() >= limit {
                warn!(room_id = %room_id, limit, "Transport limit reached for room");
                return Err(Error::RoomFull { room_id, limit });
            }

            let existing = router.register(Arc::clone(&transport))?;
            if created {
                rooms.insert(room_id.clone(), Arc::clone(&router));
                info!(room_id = %room_id, total_rooms = rooms.len(), "Created room");
            }
            (router, existing)
        };

        self.watch_leave(room_id, &transport);
        router.bootstrap(&transport, existing).await;

        debug!(client_id = %client_id, room_id = %router.room_id(), "Join complete");
        Ok(())
    }

    fn watch_leave(self: &Arc<Self>, room_id: RoomId, transport: &Arc<dyn Transport>) {
        let registry = Arc::downgrade(self);
        let client_id = transport.client_id().clone();
        let done = transport.done();

        tokio::spawn(async move {
            done.cancelled().await;
            if let Some(registry) = Weak::upgrade(&registry) {
                registry.remove_client(&room_id, &client_id);
            }
        });
    }

    /// Drop a client from a room, deleting the room once it is empty
    fn remove_client(&self, room_id: &RoomId, client_id: &ClientId) {
        let mut rooms = self.rooms.lock();
        let Some(router) = rooms.get(room_id) else {
            debug!(room_id = %room_id, client_id = %client_id, "Room not found when removing client");
            return;
        };

        router.remove(client_id);
        if router.is_empty() {
            rooms.remove(room_id);
            info!(room_id = %room_id, total_rooms = rooms.len(), "Removed empty room");
        }
    }

    /// Tracks the SFU currently sends to one client, if it is in the room
    pub async fn get_tracks_metadata(
        &self,
        room_id: &RoomId,
        client_id: &ClientId,
    ) -> Option<Vec<TrackMetadata>> {
        let router = self.router(room_id)?;
        router.get_tracks_metadata(client_id).await
    }

    #[must_use]
    pub fn router(&self, room_id: &RoomId) -> Option<Arc<ForwardingRouter>> {
        self.rooms.lock().get(room_id).cloned()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.lock().keys().cloned().collect()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let rooms = self.rooms.lock();
        RegistryStats {
            active_rooms: rooms.len(),
            total_transports: rooms.values().map(|router| router.transport_count()).sum(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }
}
