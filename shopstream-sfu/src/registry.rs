//! Coordinator-side room registry.
//!
//! Maps a room id to exactly one router bound to exactly one worker. Rooms
//! are created lazily on first join and destroyed when they hold no
//! producers and no participants. Creation is serialized per room id
//! through a `OnceCell` slot, so racing first-joiners never produce a
//! duplicate router and all of them observe the same codec capabilities.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info};

use shopstream_core::metrics;
use shopstream_core::{Error, Result};

use crate::pool::{RouterHandle, WorkerPool};
use crate::router::ClosedEntities;
use crate::rtp::RouterCapabilities;
use crate::session::SessionEvent;
use crate::types::{MediaKind, ParticipantId, ProducerId, RoomId};
use crate::worker::WorkerCommand;

/// A producer visible to a joining participant.
#[derive(Debug, Clone, Serialize)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub participant_id: ParticipantId,
    pub kind: MediaKind,
}

struct RoomState {
    participants: HashMap<ParticipantId, mpsc::UnboundedSender<SessionEvent>>,
    producers: HashMap<ProducerId, (ParticipantId, MediaKind)>,
    closed: bool,
}

/// Coordinator-side view of one live room.
pub struct Room {
    id: RoomId,
    router: RouterHandle,
    state: Mutex<RoomState>,
}

impl Room {
    fn new(id: RoomId, router: RouterHandle) -> Self {
        Self {
            id,
            router,
            state: Mutex::new(RoomState {
                participants: HashMap::new(),
                producers: HashMap::new(),
                closed: false,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn router(&self) -> &RouterHandle {
        &self.router
    }

    #[must_use]
    pub fn capabilities(&self) -> &RouterCapabilities {
        &self.router.capabilities
    }

    /// Add a participant unless the room is already closing. Returning
    /// `false` tells the caller to retry through the registry, which will
    /// build a fresh room.
    pub(crate) fn try_add_participant(
        &self,
        id: ParticipantId,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.participants.insert(id, events);
        true
    }

    pub(crate) fn remove_participant(&self, id: &ParticipantId) {
        self.state.lock().participants.remove(id);
    }

    pub(crate) fn register_producer(
        &self,
        producer_id: ProducerId,
        owner: ParticipantId,
        kind: MediaKind,
    ) {
        self.state
            .lock()
            .producers
            .insert(producer_id, (owner, kind));
    }

    pub(crate) fn unregister_producer(&self, producer_id: &ProducerId) {
        self.state.lock().producers.remove(producer_id);
    }

    /// Producers currently live in the room, for the join response.
    #[must_use]
    pub fn producer_infos(&self) -> Vec<ProducerInfo> {
        self.state
            .lock()
            .producers
            .iter()
            .map(|(producer_id, (participant_id, kind))| ProducerInfo {
                producer_id: producer_id.clone(),
                participant_id: participant_id.clone(),
                kind: *kind,
            })
            .collect()
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.state.lock().participants.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.state.lock().producers.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Deliver an event to every participant except `except`.
    pub(crate) fn broadcast_except(&self, except: &ParticipantId, event: &SessionEvent) {
        let state = self.state.lock();
        for (id, sender) in &state.participants {
            if id != except {
                let _ = sender.send(event.clone());
            }
        }
    }

    pub(crate) fn broadcast(&self, event: &SessionEvent) {
        let state = self.state.lock();
        for sender in state.participants.values() {
            let _ = sender.send(event.clone());
        }
    }

    /// Atomically flip to closed iff the room is empty. The check and the
    /// flip happen under the same lock that guards joins, so a room cannot
    /// be destroyed just as a new participant is joining it.
    fn mark_closed_if_empty(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if state.participants.is_empty() && state.producers.is_empty() {
            state.closed = true;
            true
        } else {
            false
        }
    }

    /// Flip to closed unconditionally (force close from the application
    /// layer), returning the participants to notify.
    pub(crate) fn mark_closed(&self) -> Vec<ParticipantId> {
        let mut state = self.state.lock();
        state.closed = true;
        state.participants.keys().cloned().collect()
    }

    pub(crate) fn clear_participants(&self) {
        self.state.lock().participants.clear();
    }
}

type RoomSlot = Arc<OnceCell<Arc<Room>>>;

pub struct RoomRegistry {
    rooms: DashMap<RoomId, RoomSlot>,
    pool: Arc<WorkerPool>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            rooms: DashMap::new(),
            pool,
        }
    }

    /// Get the room, creating it (and its router) on first use.
    ///
    /// Idempotent under concurrent first-joiners: the slot's `OnceCell`
    /// runs exactly one initialization per room id and every racing caller
    /// receives the same room.
    pub async fn get_or_create(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        loop {
            let slot: RoomSlot = self
                .rooms
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value()
                .clone();

            let room = slot
                .get_or_try_init(|| async {
                    let router = self.pool.create_router(room_id.clone()).await?;
                    metrics::ROOMS_ACTIVE.inc();
                    info!(room_id = %room_id, router_id = %router.id, "Room created");
                    Ok::<_, Error>(Arc::new(Room::new(room_id.clone(), router)))
                })
                .await?
                .clone();

            if room.is_closed() {
                // Lost a race with removal; drop the stale slot and retry.
                self.rooms
                    .remove_if(room_id, |_, slot_in_map| Arc::ptr_eq(slot_in_map, &slot));
                continue;
            }

            return Ok(room);
        }
    }

    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        let slot = self.rooms.get(room_id).map(|entry| entry.value().clone())?;
        slot.get().cloned()
    }

    /// Destroy the room iff its producer count and participant count are
    /// both zero at the time of check. Invoked after every producer or
    /// participant removal.
    pub async fn remove_if_empty(&self, room_id: &RoomId) {
        let Some(slot) = self.rooms.get(room_id).map(|entry| entry.value().clone()) else {
            return;
        };
        let Some(room) = slot.get().cloned() else {
            return;
        };
        if !room.mark_closed_if_empty() {
            return;
        }

        self.rooms
            .remove_if(room_id, |_, slot_in_map| Arc::ptr_eq(slot_in_map, &slot));
        metrics::ROOMS_ACTIVE.dec();
        info!(room_id = %room_id, "Room destroyed (no producers, no participants)");

        let router = room.router();
        if let Err(e) = router
            .worker
            .request(|reply| WorkerCommand::CloseRouter {
                router_id: router.id.clone(),
                reply,
            })
            .await
        {
            debug!(room_id = %room_id, error = %e, "Router already gone on worker");
        }
    }

    /// Remove a closed room's slot after a force close.
    pub(crate) fn remove(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        let (_, slot) = self.rooms.remove(room_id)?;
        let room = slot.get().cloned();
        if room.is_some() {
            metrics::ROOMS_ACTIVE.dec();
        }
        room
    }

    /// Snapshot of all live rooms (for the sweep task).
    #[must_use]
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms
            .iter()
            .filter(|entry| entry.value().get().is_some())
            .count()
    }

    /// Close every router (service shutdown).
    pub async fn close_all(&self) -> Vec<ClosedEntities> {
        let mut results = Vec::new();
        for room in self.rooms() {
            room.mark_closed();
            let router = room.router();
            if let Ok(closed) = router
                .worker
                .request(|reply| WorkerCommand::CloseRouter {
                    router_id: router.id.clone(),
                    reply,
                })
                .await
            {
                results.push(closed);
            }
        }
        self.rooms.clear();
        results
    }
}
