//! Participant sessions: the coordinator-side endpoint of one signaling
//! channel.
//!
//! A session owns the id sets of every transport, producer, and consumer
//! the participant created, so disconnect cleanup can walk those lists and
//! cascade deletes through the owning room instead of scattering partial
//! state across the socket handler. Once a session is closed, any creation
//! request that completes late is rejected at registration time and the
//! entity is torn down immediately instead of leaked.

use std::collections::HashSet;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use shopstream_core::auth::Claims;
use shopstream_core::{Error, Result};

use crate::types::{ConsumerId, MediaKind, ParticipantId, ProducerId, RoomId, TransportId};

/// Server-initiated notification delivered to one participant's signaling
/// channel.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SessionEvent {
    /// A new producer appeared in the joined room.
    ProducerAdded {
        producer_id: ProducerId,
        participant_id: ParticipantId,
        kind: MediaKind,
    },
    /// One of this participant's consumers closed because its producer (or
    /// the underlying transport) went away.
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    /// One of this participant's transports was torn down server-side
    /// (DTLS failure or idle reap).
    TransportClosed { transport_id: TransportId },
    /// The room ended; the participant should drop its local state.
    RoomClosed { room_id: RoomId },
}

#[derive(Default)]
struct SessionState {
    room_id: Option<RoomId>,
    transports: HashSet<TransportId>,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
    closed: bool,
}

/// One connected participant.
pub struct Session {
    id: ParticipantId,
    claims: Claims,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(claims: Claims) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ParticipantId::generate(),
                claims,
                event_tx,
                state: Mutex::new(SessionState::default()),
            },
            event_rx,
        )
    }

    #[must_use]
    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    #[must_use]
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// Deliver a notification. Best-effort: a disconnected receiver is not
    /// an error, the session is about to be reaped anyway.
    pub(crate) fn notify(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn event_sender(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.event_tx.clone()
    }

    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        self.state.lock().room_id.clone()
    }

    pub(crate) fn set_room(&self, room_id: RoomId) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::InvalidState("participant disconnected".to_string()));
        }
        if state.room_id.is_some() {
            return Err(Error::InvalidState("already joined a room".to_string()));
        }
        state.room_id = Some(room_id);
        Ok(())
    }

    /// Record ownership of a newly created entity. Fails when the session
    /// closed while the creation request was in flight; the caller must then
    /// destroy the entity it just created.
    pub(crate) fn track_transport(&self, id: TransportId) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::InvalidState("participant disconnected".to_string()));
        }
        state.transports.insert(id);
        Ok(())
    }

    pub(crate) fn track_producer(&self, id: ProducerId) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::InvalidState("participant disconnected".to_string()));
        }
        state.producers.insert(id);
        Ok(())
    }

    pub(crate) fn track_consumer(&self, id: ConsumerId) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::InvalidState("participant disconnected".to_string()));
        }
        state.consumers.insert(id);
        Ok(())
    }

    pub(crate) fn untrack_transport(&self, id: &TransportId) {
        self.state.lock().transports.remove(id);
    }

    pub(crate) fn untrack_producer(&self, id: &ProducerId) {
        self.state.lock().producers.remove(id);
    }

    pub(crate) fn untrack_consumer(&self, id: &ConsumerId) {
        self.state.lock().consumers.remove(id);
    }

    pub(crate) fn owns_transport(&self, id: &TransportId) -> bool {
        self.state.lock().transports.contains(id)
    }

    pub(crate) fn owns_producer(&self, id: &ProducerId) -> bool {
        self.state.lock().producers.contains(id)
    }

    /// Mark the session closed and take the owned-id lists for teardown.
    /// Idempotent: the second caller gets empty lists.
    pub(crate) fn close(&self) -> (Option<RoomId>, Vec<TransportId>) {
        let mut state = self.state.lock();
        state.closed = true;
        (
            state.room_id.take(),
            state.transports.drain().collect(),
        )
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[cfg(test)]
    pub(crate) fn owned_counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (
            state.transports.len(),
            state.producers.len(),
            state.consumers.len(),
        )
    }
}
