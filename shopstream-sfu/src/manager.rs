//! Top-level orchestration for the media engine.
//!
//! `SfuManager` is what the signaling layer calls: it owns the worker pool,
//! the room registry, and the participant sessions, and sequences every
//! operation between them. Cascading teardown flows through
//! [`SfuManager::apply_closed`]: each close on a worker reports the full set
//! of entities it took down, and the coordinator walks that set to update
//! ownership indexes, adjust gauges, and notify affected participants.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shopstream_core::auth::Claims;
use shopstream_core::config::MediaConfig;
use shopstream_core::metrics;
use shopstream_core::{Error, Result};

use crate::pool::{RouterHandle, WorkerPool};
use crate::registry::{ProducerInfo, Room, RoomRegistry};
use crate::router::{ClosedEntities, ConsumerDescriptor};
use crate::rtp::{RouterCapabilities, RtpPacket, RtpParameters};
use crate::session::{Session, SessionEvent};
use crate::transport::{DtlsParameters, TransportDescriptor};
use crate::types::{
    MediaKind, ParticipantId, ProducerId, RoomId, TransportDirection, TransportId,
};
use crate::worker::WorkerCommand;

/// Join response: the room's negotiated capabilities plus the producers a
/// viewer can subscribe to right away.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JoinInfo {
    pub capabilities: RouterCapabilities,
    pub producers: Vec<ProducerInfo>,
}

/// Handle for pushing a publisher's RTP packets into the fan-out path.
///
/// The media edge holds this; packets sent here are forwarded byte-for-byte
/// to every consumer of the producer by its owning worker.
#[derive(Debug, Clone)]
pub struct ProducerHandle {
    pub id: ProducerId,
    router: RouterHandle,
}

impl ProducerHandle {
    pub fn send(&self, packet: RtpPacket) -> Result<()> {
        self.router.worker.send(WorkerCommand::Forward {
            router_id: self.router.id.clone(),
            producer_id: self.id.clone(),
            packet,
        })
    }
}

pub struct SfuManager {
    pool: Arc<WorkerPool>,
    registry: RoomRegistry,
    sessions: DashMap<ParticipantId, Arc<Session>>,
    shutdown: CancellationToken,
}

impl SfuManager {
    /// Create the manager and start the idle-transport sweep task.
    pub fn new(pool: Arc<WorkerPool>, media: &MediaConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            registry: RoomRegistry::new(Arc::clone(&pool)),
            pool,
            sessions: DashMap::new(),
            shutdown: CancellationToken::new(),
        });

        info!(
            workers = manager.pool.size(),
            idle_timeout_secs = media.transport_idle_timeout_secs,
            "SFU manager initialized"
        );

        let sweeper = Arc::clone(&manager);
        let sweep_interval = Duration::from_secs(media.sweep_interval_secs);
        tokio::spawn(async move {
            sweeper.sweep_task(sweep_interval).await;
        });

        manager
    }

    /// Register a new participant session for a validated credential.
    pub fn connect(&self, claims: Claims) -> (Arc<Session>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (session, event_rx) = Session::new(claims);
        let session = Arc::new(session);
        self.sessions
            .insert(session.id().clone(), Arc::clone(&session));
        metrics::PARTICIPANTS_ACTIVE.inc();
        debug!(participant_id = %session.id(), user = %session.claims().sub, "Participant connected");
        (session, event_rx)
    }

    /// Join the room, creating it on first use.
    pub async fn join_room(&self, session: &Arc<Session>, room_id: RoomId) -> Result<JoinInfo> {
        session.set_room(room_id.clone())?;

        let room = loop {
            let room = self.registry.get_or_create(&room_id).await?;
            if room.try_add_participant(session.id().clone(), session.event_sender()) {
                break room;
            }
            // The room closed between lookup and join; the registry will
            // build a fresh one on the next iteration.
        };

        if session.is_closed() {
            // Disconnected while the join was in flight; undo immediately.
            room.remove_participant(session.id());
            self.registry.remove_if_empty(&room_id).await;
            return Err(Error::InvalidState("participant disconnected".to_string()));
        }

        info!(
            participant_id = %session.id(),
            room_id = %room_id,
            participants = room.participant_count(),
            "Participant joined room"
        );

        Ok(JoinInfo {
            capabilities: room.capabilities().clone(),
            producers: room.producer_infos(),
        })
    }

    /// Create a send- or recv-direction transport on the room's router.
    pub async fn create_transport(
        &self,
        session: &Arc<Session>,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor> {
        let room = self.room_of(session)?;
        let router = room.router();

        let descriptor = router
            .worker
            .request(|reply| WorkerCommand::CreateTransport {
                router_id: router.id.clone(),
                owner: session.id().clone(),
                direction,
                reply,
            })
            .await?;

        if session.track_transport(descriptor.transport_id.clone()).is_err() {
            // Owner disconnected while the request was in flight: tear the
            // transport down instead of leaking it.
            let closed = self
                .close_transport_on(router, &descriptor.transport_id)
                .await;
            self.apply_closed(&room, closed);
            return Err(Error::InvalidState("participant disconnected".to_string()));
        }

        Ok(descriptor)
    }

    /// Finalize the DTLS handshake for a transport.
    ///
    /// A negotiation failure tears down the affected transport and
    /// everything bound to it; the participant's other transports are
    /// unaffected.
    pub async fn connect_transport(
        &self,
        session: &Arc<Session>,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let room = self.room_of(session)?;
        let router = room.router();

        let result = router
            .worker
            .request(|reply| WorkerCommand::ConnectTransport {
                router_id: router.id.clone(),
                owner: session.id().clone(),
                transport_id: transport_id.clone(),
                dtls_parameters,
                reply,
            })
            .await;

        if let Err(Error::Negotiation(_)) = &result {
            warn!(
                participant_id = %session.id(),
                transport_id = %transport_id,
                "DTLS negotiation failed, tearing down transport"
            );
            let closed = self.close_transport_on(router, transport_id).await;
            self.apply_closed(&room, closed);
            self.registry.remove_if_empty(room.id()).await;
        }

        result
    }

    /// Register an inbound track on a send transport owned by the caller.
    pub async fn produce(
        &self,
        session: &Arc<Session>,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerHandle> {
        let room = self.room_of(session)?;
        let router = room.router();

        let producer_id = router
            .worker
            .request(|reply| WorkerCommand::Produce {
                router_id: router.id.clone(),
                owner: session.id().clone(),
                transport_id: transport_id.clone(),
                kind,
                rtp_parameters,
                reply,
            })
            .await?;

        if session.track_producer(producer_id.clone()).is_err() {
            if let Ok(closed) = router
                .worker
                .request(|reply| WorkerCommand::CloseProducer {
                    router_id: router.id.clone(),
                    producer_id: producer_id.clone(),
                    reply,
                })
                .await
            {
                self.apply_closed(&room, closed);
            }
            return Err(Error::InvalidState("participant disconnected".to_string()));
        }

        room.register_producer(producer_id.clone(), session.id().clone(), kind);
        metrics::PRODUCERS_ACTIVE.inc();

        room.broadcast_except(
            session.id(),
            &SessionEvent::ProducerAdded {
                producer_id: producer_id.clone(),
                participant_id: session.id().clone(),
                kind,
            },
        );

        info!(
            participant_id = %session.id(),
            room_id = %room.id(),
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );

        Ok(ProducerHandle {
            id: producer_id,
            router: router.clone(),
        })
    }

    /// Register an outbound forwarded track for the named producer on a recv
    /// transport owned by the caller. Returns the consumer descriptor and
    /// the packet stream for the media edge.
    pub async fn consume(
        &self,
        session: &Arc<Session>,
        transport_id: &TransportId,
        producer_id: &ProducerId,
    ) -> Result<(ConsumerDescriptor, mpsc::UnboundedReceiver<RtpPacket>)> {
        let room = self.room_of(session)?;
        let router = room.router();

        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        let descriptor = router
            .worker
            .request(|reply| WorkerCommand::Consume {
                router_id: router.id.clone(),
                owner: session.id().clone(),
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
                packet_tx,
                reply,
            })
            .await?;

        if session.track_consumer(descriptor.consumer_id.clone()).is_err() {
            if let Ok(closed) = router
                .worker
                .request(|reply| WorkerCommand::CloseConsumer {
                    router_id: router.id.clone(),
                    consumer_id: descriptor.consumer_id.clone(),
                    reply,
                })
                .await
            {
                self.apply_closed(&room, closed);
            }
            return Err(Error::InvalidState("participant disconnected".to_string()));
        }

        metrics::CONSUMERS_ACTIVE.inc();
        debug!(
            participant_id = %session.id(),
            consumer_id = %descriptor.consumer_id,
            producer_id = %producer_id,
            "Consumer created"
        );

        Ok((descriptor, packet_rx))
    }

    /// Close a producer the caller owns, cascading into every consumer that
    /// references it.
    pub async fn close_producer(
        &self,
        session: &Arc<Session>,
        producer_id: &ProducerId,
    ) -> Result<()> {
        if !session.owns_producer(producer_id) {
            return Err(Error::not_found("producer", producer_id.as_str()));
        }
        let room = self.room_of(session)?;
        let router = room.router();

        let closed = router
            .worker
            .request(|reply| WorkerCommand::CloseProducer {
                router_id: router.id.clone(),
                producer_id: producer_id.clone(),
                reply,
            })
            .await?;

        self.apply_closed(&room, closed);
        self.registry.remove_if_empty(room.id()).await;
        Ok(())
    }

    /// Tear down everything a participant owns, bottom-up, and drop its
    /// session. Idempotent: only the first call does work.
    pub async fn disconnect(&self, participant_id: &ParticipantId) {
        let Some((_, session)) = self.sessions.remove(participant_id) else {
            return;
        };
        let (room_id, transports) = session.close();
        metrics::PARTICIPANTS_ACTIVE.dec();

        let Some(room_id) = room_id else {
            return;
        };
        let Some(room) = self.registry.get(&room_id) else {
            return;
        };

        room.remove_participant(participant_id);
        for transport_id in transports {
            let closed = self.close_transport_on(room.router(), &transport_id).await;
            self.apply_closed(&room, closed);
        }

        info!(
            participant_id = %participant_id,
            room_id = %room_id,
            participants = room.participant_count(),
            "Participant disconnected"
        );

        self.registry.remove_if_empty(&room_id).await;
    }

    /// Create a room's router ahead of the first join (stream lifecycle
    /// pre-warm from the application layer).
    pub async fn prewarm(&self, room_id: RoomId) -> Result<RouterCapabilities> {
        let room = self.registry.get_or_create(&room_id).await?;
        Ok(room.capabilities().clone())
    }

    /// Force-close a room (stream ended in the application layer), ejecting
    /// every participant's media state and notifying them.
    pub async fn close_room(&self, room_id: &RoomId) -> Result<()> {
        let room = self
            .registry
            .get(room_id)
            .ok_or_else(|| Error::not_found("room", room_id.as_str()))?;

        room.mark_closed();
        let router = room.router();
        let closed = router
            .worker
            .request(|reply| WorkerCommand::CloseRouter {
                router_id: router.id.clone(),
                reply,
            })
            .await
            .unwrap_or_default();
        self.apply_closed(&room, closed);

        room.broadcast(&SessionEvent::RoomClosed {
            room_id: room_id.clone(),
        });
        room.clear_participants();
        self.registry.remove(room_id);

        info!(room_id = %room_id, "Room force-closed");
        Ok(())
    }

    /// Orderly shutdown: stop the sweeper, close every router, stop workers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for room in self.registry.rooms() {
            room.broadcast(&SessionEvent::RoomClosed {
                room_id: room.id().clone(),
            });
        }
        self.registry.close_all().await;
        self.pool.shutdown();
        info!("SFU manager shut down");
    }

    /// Resolves when a media worker dies (fatal, fail-fast).
    pub async fn worker_failed(&self) -> Error {
        self.pool.failed().await
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.registry.room_count()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.registry.get(room_id)
    }

    fn room_of(&self, session: &Arc<Session>) -> Result<Arc<Room>> {
        let room_id = session
            .room_id()
            .ok_or_else(|| Error::InvalidState("join a room first".to_string()))?;
        self.registry
            .get(&room_id)
            .ok_or_else(|| Error::not_found("room", room_id.as_str()))
    }

    async fn close_transport_on(
        &self,
        router: &RouterHandle,
        transport_id: &TransportId,
    ) -> ClosedEntities {
        router
            .worker
            .request(|reply| WorkerCommand::CloseTransport {
                router_id: router.id.clone(),
                transport_id: transport_id.clone(),
                reply,
            })
            .await
            .unwrap_or_default()
    }

    /// Walk a close cascade reported by a worker: update ownership indexes,
    /// adjust gauges, and notify each affected participant exactly once per
    /// closed entity.
    fn apply_closed(&self, room: &Room, closed: ClosedEntities) {
        for (owner, consumer_id, producer_id) in closed.consumers {
            if let Some(session) = self.sessions.get(&owner) {
                session.untrack_consumer(&consumer_id);
                session.notify(SessionEvent::ConsumerClosed {
                    consumer_id,
                    producer_id,
                });
            }
            metrics::CONSUMERS_ACTIVE.dec();
        }

        for (owner, producer_id) in closed.producers {
            if let Some(session) = self.sessions.get(&owner) {
                session.untrack_producer(&producer_id);
            }
            room.unregister_producer(&producer_id);
            metrics::PRODUCERS_ACTIVE.dec();
        }

        for (owner, transport_id) in closed.transports {
            if let Some(session) = self.sessions.get(&owner) {
                session.untrack_transport(&transport_id);
                session.notify(SessionEvent::TransportClosed { transport_id });
            }
        }
    }

    /// Periodically reap transports whose client vanished without a clean
    /// signaling disconnect.
    async fn sweep_task(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!(interval_secs = interval.as_secs(), "Idle transport sweeper started");

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for room in self.registry.rooms() {
                let router = room.router();
                match router
                    .worker
                    .request(|reply| WorkerCommand::SweepIdle {
                        router_id: router.id.clone(),
                        reply,
                    })
                    .await
                {
                    Ok(closed) if !closed.is_empty() => {
                        warn!(
                            room_id = %room.id(),
                            transports = closed.transports.len(),
                            "Reaped idle transports"
                        );
                        self.apply_closed(&room, closed);
                        self.registry.remove_if_empty(room.id()).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(room_id = %room.id(), error = %e, "Sweep skipped");
                    }
                }
            }
        }
    }
}
