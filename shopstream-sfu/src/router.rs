//! Per-room routing context: the producer/consumer graph.
//!
//! A router lives inside exactly one worker for its entire lifetime and owns
//! every transport, producer, and consumer of its room. All mutation goes
//! through the router's API; close paths return the full set of entities
//! they cascaded into so the coordinator can update its ownership indexes
//! and notify the affected participants.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use shopstream_core::{Error, Result};

use crate::rtp::{RouterCapabilities, RtpPacket, RtpParameters};
use crate::transport::{DtlsParameters, Transport, TransportDescriptor};
use crate::types::{
    ConsumerId, MediaKind, ParticipantId, ProducerId, RoomId, RouterId, TransportDirection,
    TransportId,
};

/// An inbound media track published by a broadcaster.
#[derive(Debug)]
pub(crate) struct Producer {
    pub(crate) id: ProducerId,
    pub(crate) owner: ParticipantId,
    pub(crate) transport_id: TransportId,
    pub(crate) kind: MediaKind,
    pub(crate) rtp_parameters: RtpParameters,
}

/// An outbound forwarded track, referencing exactly one producer.
#[derive(Debug)]
pub(crate) struct Consumer {
    pub(crate) id: ConsumerId,
    pub(crate) owner: ParticipantId,
    pub(crate) transport_id: TransportId,
    pub(crate) producer_id: ProducerId,
    packet_tx: mpsc::UnboundedSender<RtpPacket>,
}

/// Parameters returned to a subscriber from `consume`.
///
/// The RTP parameters are the producer's own, unchanged: packets are
/// forwarded, never re-encoded.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConsumerDescriptor {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Everything a close operation cascaded into, with owners, so the
/// coordinator can walk its ownership indexes and notify participants.
#[derive(Debug, Default)]
pub struct ClosedEntities {
    pub transports: Vec<(ParticipantId, TransportId)>,
    pub producers: Vec<(ParticipantId, ProducerId)>,
    pub consumers: Vec<(ParticipantId, ConsumerId, ProducerId)>,
}

impl ClosedEntities {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }

    fn merge(&mut self, other: Self) {
        self.transports.extend(other.transports);
        self.producers.extend(other.producers);
        self.consumers.extend(other.consumers);
    }
}

/// Worker-side routing context for one room.
pub(crate) struct Router {
    pub(crate) id: RouterId,
    room_id: RoomId,
    capabilities: RouterCapabilities,
    transports: HashMap<TransportId, Transport>,
    producers: HashMap<ProducerId, Producer>,
    consumers: HashMap<ConsumerId, Consumer>,
}

impl Router {
    pub(crate) fn new(id: RouterId, room_id: RoomId, capabilities: RouterCapabilities) -> Self {
        Self {
            id,
            room_id,
            capabilities,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    pub(crate) fn create_transport(
        &mut self,
        owner: ParticipantId,
        direction: TransportDirection,
        ip: String,
        port: u16,
    ) -> TransportDescriptor {
        let transport = Transport::new(owner, direction, ip, port);
        let descriptor = transport.descriptor();
        debug!(
            room_id = %self.room_id,
            transport_id = %transport.id,
            direction = %direction,
            "Created transport"
        );
        self.transports.insert(transport.id.clone(), transport);
        descriptor
    }

    pub(crate) fn connect_transport(
        &mut self,
        owner: &ParticipantId,
        transport_id: &TransportId,
        remote: DtlsParameters,
    ) -> Result<()> {
        let transport = self.owned_transport_mut(owner, transport_id)?;
        transport.connect(remote)
    }

    /// Register an inbound track. Requires a send-direction transport
    /// belonging to the caller and parameters the room's codec set supports.
    pub(crate) fn produce(
        &mut self,
        owner: &ParticipantId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let transport = self.owned_transport_mut(owner, transport_id)?;
        if transport.direction != TransportDirection::Send {
            return Err(Error::InvalidState(format!(
                "transport {transport_id} is not a send transport"
            )));
        }
        if !self.capabilities.supports(kind, &rtp_parameters) {
            return Err(Error::Validation(format!(
                "codec {} is not supported by this room",
                rtp_parameters.mime_type
            )));
        }

        let producer = Producer {
            id: ProducerId::generate(),
            owner: owner.clone(),
            transport_id: transport_id.clone(),
            kind,
            rtp_parameters,
        };
        let id = producer.id.clone();
        debug!(room_id = %self.room_id, producer_id = %id, kind = %kind, "Producer registered");
        self.producers.insert(id.clone(), producer);
        Ok(id)
    }

    /// Register an outbound forwarded track for the named producer. Requires
    /// a recv-direction transport belonging to the caller and a producer in
    /// this room.
    pub(crate) fn consume(
        &mut self,
        owner: &ParticipantId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        packet_tx: mpsc::UnboundedSender<RtpPacket>,
    ) -> Result<ConsumerDescriptor> {
        {
            let transport = self.owned_transport_mut(owner, transport_id)?;
            if transport.direction != TransportDirection::Recv {
                return Err(Error::InvalidState(format!(
                    "transport {transport_id} is not a recv transport"
                )));
            }
        }
        let producer = self
            .producers
            .get(producer_id)
            .ok_or_else(|| Error::not_found("producer", producer_id.as_str()))?;

        let consumer = Consumer {
            id: ConsumerId::generate(),
            owner: owner.clone(),
            transport_id: transport_id.clone(),
            producer_id: producer_id.clone(),
            packet_tx,
        };
        let descriptor = ConsumerDescriptor {
            consumer_id: consumer.id.clone(),
            producer_id: producer_id.clone(),
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
        };
        debug!(
            room_id = %self.room_id,
            consumer_id = %consumer.id,
            producer_id = %producer_id,
            "Consumer registered"
        );
        self.consumers.insert(consumer.id.clone(), consumer);
        Ok(descriptor)
    }

    /// Close a transport and everything bound to it. Idempotent: closing an
    /// unknown or already-closed transport cascades into nothing.
    pub(crate) fn close_transport(&mut self, transport_id: &TransportId) -> ClosedEntities {
        let mut closed = ClosedEntities::default();
        let Some(mut transport) = self.transports.remove(transport_id) else {
            return closed;
        };
        transport.close();
        closed
            .transports
            .push((transport.owner.clone(), transport.id.clone()));

        // Producers bound to this transport, each cascading into its consumers
        let producer_ids: Vec<ProducerId> = self
            .producers
            .values()
            .filter(|p| &p.transport_id == transport_id)
            .map(|p| p.id.clone())
            .collect();
        for producer_id in producer_ids {
            if let Ok(cascade) = self.close_producer(&producer_id) {
                closed.merge(cascade);
            }
        }

        // Consumers bound to this transport directly
        let consumer_ids: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| &c.transport_id == transport_id)
            .map(|c| c.id.clone())
            .collect();
        for consumer_id in consumer_ids {
            closed.merge(self.close_consumer(&consumer_id));
        }

        debug!(room_id = %self.room_id, transport_id = %transport_id, "Transport closed");
        closed
    }

    /// Close a producer and, synchronously as part of the same operation,
    /// every consumer that references it.
    pub(crate) fn close_producer(&mut self, producer_id: &ProducerId) -> Result<ClosedEntities> {
        let producer = self
            .producers
            .remove(producer_id)
            .ok_or_else(|| Error::not_found("producer", producer_id.as_str()))?;

        let mut closed = ClosedEntities::default();
        closed.producers.push((producer.owner, producer.id));

        let consumer_ids: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| &c.producer_id == producer_id)
            .map(|c| c.id.clone())
            .collect();
        for consumer_id in consumer_ids {
            closed.merge(self.close_consumer(&consumer_id));
        }

        debug!(
            room_id = %self.room_id,
            producer_id = %producer_id,
            consumers_closed = closed.consumers.len(),
            "Producer closed"
        );
        Ok(closed)
    }

    /// Close a single consumer. Idempotent: the first close wins, whether it
    /// came from the consumer itself, its producer, or its transport.
    pub(crate) fn close_consumer(&mut self, consumer_id: &ConsumerId) -> ClosedEntities {
        let mut closed = ClosedEntities::default();
        if let Some(consumer) = self.consumers.remove(consumer_id) {
            closed
                .consumers
                .push((consumer.owner, consumer.id, consumer.producer_id));
        }
        closed
    }

    /// Forward one RTP packet from a producer to every consumer referencing
    /// it. Packets are passed through byte-for-byte; a subscriber whose sink
    /// is gone is skipped.
    pub(crate) fn forward(&mut self, producer_id: &ProducerId, packet: &RtpPacket) {
        let Some(producer) = self.producers.get(producer_id) else {
            // Media racing a producer close; nothing to forward to.
            return;
        };
        let send_transport_id = producer.transport_id.clone();

        let mut recv_transports: Vec<TransportId> = Vec::new();
        for consumer in self.consumers.values() {
            if &consumer.producer_id != producer_id {
                continue;
            }
            if consumer.packet_tx.send(packet.clone()).is_err() {
                warn!(
                    room_id = %self.room_id,
                    consumer_id = %consumer.id,
                    "Subscriber sink gone, dropping packet"
                );
                continue;
            }
            recv_transports.push(consumer.transport_id.clone());
        }

        if let Some(transport) = self.transports.get_mut(&send_transport_id) {
            transport.touch();
        }
        for transport_id in recv_transports {
            if let Some(transport) = self.transports.get_mut(&transport_id) {
                transport.touch();
            }
        }
    }

    /// Close every transport with no activity for `timeout`, reclaiming
    /// transports whose client vanished without a clean signaling disconnect.
    pub(crate) fn sweep_idle(&mut self, timeout: Duration, now: Instant) -> ClosedEntities {
        let idle: Vec<TransportId> = self
            .transports
            .values()
            .filter(|t| t.is_idle(timeout, now))
            .map(|t| t.id.clone())
            .collect();

        let mut closed = ClosedEntities::default();
        for transport_id in idle {
            warn!(
                room_id = %self.room_id,
                transport_id = %transport_id,
                "Reaping idle transport"
            );
            closed.merge(self.close_transport(&transport_id));
        }
        closed
    }

    /// Tear down the whole router (room destroyed or force-closed).
    pub(crate) fn close_all(&mut self) -> ClosedEntities {
        let transport_ids: Vec<TransportId> = self.transports.keys().cloned().collect();
        let mut closed = ClosedEntities::default();
        for transport_id in transport_ids {
            closed.merge(self.close_transport(&transport_id));
        }
        closed
    }

    pub(crate) const fn capabilities(&self) -> &RouterCapabilities {
        &self.capabilities
    }

    fn owned_transport_mut(
        &mut self,
        owner: &ParticipantId,
        transport_id: &TransportId,
    ) -> Result<&mut Transport> {
        match self.transports.get_mut(transport_id) {
            Some(t) if &t.owner == owner => Ok(t),
            // A transport belonging to someone else is not visible to the caller
            _ => Err(Error::not_found("transport", transport_id.as_str())),
        }
    }

    #[cfg(test)]
    pub(crate) fn counts(&self) -> (usize, usize, usize) {
        (
            self.transports.len(),
            self.producers.len(),
            self.consumers.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn router() -> Router {
        Router::new(
            RouterId::generate(),
            RoomId::from("room-1"),
            RouterCapabilities::broadcast_default(),
        )
    }

    fn opus() -> RtpParameters {
        RtpParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48000,
            ssrc: 0xAA,
        }
    }

    fn packet() -> RtpPacket {
        RtpPacket {
            ssrc: 0xAA,
            sequence_number: 7,
            timestamp: 1000,
            marker: false,
            payload: Bytes::from_static(b"opus-frame"),
        }
    }

    fn send_transport(r: &mut Router, owner: &str) -> TransportId {
        r.create_transport(
            ParticipantId::from(owner),
            TransportDirection::Send,
            "127.0.0.1".to_string(),
            40000,
        )
        .transport_id
    }

    fn recv_transport(r: &mut Router, owner: &str) -> TransportId {
        r.create_transport(
            ParticipantId::from(owner),
            TransportDirection::Recv,
            "127.0.0.1".to_string(),
            40001,
        )
        .transport_id
    }

    #[test]
    fn test_produce_requires_send_transport() {
        let mut r = router();
        let tid = recv_transport(&mut r, "b");
        let err = r
            .produce(&ParticipantId::from("b"), &tid, MediaKind::Audio, opus())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_produce_requires_ownership() {
        let mut r = router();
        let tid = send_transport(&mut r, "b");
        let err = r
            .produce(&ParticipantId::from("mallory"), &tid, MediaKind::Audio, opus())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_produce_rejects_unsupported_codec() {
        let mut r = router();
        let tid = send_transport(&mut r, "b");
        let mut params = opus();
        params.mime_type = "audio/G722".to_string();
        let err = r
            .produce(&ParticipantId::from("b"), &tid, MediaKind::Audio, params)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_consume_requires_existing_producer() {
        let mut r = router();
        let tid = recv_transport(&mut r, "v");
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = r
            .consume(
                &ParticipantId::from("v"),
                &tid,
                &ProducerId::from("nonexistent"),
                tx,
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "producer", .. }));
    }

    #[test]
    fn test_consumer_inherits_producer_parameters() {
        let mut r = router();
        let send = send_transport(&mut r, "b");
        let pid = r
            .produce(&ParticipantId::from("b"), &send, MediaKind::Audio, opus())
            .expect("produce");

        let recv = recv_transport(&mut r, "v");
        let (tx, _rx) = mpsc::unbounded_channel();
        let desc = r
            .consume(&ParticipantId::from("v"), &recv, &pid, tx)
            .expect("consume");
        assert_eq!(desc.rtp_parameters, opus());
        assert_eq!(desc.kind, MediaKind::Audio);
    }

    #[test]
    fn test_close_producer_cascades_to_all_consumers() {
        let mut r = router();
        let send = send_transport(&mut r, "b");
        let pid = r
            .produce(&ParticipantId::from("b"), &send, MediaKind::Audio, opus())
            .expect("produce");

        let mut rxs = Vec::new();
        for viewer in ["v1", "v2", "v3"] {
            let recv = recv_transport(&mut r, viewer);
            let (tx, rx) = mpsc::unbounded_channel();
            r.consume(&ParticipantId::from(viewer), &recv, &pid, tx)
                .expect("consume");
            rxs.push(rx);
        }

        let closed = r.close_producer(&pid).expect("close producer");
        assert_eq!(closed.producers.len(), 1);
        assert_eq!(closed.consumers.len(), 3);
        let owners: Vec<&str> = closed
            .consumers
            .iter()
            .map(|(owner, _, _)| owner.as_str())
            .collect();
        assert!(owners.contains(&"v1") && owners.contains(&"v2") && owners.contains(&"v3"));

        // Terminal: closing again is NotFound
        assert!(r.close_producer(&pid).is_err());
        let (_, producers, consumers) = r.counts();
        assert_eq!((producers, consumers), (0, 0));
    }

    #[test]
    fn test_close_transport_cascades_through_producers() {
        let mut r = router();
        let send = send_transport(&mut r, "b");
        let pid = r
            .produce(&ParticipantId::from("b"), &send, MediaKind::Audio, opus())
            .expect("produce");

        let recv = recv_transport(&mut r, "v");
        let (tx, _rx) = mpsc::unbounded_channel();
        r.consume(&ParticipantId::from("v"), &recv, &pid, tx)
            .expect("consume");

        let closed = r.close_transport(&send);
        assert_eq!(closed.transports.len(), 1);
        assert_eq!(closed.producers.len(), 1);
        assert_eq!(closed.consumers.len(), 1);

        // Idempotent
        assert!(r.close_transport(&send).is_empty());
    }

    #[test]
    fn test_forward_fans_out_to_every_consumer() {
        let mut r = router();
        let send = send_transport(&mut r, "b");
        let pid = r
            .produce(&ParticipantId::from("b"), &send, MediaKind::Audio, opus())
            .expect("produce");

        let mut rxs = Vec::new();
        for viewer in ["v1", "v2"] {
            let recv = recv_transport(&mut r, viewer);
            let (tx, rx) = mpsc::unbounded_channel();
            r.consume(&ParticipantId::from(viewer), &recv, &pid, tx)
                .expect("consume");
            rxs.push(rx);
        }

        r.forward(&pid, &packet());
        for rx in &mut rxs {
            let got = rx.try_recv().expect("packet delivered");
            assert_eq!(got.payload, Bytes::from_static(b"opus-frame"));
            assert_eq!(got.sequence_number, 7);
        }
    }

    #[test]
    fn test_forward_to_unknown_producer_is_a_no_op() {
        let mut r = router();
        r.forward(&ProducerId::from("gone"), &packet());
    }

    #[test]
    fn test_sweep_reaps_only_idle_transports() {
        let mut r = router();
        let _idle = send_transport(&mut r, "b");
        let closed = r.sweep_idle(Duration::from_secs(3600), Instant::now());
        assert!(closed.is_empty());

        let closed = r.sweep_idle(Duration::from_secs(0), Instant::now());
        assert_eq!(closed.transports.len(), 1);
        let (transports, _, _) = r.counts();
        assert_eq!(transports, 0);
    }
}
