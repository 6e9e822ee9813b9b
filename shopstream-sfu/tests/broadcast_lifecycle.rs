//! End-to-end engine tests: a merchant broadcast with viewers, the full
//! teardown cascade, and worker placement.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use shopstream_core::auth::{Capability, Claims};
use shopstream_core::config::MediaConfig;
use shopstream_core::Error;
use shopstream_sfu::{
    DtlsParameters, DtlsRole, MediaKind, RoomId, RtpPacket, RtpParameters, SessionEvent,
    SfuManager, TransportDirection, WorkerPool,
};

fn media_config() -> MediaConfig {
    MediaConfig::default()
}

fn manager_with_workers(count: usize) -> Arc<SfuManager> {
    let pool = Arc::new(WorkerPool::new(count, media_config()).expect("spawn pool"));
    SfuManager::new(pool, &media_config())
}

fn claims(user: &str, room: &str, cap: Capability) -> Claims {
    Claims {
        sub: user.to_string(),
        tenant: "merchant-9".to_string(),
        room: room.to_string(),
        cap,
        iat: 0,
        exp: i64::MAX,
    }
}

fn opus() -> RtpParameters {
    RtpParameters {
        mime_type: "audio/opus".to_string(),
        payload_type: 111,
        clock_rate: 48000,
        ssrc: 0xA0,
    }
}

fn vp8() -> RtpParameters {
    RtpParameters {
        mime_type: "video/VP8".to_string(),
        payload_type: 96,
        clock_rate: 90000,
        ssrc: 0xB0,
    }
}

async fn recv_event(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
) -> SessionEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open")
}

#[tokio::test]
async fn test_broadcast_lifecycle_end_to_end() {
    let manager = manager_with_workers(2);
    let room_id = RoomId::from("R1");

    // Broadcaster joins a new room and publishes audio + video.
    let (broadcaster, _b_events) =
        manager.connect(claims("merchant", "R1", Capability::Publish));
    let join = manager
        .join_room(&broadcaster, room_id.clone())
        .await
        .expect("broadcaster joins");
    assert_eq!(join.capabilities.codecs.len(), 2);
    assert!(join.producers.is_empty());

    let send = manager
        .create_transport(&broadcaster, TransportDirection::Send)
        .await
        .expect("send transport");
    manager
        .connect_transport(
            &broadcaster,
            &send.transport_id,
            send.dtls_parameters.clone(),
        )
        .await
        .expect("connect send transport");

    let audio = manager
        .produce(&broadcaster, &send.transport_id, MediaKind::Audio, opus())
        .await
        .expect("produce audio");
    let video = manager
        .produce(&broadcaster, &send.transport_id, MediaKind::Video, vp8())
        .await
        .expect("produce video");

    let room = manager.room(&room_id).expect("room exists");
    assert_eq!(room.producer_count(), 2);
    assert_eq!(room.participant_count(), 1);

    // Three viewers subscribe to both tracks: 6 consumers total.
    let mut viewers = Vec::new();
    for name in ["v1", "v2", "v3"] {
        let (viewer, events) = manager.connect(claims(name, "R1", Capability::Subscribe));
        let join = manager
            .join_room(&viewer, room_id.clone())
            .await
            .expect("viewer joins");
        assert_eq!(join.producers.len(), 2);

        let recv = manager
            .create_transport(&viewer, TransportDirection::Recv)
            .await
            .expect("recv transport");
        manager
            .connect_transport(&viewer, &recv.transport_id, recv.dtls_parameters.clone())
            .await
            .expect("connect recv transport");

        for producer_id in [&audio.id, &video.id] {
            manager
                .consume(&viewer, &recv.transport_id, producer_id)
                .await
                .expect("consume");
        }
        viewers.push((viewer, events));
    }
    assert_eq!(room.participant_count(), 4);

    // Broadcaster disconnects: both producers close, all 6 consumers close,
    // each viewer is notified exactly twice (once per closed producer).
    manager.disconnect(broadcaster.id()).await;

    assert_eq!(room.producer_count(), 0);
    assert_eq!(room.participant_count(), 3);
    assert!(!room.is_closed());

    for (_viewer, events) in &mut viewers {
        let mut closed_producers = Vec::new();
        for _ in 0..2 {
            match recv_event(events).await {
                SessionEvent::ConsumerClosed { producer_id, .. } => {
                    closed_producers.push(producer_id);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(closed_producers.contains(&audio.id));
        assert!(closed_producers.contains(&video.id));
        // Exactly twice: nothing else pending.
        assert!(events.try_recv().is_err());
    }

    // Viewers leave: participant count reaches zero with zero producers and
    // the room is destroyed.
    for (viewer, _) in &viewers {
        manager.disconnect(viewer.id()).await;
    }
    assert_eq!(manager.room_count(), 0);
    assert_eq!(manager.session_count(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_viewers_present_before_produce_are_announced() {
    let manager = manager_with_workers(1);
    let room_id = RoomId::from("R1");

    let (viewer, mut viewer_events) =
        manager.connect(claims("v1", "R1", Capability::Subscribe));
    manager
        .join_room(&viewer, room_id.clone())
        .await
        .expect("viewer joins");

    let (broadcaster, _events) = manager.connect(claims("merchant", "R1", Capability::Publish));
    manager
        .join_room(&broadcaster, room_id.clone())
        .await
        .expect("broadcaster joins");
    let send = manager
        .create_transport(&broadcaster, TransportDirection::Send)
        .await
        .expect("send transport");
    let producer = manager
        .produce(&broadcaster, &send.transport_id, MediaKind::Audio, opus())
        .await
        .expect("produce");

    match recv_event(&mut viewer_events).await {
        SessionEvent::ProducerAdded {
            producer_id, kind, ..
        } => {
            assert_eq!(producer_id, producer.id);
            assert_eq!(kind, MediaKind::Audio);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn test_fanout_delivers_identical_bytes_to_every_viewer() {
    let manager = manager_with_workers(2);
    let room_id = RoomId::from("R1");

    let (broadcaster, _events) = manager.connect(claims("merchant", "R1", Capability::Publish));
    manager
        .join_room(&broadcaster, room_id.clone())
        .await
        .expect("join");
    let send = manager
        .create_transport(&broadcaster, TransportDirection::Send)
        .await
        .expect("send transport");
    let producer = manager
        .produce(&broadcaster, &send.transport_id, MediaKind::Audio, opus())
        .await
        .expect("produce");

    let mut packet_rxs = Vec::new();
    for name in ["v1", "v2", "v3"] {
        let (viewer, _events) = manager.connect(claims(name, "R1", Capability::Subscribe));
        manager
            .join_room(&viewer, room_id.clone())
            .await
            .expect("join");
        let recv = manager
            .create_transport(&viewer, TransportDirection::Recv)
            .await
            .expect("recv transport");
        let (_descriptor, packet_rx) = manager
            .consume(&viewer, &recv.transport_id, &producer.id)
            .await
            .expect("consume");
        packet_rxs.push(packet_rx);
    }

    let payload = Bytes::from_static(b"encoded-opus-frame");
    producer
        .send(RtpPacket {
            ssrc: 0xA0,
            sequence_number: 41,
            timestamp: 960,
            marker: true,
            payload: payload.clone(),
        })
        .expect("push packet");

    for rx in &mut packet_rxs {
        let packet = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("packet within deadline")
            .expect("packet stream open");
        assert_eq!(packet.payload, payload);
        assert_eq!(packet.sequence_number, 41);
        assert_eq!(packet.timestamp, 960);
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_first_joins_observe_identical_capabilities() {
    let manager = manager_with_workers(4);
    let room_id = RoomId::from("R-contended");

    let mut tasks = Vec::new();
    for i in 0..12 {
        let manager = Arc::clone(&manager);
        let room_id = room_id.clone();
        tasks.push(tokio::spawn(async move {
            let (session, _events) = manager.connect(claims(
                &format!("viewer-{i}"),
                "R-contended",
                Capability::Subscribe,
            ));
            manager
                .join_room(&session, room_id)
                .await
                .expect("join")
                .capabilities
        }));
    }

    let mut all_caps = Vec::new();
    for task in tasks {
        all_caps.push(task.await.expect("join task"));
    }

    assert_eq!(manager.room_count(), 1);
    for caps in &all_caps[1..] {
        assert_eq!(caps, &all_caps[0]);
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn test_rooms_land_on_workers_round_robin() {
    let pool = Arc::new(WorkerPool::new(4, media_config()).expect("spawn pool"));
    let manager = SfuManager::new(Arc::clone(&pool), &media_config());

    let mut placements = Vec::new();
    for name in ["R1", "R2", "R3", "R4", "R5"] {
        let (session, _events) = manager.connect(claims("v", name, Capability::Subscribe));
        manager
            .join_room(&session, RoomId::from(name))
            .await
            .expect("join");
        let room = manager.room(&RoomId::from(name)).expect("room");
        placements.push(room.router().worker.id());
    }
    assert_eq!(placements, vec![0, 1, 2, 3, 0]);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_idle_transports_are_reaped() {
    let media = MediaConfig {
        transport_idle_timeout_secs: 1,
        sweep_interval_secs: 1,
        ..MediaConfig::default()
    };
    let pool = Arc::new(WorkerPool::new(1, media.clone()).expect("spawn pool"));
    let manager = SfuManager::new(pool, &media);

    let (session, mut events) = manager.connect(claims("v1", "R1", Capability::Subscribe));
    manager
        .join_room(&session, RoomId::from("R1"))
        .await
        .expect("join");
    let transport = manager
        .create_transport(&session, TransportDirection::Recv)
        .await
        .expect("transport");

    // Never connected, never carries media: the sweeper reclaims it.
    match recv_event(&mut events).await {
        SessionEvent::TransportClosed { transport_id } => {
            assert_eq!(transport_id, transport.transport_id);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn test_negotiation_failure_tears_down_only_the_affected_transport() {
    let manager = manager_with_workers(1);
    let room_id = RoomId::from("R1");

    let (session, mut events) = manager.connect(claims("v1", "R1", Capability::Subscribe));
    manager
        .join_room(&session, room_id.clone())
        .await
        .expect("join");

    let bad = manager
        .create_transport(&session, TransportDirection::Recv)
        .await
        .expect("transport");
    let good = manager
        .create_transport(&session, TransportDirection::Recv)
        .await
        .expect("transport");

    // No fingerprint: the handshake cannot complete.
    let err = manager
        .connect_transport(
            &session,
            &bad.transport_id,
            DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: vec![],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Negotiation(_)));

    match recv_event(&mut events).await {
        SessionEvent::TransportClosed { transport_id } => {
            assert_eq!(transport_id, bad.transport_id);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // The failed transport is gone entirely.
    let err = manager
        .connect_transport(
            &session,
            &bad.transport_id,
            bad.dtls_parameters.clone(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    // The participant's other transport is unaffected.
    manager
        .connect_transport(&session, &good.transport_id, good.dtls_parameters.clone())
        .await
        .expect("other transport still connects");

    // Connecting an already-connected transport is an InvalidState error.
    let err = manager
        .connect_transport(&session, &good.transport_id, good.dtls_parameters.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_force_closing_a_room_notifies_participants() {
    let manager = manager_with_workers(1);
    let room_id = RoomId::from("R1");

    let (viewer, mut events) = manager.connect(claims("v1", "R1", Capability::Subscribe));
    manager
        .join_room(&viewer, room_id.clone())
        .await
        .expect("join");

    manager.close_room(&room_id).await.expect("close room");
    assert_eq!(manager.room_count(), 0);

    match recv_event(&mut events).await {
        SessionEvent::RoomClosed { room_id: closed } => assert_eq!(closed, room_id),
        other => panic!("unexpected event: {other:?}"),
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn test_prewarm_creates_the_room_ahead_of_first_join() {
    let manager = manager_with_workers(1);
    let room_id = RoomId::from("R-prewarmed");

    let caps = manager.prewarm(room_id.clone()).await.expect("prewarm");
    assert_eq!(manager.room_count(), 1);

    let (viewer, _events) = manager.connect(claims("v1", "R-prewarmed", Capability::Subscribe));
    let join = manager
        .join_room(&viewer, room_id)
        .await
        .expect("join prewarmed room");
    assert_eq!(join.capabilities, caps);
    assert_eq!(manager.room_count(), 1);

    manager.shutdown().await;
}
