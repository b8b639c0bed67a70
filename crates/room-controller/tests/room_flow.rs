//! End-to-end room flows through the signaling dispatcher.
//!
//! Covers:
//! - Create, join, produce and consume across two peers
//! - Teardown when a producer leaves and when the last peer leaves
//! - Joining a room that does not exist

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use rc_test_utils::{audio_only_capabilities, full_capabilities, TestRoomService};
use room_controller::actors::{ServerNotification, SessionState};
use room_controller::errors::{ErrorCode, RoomError};
use room_controller::media::types::{MediaKind, TransportDirection};
use room_controller::media::EngineHandle;

#[tokio::test]
async fn test_two_peers_publish_and_subscribe() {
    let service = TestRoomService::start().await;
    let alice = service.connect();
    let mut bob = service.connect();

    let room_id = alice.create_room("r1").await.unwrap();
    assert_eq!(room_id.as_str(), "r1");

    let alice_joined = alice.join("r1").await.unwrap();
    assert!(!alice_joined.router_rtp_capabilities.codecs.is_empty());
    let producer_id = alice
        .produce_video(alice_joined.transport.id.clone())
        .await
        .unwrap();

    bob.join("r1").await.unwrap();
    let consumed = bob
        .consume(producer_id.clone(), full_capabilities())
        .await
        .unwrap();
    assert_eq!(consumed.producer_id, producer_id);
    assert_eq!(consumed.kind, MediaKind::Video);
    // First consume creates the receive transport.
    let recv = consumed.transport.clone().expect("recv transport params");
    assert_eq!(recv.id, consumed.transport_id);

    let state = service.room_state("r1").await.unwrap();
    assert_eq!(state.peers.len(), 2);
    assert_eq!(state.producers.len(), 1);
    assert_eq!(state.producers.first().unwrap().owner, alice.peer_id);

    // Alice leaves: Bob's consumer goes with her producer.
    let final_alice = alice.disconnect().await.unwrap();
    assert_eq!(final_alice.state, SessionState::Disconnected);
    assert!(final_alice.holds_nothing());

    match bob.next_notification().await {
        Some(ServerNotification::ConsumerClosed {
            consumer_id,
            producer_id: closed,
        }) => {
            assert_eq!(consumer_id, consumed.consumer_id);
            assert_eq!(closed, producer_id);
        }
        other => panic!("expected consumerClosed, got {other:?}"),
    }

    let bob_snapshot = bob.snapshot().await.unwrap();
    assert!(!bob_snapshot.is_consuming());
    assert!(
        !service
            .engine
            .is_open(&EngineHandle::Consumer(consumed.consumer_id.clone()))
            .await
    );

    let state = service.room_state("r1").await.unwrap();
    assert_eq!(state.peers, vec![bob.peer_id.clone()]);
    assert!(state.producers.is_empty());

    // Last peer out closes the room and its router.
    bob.disconnect().await.unwrap();
    service.wait_room_gone("r1").await;

    let counts = service.engine.counts().await;
    assert_eq!(counts.routers, 0);
    assert_eq!(counts.transports, 0);
    assert_eq!(counts.producers, 0);
    assert_eq!(counts.consumers, 0);
    assert_eq!(counts.workers, 2);
}

#[tokio::test]
async fn test_consume_after_producer_left_is_producer_not_found() {
    let service = TestRoomService::start().await;
    let alice = service.connect();
    let bob = service.connect();
    let carol = service.connect();

    alice.create_room("r1").await.unwrap();
    let joined = alice.join("r1").await.unwrap();
    let producer_id = alice.produce_video(joined.transport.id).await.unwrap();
    bob.join("r1").await.unwrap();
    carol.join("r1").await.unwrap();

    alice.disconnect().await.unwrap();

    let err = carol
        .consume(producer_id, full_capabilities())
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::ProducerNotFound(_)), "{err:?}");
    assert_eq!(err.error_code(), ErrorCode::ProducerNotFound);

    // Room survives while Bob and Carol remain.
    let state = service.room_state("r1").await.unwrap();
    assert_eq!(state.peers.len(), 2);
    assert!(state.router_open);
}

#[tokio::test]
async fn test_audio_only_peer_cannot_consume_video() {
    let service = TestRoomService::start().await;
    let alice = service.connect();
    let bob = service.connect();

    alice.create_room("r1").await.unwrap();
    let joined = alice.join("r1").await.unwrap();
    let producer_id = alice.produce_video(joined.transport.id).await.unwrap();
    bob.join("r1").await.unwrap();

    let err = bob
        .consume(producer_id, audio_only_capabilities())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::IncompatibleCapabilities);

    // No receive transport is left behind by the failed consume.
    let snapshot = bob.snapshot().await.unwrap();
    assert_eq!(snapshot.transport_count, 1);
    assert!(!snapshot.is_consuming());
}

#[tokio::test]
async fn test_second_consume_reuses_recv_transport() {
    let service = TestRoomService::start().await;
    let alice = service.connect();
    let bob = service.connect();
    let carol = service.connect();

    alice.create_room("r1").await.unwrap();
    let a = alice.join("r1").await.unwrap();
    let b = bob.join("r1").await.unwrap();
    let alice_producer = alice.produce_video(a.transport.id).await.unwrap();
    let bob_producer = bob.produce_video(b.transport.id).await.unwrap();
    carol.join("r1").await.unwrap();

    let first = carol
        .consume(alice_producer, full_capabilities())
        .await
        .unwrap();
    let second = carol
        .consume(bob_producer, full_capabilities())
        .await
        .unwrap();

    assert!(first.transport.is_some());
    assert!(second.transport.is_none());
    assert_eq!(first.transport_id, second.transport_id);

    let snapshot = carol.snapshot().await.unwrap();
    assert_eq!(snapshot.consumer_ids.len(), 2);
    assert_eq!(snapshot.transport_count, 2);
}

#[tokio::test]
async fn test_explicit_recv_transport_can_be_connected() {
    let service = TestRoomService::start().await;
    let alice = service.connect();

    alice.create_room("r1").await.unwrap();
    alice.join("r1").await.unwrap();

    let created = alice
        .create_transport(TransportDirection::Recv)
        .await
        .unwrap();
    assert_eq!(created.direction, TransportDirection::Recv);
    alice
        .connect_transport(created.transport.id.clone())
        .await
        .unwrap();

    // A recv transport cannot carry the peer's outbound stream.
    let err = alice.produce_video(created.transport.id).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::NoSendTransport);
}

#[tokio::test]
async fn test_join_nonexistent_room_has_no_side_effects() {
    let service = TestRoomService::start().await;
    let alice = service.connect();

    let err = alice.join("nonexistent").await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::NotFound);

    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Connected);
    assert!(snapshot.room_id.is_none());
    assert!(snapshot.holds_nothing());

    assert!(service.room_state("nonexistent").await.is_none());
    let counts = service.engine.counts().await;
    assert_eq!(counts.routers, 0);
    assert_eq!(counts.transports, 0);

    // The peer can still go on to create and join a room.
    alice.create_room("r1").await.unwrap();
    alice.join("r1").await.unwrap();
}

#[tokio::test]
async fn test_create_room_does_not_join() {
    let service = TestRoomService::start().await;
    let alice = service.connect();

    alice.create_room("r1").await.unwrap();

    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Connected);
    let state = service.room_state("r1").await.unwrap();
    assert!(state.peers.is_empty());

    let err = alice.create_room("r1").await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::AlreadyExists);
}

#[tokio::test]
async fn test_room_capacity_is_enforced() {
    let service = TestRoomService::builder()
        .max_peers_per_room(1)
        .build()
        .await;
    let alice = service.connect();
    let bob = service.connect();

    alice.create_room("r1").await.unwrap();
    alice.join("r1").await.unwrap();

    let err = bob.join("r1").await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::RoomFull);
    // The send transport created for the failed join is released.
    let snapshot = bob.snapshot().await.unwrap();
    assert!(snapshot.holds_nothing());
    assert_eq!(service.engine.counts().await.transports, 1);
}
