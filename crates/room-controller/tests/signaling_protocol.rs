//! JSON request/response round trips through the dispatcher.
//!
//! Drives the same path the WebSocket reader uses: parse a text frame,
//! dispatch it, serialize the response.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use rc_test_utils::TestRoomService;
use room_controller::signaling::{parse_request, ServerMessage, SignalingResponse};
use serde_json::{json, Value};

async fn send(service: &TestRoomService, peer: &common::PeerId, frame: Value) -> Value {
    let response = match parse_request(&frame.to_string()) {
        Ok(envelope) => service.dispatcher.handle(peer, envelope).await,
        Err(malformed) => SignalingResponse::error(malformed.id, &malformed.error),
    };
    serde_json::to_value(ServerMessage::Response(response)).unwrap()
}

#[tokio::test]
async fn test_publish_subscribe_over_json() {
    let service = TestRoomService::start().await;
    let alice = service.connect();
    let bob = service.connect();

    let created = send(
        &service,
        &alice.peer_id,
        json!({"id": 1, "method": "createRoom", "roomId": "r1"}),
    )
    .await;
    assert_eq!(created["response"], true);
    assert_eq!(created["id"], 1);
    assert_eq!(created["ok"], true);
    assert_eq!(created["data"]["roomId"], "r1");

    let joined = send(
        &service,
        &alice.peer_id,
        json!({"id": 2, "method": "joinRoom", "roomId": "r1"}),
    )
    .await;
    assert_eq!(joined["ok"], true);
    let codecs = joined["data"]["routerRtpCapabilities"]["codecs"]
        .as_array()
        .unwrap();
    assert!(!codecs.is_empty());
    let transport_id = joined["data"]["transport"]["id"].as_str().unwrap().to_string();
    assert!(joined["data"]["transport"]["iceParameters"]["usernameFragment"].is_string());

    let connected = send(
        &service,
        &alice.peer_id,
        json!({
            "id": 3,
            "method": "connectTransport",
            "transportId": transport_id,
            "dtlsParameters": {
                "role": "client",
                "fingerprints": [{"algorithm": "sha-256", "value": "AB:CD"}]
            }
        }),
    )
    .await;
    assert_eq!(connected["ok"], true);

    let produced = send(
        &service,
        &alice.peer_id,
        json!({
            "id": 4,
            "method": "produce",
            "transportId": transport_id,
            "kind": "video",
            "rtpParameters": {
                "codecs": [{"mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000}],
                "encodings": [{"ssrc": 2222}]
            }
        }),
    )
    .await;
    assert_eq!(produced["ok"], true);
    let producer_id = produced["data"]["producerId"].as_str().unwrap().to_string();

    send(
        &service,
        &bob.peer_id,
        json!({"id": 1, "method": "joinRoom", "roomId": "r1"}),
    )
    .await;
    let consumed = send(
        &service,
        &bob.peer_id,
        json!({
            "id": 2,
            "method": "consume",
            "producerId": producer_id,
            "rtpCapabilities": {"codecs": codecs}
        }),
    )
    .await;
    assert_eq!(consumed["ok"], true, "{consumed}");
    assert_eq!(consumed["data"]["producerId"], producer_id.as_str());
    assert_eq!(consumed["data"]["kind"], "video");
    assert!(consumed["data"]["consumerId"].is_string());
    assert!(consumed["data"]["transport"]["id"].is_string());
}

#[tokio::test]
async fn test_error_responses_carry_codes() {
    let service = TestRoomService::start().await;
    let alice = service.connect();

    let missing = send(
        &service,
        &alice.peer_id,
        json!({"id": 7, "method": "joinRoom", "roomId": "nonexistent"}),
    )
    .await;
    assert_eq!(missing["response"], true);
    assert_eq!(missing["id"], 7);
    assert_eq!(missing["ok"], false);
    assert_eq!(missing["error"]["code"], "NotFound");
    assert!(missing["error"]["message"].is_string());
    assert!(missing.get("data").is_none());

    let not_joined = send(
        &service,
        &alice.peer_id,
        json!({"id": 8, "method": "createTransport", "direction": "recv"}),
    )
    .await;
    assert_eq!(not_joined["error"]["code"], "InvalidState");

    let unknown = send(
        &service,
        &alice.peer_id,
        json!({"id": 9, "method": "teleport"}),
    )
    .await;
    assert_eq!(unknown["id"], 9);
    assert_eq!(unknown["error"]["code"], "InvalidRequest");

    let missing_field = send(
        &service,
        &alice.peer_id,
        json!({"id": 10, "method": "joinRoom"}),
    )
    .await;
    assert_eq!(missing_field["id"], 10);
    assert_eq!(missing_field["error"]["code"], "InvalidRequest");

    let no_producer = send(
        &service,
        &alice.peer_id,
        json!({"id": 11, "method": "consume", "rtpCapabilities": {"codecs": []}}),
    )
    .await;
    assert_eq!(no_producer["ok"], false);
}

#[tokio::test]
async fn test_garbage_frame_gets_id_zero() {
    let malformed = parse_request("not json").unwrap_err();
    assert_eq!(malformed.id, 0);
    let value =
        serde_json::to_value(ServerMessage::Response(SignalingResponse::error(
            malformed.id,
            &malformed.error,
        )))
        .unwrap();
    assert_eq!(value["id"], 0);
    assert_eq!(value["error"]["code"], "InvalidRequest");
}
