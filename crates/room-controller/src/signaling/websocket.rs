//! WebSocket transport for the signaling protocol.
//!
//! One socket is one peer. Text frames carry JSON requests; responses and
//! notifications share the socket through a single writer task. Requests of
//! a socket are handled one at a time, in arrival order, on a task of their
//! own so the reader notices a closed socket while a request is running.

use super::dispatcher::SignalingDispatcher;
use super::protocol::{parse_request, RequestEnvelope, ServerMessage, SignalingResponse};

use crate::errors::RoomError;
use crate::observability::metrics::record_signaling_request;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Responses waiting for the writer.
const RESPONSE_BUFFER: usize = 32;

/// Frames waiting for the request task.
const INBOUND_BUFFER: usize = 32;

/// Notifications waiting for the writer.
const NOTIFICATION_BUFFER: usize = 128;

/// Create the signaling router serving `GET /ws`.
pub fn signaling_router(dispatcher: Arc<SignalingDispatcher>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(dispatcher)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(dispatcher): State<Arc<SignalingDispatcher>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, dispatcher))
}

async fn handle_socket(socket: WebSocket, dispatcher: Arc<SignalingDispatcher>) {
    let (sink, stream) = socket.split();
    serve_peer(sink, stream, dispatcher).await;
}

/// A frame from the reader, answered in arrival order.
enum Inbound {
    Request(RequestEnvelope),
    /// Rejected by the reader; the response is ready.
    Rejected(SignalingResponse),
}

/// Run one peer over a message sink and stream.
///
/// The reader keeps polling the stream while a request is in flight, so a
/// closed socket cancels the peer's pending engine calls right away.
async fn serve_peer<K, S, E>(mut sink: K, mut stream: S, dispatcher: Arc<SignalingDispatcher>)
where
    K: Sink<Message> + Unpin + Send + 'static,
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let (notify_tx, mut notify_rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let peer = match dispatcher.connect(notify_tx) {
        Ok(peer) => peer,
        Err(e) => {
            info!(target: "rc.signaling", error = %e, "Refusing signaling connection");
            let message = ServerMessage::Response(SignalingResponse::error(0, &e));
            write_message(&mut sink, &message).await;
            let _ = sink.close().await;
            return;
        }
    };
    let peer_id = peer.peer_id.clone();

    let (response_tx, mut response_rx) = mpsc::channel::<SignalingResponse>(RESPONSE_BUFFER);
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(INBOUND_BUFFER);

    // Ends once both channels are closed: the request task dropped its
    // sender and the session task dropped the notification sender.
    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(response) = response_rx.recv() => ServerMessage::Response(response),
                Some(notification) = notify_rx.recv() => ServerMessage::Notification(notification),
                else => break,
            };
            if !write_message(&mut sink, &message).await {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let requests = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        let peer_id = peer_id.clone();
        async move {
            while let Some(inbound) = inbound_rx.recv().await {
                let response = match inbound {
                    Inbound::Request(envelope) => dispatcher.handle(&peer_id, envelope).await,
                    Inbound::Rejected(response) => response,
                };
                if response_tx.send(response).await.is_err() {
                    break;
                }
            }
        }
    });

    loop {
        let frame = tokio::select! {
            () = peer.closed.cancelled() => {
                debug!(target: "rc.signaling", peer_id = %peer_id, "Session ended, closing socket");
                break;
            }
            frame = stream.next() => frame,
        };

        let inbound = match frame {
            Some(Ok(Message::Text(text))) => match parse_request(&text) {
                Ok(envelope) => Inbound::Request(envelope),
                Err(malformed) => {
                    record_signaling_request(
                        "malformed",
                        malformed.error.error_code().as_str(),
                        Duration::ZERO,
                    );
                    Inbound::Rejected(SignalingResponse::error(malformed.id, &malformed.error))
                }
            },
            Some(Ok(Message::Binary(_))) => Inbound::Rejected(SignalingResponse::error(
                0,
                &RoomError::InvalidRequest("binary frames are not supported".to_string()),
            )),
            Some(Ok(Message::Close(_))) | None => break,
            // Ping/pong are answered by the socket itself.
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Err(e)) => {
                debug!(target: "rc.signaling", peer_id = %peer_id, error = %e, "Socket error");
                break;
            }
        };

        if inbound_tx.send(inbound).await.is_err() {
            break;
        }
    }

    drop(inbound_tx);
    dispatcher.disconnect(&peer_id).await;
    if let Err(e) = requests.await {
        warn!(target: "rc.signaling", peer_id = %peer_id, error = ?e, "Socket request task failed");
    }
    if let Err(e) = writer.await {
        warn!(target: "rc.signaling", peer_id = %peer_id, error = ?e, "Socket writer task failed");
    }
}

/// Serialize and send one message. Returns false once the socket is gone.
async fn write_message<K>(sink: &mut K, message: &ServerMessage) -> bool
where
    K: Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!(target: "rc.signaling", error = %e, "Failed to serialize signaling message");
            return true;
        }
    };
    sink.send(Message::Text(text)).await.is_ok()
}
