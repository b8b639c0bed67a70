//! In-process Room Controller for integration tests.
//!
//! `TestRoomService` wires the in-memory engine, the worker pool, the room
//! registry and the signaling dispatcher exactly like the binary does,
//! minus the sockets. `TestPeer` plays a connected client: it sends typed
//! requests and receives the notifications its session pushes.

use common::{PeerId, RoomId};
use room_controller::actors::{
    ActorMetrics, Consumed, Joined, RoomRegistryHandle, RoomState, ServerNotification,
    SessionReply, SessionRequest, SessionSnapshot, TransportCreated,
};
use room_controller::errors::RoomError;
use room_controller::media::types::{
    default_media_codecs, MediaKind, ProducerId, RtpCapabilities, TransportDirection,
    TransportId, TransportOptions,
};
use room_controller::media::{EngineCall, InMemoryEngine, WorkerPool};
use room_controller::signaling::SignalingDispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::fixtures;

const NOTIFICATION_BUFFER: usize = 64;

/// Builder for [`TestRoomService`].
#[derive(Debug, Clone)]
pub struct TestRoomServiceBuilder {
    workers: usize,
    engine_timeout: Duration,
    max_peers_per_room: usize,
}

impl Default for TestRoomServiceBuilder {
    fn default() -> Self {
        Self {
            workers: 2,
            engine_timeout: Duration::from_secs(5),
            max_peers_per_room: 0,
        }
    }
}

impl TestRoomServiceBuilder {
    /// Number of engine workers to start.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Bound on every engine call.
    #[must_use]
    pub fn engine_timeout(mut self, timeout: Duration) -> Self {
        self.engine_timeout = timeout;
        self
    }

    /// Peer capacity per room (0 = unbounded).
    #[must_use]
    pub fn max_peers_per_room(mut self, max: usize) -> Self {
        self.max_peers_per_room = max;
        self
    }

    pub async fn build(self) -> TestRoomService {
        let engine = Arc::new(InMemoryEngine::new());
        let pool = Arc::new(
            WorkerPool::start(engine.clone(), self.workers)
                .await
                .expect("worker pool should start"),
        );
        let call = EngineCall::new(engine.clone(), self.engine_timeout);
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(
            "rc-test".to_string(),
            Arc::clone(&pool),
            call.clone(),
            self.max_peers_per_room,
            Arc::clone(&metrics),
        );
        let dispatcher = SignalingDispatcher::start(
            registry.clone(),
            call,
            Arc::clone(&pool),
            TransportOptions::default(),
            default_media_codecs(),
            metrics,
        );

        TestRoomService {
            engine,
            pool,
            registry,
            dispatcher,
        }
    }
}

/// A running Room Controller without network listeners.
pub struct TestRoomService {
    pub engine: Arc<InMemoryEngine>,
    pub pool: Arc<WorkerPool>,
    pub registry: RoomRegistryHandle,
    pub dispatcher: Arc<SignalingDispatcher>,
}

impl TestRoomService {
    #[must_use]
    pub fn builder() -> TestRoomServiceBuilder {
        TestRoomServiceBuilder::default()
    }

    /// Service with default settings (two workers, 5s engine timeout).
    pub async fn start() -> Self {
        Self::builder().build().await
    }

    /// Connect a new peer.
    pub fn connect(&self) -> TestPeer {
        self.try_connect().expect("connect should succeed")
    }

    /// Connect a new peer, returning the dispatcher's error.
    pub fn try_connect(&self) -> Result<TestPeer, RoomError> {
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let peer = self.dispatcher.connect(tx)?;
        Ok(TestPeer {
            peer_id: peer.peer_id,
            closed: peer.closed,
            notifications: rx,
            dispatcher: Arc::clone(&self.dispatcher),
        })
    }

    /// State of a registered room, `None` if the registry does not know it.
    pub async fn room_state(&self, room_id: &str) -> Option<RoomState> {
        let handle = self.registry.find(fixtures::room(room_id)).await.ok()?;
        handle.get_state().await.ok()
    }

    /// Wait until the registry no longer knows `room_id`.
    pub async fn wait_room_gone(&self, room_id: &str) {
        let room_id = fixtures::room(room_id);
        for _ in 0..100 {
            if self.registry.find(room_id.clone()).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("room {room_id} still registered");
    }
}

/// A connected client.
pub struct TestPeer {
    pub peer_id: PeerId,
    /// Fires when the session ends on its own.
    pub closed: CancellationToken,
    pub notifications: mpsc::Receiver<ServerNotification>,
    dispatcher: Arc<SignalingDispatcher>,
}

impl TestPeer {
    pub async fn request(&self, request: SessionRequest) -> Result<SessionReply, RoomError> {
        self.dispatcher.handle_request(&self.peer_id, request).await
    }

    pub async fn create_room(&self, room_id: &str) -> Result<RoomId, RoomError> {
        match self
            .request(SessionRequest::CreateRoom {
                room_id: fixtures::room(room_id),
            })
            .await?
        {
            SessionReply::RoomCreated(created) => Ok(created.room_id),
            other => panic!("unexpected reply to createRoom: {other:?}"),
        }
    }

    pub async fn join(&self, room_id: &str) -> Result<Joined, RoomError> {
        match self
            .request(SessionRequest::JoinRoom {
                room_id: fixtures::room(room_id),
            })
            .await?
        {
            SessionReply::Joined(joined) => Ok(joined),
            other => panic!("unexpected reply to joinRoom: {other:?}"),
        }
    }

    pub async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportCreated, RoomError> {
        match self
            .request(SessionRequest::CreateTransport { direction })
            .await?
        {
            SessionReply::TransportCreated(created) => Ok(created),
            other => panic!("unexpected reply to createTransport: {other:?}"),
        }
    }

    pub async fn connect_transport(&self, transport_id: TransportId) -> Result<(), RoomError> {
        self.request(SessionRequest::ConnectTransport {
            transport_id,
            dtls_parameters: fixtures::client_dtls_parameters(),
        })
        .await
        .map(|_| ())
    }

    /// Publish a VP8 stream on `transport_id`.
    pub async fn produce_video(&self, transport_id: TransportId) -> Result<ProducerId, RoomError> {
        match self
            .request(SessionRequest::Produce {
                transport_id,
                kind: MediaKind::Video,
                rtp_parameters: fixtures::vp8_parameters(1111),
            })
            .await?
        {
            SessionReply::Produced(produced) => Ok(produced.producer_id),
            other => panic!("unexpected reply to produce: {other:?}"),
        }
    }

    pub async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Consumed, RoomError> {
        match self
            .request(SessionRequest::Consume {
                rtp_capabilities,
                producer_id: Some(producer_id),
            })
            .await?
        {
            SessionReply::Consumed(consumed) => Ok(consumed),
            other => panic!("unexpected reply to consume: {other:?}"),
        }
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, RoomError> {
        self.dispatcher.session_snapshot(&self.peer_id).await
    }

    /// Run the disconnect path and return the final snapshot.
    pub async fn disconnect(&self) -> Option<SessionSnapshot> {
        self.dispatcher.disconnect(&self.peer_id).await
    }

    /// Next pushed notification, or `None` if none arrives within a second.
    pub async fn next_notification(&mut self) -> Option<ServerNotification> {
        tokio::time::timeout(Duration::from_secs(1), self.notifications.recv())
            .await
            .ok()
            .flatten()
    }
}
