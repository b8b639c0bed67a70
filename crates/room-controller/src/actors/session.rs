//! `PeerSession` - per-connection actor that owns a peer's engine resources.
//!
//! Each `PeerSession`:
//! - Is 1:1 with a signaling connection
//! - Processes client requests in arrival order on its own mailbox
//! - Owns every transport, producer and consumer it created; nothing else
//!   closes them except engine-side cascades
//! - Pushes server notifications to the connection's outbound channel
//!
//! # Lifecycle
//!
//! `Connected` -> `Joining` -> `Joined` -> `Disconnected`. A failed join
//! returns to `Connected`. Cancelling the session token (client disconnect,
//! room closure, process shutdown) runs the cleanup path exactly once:
//! consumers, then the producer, then transports are closed, the peer leaves
//! its room, and an emptied room is handed back to the registry.

use crate::errors::RoomError;
use crate::media::types::{
    ConsumerId, DtlsParameters, DtlsState, MediaKind, ProducerId, RtpCapabilities,
    RtpCodecCapability, RtpParameters, TransportDirection, TransportId, TransportOptions,
};
use crate::media::{
    ConsumerHandle, EngineCall, EngineEvent, EngineHandle, ProducerHandle, RouterHandle,
    TransportHandle,
};
use crate::observability::metrics::record_message_dropped;

use super::messages::{
    Ack, Consumed, Joined, Produced, RoomCloseReason, RoomCreated, ServerNotification,
    SessionMessage, SessionReply, SessionRequest, SessionSnapshot, SessionState,
    TransportCreated,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::registry::RoomRegistryHandle;
use super::room::RoomHandle;

use common::{PeerId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 200;

/// Handle to a `PeerSession`.
#[derive(Clone, Debug)]
pub struct PeerSessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    peer_id: PeerId,
}

impl PeerSessionHandle {
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Run a client request on the session.
    ///
    /// # Errors
    ///
    /// The request's own error, or `SessionClosed` if the session ended
    /// before answering.
    pub async fn request(&self, request: SessionRequest) -> Result<SessionReply, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::Request {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| RoomError::SessionClosed)?;

        rx.await.map_err(|_| RoomError::SessionClosed)?
    }

    /// Get a point-in-time view of the session.
    ///
    /// # Errors
    ///
    /// `SessionClosed` if the actor has stopped.
    pub async fn get_snapshot(&self) -> Result<SessionSnapshot, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::GetSnapshot { respond_to: tx })
            .await
            .map_err(|_| RoomError::SessionClosed)?;

        rx.await.map_err(|_| RoomError::SessionClosed)
    }

    /// Tell the session a producer in its room went away.
    ///
    /// Never blocks; called from the room actor.
    ///
    /// # Errors
    ///
    /// `SessionClosed` if the session is gone, `Internal` if its mailbox is full.
    pub fn notify_producer_closed(&self, producer_id: ProducerId) -> Result<(), RoomError> {
        self.try_send(SessionMessage::ProducerClosed { producer_id })
    }

    /// Tell the session its room was closed underneath it.
    ///
    /// # Errors
    ///
    /// `SessionClosed` if the session is gone, `Internal` if its mailbox is full.
    pub fn notify_room_closed(
        &self,
        room_id: RoomId,
        reason: RoomCloseReason,
    ) -> Result<(), RoomError> {
        self.try_send(SessionMessage::RoomClosed { room_id, reason })
    }

    /// Cancel the session; it cleans up and stops.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    fn try_send(&self, message: SessionMessage) -> Result<(), RoomError> {
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                record_message_dropped(ActorType::Session.as_str());
                RoomError::Internal(format!("session {} mailbox full", self.peer_id))
            }
            mpsc::error::TrySendError::Closed(_) => RoomError::SessionClosed,
        })
    }

    /// Handle backed by a bare channel instead of an actor.
    #[cfg(test)]
    pub(crate) fn detached(peer_id: PeerId) -> (Self, mpsc::Receiver<SessionMessage>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        (
            Self {
                sender,
                cancel_token: CancellationToken::new(),
                peer_id,
            },
            receiver,
        )
    }
}

/// Collaborators a session needs; shared by every session of the process.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: RoomRegistryHandle,
    pub engine: EngineCall,
    pub transport_options: TransportOptions,
    pub media_codecs: Arc<[RtpCodecCapability]>,
    pub metrics: Arc<ActorMetrics>,
}

struct OwnedTransport {
    handle: TransportHandle,
    direction: TransportDirection,
}

/// The `PeerSession` implementation.
pub struct PeerSession {
    peer_id: PeerId,
    receiver: mpsc::Receiver<SessionMessage>,
    cancel_token: CancellationToken,
    /// Own handle, given to the room on join.
    handle: PeerSessionHandle,
    ctx: SessionContext,
    notifications: mpsc::Sender<ServerNotification>,
    events: broadcast::Receiver<EngineEvent>,
    events_open: bool,
    state: SessionState,
    room: Option<RoomHandle>,
    /// Room was closed by its owner; leaving it is not our job.
    room_closed: bool,
    transports: HashMap<TransportId, OwnedTransport>,
    producer: Option<ProducerHandle>,
    consumers: HashMap<ConsumerId, ConsumerHandle>,
    mailbox: MailboxMonitor,
}

impl PeerSession {
    /// Spawn a session for a freshly connected peer.
    ///
    /// Server notifications are pushed to `notifications`. The join handle
    /// resolves to the final snapshot after cleanup.
    pub fn spawn(
        peer_id: PeerId,
        ctx: SessionContext,
        notifications: mpsc::Sender<ServerNotification>,
        cancel_token: CancellationToken,
    ) -> (PeerSessionHandle, JoinHandle<SessionSnapshot>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);

        let handle = PeerSessionHandle {
            sender,
            cancel_token: cancel_token.clone(),
            peer_id: peer_id.clone(),
        };

        // Subscribe before the task starts so no event is missed.
        let events = ctx.engine.engine().subscribe();
        ctx.metrics.session_created();

        let actor = Self {
            peer_id: peer_id.clone(),
            receiver,
            cancel_token,
            handle: handle.clone(),
            notifications,
            events,
            events_open: true,
            state: SessionState::Connected,
            room: None,
            room_closed: false,
            transports: HashMap::new(),
            producer: None,
            consumers: HashMap::new(),
            mailbox: MailboxMonitor::new(ActorType::Session, peer_id.as_str()),
            ctx,
        };

        let task_handle = tokio::spawn(actor.run());

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "rc.actor.session", fields(peer_id = %self.peer_id))]
    async fn run(mut self) -> SessionSnapshot {
        debug!(
            target: "rc.actor.session",
            peer_id = %self.peer_id,
            "PeerSession started"
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "rc.actor.session",
                        peer_id = %self.peer_id,
                        "PeerSession received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.ctx.metrics.record_message_processed();
                        }
                        None => break,
                    }
                }

                event = self.events.recv(), if self.events_open => {
                    match event {
                        Ok(event) => self.handle_engine_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                target: "rc.actor.session",
                                peer_id = %self.peer_id,
                                skipped,
                                "Engine event stream lagged"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.events_open = false;
                        }
                    }
                }
            }
        }

        self.cleanup().await;

        let snapshot = self.snapshot();
        info!(
            target: "rc.actor.session",
            peer_id = %self.peer_id,
            messages_processed = self.mailbox.messages_processed(),
            "PeerSession stopped"
        );
        snapshot
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Request {
                request,
                respond_to,
            } => {
                let method = request.method();
                let result = self.handle_request(request).await;
                if let Err(e) = &result {
                    debug!(
                        target: "rc.actor.session",
                        peer_id = %self.peer_id,
                        method,
                        error = %e,
                        "Request failed"
                    );
                }
                let _ = respond_to.send(result);
            }

            SessionMessage::ProducerClosed { producer_id } => {
                self.on_producer_closed(&producer_id).await;
            }

            SessionMessage::RoomClosed { room_id, reason } => {
                let is_current = self
                    .room
                    .as_ref()
                    .is_some_and(|room| room.room_id() == &room_id);
                if is_current {
                    info!(
                        target: "rc.actor.session",
                        peer_id = %self.peer_id,
                        room_id = %room_id,
                        reason = ?reason,
                        "Room closed, disconnecting peer"
                    );
                    self.room_closed = true;
                    self.notify(ServerNotification::RoomClosed { room_id, reason });
                    self.cancel_token.cancel();
                }
            }

            SessionMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    async fn handle_request(&mut self, request: SessionRequest) -> Result<SessionReply, RoomError> {
        match request {
            SessionRequest::CreateRoom { room_id } => {
                self.ctx
                    .registry
                    .create_room(room_id.clone(), self.ctx.media_codecs.to_vec())
                    .await?;
                Ok(SessionReply::RoomCreated(RoomCreated { room_id }))
            }
            SessionRequest::JoinRoom { room_id } => self.join(room_id).await,
            SessionRequest::CreateTransport { direction } => {
                let room = self.joined_room()?;
                let router = room.router().clone();
                let transport = self.create_transport(&router, direction).await?;
                Ok(SessionReply::TransportCreated(TransportCreated {
                    direction,
                    transport: transport.params,
                }))
            }
            SessionRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => self.connect_transport(transport_id, dtls_parameters).await,
            SessionRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => self.produce(transport_id, kind, rtp_parameters).await,
            SessionRequest::Consume {
                rtp_capabilities,
                producer_id,
            } => self.consume(rtp_capabilities, producer_id).await,
        }
    }

    async fn join(&mut self, room_id: RoomId) -> Result<SessionReply, RoomError> {
        match self.state {
            SessionState::Connected => {}
            SessionState::Joining | SessionState::Joined | SessionState::Disconnected => {
                return Err(RoomError::InvalidState(format!(
                    "cannot join while {:?}",
                    self.state
                )));
            }
        }

        self.state = SessionState::Joining;
        match self.try_join(room_id).await {
            Ok(reply) => {
                self.state = SessionState::Joined;
                Ok(reply)
            }
            Err(e) => {
                self.state = SessionState::Connected;
                Err(e)
            }
        }
    }

    /// Find the room, create the send transport, then get admitted.
    ///
    /// Admission is last so a failed join never leaves a trace in the room.
    async fn try_join(&mut self, room_id: RoomId) -> Result<SessionReply, RoomError> {
        let room = self.ctx.registry.find(room_id.clone()).await?;
        let router = room.router().clone();

        let transport = self.spawn_transport(&router).await?;

        if let Err(e) = room.add_peer(self.peer_id.clone(), self.handle.clone()).await {
            self.ctx
                .engine
                .close(EngineHandle::Transport(transport.id.clone()))
                .await;
            return Err(e);
        }

        info!(
            target: "rc.actor.session",
            peer_id = %self.peer_id,
            room_id = %room_id,
            transport_id = %transport.id,
            "Peer joined"
        );

        let params = transport.params.clone();
        self.transports.insert(
            transport.id.clone(),
            OwnedTransport {
                handle: transport,
                direction: TransportDirection::Send,
            },
        );
        self.room = Some(room);

        Ok(SessionReply::Joined(Joined {
            router_rtp_capabilities: router.rtp_capabilities,
            transport: params,
        }))
    }

    /// Create and track a transport on the room's router.
    async fn create_transport(
        &mut self,
        router: &RouterHandle,
        direction: TransportDirection,
    ) -> Result<TransportHandle, RoomError> {
        let transport = self.spawn_transport(router).await?;

        debug!(
            target: "rc.actor.session",
            peer_id = %self.peer_id,
            transport_id = %transport.id,
            direction = %direction,
            "Transport created"
        );

        self.transports.insert(
            transport.id.clone(),
            OwnedTransport {
                handle: transport.clone(),
                direction,
            },
        );
        Ok(transport)
    }

    /// Create an untracked transport; the caller decides whether to keep it.
    async fn spawn_transport(&self, router: &RouterHandle) -> Result<TransportHandle, RoomError> {
        let router_id = router.id.clone();
        let options = self.ctx.transport_options.clone();
        self.ctx
            .engine
            .run("create_transport", &self.cancel_token, move |e| async move {
                e.create_transport(&router_id, &options).await
            })
            .await
    }

    async fn connect_transport(
        &mut self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<SessionReply, RoomError> {
        self.joined_room()?;
        if !self.transports.contains_key(&transport_id) {
            return Err(RoomError::TransportNotFound(transport_id.to_string()));
        }

        self.ctx
            .engine
            .run("connect_transport", &self.cancel_token, move |e| async move {
                e.connect_transport(&transport_id, &dtls_parameters).await
            })
            .await?;

        Ok(SessionReply::TransportConnected(Ack {}))
    }

    async fn produce(
        &mut self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<SessionReply, RoomError> {
        let room = self.joined_room()?.clone();

        let is_send = self
            .transports
            .get(&transport_id)
            .is_some_and(|t| t.direction == TransportDirection::Send);
        if !is_send {
            return Err(RoomError::NoSendTransport(transport_id.to_string()));
        }
        if self.producer.is_some() {
            return Err(RoomError::AlreadyProducing);
        }

        let producer = self
            .ctx
            .engine
            .run("produce", &self.cancel_token, move |e| async move {
                e.produce(&transport_id, kind, &rtp_parameters).await
            })
            .await?;

        if let Err(e) = room
            .register_producer(self.peer_id.clone(), producer.id.clone(), producer.kind)
            .await
        {
            self.ctx
                .engine
                .close(EngineHandle::Producer(producer.id.clone()))
                .await;
            return Err(e);
        }

        info!(
            target: "rc.actor.session",
            peer_id = %self.peer_id,
            room_id = %room.room_id(),
            producer_id = %producer.id,
            kind = %producer.kind,
            "Peer producing"
        );

        let producer_id = producer.id.clone();
        self.producer = Some(producer);
        Ok(SessionReply::Produced(Produced { producer_id }))
    }

    async fn consume(
        &mut self,
        rtp_capabilities: RtpCapabilities,
        producer_id: Option<ProducerId>,
    ) -> Result<SessionReply, RoomError> {
        let room = self.joined_room()?.clone();
        let producer_id = producer_id
            .ok_or_else(|| RoomError::InvalidRequest("producerId is required".to_string()))?;

        let producer = room.find_producer(producer_id.clone()).await?;
        let router = room.router().clone();

        let router_id = router.id.clone();
        let target = producer_id.clone();
        let caps = rtp_capabilities.clone();
        let compatible = self
            .ctx
            .engine
            .run("can_consume", &self.cancel_token, move |e| async move {
                Ok(e.can_consume(&router_id, &target, &caps).await)
            })
            .await?;
        if !compatible {
            // The engine also answers false for a producer closed since the lookup.
            room.find_producer(producer_id.clone()).await?;
            return Err(RoomError::IncompatibleCapabilities(producer_id));
        }

        let existing = self
            .transports
            .values()
            .find(|t| t.direction == TransportDirection::Recv)
            .map(|t| t.handle.clone());
        let (transport, created) = match existing {
            Some(transport) => (transport, false),
            None => (
                self.create_transport(&router, TransportDirection::Recv)
                    .await?,
                true,
            ),
        };

        let transport_id = transport.id.clone();
        let target = producer_id.clone();
        let consumed = self
            .ctx
            .engine
            .run("consume", &self.cancel_token, move |e| async move {
                e.consume(&transport_id, &target, &rtp_capabilities).await
            })
            .await;

        let consumer = match consumed {
            Ok(consumer) => consumer,
            Err(e) => {
                if created {
                    self.transports.remove(&transport.id);
                    self.ctx
                        .engine
                        .close(EngineHandle::Transport(transport.id.clone()))
                        .await;
                }
                return Err(e);
            }
        };

        debug!(
            target: "rc.actor.session",
            peer_id = %self.peer_id,
            consumer_id = %consumer.id,
            producer_id = %producer.producer_id,
            producer_owner = %producer.owner,
            "Peer consuming"
        );

        let reply = Consumed {
            consumer_id: consumer.id.clone(),
            producer_id: consumer.producer_id.clone(),
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters.clone(),
            transport_id: consumer.transport_id.clone(),
            transport: created.then_some(transport.params),
        };
        self.consumers.insert(consumer.id.clone(), consumer);
        Ok(SessionReply::Consumed(reply))
    }

    /// Close every consumer bound to a producer that went away.
    async fn on_producer_closed(&mut self, producer_id: &ProducerId) {
        let bound: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| &c.producer_id == producer_id)
            .map(|c| c.id.clone())
            .collect();

        for consumer_id in bound {
            self.consumers.remove(&consumer_id);
            self.ctx
                .engine
                .close(EngineHandle::Consumer(consumer_id.clone()))
                .await;
            self.notify(ServerNotification::ConsumerClosed {
                consumer_id,
                producer_id: producer_id.clone(),
            });
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::TransportStateChanged {
                transport_id,
                state,
            } => {
                if state.is_terminal() && self.transports.contains_key(&transport_id) {
                    self.on_transport_terminated(transport_id, state).await;
                }
            }
            // Handled by the dispatcher; hosted rooms are force-closed.
            EngineEvent::WorkerDied { .. } => {}
        }
    }

    /// Close a transport whose DTLS session ended, and everything on it.
    async fn on_transport_terminated(&mut self, transport_id: TransportId, state: DtlsState) {
        info!(
            target: "rc.actor.session",
            peer_id = %self.peer_id,
            transport_id = %transport_id,
            state = ?state,
            "Transport DTLS terminated, closing"
        );

        let on_transport: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| c.transport_id == transport_id)
            .map(|c| c.id.clone())
            .collect();
        for consumer_id in on_transport {
            self.consumers.remove(&consumer_id);
            self.ctx
                .engine
                .close(EngineHandle::Consumer(consumer_id))
                .await;
        }

        if self
            .producer
            .as_ref()
            .is_some_and(|p| p.transport_id == transport_id)
        {
            if let Some(producer) = self.producer.take() {
                if let Some(room) = &self.room {
                    room.unregister_producer(producer.id.clone()).await;
                }
                self.ctx
                    .engine
                    .close(EngineHandle::Producer(producer.id))
                    .await;
            }
        }

        self.transports.remove(&transport_id);
        self.ctx
            .engine
            .close(EngineHandle::Transport(transport_id.clone()))
            .await;

        self.notify(ServerNotification::TransportClosed { transport_id });
    }

    /// Release everything the peer owns and leave the room.
    async fn cleanup(&mut self) {
        for (consumer_id, _) in self.consumers.drain() {
            self.ctx
                .engine
                .close(EngineHandle::Consumer(consumer_id))
                .await;
        }

        if let Some(producer) = self.producer.take() {
            // Unindexed first so a racing consume sees ProducerNotFound.
            if let Some(room) = self.room.as_ref().filter(|_| !self.room_closed) {
                room.unregister_producer(producer.id.clone()).await;
            }
            self.ctx
                .engine
                .close(EngineHandle::Producer(producer.id))
                .await;
        }

        for (transport_id, _) in self.transports.drain() {
            self.ctx
                .engine
                .close(EngineHandle::Transport(transport_id))
                .await;
        }

        if let Some(room) = self.room.take() {
            if !self.room_closed {
                let is_empty = room.remove_peer(self.peer_id.clone()).await;
                if is_empty {
                    let removal = self
                        .ctx
                        .registry
                        .remove_if_empty(room.room_id().clone(), room.router().id.clone())
                        .await;
                    match removal {
                        Ok(removed) => {
                            debug!(
                                target: "rc.actor.session",
                                peer_id = %self.peer_id,
                                room_id = %room.room_id(),
                                removed,
                                "Last peer left room"
                            );
                        }
                        Err(e) => {
                            warn!(
                                target: "rc.actor.session",
                                peer_id = %self.peer_id,
                                room_id = %room.room_id(),
                                error = %e,
                                "Failed to remove empty room"
                            );
                        }
                    }
                }
            }
        }

        if self.state != SessionState::Disconnected {
            self.state = SessionState::Disconnected;
            self.ctx.metrics.session_closed();
        }

        info!(
            target: "rc.actor.session",
            peer_id = %self.peer_id,
            "Peer disconnected"
        );
    }

    fn joined_room(&self) -> Result<&RoomHandle, RoomError> {
        match (&self.state, &self.room) {
            (SessionState::Joined, Some(room)) => Ok(room),
            _ => Err(RoomError::InvalidState("peer has not joined a room".to_string())),
        }
    }

    fn notify(&self, notification: ServerNotification) {
        if let Err(e) = self.notifications.try_send(notification) {
            record_message_dropped(ActorType::Session.as_str());
            warn!(
                target: "rc.actor.session",
                peer_id = %self.peer_id,
                error = %e,
                "Dropped notification for client"
            );
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let mut consumer_ids: Vec<ConsumerId> = self.consumers.keys().cloned().collect();
        consumer_ids.sort();
        SessionSnapshot {
            peer_id: self.peer_id.clone(),
            state: self.state,
            room_id: self.room.as_ref().map(|r| r.room_id().clone()),
            transport_count: self.transports.len(),
            producer_id: self.producer.as_ref().map(|p| p.id.clone()),
            consumer_ids,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::media::types::{
        default_media_codecs, DtlsFingerprint, RtpCodecParameters, RtpEncodingParameters,
    };
    use crate::media::{EngineOperation, Fault, InMemoryEngine, WorkerPool};
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Harness {
        engine: Arc<InMemoryEngine>,
        ctx: SessionContext,
    }

    impl Harness {
        async fn new() -> Self {
            let engine = Arc::new(InMemoryEngine::new());
            let pool = Arc::new(WorkerPool::start(engine.clone(), 1).await.unwrap());
            let call = EngineCall::new(engine.clone(), Duration::from_secs(5));
            let metrics = ActorMetrics::new();
            let registry = RoomRegistryHandle::new(
                "rc-test".to_string(),
                pool,
                call.clone(),
                0,
                Arc::clone(&metrics),
            );
            Self {
                engine,
                ctx: SessionContext {
                    registry,
                    engine: call,
                    transport_options: TransportOptions::default(),
                    media_codecs: default_media_codecs().into(),
                    metrics,
                },
            }
        }

        fn connect(
            &self,
            name: &str,
        ) -> (
            PeerSessionHandle,
            JoinHandle<SessionSnapshot>,
            mpsc::Receiver<ServerNotification>,
        ) {
            let (tx, rx) = mpsc::channel(16);
            let (handle, task) = PeerSession::spawn(
                PeerId::from(name),
                self.ctx.clone(),
                tx,
                CancellationToken::new(),
            );
            (handle, task, rx)
        }
    }

    fn room(id: &str) -> RoomId {
        RoomId::parse(id).unwrap()
    }

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 101,
                clock_rate: 90_000,
                channels: None,
                parameters: BTreeMap::new(),
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1111),
                rid: None,
            }],
        }
    }

    fn full_capabilities() -> RtpCapabilities {
        RtpCapabilities {
            codecs: default_media_codecs(),
            header_extensions: vec![],
        }
    }

    async fn join(handle: &PeerSessionHandle, room_id: &str) -> Joined {
        match handle
            .request(SessionRequest::JoinRoom {
                room_id: room(room_id),
            })
            .await
            .unwrap()
        {
            SessionReply::Joined(joined) => joined,
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    async fn produce_video(handle: &PeerSessionHandle, transport_id: TransportId) -> ProducerId {
        match handle
            .request(SessionRequest::Produce {
                transport_id,
                kind: MediaKind::Video,
                rtp_parameters: vp8_parameters(),
            })
            .await
            .unwrap()
        {
            SessionReply::Produced(p) => p.producer_id,
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_missing_room_leaves_session_connected() {
        let h = Harness::new().await;
        let (a, _task, _rx) = h.connect("a");

        let err = a
            .request(SessionRequest::JoinRoom {
                room_id: room("nonexistent"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::RoomNotFound(_)));

        let snapshot = a.get_snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Connected);
        assert!(snapshot.holds_nothing());
        assert_eq!(h.engine.counts().await.transports, 0);
    }

    #[tokio::test]
    async fn test_join_twice_is_invalid_state() {
        let h = Harness::new().await;
        h.ctx
            .registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        let (a, _task, _rx) = h.connect("a");

        join(&a, "r1").await;
        let err = a
            .request(SessionRequest::JoinRoom { room_id: room("r1") })
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_requests_before_join_are_invalid_state() {
        let h = Harness::new().await;
        let (a, _task, _rx) = h.connect("a");

        let err = a
            .request(SessionRequest::CreateTransport {
                direction: TransportDirection::Recv,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_produce_rules() {
        let h = Harness::new().await;
        h.ctx
            .registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        let (a, _task, _rx) = h.connect("a");
        let joined = join(&a, "r1").await;

        let recv = match a
            .request(SessionRequest::CreateTransport {
                direction: TransportDirection::Recv,
            })
            .await
            .unwrap()
        {
            SessionReply::TransportCreated(t) => t.transport.id,
            other => panic!("unexpected reply: {other:?}"),
        };
        let err = a
            .request(SessionRequest::Produce {
                transport_id: recv,
                kind: MediaKind::Video,
                rtp_parameters: vp8_parameters(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::NoSendTransport(_)));

        produce_video(&a, joined.transport.id.clone()).await;
        let err = a
            .request(SessionRequest::Produce {
                transport_id: joined.transport.id,
                kind: MediaKind::Video,
                rtp_parameters: vp8_parameters(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::AlreadyProducing));
        assert_eq!(h.engine.counts().await.producers, 1);
    }

    #[tokio::test]
    async fn test_connect_unknown_transport() {
        let h = Harness::new().await;
        h.ctx
            .registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        let (a, _task, _rx) = h.connect("a");
        join(&a, "r1").await;

        let err = a
            .request(SessionRequest::ConnectTransport {
                transport_id: TransportId::from("nope"),
                dtls_parameters: DtlsParameters {
                    role: None,
                    fingerprints: vec![DtlsFingerprint {
                        algorithm: "sha-256".to_string(),
                        value: "AA:BB".to_string(),
                    }],
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::TransportNotFound(_)));
    }

    #[tokio::test]
    async fn test_consume_creates_recv_transport_on_demand() {
        let h = Harness::new().await;
        h.ctx
            .registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        let (a, _a_task, _a_rx) = h.connect("a");
        let (b, _b_task, _b_rx) = h.connect("b");
        let a_joined = join(&a, "r1").await;
        join(&b, "r1").await;
        let producer_id = produce_video(&a, a_joined.transport.id).await;

        let err = b
            .request(SessionRequest::Consume {
                rtp_capabilities: full_capabilities(),
                producer_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::InvalidRequest(_)));

        let first = match b
            .request(SessionRequest::Consume {
                rtp_capabilities: full_capabilities(),
                producer_id: Some(producer_id.clone()),
            })
            .await
            .unwrap()
        {
            SessionReply::Consumed(c) => c,
            other => panic!("unexpected reply: {other:?}"),
        };
        assert_eq!(first.kind, MediaKind::Video);
        assert!(first.transport.is_some());

        let second = match b
            .request(SessionRequest::Consume {
                rtp_capabilities: full_capabilities(),
                producer_id: Some(producer_id),
            })
            .await
            .unwrap()
        {
            SessionReply::Consumed(c) => c,
            other => panic!("unexpected reply: {other:?}"),
        };
        assert!(second.transport.is_none());
        assert_eq!(second.transport_id, first.transport_id);
    }

    #[tokio::test]
    async fn test_consume_with_incompatible_capabilities() {
        let h = Harness::new().await;
        h.ctx
            .registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        let (a, _a_task, _a_rx) = h.connect("a");
        let (b, _b_task, _b_rx) = h.connect("b");
        let a_joined = join(&a, "r1").await;
        join(&b, "r1").await;
        let producer_id = produce_video(&a, a_joined.transport.id).await;

        let audio_only = RtpCapabilities {
            codecs: default_media_codecs()
                .into_iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .collect(),
            header_extensions: vec![],
        };
        let err = b
            .request(SessionRequest::Consume {
                rtp_capabilities: audio_only,
                producer_id: Some(producer_id),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::IncompatibleCapabilities(_)));
        assert_eq!(h.engine.counts().await.consumers, 0);
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything_and_removes_room() {
        let h = Harness::new().await;
        h.ctx
            .registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        let (a, task, _rx) = h.connect("a");
        let joined = join(&a, "r1").await;
        produce_video(&a, joined.transport.id).await;

        a.cancel();
        let snapshot = task.await.unwrap();

        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert!(snapshot.holds_nothing());
        let counts = h.engine.counts().await;
        assert_eq!(counts.transports, 0);
        assert_eq!(counts.producers, 0);
        assert_eq!(counts.routers, 0);
        assert!(h.ctx.registry.find(room("r1")).await.is_err());
    }

    #[tokio::test]
    async fn test_dtls_failure_closes_transport() {
        let h = Harness::new().await;
        h.ctx
            .registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        let (a, _task, mut rx) = h.connect("a");
        let joined = join(&a, "r1").await;
        let producer_id = produce_video(&a, joined.transport.id.clone()).await;

        h.engine
            .set_dtls_state(&joined.transport.id, DtlsState::Failed)
            .await;

        match rx.recv().await.unwrap() {
            ServerNotification::TransportClosed { transport_id } => {
                assert_eq!(transport_id, joined.transport.id);
            }
            other => panic!("unexpected notification: {other:?}"),
        }
        let snapshot = a.get_snapshot().await.unwrap();
        assert_eq!(snapshot.transport_count, 0);
        assert!(!snapshot.is_producing());
        assert!(
            !h.engine
                .is_open(&EngineHandle::Producer(producer_id))
                .await
        );
    }

    #[tokio::test]
    async fn test_worker_death_cancels_session_with_full_mailbox() {
        let h = Harness::new().await;
        let room_handle = h
            .ctx
            .registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        let (a, task, _rx) = h.connect("a");
        join(&a, "r1").await;

        // Keep the session busy, then fill its mailbox behind that request.
        h.engine
            .inject(EngineOperation::CreateTransport, Fault::Stall)
            .await;
        let busy = a.clone();
        tokio::spawn(async move {
            let _ = busy
                .request(SessionRequest::CreateTransport {
                    direction: TransportDirection::Recv,
                })
                .await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..SESSION_CHANNEL_BUFFER + 5 {
            let queued = a.clone();
            tokio::spawn(async move {
                let _ = queued.get_snapshot().await;
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let removed = h
            .ctx
            .registry
            .worker_died(room_handle.router().worker_id.clone())
            .await
            .unwrap();
        assert_eq!(removed, vec![room("r1")]);

        let snapshot = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("session should end")
            .unwrap();
        assert!(a.is_cancelled());
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert!(snapshot.holds_nothing());
        assert_eq!(h.engine.counts().await.transports, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_waits_for_join_in_flight() {
        let h = Harness::new().await;
        h.ctx
            .registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        let (a, _task, _rx) = h.connect("a");
        h.engine
            .inject(
                EngineOperation::CreateTransport,
                Fault::Delay(Duration::from_millis(200)),
            )
            .await;

        let joiner = a.clone();
        let joining = tokio::spawn(async move {
            joiner
                .request(SessionRequest::JoinRoom { room_id: room("r1") })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Queued behind the join, so it sees the outcome and never `Joining`.
        let snapshot = a.get_snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Joined);
        assert!(joining.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_room_closed_disconnects_peer() {
        let h = Harness::new().await;
        let room_handle = h
            .ctx
            .registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        let (a, task, mut rx) = h.connect("a");
        join(&a, "r1").await;

        room_handle.force_close(RoomCloseReason::Shutdown).await;

        match rx.recv().await.unwrap() {
            ServerNotification::RoomClosed { room_id, reason } => {
                assert_eq!(room_id, room("r1"));
                assert_eq!(reason, RoomCloseReason::Shutdown);
            }
            other => panic!("unexpected notification: {other:?}"),
        }
        let snapshot = task.await.unwrap();
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert_eq!(h.engine.counts().await.transports, 0);
    }
}
