//! `SignalingDispatcher` - the boundary between connections and actors.
//!
//! The dispatcher:
//! - Spawns one `PeerSession` per connection and tracks it by `PeerId`
//! - Routes requests to the right session and turns every `RoomError` into
//!   a response body
//! - Runs the disconnect path of a peer at most once
//! - Consumes engine lifecycle events: a dead worker fails its rooms and is
//!   replaced in the pool

use crate::actors::{
    ActorMetrics, ActorType, PeerSession, PeerSessionHandle, RoomRegistryHandle, ServerNotification,
    SessionContext, SessionReply, SessionRequest, SessionSnapshot,
};
use crate::errors::RoomError;
use crate::media::types::{RtpCodecCapability, TransportOptions};
use crate::media::{EngineCall, EngineEvent, WorkerPool};
use crate::observability::metrics::{record_signaling_request, record_worker_death};

use super::protocol::{RequestEnvelope, SignalingResponse};

use common::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long `disconnect` waits for a session to finish cleanup.
const SESSION_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// A connected peer, as seen by the transport layer.
#[derive(Debug, Clone)]
pub struct ConnectedPeer {
    pub peer_id: PeerId,
    /// Fires when the session ends on its own (room closed, shutdown).
    pub closed: CancellationToken,
}

struct ManagedSession {
    handle: PeerSessionHandle,
    task_handle: JoinHandle<SessionSnapshot>,
}

pub struct SignalingDispatcher {
    ctx: SessionContext,
    pool: Arc<WorkerPool>,
    root_token: CancellationToken,
    draining: AtomicBool,
    sessions: Mutex<HashMap<PeerId, ManagedSession>>,
}

impl SignalingDispatcher {
    /// Create the dispatcher and start its engine-event loop.
    #[must_use]
    pub fn start(
        registry: RoomRegistryHandle,
        engine: EngineCall,
        pool: Arc<WorkerPool>,
        transport_options: TransportOptions,
        media_codecs: Vec<RtpCodecCapability>,
        metrics: Arc<ActorMetrics>,
    ) -> Arc<Self> {
        let events = engine.engine().subscribe();
        let dispatcher = Arc::new(Self {
            ctx: SessionContext {
                registry,
                engine,
                transport_options,
                media_codecs: media_codecs.into(),
                metrics,
            },
            pool,
            root_token: CancellationToken::new(),
            draining: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
        });

        tokio::spawn(Self::run_engine_events(
            Arc::downgrade(&dispatcher),
            events,
            dispatcher.root_token.clone(),
        ));

        dispatcher
    }

    /// Register a new connection as an unjoined peer.
    ///
    /// # Errors
    ///
    /// `Draining` once shutdown has begun.
    pub fn connect(
        &self,
        notifications: mpsc::Sender<ServerNotification>,
    ) -> Result<ConnectedPeer, RoomError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(RoomError::Draining);
        }

        let peer_id = PeerId::new();
        let token = self.root_token.child_token();
        let (handle, task_handle) =
            PeerSession::spawn(peer_id.clone(), self.ctx.clone(), notifications, token.clone());

        self.lock_sessions()?.insert(
            peer_id.clone(),
            ManagedSession {
                handle,
                task_handle,
            },
        );

        info!(target: "rc.signaling", peer_id = %peer_id, "Peer connected");

        Ok(ConnectedPeer {
            peer_id,
            closed: token,
        })
    }

    /// Route one typed request to the peer's session.
    ///
    /// # Errors
    ///
    /// `SessionClosed` if the peer is unknown or gone; otherwise whatever
    /// the session returned.
    pub async fn handle_request(
        &self,
        peer_id: &PeerId,
        request: SessionRequest,
    ) -> Result<SessionReply, RoomError> {
        let handle = self.session_handle(peer_id)?;
        handle.request(request).await
    }

    /// Handle a parsed request envelope and build its response.
    pub async fn handle(&self, peer_id: &PeerId, envelope: RequestEnvelope) -> SignalingResponse {
        let start = Instant::now();
        let RequestEnvelope { id, request } = envelope;

        let (method, result) = match request.into_session_request() {
            Ok(request) => {
                let method = request.method();
                (method, self.handle_request(peer_id, request).await)
            }
            Err(e) => ("invalid", Err(e)),
        };

        let response = match result {
            Ok(reply) => SignalingResponse::ok(id, reply),
            Err(e) => {
                if matches!(e, RoomError::Internal(_)) {
                    error!(target: "rc.signaling", peer_id = %peer_id, method, error = %e, "Request failed");
                } else {
                    debug!(target: "rc.signaling", peer_id = %peer_id, method, error = %e, "Request rejected");
                }
                SignalingResponse::error(id, &e)
            }
        };

        record_signaling_request(method, response.status(), start.elapsed());
        response
    }

    /// Run the peer's disconnect path. Later calls for the same peer are no-ops.
    ///
    /// Returns the final snapshot of the session on the first call.
    pub async fn disconnect(&self, peer_id: &PeerId) -> Option<SessionSnapshot> {
        let managed = match self.lock_sessions() {
            Ok(mut sessions) => sessions.remove(peer_id),
            Err(e) => {
                error!(target: "rc.signaling", peer_id = %peer_id, error = %e, "Session table unavailable");
                None
            }
        }?;

        managed.handle.cancel();
        match tokio::time::timeout(SESSION_STOP_TIMEOUT, managed.task_handle).await {
            Ok(Ok(snapshot)) => {
                info!(target: "rc.signaling", peer_id = %peer_id, "Peer disconnected");
                Some(snapshot)
            }
            Ok(Err(join_error)) => {
                if join_error.is_panic() {
                    self.ctx.metrics.record_panic(ActorType::Session);
                }
                error!(
                    target: "rc.signaling",
                    peer_id = %peer_id,
                    error = ?join_error,
                    "Peer session task failed"
                );
                None
            }
            Err(_) => {
                warn!(target: "rc.signaling", peer_id = %peer_id, "Peer session cleanup timed out");
                None
            }
        }
    }

    /// Current snapshot of a connected peer.
    ///
    /// # Errors
    ///
    /// `SessionClosed` if the peer is unknown or gone.
    pub async fn session_snapshot(&self, peer_id: &PeerId) -> Result<SessionSnapshot, RoomError> {
        self.session_handle(peer_id)?.get_snapshot().await
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock_sessions().map(|s| s.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Refuse new peers and disconnect every connected one.
    pub async fn shutdown(&self) {
        self.draining.store(true, Ordering::SeqCst);

        let peers: Vec<PeerId> = self
            .lock_sessions()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();

        info!(target: "rc.signaling", peers = peers.len(), "Disconnecting all peers");

        for peer_id in peers {
            self.disconnect(&peer_id).await;
        }
        self.root_token.cancel();
    }

    fn session_handle(&self, peer_id: &PeerId) -> Result<PeerSessionHandle, RoomError> {
        self.lock_sessions()?
            .get(peer_id)
            .map(|m| m.handle.clone())
            .ok_or(RoomError::SessionClosed)
    }

    fn lock_sessions(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<PeerId, ManagedSession>>, RoomError> {
        self.sessions
            .lock()
            .map_err(|e| RoomError::Internal(format!("session table poisoned: {e}")))
    }

    async fn run_engine_events(
        dispatcher: std::sync::Weak<Self>,
        mut events: broadcast::Receiver<EngineEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(EngineEvent::WorkerDied { worker_id }) => {
                    let Some(dispatcher) = dispatcher.upgrade() else {
                        break;
                    };
                    record_worker_death();
                    match dispatcher.ctx.registry.worker_died(worker_id.clone()).await {
                        Ok(rooms) => {
                            warn!(
                                target: "rc.signaling",
                                worker_id = %worker_id,
                                rooms_failed = rooms.len(),
                                "Worker death handled"
                            );
                        }
                        Err(e) => {
                            error!(
                                target: "rc.signaling",
                                worker_id = %worker_id,
                                error = %e,
                                "Failed to fail rooms of dead worker"
                            );
                        }
                    }
                    dispatcher.pool.handle_worker_death(&worker_id).await;
                }
                Ok(EngineEvent::TransportStateChanged { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "rc.signaling", skipped, "Engine event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        debug!(target: "rc.signaling", "Engine event loop stopped");
    }
}
