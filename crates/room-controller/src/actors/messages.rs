//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Response patterns use `tokio::sync::oneshot` for request-reply semantics.

use crate::errors::RoomError;
use crate::media::types::{
    ConsumerId, DtlsParameters, MediaKind, ProducerId, RouterId, RtpCapabilities,
    RtpCodecCapability, RtpParameters, TransportDirection, TransportId, TransportParams, WorkerId,
};
use crate::media::RouterHandle;

use super::room::RoomHandle;
use super::session::PeerSessionHandle;

use common::{PeerId, RoomId};
use serde::Serialize;
use tokio::sync::oneshot;

/// Messages sent to `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Reserve `room_id` and create its router.
    CreateRoom {
        room_id: RoomId,
        media_codecs: Vec<RtpCodecCapability>,
        respond_to: oneshot::Sender<Result<RoomHandle, RoomError>>,
    },

    /// Router creation for a reserved room finished (internal).
    RouterReady {
        room_id: RoomId,
        worker_id: WorkerId,
        result: Result<RouterHandle, RoomError>,
        respond_to: oneshot::Sender<Result<RoomHandle, RoomError>>,
    },

    FindRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<RoomHandle, RoomError>>,
    },

    /// Remove the room iff it has no peers. Responds whether it was removed.
    RemoveIfEmpty {
        room_id: RoomId,
        router_id: RouterId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Fail every room hosted on a dead worker. Responds with the removed ids.
    WorkerDied {
        worker_id: WorkerId,
        respond_to: oneshot::Sender<Vec<RoomId>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms and close every room.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    AddPeer {
        peer_id: PeerId,
        session: PeerSessionHandle,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },

    /// Responds whether the room is now empty.
    RemovePeer {
        peer_id: PeerId,
        respond_to: oneshot::Sender<bool>,
    },

    RegisterProducer {
        peer_id: PeerId,
        producer_id: ProducerId,
        kind: MediaKind,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },

    UnregisterProducer {
        producer_id: ProducerId,
        respond_to: oneshot::Sender<()>,
    },

    FindProducer {
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Result<ProducerInfo, RoomError>>,
    },

    /// Close the router and stop iff no peers remain. Responds whether it closed.
    CloseIfEmpty { respond_to: oneshot::Sender<bool> },

    /// Close regardless of membership; peers are told `RoomClosed`.
    ForceClose {
        reason: RoomCloseReason,
        respond_to: oneshot::Sender<()>,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

/// Messages sent to `PeerSession`.
#[derive(Debug)]
pub enum SessionMessage {
    /// Client request, processed in arrival order.
    Request {
        request: SessionRequest,
        respond_to: oneshot::Sender<Result<SessionReply, RoomError>>,
    },

    /// A producer in the peer's room went away.
    ProducerClosed { producer_id: ProducerId },

    /// The peer's room was closed underneath it.
    RoomClosed {
        room_id: RoomId,
        reason: RoomCloseReason,
    },

    GetSnapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
}

/// Client operations handled by a peer session.
#[derive(Debug, Clone)]
pub enum SessionRequest {
    CreateRoom {
        room_id: RoomId,
    },
    JoinRoom {
        room_id: RoomId,
    },
    CreateTransport {
        direction: TransportDirection,
    },
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    Consume {
        rtp_capabilities: RtpCapabilities,
        producer_id: Option<ProducerId>,
    },
}

impl SessionRequest {
    /// Method name as it appears on the wire.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            SessionRequest::CreateRoom { .. } => "createRoom",
            SessionRequest::JoinRoom { .. } => "joinRoom",
            SessionRequest::CreateTransport { .. } => "createTransport",
            SessionRequest::ConnectTransport { .. } => "connectTransport",
            SessionRequest::Produce { .. } => "produce",
            SessionRequest::Consume { .. } => "consume",
        }
    }
}

/// Successful result of a `SessionRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SessionReply {
    RoomCreated(RoomCreated),
    Joined(Joined),
    TransportCreated(TransportCreated),
    TransportConnected(Ack),
    Produced(Produced),
    Consumed(Consumed),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreated {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Joined {
    pub router_rtp_capabilities: RtpCapabilities,
    pub transport: TransportParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreated {
    pub direction: TransportDirection,
    pub transport: TransportParams,
}

/// Empty success body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Ack {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Produced {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumed {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub transport_id: TransportId,
    /// Present when a receive transport was created for this consume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportParams>,
}

/// Server-initiated message pushed to a peer's signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "notification",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerNotification {
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    TransportClosed {
        transport_id: TransportId,
    },
    RoomClosed {
        room_id: RoomId,
        reason: RoomCloseReason,
    },
}

/// Why a room was closed while peers were still in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomCloseReason {
    WorkerDied,
    Shutdown,
}

/// Producer registered in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub owner: PeerId,
    pub kind: MediaKind,
}

/// Status of the `RoomRegistryActor`.
#[derive(Debug, Clone)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub pending_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Current state of a room (for debugging/health/tests).
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: RoomId,
    pub worker_id: WorkerId,
    pub peers: Vec<PeerId>,
    pub producers: Vec<ProducerInfo>,
    pub router_open: bool,
    pub created_at: i64,
}

/// Peer session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Signaling established, not in a room.
    Connected,
    /// Join in flight. Requests and snapshots queue behind the join, so
    /// this state is only held inside the session and never reported.
    Joining,
    /// Member of a room.
    Joined,
    /// Terminal; all resources released.
    Disconnected,
}

/// Point-in-time view of a peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub peer_id: PeerId,
    pub state: SessionState,
    pub room_id: Option<RoomId>,
    pub transport_count: usize,
    pub producer_id: Option<ProducerId>,
    pub consumer_ids: Vec<ConsumerId>,
}

impl SessionSnapshot {
    #[must_use]
    pub fn is_producing(&self) -> bool {
        self.producer_id.is_some()
    }

    #[must_use]
    pub fn is_consuming(&self) -> bool {
        !self.consumer_ids.is_empty()
    }

    /// Whether the session holds no engine resources.
    #[must_use]
    pub fn holds_nothing(&self) -> bool {
        self.transport_count == 0 && self.producer_id.is_none() && self.consumer_ids.is_empty()
    }
}
