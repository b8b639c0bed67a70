//! JSON wire format for the signaling channel.
//!
//! Client requests carry a numeric `id` and a `method` tag with the request
//! fields flattened beside it:
//!
//! ```json
//! { "id": 7, "method": "joinRoom", "roomId": "r1" }
//! ```
//!
//! Every request gets exactly one response with the same `id`:
//!
//! ```json
//! { "response": true, "id": 7, "ok": true, "data": { ... } }
//! { "response": true, "id": 7, "ok": false, "error": { "code": "NotFound", "message": "..." } }
//! ```
//!
//! Server notifications are tagged with `notification` instead.

use crate::actors::{ServerNotification, SessionReply, SessionRequest};
use crate::errors::{ErrorCode, RoomError};
use crate::media::types::{
    DtlsParameters, MediaKind, ProducerId, RtpCapabilities, RtpParameters, TransportDirection,
    TransportId,
};

use common::RoomId;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// A client request with its correlation id.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: SignalingRequest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum SignalingRequest {
    CreateRoom(RoomRequest),
    JoinRoom(RoomRequest),
    CreateTransport(CreateTransportRequest),
    ConnectTransport(ConnectTransportRequest),
    Produce(ProduceRequest),
    Consume(ConsumeRequest),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    pub room_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    /// Defaults to `recv`; the send transport comes with `joinRoom`.
    #[serde(default)]
    pub direction: Option<TransportDirection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: TransportId,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub rtp_capabilities: RtpCapabilities,
    #[serde(default)]
    pub producer_id: Option<ProducerId>,
}

impl SignalingRequest {
    /// Validate wire values and convert into the session's request type.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if a room id is malformed.
    pub fn into_session_request(self) -> Result<SessionRequest, RoomError> {
        Ok(match self {
            SignalingRequest::CreateRoom(r) => SessionRequest::CreateRoom {
                room_id: parse_room_id(r.room_id)?,
            },
            SignalingRequest::JoinRoom(r) => SessionRequest::JoinRoom {
                room_id: parse_room_id(r.room_id)?,
            },
            SignalingRequest::CreateTransport(r) => SessionRequest::CreateTransport {
                direction: r.direction.unwrap_or(TransportDirection::Recv),
            },
            SignalingRequest::ConnectTransport(r) => SessionRequest::ConnectTransport {
                transport_id: r.transport_id,
                dtls_parameters: r.dtls_parameters,
            },
            SignalingRequest::Produce(r) => SessionRequest::Produce {
                transport_id: r.transport_id,
                kind: r.kind,
                rtp_parameters: r.rtp_parameters,
            },
            SignalingRequest::Consume(r) => SessionRequest::Consume {
                rtp_capabilities: r.rtp_capabilities,
                producer_id: r.producer_id,
            },
        })
    }
}

fn parse_room_id(raw: String) -> Result<RoomId, RoomError> {
    RoomId::parse(raw).map_err(|e| RoomError::InvalidRequest(format!("invalid roomId: {e}")))
}

/// A frame that could not be parsed as a request.
#[derive(Debug)]
pub struct MalformedRequest {
    /// The request id if it could be recovered, else 0.
    pub id: u64,
    pub error: RoomError,
}

/// Parse one text frame.
///
/// # Errors
///
/// `MalformedRequest` carrying an `InvalidRequest` error.
pub fn parse_request(text: &str) -> Result<RequestEnvelope, MalformedRequest> {
    serde_json::from_str(text).map_err(|e| {
        let id = serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .and_then(|v| v.get("id").and_then(serde_json::Value::as_u64))
            .unwrap_or(0);
        MalformedRequest {
            id,
            error: RoomError::InvalidRequest(e.to_string()),
        }
    })
}

/// Client-facing error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&RoomError> for ErrorBody {
    fn from(err: &RoomError) -> Self {
        Self {
            code: err.error_code(),
            message: err.client_message(),
        }
    }
}

/// Response to exactly one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingResponse {
    pub id: u64,
    pub outcome: Result<SessionReply, ErrorBody>,
}

impl SignalingResponse {
    #[must_use]
    pub fn ok(id: u64, reply: SessionReply) -> Self {
        Self {
            id,
            outcome: Ok(reply),
        }
    }

    #[must_use]
    pub fn error(id: u64, err: &RoomError) -> Self {
        Self {
            id,
            outcome: Err(err.into()),
        }
    }

    /// `ok` or the error code name; used as the metrics status label.
    #[must_use]
    pub fn status(&self) -> &'static str {
        match &self.outcome {
            Ok(_) => "ok",
            Err(body) => body.code.as_str(),
        }
    }
}

impl Serialize for SignalingResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("SignalingResponse", 4)?;
        state.serialize_field("response", &true)?;
        state.serialize_field("id", &self.id)?;
        match &self.outcome {
            Ok(data) => {
                state.serialize_field("ok", &true)?;
                state.serialize_field("data", data)?;
            }
            Err(error) => {
                state.serialize_field("ok", &false)?;
                state.serialize_field("error", error)?;
            }
        }
        state.end()
    }
}

/// Anything the server writes to the socket.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(SignalingResponse),
    Notification(ServerNotification),
}
