//! Signaling: wire protocol, request dispatch and the WebSocket endpoint.

pub mod dispatcher;
pub mod protocol;
pub mod websocket;

pub use dispatcher::{ConnectedPeer, SignalingDispatcher};
pub use protocol::{
    parse_request, ErrorBody, MalformedRequest, RequestEnvelope, ServerMessage, SignalingRequest,
    SignalingResponse,
};
pub use websocket::signaling_router;
