//! Room Controller Library
//!
//! Core of the Room Controller, a WebSocket signaling server for
//! multi-party media sessions:
//!
//! - Room lifecycle: rooms are created explicitly, pinned to one media
//!   worker, and reclaimed when the last peer leaves
//! - Peer sessions: join, transports, one outbound stream per peer, and
//!   any number of subscriptions to the streams of others
//! - Media engine facade with bounded, cancellable calls
//! - Graceful shutdown that releases every engine resource
//!
//! # Architecture
//!
//! ```text
//! SignalingDispatcher (one per process)
//! ├── RoomRegistryActor (singleton)
//! │   └── supervises N RoomActors
//! │       └── RoomActor (one per room, owns the router and the producer directory)
//! └── supervises N PeerSessions
//!     └── PeerSession (one per WebSocket connection, owns transports/producer/consumers)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry, room and peer session actors
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with wire error codes
//! - [`media`] - Media engine facade, in-process engine and worker pool
//! - [`observability`] - Health endpoints and metrics
//! - [`signaling`] - Wire protocol, dispatch and WebSocket endpoint

pub mod actors;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod signaling;
