//! Actor model implementation for the Room Controller.
//!
//! ```text
//! RoomRegistryActor (singleton per process)
//! └── supervises N RoomActors
//!     └── RoomActor (one per room)
//!         ├── owns the router
//!         └── holds handles of N PeerSessions (lookup and notification only)
//!
//! PeerSession (one per signaling connection, owned by the dispatcher)
//! └── owns its transports, producer and consumers
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single owner per resource**: routers belong to rooms, everything else to sessions
//! - **CancellationToken propagation**: the registry passes child tokens to rooms
//! - **Mailbox monitoring**: Depth thresholds with metrics (Room: 100/500, Session: 50/200)
//! - **Message passing**: All inter-actor communication via `tokio::sync::mpsc` channels
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` singleton that owns the room table
//! - [`room`] - `RoomActor` per room, owns router and membership
//! - [`session`] - `PeerSession` per connection, owns engine resources
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;
pub mod session;

// Re-export primary types
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::{RoomRegistryActor, RoomRegistryHandle};
pub use room::{RoomActor, RoomHandle};
pub use session::{PeerSession, PeerSessionHandle, SessionContext};
