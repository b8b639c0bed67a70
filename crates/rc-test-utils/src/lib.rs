//! # RC Test Utilities
//!
//! Shared test utilities for the Room Controller (RC).
//!
//! ## Modules
//!
//! - `harness` - In-process controller (`TestRoomService`) and client (`TestPeer`)
//! - `fixtures` - RTP parameters, capability sets and DTLS parameters
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let service = TestRoomService::start().await;
//!     let alice = service.connect();
//!
//!     alice.create_room("r1").await.unwrap();
//!     let joined = alice.join("r1").await.unwrap();
//!     alice.produce_video(joined.transport.id).await.unwrap();
//! }
//! ```

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::{TestPeer, TestRoomService, TestRoomServiceBuilder};
