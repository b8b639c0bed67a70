//! Common utilities and types shared across Room Controller components.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

pub use types::{PeerId, RoomId, RoomIdError};
