//! Courier Protocol Definitions
//!
//! This crate defines the frame schema exchanged between the relay and its
//! peers (controllers and agents), plus the JSON codec used on the wire.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, FrameCodec};
pub use messages::*;

/// Default relay listening port
pub const DEFAULT_PORT: u16 = 6857;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
