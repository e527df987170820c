//! # mortar-codec
//!
//! Framing for the Mortar RPC transport.
//!
//! This crate provides:
//! - `Frame` / `Framelet` - the unit of wire transmission
//! - `FrameCodec` - length-prefixed encoder/decoder for tokio-util
//!
//! ## Frame Format
//!
//! ```text
//! +---------------+-----------------------+-------------+----------------+
//! | Length (4 LE) | Conversation ID (8 LE)| Kind (1)    | Framelets (2 LE)|
//! +---------------+-----------------------+-------------+----------------+
//! | Framelet type (2 LE) | Framelet length (4 LE) | Framelet bytes | ...  |
//! +----------------------+------------------------+----------------+-----+
//! ```
//!
//! The length covers everything after itself. Framelets appear in a fixed
//! order: optional layer data, headers (requests and events only), then
//! the payload. Control frames carry a single control framelet.

mod frame;

pub use frame::{
    CONTROL_CONVERSATION_ID, DEFAULT_MAX_FRAME_SIZE, Frame, FrameCodec, Framelet, FrameletType,
};
