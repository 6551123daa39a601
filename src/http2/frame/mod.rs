//! # HTTP/2 フレーム層 (RFC 7540 Section 4, 6)

pub mod decoder;
pub mod encoder;
pub mod types;

pub use decoder::FrameDecoder;
pub use encoder::FrameEncoder;
pub use types::{Frame, FrameFlags, FrameHeader, FrameType, PrioritySpec};
