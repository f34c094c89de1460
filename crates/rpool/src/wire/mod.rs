//! Wire format for talking to an engine process.
//!
//! Frames are a 4-byte big-endian length followed by a JSON body. The
//! channel is blocking: one request, then one response.

pub mod codec;
pub mod protocol;

pub use codec::{DEFAULT_MAX_FRAME_LENGTH, FramedChannel, JsonCodec};
pub use protocol::{EngineRequest, EngineResponse};
