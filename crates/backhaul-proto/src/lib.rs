//! Backhaul tunnel protocol definitions
//!
//! Wire messages exchanged between the coordinator and agents over a
//! persistent WebSocket tunnel, plus the helpers both sides use to cut a
//! file into base64 chunks and put it back together.

pub mod chunk;
pub mod codec;
pub mod messages;

pub use chunk::{
    chunk_count, decode_chunk, encode_chunk, ChunkError, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE,
};
pub use codec::{CodecError, TunnelCodec};
pub use messages::*;
