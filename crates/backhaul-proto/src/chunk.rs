//! Chunk encoding shared by the agent emitter and the coordinator

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use thiserror::Error;

use crate::codec::TunnelCodec;

/// Default chunk size (64KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Room left in a frame for the `file_chunk` envelope around the payload
const ENVELOPE_HEADROOM: usize = 64 * 1024;

/// Largest chunk whose base64 `file_chunk` frame stays under
/// [`TunnelCodec::MAX_MESSAGE_SIZE`]
pub const MAX_CHUNK_SIZE: usize = (TunnelCodec::MAX_MESSAGE_SIZE - ENVELOPE_HEADROOM) / 4 * 3;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Invalid base64 payload: {0}")]
    InvalidPayload(#[from] base64::DecodeError),
}

/// Number of chunks needed to carry `file_size` bytes
///
/// An empty file still travels as one (empty) chunk so the receiver sees a
/// final chunk and completes the transfer.
pub fn chunk_count(file_size: u64, chunk_size: usize) -> u32 {
    let chunk_size = chunk_size.max(1) as u64;
    let count = file_size.div_ceil(chunk_size).max(1);
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Encode raw chunk bytes for a `file_chunk` message
pub fn encode_chunk(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode the `data` field of a `file_chunk` message
pub fn decode_chunk(data: &str) -> Result<Bytes, ChunkError> {
    Ok(Bytes::from(STANDARD.decode(data)?))
}
