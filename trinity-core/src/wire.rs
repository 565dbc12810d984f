//! Framing: length-prefix (4 bytes LE) + JSON envelope.

use crate::protocol::Envelope;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 1024 * 1024; // 1 MiB

/// Encode an envelope into a single frame: 4 bytes LE length + JSON payload.
pub fn encode_frame(env: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = serde_json::to_vec(env).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding an envelope into a frame (JSON or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the envelope and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    let len = frame_len(bytes)?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let env = decode_body(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((env, LEN_SIZE + len))
}

/// Read the body length from a frame header. Hosts reading from a stream use this
/// to size the body read.
pub fn frame_len(header: &[u8]) -> Result<usize, FrameDecodeError> {
    if header.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode a frame body (without the length prefix).
pub fn decode_body(body: &[u8]) -> Result<Envelope, FrameDecodeError> {
    serde_json::from_slice(body).map_err(FrameDecodeError::Decode)
}

/// Error decoding a frame (need more bytes, too large, or JSON failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
