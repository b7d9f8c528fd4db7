//! Framing: one JSON object per frame, terminated by `\n`.

use crate::protocol::Message;

const DELIMITER: u8 = b'\n';
pub const MAX_FRAME_LEN: usize = 1024 * 1024; // 1 MiB

/// Encode a message into a single frame: JSON payload + newline.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = serde_json::to_vec(msg).map_err(FrameEncodeError::Encode)?;
    if out.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    out.push(DELIMITER);
    Ok(out)
}

/// Error encoding a message into a frame (serde_json or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if no complete frame is buffered yet.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let Some(end) = bytes.iter().position(|&b| b == DELIMITER) else {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(FrameDecodeError::TooLarge);
        }
        return Err(FrameDecodeError::NeedMore);
    };
    if end > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let mut payload = &bytes[..end];
    if let Some(stripped) = payload.strip_suffix(b"\r") {
        payload = stripped;
    }
    let msg: Message = serde_json::from_slice(payload).map_err(FrameDecodeError::Malformed)?;
    Ok((msg, end + 1))
}

/// Error decoding a frame (need more bytes, too large, or malformed payload).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    /// Invalid JSON, missing `type`/`timestamp`, or an unrecognized kind.
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    /// Stream ended with a partial frame buffered.
    #[error("stream ended mid-frame")]
    Truncated,
}
