//! Framing: 4-byte LE total length, 4-byte LE header length, UTF-8 JSON
//! header, raw body. Coordination verbs carry UTF-8 JSON bodies; replication
//! verbs carry raw file bytes, which is why the body is not forced through
//! JSON itself.

use serde::{Deserialize, Serialize};

const LEN_SIZE: usize = 4;
/// Upper bound on one frame; sized to carry one encoded segment.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Direction and status of a frame. Consumers read header fields by name and
/// tolerate unknown extras, so new fields can be added without a version bump.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FrameKind {
    /// A request naming the verb to dispatch on.
    Request { verb: String },
    /// A response; `error` is set when the responder itself failed (transport
    /// or handler error). Verb-level failures like `no-work` live in the body.
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Frame header: correlation id plus kind. Serialized as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameHeader {
    pub id: u64,
    #[serde(flatten)]
    pub kind: FrameKind,
}

impl FrameHeader {
    pub fn request(id: u64, verb: impl Into<String>) -> Self {
        FrameHeader {
            id,
            kind: FrameKind::Request { verb: verb.into() },
        }
    }

    pub fn response(id: u64) -> Self {
        FrameHeader {
            id,
            kind: FrameKind::Response { error: None },
        }
    }

    pub fn error_response(id: u64, error: impl Into<String>) -> Self {
        FrameHeader {
            id,
            kind: FrameKind::Response {
                error: Some(error.into()),
            },
        }
    }
}

/// Encode one frame: total length, header length, header JSON, body bytes.
pub fn encode_frame(header: &FrameHeader, body: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let header_json = serde_json::to_vec(header).map_err(FrameEncodeError::Encode)?;
    let total = LEN_SIZE + header_json.len() + body.len();
    if total > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + total);
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(header_json.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_json);
    out.extend_from_slice(body);
    Ok(out)
}

/// Error encoding a frame (serde or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the header, body and
/// bytes consumed. Call with a partial buffer; `NeedMore` means try again
/// after more data arrives.
pub fn decode_frame(bytes: &[u8]) -> Result<(FrameHeader, Vec<u8>, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let total = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if total > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + total {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame = &bytes[LEN_SIZE..LEN_SIZE + total];
    if frame.len() < LEN_SIZE {
        return Err(FrameDecodeError::Malformed);
    }
    let header_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if LEN_SIZE + header_len > frame.len() {
        return Err(FrameDecodeError::Malformed);
    }
    let header: FrameHeader = serde_json::from_slice(&frame[LEN_SIZE..LEN_SIZE + header_len])
        .map_err(FrameDecodeError::Decode)?;
    let body = frame[LEN_SIZE + header_len..].to_vec();
    Ok((header, body, LEN_SIZE + total))
}

/// Error decoding a frame (need more bytes, too large, or malformed).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("malformed frame")]
    Malformed,
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
