//! Wire framing for fleet traffic.
//!
//! Every connection carries exactly one frame:
//!
//! ```text
//! +----------------+--------------------------+
//! | Length (4B BE) | JSON-encoded Message     |
//! +----------------+--------------------------+
//! ```
//!
//! The length prefix lets the receiver know when the message is complete
//! without waiting for the peer to close its half of the socket.

use fleetlink_types::{FleetError, Message};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum byte length of a frame body.
///
/// Frames announcing a larger body are rejected before any allocation.
pub const MAX_FRAME_BYTES: usize = 64 * 1024; // 64 KiB

const LENGTH_PREFIX_BYTES: usize = 4;

/// Serialise `message` into a length-prefixed frame.
///
/// # Errors
///
/// Returns [`FleetError::Serialization`] if the message cannot be encoded or
/// its body exceeds [`MAX_FRAME_BYTES`].
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, FleetError> {
    let body = serde_json::to_vec(message).map_err(|e| FleetError::Serialization(e.to_string()))?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(FleetError::Serialization(format!(
            "frame body is {} bytes, exceeding the limit of {}",
            body.len(),
            MAX_FRAME_BYTES
        )));
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body (without its length prefix).
pub fn decode_body(body: &[u8]) -> Result<Message, FleetError> {
    serde_json::from_slice(body).map_err(|e| FleetError::Protocol(format!("invalid JSON: {e}")))
}

/// Read one frame from `reader` and decode it.
///
/// # Errors
///
/// Returns [`FleetError::Protocol`] when the stream ends early, the length
/// prefix is zero or larger than `max_body`, or the body is not a valid
/// [`Message`].
pub async fn read_frame<R>(reader: &mut R, max_body: usize) -> Result<Message, FleetError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
    reader.read_exact(&mut len_buf).await.map_err(|e| {
        FleetError::Protocol(format!("connection closed before a length prefix arrived: {e}"))
    })?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(FleetError::Protocol("empty frame".into()));
    }
    if len > max_body {
        return Err(FleetError::Protocol(format!(
            "frame too large: {len} > {max_body}"
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| FleetError::Protocol(format!("truncated frame body: {e}")))?;

    decode_body(&body)
}
