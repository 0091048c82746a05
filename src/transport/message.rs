//! Wire codec
//!
//! One relay message travels as one WebSocket binary message. Its payload
//! is the concatenation of the frames, each prefixed by its length as a
//! 4-byte big-endian integer:
//!
//! ```text
//! +----------+-----------+----------+-----------+---
//! | len0 u32 | frame0 .. | len1 u32 | frame1 .. | ...
//! +----------+-----------+----------+-----------+---
//! ```

use tungstenite::protocol::Message as WsMessage;

use crate::relay::message::Message;
use crate::utils::RelayError;

const LEN_PREFIX: usize = 4;

/// Serialize a message into its wire payload.
pub fn encode(message: &Message) -> Vec<u8> {
    let size = message
        .frames()
        .iter()
        .map(|frame| LEN_PREFIX + frame.len())
        .sum();
    let mut out = Vec::with_capacity(size);
    for frame in message.frames() {
        // frames are bounded by the websocket max message size, far below u32::MAX
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(frame);
    }
    out
}

/// Parse a wire payload back into a message.
///
/// # Errors
///
/// `EmptyMessage` for an empty payload, `TruncatedFrame` when a length
/// prefix or frame body runs past the end.
pub fn decode(mut payload: &[u8]) -> Result<Message, RelayError> {
    let mut frames = Vec::new();
    while !payload.is_empty() {
        let Some((len, rest)) = payload.split_first_chunk::<LEN_PREFIX>() else {
            return Err(RelayError::TruncatedFrame {
                needed: LEN_PREFIX,
                available: payload.len(),
            });
        };
        let len = u32::from_be_bytes(*len) as usize;
        if rest.len() < len {
            return Err(RelayError::TruncatedFrame {
                needed: len,
                available: rest.len(),
            });
        }
        let (frame, rest) = rest.split_at(len);
        frames.push(frame.to_vec());
        payload = rest;
    }
    Message::new(frames)
}

/// Wrap a message into a WebSocket binary message ready to be queued.
pub fn to_ws(message: &Message) -> WsMessage {
    WsMessage::binary(encode(message))
}
