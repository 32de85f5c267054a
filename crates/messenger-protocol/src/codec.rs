//! Codec for encoding and decoding event frames.
//!
//! Frames are single JSON texts of the form `{"event": ..., "data": ...}`.
//! Decode enforces a size cap before touching the parser so an oversized
//! frame is rejected cheaply.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Maximum accepted frame size in bytes (inbound and outbound).
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame exceeds the size cap
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    /// Frame is not valid JSON or does not match the event schema
    #[error("Invalid frame format: {0}")]
    InvalidFormat(String),

    /// Frame is not text
    #[error("Non-text frame")]
    NonText,
}

/// Decode an event frame from a JSON text.
///
/// # Errors
///
/// Returns [`CodecError::FrameTooLarge`] if the text exceeds
/// [`MAX_FRAME_BYTES`], or [`CodecError::InvalidFormat`] if it does not
/// parse into the expected event type.
pub fn decode_frame<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            len: text.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    serde_json::from_str(text).map_err(|e| CodecError::InvalidFormat(e.to_string()))
}

/// Encode an event to a JSON frame.
///
/// # Errors
///
/// Returns [`CodecError::InvalidFormat`] if serialization fails, or
/// [`CodecError::FrameTooLarge`] if the encoded frame exceeds the cap.
pub fn encode_frame<T: Serialize>(event: &T) -> Result<String, CodecError> {
    let text = serde_json::to_string(event).map_err(|e| CodecError::InvalidFormat(e.to_string()))?;

    if text.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            len: text.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    Ok(text)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::dialog::DialogClientEvent;

    #[test]
    fn test_decode_valid_frame() {
        let event: DialogClientEvent =
            decode_frame(r#"{"event":"start_typing","data":{"dialog_id":"d1"}}"#).unwrap();
        assert_eq!(
            event,
            DialogClientEvent::StartTyping {
                dialog_id: "d1".to_string()
            }
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result: Result<DialogClientEvent, _> = decode_frame("not json");
        assert!(matches!(result, Err(CodecError::InvalidFormat(_))));
    }

    #[test]
    fn test_decode_rejects_unknown_event() {
        let result: Result<DialogClientEvent, _> =
            decode_frame(r#"{"event":"self_destruct","data":{}}"#);
        assert!(matches!(result, Err(CodecError::InvalidFormat(_))));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let padding = "x".repeat(MAX_FRAME_BYTES + 1);
        let result: Result<DialogClientEvent, _> = decode_frame(&padding);
        assert!(matches!(result, Err(CodecError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let event = DialogClientEvent::StopTyping {
            dialog_id: "d9".to_string(),
        };
        let text = encode_frame(&event).unwrap();
        let decoded: DialogClientEvent = decode_frame(&text).unwrap();
        assert_eq!(decoded, event);
    }
}
