//! Codec for encoding/decoding relay frames
//!
//! Frames travel as one JSON object per transport message. Decoding rejects
//! oversized input, unknown frame types, missing fields and the empty
//! identifiers checked by [`Frame::validate`].

use crate::messages::Frame;
use crate::MAX_FRAME_SIZE;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Relay frame codec
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame to its JSON text form
    pub fn encode(&self, frame: &Frame) -> Result<String, CodecError> {
        let text = serde_json::to_string(frame)?;

        if text.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(text.len()));
        }

        Ok(text)
    }

    /// Decode and validate a frame from JSON text
    pub fn decode(&self, text: &str) -> Result<Frame, CodecError> {
        if text.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(text.len()));
        }

        let frame: Frame = serde_json::from_str(text)?;
        frame.validate().map_err(CodecError::InvalidFrame)?;

        Ok(frame)
    }

    /// Decode a frame carried as raw bytes (e.g. a binary WebSocket message)
    pub fn decode_bytes(&self, data: &[u8]) -> Result<Frame, CodecError> {
        if data.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(data.len()));
        }

        let text = std::str::from_utf8(data).map_err(|_| CodecError::InvalidUtf8)?;
        self.decode(text)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CommandRequest, Handshake, Role};
    use serde_json::json;

    #[test]
    fn test_decode_handshake_with_aliases() {
        let codec = FrameCodec::new();
        let frame = codec
            .decode(r#"{"type":"handshake","role":"agent","client_id":"a1","data":{"host":"H1"}}"#)
            .unwrap();

        match frame {
            Frame::Handshake(handshake) => {
                assert_eq!(handshake.role, Role::Agent);
                assert_eq!(handshake.requested_id(), Some("a1"));
                assert_eq!(handshake.metadata, Some(json!({"host": "H1"})));
            }
            other => panic!("Expected handshake, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_handshake_with_legacy_agent_role() {
        let codec = FrameCodec::new();
        let frame = codec
            .decode(r#"{"type":"handshake","role":"infected","client_id":"a1"}"#)
            .unwrap();

        match frame {
            Frame::Handshake(handshake) => assert_eq!(handshake.role, Role::Agent),
            other => panic!("Expected handshake, got {:?}", other),
        }

        // Always written back out under the current name
        assert_eq!(serde_json::to_string(&Role::Agent).unwrap(), r#""agent""#);
    }

    #[test]
    fn test_decode_handshake_without_id() {
        let codec = FrameCodec::new();
        let frame = codec
            .decode(r#"{"type":"handshake","role":"controller"}"#)
            .unwrap();
        assert_eq!(frame, Frame::Handshake(Handshake::controller()));
    }

    #[test]
    fn test_decode_handshake_missing_role() {
        let codec = FrameCodec::new();
        let result = codec.decode(r#"{"type":"handshake","id":"c1"}"#);
        assert!(matches!(result, Err(CodecError::SerializationError(_))));
    }

    #[test]
    fn test_decode_unknown_role() {
        let codec = FrameCodec::new();
        let result = codec.decode(r#"{"type":"handshake","role":"observer"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_unknown_type() {
        let codec = FrameCodec::new();
        let result = codec.decode(r#"{"type":"send_executable","target":"a1"}"#);
        assert!(matches!(result, Err(CodecError::SerializationError(_))));
    }

    #[test]
    fn test_decode_not_json() {
        let codec = FrameCodec::new();
        assert!(codec.decode("not json at all").is_err());
        assert!(codec.decode("").is_err());
    }

    #[test]
    fn test_decode_command_with_legacy_field_names() {
        let codec = FrameCodec::new();
        let frame = codec
            .decode(r#"{"type":"command","target":"a1","command_type":"shell","command":"whoami"}"#)
            .unwrap();

        assert_eq!(
            frame,
            Frame::Command(CommandRequest {
                target: "a1".to_string(),
                kind: "shell".to_string(),
                payload: json!("whoami"),
            })
        );
    }

    #[test]
    fn test_decode_command_missing_payload() {
        let codec = FrameCodec::new();
        let result = codec.decode(r#"{"type":"command","target":"a1","kind":"shell"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_command_empty_target() {
        let codec = FrameCodec::new();
        let result = codec.decode(r#"{"type":"command","target":"","kind":"shell","payload":1}"#);
        assert!(matches!(result, Err(CodecError::InvalidFrame(_))));
    }

    #[test]
    fn test_decode_request_client_list() {
        let codec = FrameCodec::new();
        let frame = codec.decode(r#"{"type":"request_client_list"}"#).unwrap();
        assert_eq!(frame, Frame::RequestClientList);
    }

    #[test]
    fn test_encode_relayed_command_has_null_response() {
        let codec = FrameCodec::new();
        let record = crate::messages::CommandRecord {
            id: "r1".to_string(),
            origin: "c1".to_string(),
            target: "a1".to_string(),
            issued_at: chrono::Utc::now(),
            responded_at: None,
            kind: "shell".to_string(),
            payload: json!("whoami"),
            response: None,
        };

        let text = codec.encode(&Frame::RelayedCommand(record)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["type"], "relayed_command");
        assert_eq!(value["id"], "r1");
        assert_eq!(value["origin"], "c1");
        assert!(value["response"].is_null());
        assert!(value["responded_at"].is_null());
    }

    #[test]
    fn test_frame_too_large() {
        let codec = FrameCodec::with_max_frame_size(16);
        let result = codec.decode(r#"{"type":"request_client_list"}"#);
        assert!(matches!(result, Err(CodecError::FrameTooLarge(_))));

        let result = codec.encode(&Frame::Disconnect {
            reason: "a reason longer than sixteen bytes".to_string(),
        });
        assert!(matches!(result, Err(CodecError::FrameTooLarge(_))));
    }

    #[test]
    fn test_decode_bytes_invalid_utf8() {
        let codec = FrameCodec::new();
        let result = codec.decode_bytes(&[0xff, 0xfe, 0xfd]);
        assert!(matches!(result, Err(CodecError::InvalidUtf8)));
    }
}
