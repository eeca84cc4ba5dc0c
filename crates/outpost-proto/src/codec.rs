//! JSON frame codec for the control channel
//!
//! Frames are whole WebSocket text messages, so the codec only handles the
//! JSON body. Unknown `type` tags are reported separately from malformed
//! JSON: a session logs and drops unknown types but stays up.

use crate::messages::{Envelope, KNOWN_TYPES};
use crate::MAX_FRAME_BYTES;
use thiserror::Error;

/// Frame codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown message type `{type_name}`")]
    UnknownType { type_name: String },

    #[error("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    Oversized { len: usize },
}

/// Encode a message envelope into its wire form.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Decode a wire frame into a message envelope.
///
/// Fails with [`CodecError::UnknownType`] when the frame is valid JSON with
/// a `type` tag this protocol revision does not know. Anything else that
/// cannot be parsed is [`CodecError::Malformed`].
pub fn decode(text: &str) -> Result<Envelope, CodecError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(CodecError::Oversized { len: text.len() });
    }

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let type_name = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| CodecError::Malformed("missing `type` field".to_string()))?;

    if !KNOWN_TYPES.contains(&type_name) {
        return Err(CodecError::UnknownType {
            type_name: type_name.to_string(),
        });
    }

    serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, TunnelProtocol, TunnelSpec};

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Auth {
                token: Some("secret".to_string()),
            },
            Message::AuthResponse {
                success: true,
                client_id: Some("client-1".to_string()),
                error: None,
            },
            Message::TunnelRequest {
                config: TunnelSpec {
                    id: "web".to_string(),
                    protocol: TunnelProtocol::Http,
                    local_host: "127.0.0.1".to_string(),
                    local_port: 3000,
                    subdomain: Some("web".to_string()),
                    remote_port: None,
                },
            },
            Message::TunnelResponse {
                success: false,
                tunnel_id: None,
                public_url: None,
                error: Some("subdomain 'web' is in use".to_string()),
            },
            Message::TunnelClose {
                tunnel_id: "t-1".to_string(),
            },
            Message::HttpRequest {
                tunnel_id: "t-1".to_string(),
                request_id: "r-1".to_string(),
                method: "GET".to_string(),
                path: "/hello".to_string(),
                headers: vec![("Host".to_string(), "web.op.example.com".to_string())],
                body: None,
            },
            Message::HttpResponse {
                tunnel_id: "t-1".to_string(),
                request_id: "r-1".to_string(),
                status_code: 200,
                headers: vec![("Content-Type".to_string(), "application/json".to_string())],
                body: Some("eyJvayI6dHJ1ZX0=".to_string()),
                is_base64: true,
            },
            Message::TcpData {
                tunnel_id: "t-2".to_string(),
                connection_id: "c-1".to_string(),
                data: vec![1, 2, 3],
            },
            Message::TcpClose {
                tunnel_id: "t-2".to_string(),
                connection_id: "c-1".to_string(),
            },
            Message::Ping,
            Message::Pong,
            Message::Error {
                error: "boom".to_string(),
                code: Some("internal".to_string()),
            },
        ]
    }

    #[test]
    fn test_decode_encode_roundtrip_all_types() {
        for msg in sample_messages() {
            let env = Envelope::new(msg);
            let wire = encode(&env).unwrap();
            let back = decode(&wire).unwrap();
            assert_eq!(env, back, "roundtrip failed for {}", back.message.type_name());
        }
    }

    #[test]
    fn test_encode_decode_preserves_wire_form() {
        // Well-formed frames survive a decode/encode cycle semantically intact.
        let wire = r#"{"type":"tunnel_close","id":"f-1","timestamp":1700000000000,"tunnelId":"t-9"}"#;
        let env = decode(wire).unwrap();
        let reencoded = encode(&env).unwrap();

        let before: serde_json::Value = serde_json::from_str(wire).unwrap();
        let after: serde_json::Value = serde_json::from_str(&reencoded).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_unknown_type_is_distinguished() {
        let wire = r#"{"type":"telemetry","id":"f-1","timestamp":0}"#;
        match decode(wire) {
            Err(CodecError::UnknownType { type_name }) => assert_eq!(type_name, "telemetry"),
            other => panic!("expected UnknownType, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_type_is_malformed() {
        assert!(matches!(
            decode(r#"{"id":"f-1","timestamp":0}"#),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(decode("not json"), Err(CodecError::Malformed(_))));
        assert!(matches!(decode(""), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_bad_field_type_is_malformed() {
        // known type but wrong field shape
        let wire = r#"{"type":"tunnel_close","id":"f-1","timestamp":0,"tunnelId":7}"#;
        assert!(matches!(decode(wire), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let huge = format!(
            r#"{{"type":"ping","id":"f","timestamp":0,"pad":"{}"}}"#,
            "x".repeat(MAX_FRAME_BYTES)
        );
        assert!(matches!(
            decode(&huge),
            Err(CodecError::Oversized { .. })
        ));
    }
}
