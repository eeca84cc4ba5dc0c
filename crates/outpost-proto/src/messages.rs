//! Protocol message types
//!
//! Every control frame is a JSON object with a common envelope
//! (`type`, `id`, `timestamp`) plus type-specific fields. Binary payloads
//! (`tcp_data.data`, HTTP request bodies) are base64 strings on the wire.

use serde::{Deserialize, Serialize};

/// Common envelope carried by every control frame.
///
/// `id` is a per-frame unique string and `timestamp` is wall-clock
/// milliseconds at send time. The type-specific fields are flattened next to
/// the envelope fields, so the wire form is a single flat JSON object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// Wrap a message with a fresh frame id and the current timestamp.
    pub fn new(message: Message) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            message,
        }
    }
}

/// Control channel message, tagged by the wire `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    // Agent -> server
    Auth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    // Server -> agent
    AuthResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TunnelRequest {
        config: TunnelSpec,
    },
    TunnelResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tunnel_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TunnelClose {
        tunnel_id: String,
    },
    /// Server -> agent: a public HTTP request dispatched into the tunnel.
    /// The body, when present, is base64-encoded.
    HttpRequest {
        tunnel_id: String,
        request_id: String,
        method: String,
        path: String,
        headers: HeaderList,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "b64_option"
        )]
        body: Option<Vec<u8>>,
    },
    /// Agent -> server: the response for a previously dispatched request.
    /// `is_base64` says whether `body` was base64-encoded by the sender.
    HttpResponse {
        tunnel_id: String,
        request_id: String,
        status_code: u16,
        headers: HeaderList,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default)]
        is_base64: bool,
    },
    /// Bidirectional byte chunk of a public TCP sub-connection.
    TcpData {
        tunnel_id: String,
        connection_id: String,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    TcpClose {
        tunnel_id: String,
        connection_id: String,
    },
    Ping,
    Pong,
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl Message {
    /// Wire name of this message's `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "auth",
            Message::AuthResponse { .. } => "auth_response",
            Message::TunnelRequest { .. } => "tunnel_request",
            Message::TunnelResponse { .. } => "tunnel_response",
            Message::TunnelClose { .. } => "tunnel_close",
            Message::HttpRequest { .. } => "http_request",
            Message::HttpResponse { .. } => "http_response",
            Message::TcpData { .. } => "tcp_data",
            Message::TcpClose { .. } => "tcp_close",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Error { .. } => "error",
        }
    }
}

/// Wire `type` tags this protocol revision understands.
pub const KNOWN_TYPES: &[&str] = &[
    "auth",
    "auth_response",
    "tunnel_request",
    "tunnel_response",
    "tunnel_close",
    "http_request",
    "http_response",
    "tcp_data",
    "tcp_close",
    "ping",
    "pong",
    "error",
];

/// Ordered header list. Order and duplicates are preserved end to end.
pub type HeaderList = Vec<(String, String)>;

/// Look up the first header with the given name, case-insensitively.
pub fn header_get<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Tunnel protocol selector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    /// Public HTTP traffic forwarded to a plain-HTTP origin
    Http,
    /// Public HTTP traffic forwarded to an HTTPS origin
    Https,
    /// Raw TCP byte stream on a dedicated public port
    Tcp,
}

impl TunnelProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelProtocol::Http => "http",
            TunnelProtocol::Https => "https",
            TunnelProtocol::Tcp => "tcp",
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, TunnelProtocol::Http | TunnelProtocol::Https)
    }
}

impl std::fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent-supplied tunnel configuration inside `tunnel_request`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    /// Agent-side name for the tunnel (echoed back for correlation)
    pub id: String,
    pub protocol: TunnelProtocol,
    pub local_host: String,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
}

impl TunnelSpec {
    /// Local address the agent forwards to, in `host:port` form.
    pub fn local_address(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

/// Decode an `http_response` body into raw bytes, honoring `is_base64`.
pub fn decode_response_body(
    body: Option<&str>,
    is_base64: bool,
) -> Result<Option<Vec<u8>>, base64::DecodeError> {
    use base64::Engine;
    match body {
        None => Ok(None),
        Some(text) if is_base64 => base64::engine::general_purpose::STANDARD
            .decode(text)
            .map(Some),
        Some(text) => Ok(Some(text.as_bytes().to_vec())),
    }
}

/// Encode raw bytes for an `http_response` body (always base64).
pub fn encode_response_body(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

// Serde helpers for base64-encoded byte payloads
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

mod b64_option {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match data {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD
                .decode(text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_fields_are_flat() {
        let env = Envelope::new(Message::TunnelClose {
            tunnel_id: "t-1".to_string(),
        });
        let value: serde_json::Value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["type"], "tunnel_close");
        assert_eq!(value["tunnelId"], "t-1");
        assert!(value["id"].is_string());
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn test_tcp_data_is_base64_on_the_wire() {
        let env = Envelope::new(Message::TcpData {
            tunnel_id: "t-1".to_string(),
            connection_id: "c-1".to_string(),
            data: vec![0x00, 0xff, 0x10],
        });

        let value: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["data"], "AP8Q");

        let back: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn test_http_request_roundtrip() {
        let env = Envelope::new(Message::HttpRequest {
            tunnel_id: "t-1".to_string(),
            request_id: "r-1".to_string(),
            method: "POST".to_string(),
            path: "/api/items?page=2".to_string(),
            headers: vec![
                ("Host".to_string(), "web.op.example.com".to_string()),
                ("Set-Cookie".to_string(), "a=1".to_string()),
                ("Set-Cookie".to_string(), "b=2".to_string()),
            ],
            body: Some(b"{\"name\":\"x\"}".to_vec()),
        });

        let text = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(env, back);

        // duplicate headers keep their order
        if let Message::HttpRequest { headers, .. } = back.message {
            assert_eq!(headers[1].1, "a=1");
            assert_eq!(headers[2].1, "b=2");
        } else {
            panic!("expected HttpRequest");
        }
    }

    #[test]
    fn test_response_body_decoding() {
        let decoded = decode_response_body(Some("aGVsbG8="), true).unwrap();
        assert_eq!(decoded, Some(b"hello".to_vec()));

        let plain = decode_response_body(Some("hello"), false).unwrap();
        assert_eq!(plain, Some(b"hello".to_vec()));

        assert_eq!(decode_response_body(None, true).unwrap(), None);
        assert!(decode_response_body(Some("not!!base64"), true).is_err());
    }

    #[test]
    fn test_ping_has_no_extra_fields() {
        let env = Envelope::new(Message::Ping);
        let value: serde_json::Value = serde_json::to_value(&env).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 3); // type, id, timestamp
        assert_eq!(value["type"], "ping");
    }

    #[test]
    fn test_header_get_case_insensitive() {
        let headers = vec![
            ("Content-Type".to_string(), "text/plain".to_string()),
            ("X-Real-IP".to_string(), "10.0.0.1".to_string()),
        ];
        assert_eq!(header_get(&headers, "x-real-ip"), Some("10.0.0.1"));
        assert_eq!(header_get(&headers, "Host"), None);
    }

    #[test]
    fn test_type_name_matches_wire_tag() {
        let samples = vec![
            Message::Auth { token: None },
            Message::Ping,
            Message::TcpClose {
                tunnel_id: "t".to_string(),
                connection_id: "c".to_string(),
            },
        ];
        for msg in samples {
            let env = Envelope::new(msg);
            let value: serde_json::Value = serde_json::to_value(&env).unwrap();
            assert_eq!(value["type"], env.message.type_name());
            assert!(KNOWN_TYPES.contains(&env.message.type_name()));
        }
    }

    #[test]
    fn test_tunnel_spec_wire_names() {
        let spec = TunnelSpec {
            id: "web".to_string(),
            protocol: TunnelProtocol::Http,
            local_host: "127.0.0.1".to_string(),
            local_port: 3000,
            subdomain: Some("web".to_string()),
            remote_port: None,
        };
        let value: serde_json::Value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["localHost"], "127.0.0.1");
        assert_eq!(value["localPort"], 3000);
        assert_eq!(value["protocol"], "http");
        assert!(value.get("remotePort").is_none());
    }
}
