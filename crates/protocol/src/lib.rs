//! Gateway WebSocket frame protocol definitions.
//!
//! Protocol version 1. All communication uses newline-free JSON frames over
//! WebSocket text (or UTF-8 binary) messages.
//!
//! Frame types:
//! - `hello`       — client → gateway, first frame only (handshake)
//! - `hello-ok`    — gateway → client, handshake accepted (carries snapshot)
//! - `hello-error` — gateway → client, handshake rejected
//! - `req`         — client → gateway RPC call
//! - `res`         — gateway → client RPC result
//! - `event`       — gateway → client server-push

use serde::{Deserialize, Serialize};

pub mod schema;
pub mod validate;

/// Milliseconds since the Unix epoch, as carried in wire timestamps.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 18789;
pub const MAX_PAYLOAD_BYTES: usize = 524_288; // 512 KiB
pub const MAX_BUFFERED_BYTES: usize = 1_572_864; // 1.5 MiB
pub const HANDSHAKE_TIMEOUT_MS: u64 = 3_000; // 3s
pub const TICK_INTERVAL_MS: u64 = 30_000; // 30s
pub const DEDUPE_TTL_MS: u64 = 300_000; // 5 min
pub const DEDUPE_MAX_ENTRIES: usize = 1_000;
pub const DEDUPE_SWEEP_INTERVAL_MS: u64 = 60_000; // 60s
pub const PRESENCE_TTL_MS: u64 = 300_000; // 5 min
pub const PRESENCE_MAX_ENTRIES: usize = 200;

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const AGENT_TIMEOUT: &str = "AGENT_TIMEOUT";
    pub const NOT_LINKED: &str = "NOT_LINKED";

    pub const ALL: &[&str] = &[INVALID_REQUEST, UNAVAILABLE, AGENT_TIMEOUT, NOT_LINKED];
}

// ── Event names ──────────────────────────────────────────────────────────────

pub mod events {
    pub const TICK: &str = "tick";
    pub const PRESENCE: &str = "presence";
    pub const AGENT: &str = "agent";
    pub const SHUTDOWN: &str = "shutdown";

    pub const ALL: &[&str] = &[TICK, PRESENCE, AGENT, SHUTDOWN];
}

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_REQUEST, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            retryable: Some(true),
            retry_after_ms: Some(1_000),
            ..Self::new(error_codes::UNAVAILABLE, message)
        }
    }

    pub fn agent_timeout(message: impl Into<String>) -> Self {
        Self::new(error_codes::AGENT_TIMEOUT, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Discriminated union of all wire frames, tagged by the `type` member.
///
/// Every frame on the wire deserializes into exactly one variant; dispatch
/// sites match exhaustively so a new variant is a compile error until every
/// handler addresses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    #[serde(rename = "hello")]
    Hello(HelloParams),
    #[serde(rename = "hello-ok")]
    HelloOk(HelloOk),
    #[serde(rename = "hello-error")]
    HelloError(HelloError),
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl GatewayFrame {
    /// Serialize to the newline-free JSON wire form.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Client → gateway handshake, sent as the first frame of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    pub client: ClientDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caps: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    #[serde(rename = "instanceId", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Gateway → client, handshake accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloOk {
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    pub snapshot: Snapshot,
    pub policy: Policy,
}

/// Gateway → client, handshake rejected. The connection closes right after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloError {
    pub reason: String,
    #[serde(rename = "expectedProtocol", skip_serializing_if = "Option::is_none")]
    pub expected_protocol: Option<u32>,
}

impl HelloError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            expected_protocol: None,
        }
    }

    pub fn protocol_mismatch() -> Self {
        Self {
            reason: "protocol mismatch".into(),
            expected_protocol: Some(PROTOCOL_VERSION),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "connId")]
    pub conn_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

/// Complete view of presence + health + state versions at handshake time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub presence: Vec<PresenceEntry>,
    pub health: serde_json::Value,
    #[serde(rename = "stateVersion")]
    pub state_version: StateVersion,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersion {
    pub presence: u64,
    pub health: u64,
}

/// One known client/self node with metadata and a last-seen timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(rename = "lastInputSeconds", skip_serializing_if = "Option::is_none")]
    pub last_input_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub ts: u64,
    #[serde(rename = "instanceId", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "maxPayload")]
    pub max_payload: usize,
    #[serde(rename = "maxBufferedBytes")]
    pub max_buffered_bytes: usize,
    #[serde(rename = "tickIntervalMs")]
    pub tick_interval_ms: u64,
}

impl Policy {
    pub fn default_policy() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_BYTES,
            max_buffered_bytes: MAX_BUFFERED_BYTES,
            tick_interval_ms: TICK_INTERVAL_MS,
        }
    }
}

/// Client → gateway RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Gateway → client RPC response, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Gateway → client unsolicited server-push, ordered by `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(rename = "stateVersion", skip_serializing_if = "Option::is_none")]
    pub state_version: Option<StateVersion>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value, seq: u64) -> Self {
        Self {
            event: event.into(),
            payload: Some(payload),
            seq: Some(seq),
            state_version: None,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: GatewayFrame) -> GatewayFrame {
        let json = frame.to_json().unwrap();
        assert!(!json.contains('\n'), "frames must be newline-free");
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn hello_round_trips() {
        let frame = GatewayFrame::Hello(HelloParams {
            min_protocol: 1,
            max_protocol: 1,
            client: ClientDescriptor {
                name: "t".into(),
                version: "1".into(),
                platform: "test".into(),
                mode: "test".into(),
                instance_id: None,
            },
            caps: Some(vec![]),
            auth: Some(HelloAuth {
                token: Some("secret".into()),
            }),
        });
        assert_eq!(frame.clone(), round_trip(frame));
    }

    #[test]
    fn response_round_trips() {
        let frame = GatewayFrame::Response(ResponseFrame::err(
            "r1",
            ErrorShape::unavailable("delivery offline"),
        ));
        assert_eq!(frame.clone(), round_trip(frame));
    }

    #[test]
    fn event_round_trips_with_state_version() {
        let mut event = EventFrame::new("presence", serde_json::json!({ "presence": [] }), 7);
        event.state_version = Some(StateVersion {
            presence: 3,
            health: 1,
        });
        let frame = GatewayFrame::Event(event);
        assert_eq!(frame.clone(), round_trip(frame));
    }

    #[test]
    fn frames_carry_their_tag() {
        let json = GatewayFrame::HelloError(HelloError::protocol_mismatch())
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "hello-error");
        assert_eq!(value["expectedProtocol"], 1);
    }

    #[test]
    fn optional_members_are_omitted() {
        let json = GatewayFrame::Response(ResponseFrame::ok("a", serde_json::json!({})))
            .to_json()
            .unwrap();
        assert!(!json.contains("error"));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["id"], "a");
        assert_eq!(value["ok"], true);
    }
}
