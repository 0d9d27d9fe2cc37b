use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Display protocol carried over a proxied connection.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vnc,
    Spice,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vnc => "vnc",
            Protocol::Spice => "spice",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    Standalone,
    Pool,
}

/// One entry of the VM inventory returned by the management service at login.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(rename = "type")]
    pub vm_type: VmType,
}

/// Host/port/password tuple a client needs to reach one display server.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub password: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct LoginResponse {
    /// Bearer presented on subsequent REST calls and WebSocket upgrades.
    pub token: String,
    pub vms: Vec<VmInfo>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct RefreshResponse {
    pub token: String,
    pub vms: Vec<VmInfo>,
}

/// Rendering preferences forwarded verbatim to the SPICE connection-info call.
#[derive(Clone, Debug, Default, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SpiceRendering {
    #[serde(default)]
    pub color_depth: Option<u8>,
    #[serde(default)]
    pub streaming: Option<bool>,
}

/// Connection parameters handed to the browser SDK.
///
/// The password here is the one the display server expects; the proxy hands
/// back the same value on every call for the lifetime of the session.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub host: String,
    pub port: u16,
    pub password: String,
    /// Short-lived display bearer usable directly in the WebSocket URL.
    pub token: String,
    pub ws_path: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmConnectionCount {
    pub vm_id: String,
    pub connections: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub id: String,
    pub vm_id: String,
    pub protocol: Protocol,
    pub upstream: String,
    #[serde(default)]
    pub client: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total: usize,
    pub by_vm: Vec<VmConnectionCount>,
    pub connections: Vec<ConnectionSummary>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

/// In-band control message a client may send as a text frame.
///
/// Text frames that fail to parse into this shape are treated as raw payload
/// (legacy SDKs send the RFB version string as text).
#[derive(Debug, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub level: Option<u8>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Serialize)]
struct PongFrame {
    #[serde(rename = "type")]
    typ: &'static str,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct ErrorFrame<'a> {
    #[serde(rename = "type")]
    typ: &'static str,
    message: &'a str,
}

/// Serialized `{"type":"pong","timestamp":..}` reply.
pub fn pong_text() -> String {
    let frame = PongFrame {
        typ: "pong",
        timestamp: Utc::now().timestamp_millis(),
    };
    serde_json::to_string(&frame).unwrap_or_else(|_| r#"{"type":"pong"}"#.to_string())
}

/// Serialized `{"type":"error","message":..}` frame sent before a close.
pub fn error_text(message: &str) -> String {
    let frame = ErrorFrame {
        typ: "error",
        message,
    };
    serde_json::to_string(&frame)
        .unwrap_or_else(|_| r#"{"type":"error","message":"internal error"}"#.to_string())
}
