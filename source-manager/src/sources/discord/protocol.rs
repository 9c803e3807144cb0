//! Gateway wire format: opcodes, inbound payload shape and outbound builders.

use serde::Deserialize;
use serde_json::{json, Value};

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";
pub const GATEWAY_QUERY: &str = "v=10&encoding=json";

/// GUILDS (1 << 0) | GUILD_MESSAGES (1 << 9)
pub const DEFAULT_INTENTS: u64 = (1 << 0) | (1 << 9);

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_RESUME: u8 = 6;
pub const OP_RECONNECT: u8 = 7;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

/// Inbound gateway frame.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayPayload {
    /// `d.heartbeat_interval` of a HELLO frame, in milliseconds.
    pub fn heartbeat_interval(&self) -> Option<u64> {
        self.d.get("heartbeat_interval").and_then(Value::as_u64)
    }
}

/// Appends the version/encoding query to a gateway base URL.
pub fn gateway_endpoint(base: &str) -> String {
    format!("{}/?{}", base.trim_end_matches('/'), GATEWAY_QUERY)
}

pub fn heartbeat(sequence: Option<u64>) -> Value {
    json!({ "op": OP_HEARTBEAT, "d": sequence })
}

pub fn identify(token: &str, intents: u64) -> Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": intents,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "sourcebus",
                "device": "sourcebus"
            }
        }
    })
}

pub fn resume(token: &str, session_id: &str, sequence: Option<u64>) -> Value {
    json!({
        "op": OP_RESUME,
        "d": {
            "token": token,
            "session_id": session_id,
            "seq": sequence
        }
    })
}
