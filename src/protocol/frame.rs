//! Frame codec for the venue's text protocol
//!
//! Three wire shapes:
//! - request/response frames: JSON object `{"action", "message", "token", "ns"}`
//! - bare commands: JSON array, e.g. `["getBalance"]`
//! - envelope frames: short numeric framing prefix followed by a JSON
//!   array `[eventName, payload]`; a bare prefix is a transport-level
//!   control frame (connect/disconnect/ping/pong).

use crate::{ClientError, Result};
use serde_json::{json, Value};

/// Framing-layer prefix class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePrefix {
    Connect,
    Disconnect,
    Ping,
    Pong,
    Data,
}

impl FramePrefix {
    fn from_digit(d: u8) -> Option<Self> {
        match d {
            b'0' => Some(FramePrefix::Connect),
            b'1' => Some(FramePrefix::Disconnect),
            b'2' => Some(FramePrefix::Ping),
            b'3' => Some(FramePrefix::Pong),
            b'4' => Some(FramePrefix::Data),
            _ => None,
        }
    }
}

/// Decoded request/response object frame
#[derive(Debug, Clone)]
pub struct Envelope {
    pub action: Option<String>,
    pub ns: Option<u64>,
    /// Full frame body, delivered as-is to the waiting caller
    pub body: Value,
}

impl Envelope {
    /// `message` payload of the frame, or Null when absent
    pub fn message(&self) -> &Value {
        self.body.get("message").unwrap_or(&Value::Null)
    }
}

/// One decoded unit of data on the transport
#[derive(Debug, Clone)]
pub enum Frame {
    /// JSON object frame keyed by action/ns
    Message(Envelope),
    /// Prefixed `[eventName, payload]` data frame
    Event {
        prefix: FramePrefix,
        name: String,
        payload: Value,
    },
    /// Bare framing-layer control frame
    Control(FramePrefix),
}

/// Encode a request frame with correlation id and auth token
pub fn encode_request(action: &str, message: Value, token: &str, ns: u64) -> String {
    json!({
        "action": action,
        "message": message,
        "token": token,
        "ns": ns,
    })
    .to_string()
}

/// Encode a bare command frame, e.g. `["getBalance"]`
pub fn encode_command(name: &str) -> String {
    json!([name]).to_string()
}

/// Decode one inbound text frame
pub fn decode(raw: &str) -> Result<Frame> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ClientError::Protocol("empty frame".into()));
    }

    match trimmed.as_bytes()[0] {
        b'{' => decode_object(trimmed),
        b'0'..=b'9' => decode_prefixed(trimmed),
        _ => Err(ClientError::Protocol(format!(
            "unrecognized frame start: {}",
            truncate(trimmed)
        ))),
    }
}

fn decode_object(raw: &str) -> Result<Frame> {
    let body: Value = serde_json::from_str(raw)
        .map_err(|e| ClientError::Protocol(format!("invalid JSON frame: {e}")))?;

    let action = body
        .get("action")
        .and_then(Value::as_str)
        .map(str::to_string);
    let ns = decode_ns(body.get("ns"));

    Ok(Frame::Message(Envelope { action, ns, body }))
}

fn decode_prefixed(raw: &str) -> Result<Frame> {
    let digits = raw.bytes().take_while(u8::is_ascii_digit).count();
    let prefix = FramePrefix::from_digit(raw.as_bytes()[0]).ok_or_else(|| {
        ClientError::Protocol(format!("unknown framing prefix: {}", truncate(raw)))
    })?;

    let rest = &raw[digits..];
    if rest.is_empty() {
        return Ok(Frame::Control(prefix));
    }

    let parsed: Value = serde_json::from_str(rest)
        .map_err(|e| ClientError::Protocol(format!("invalid event frame: {e}")))?;
    let items = parsed
        .as_array()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| ClientError::Protocol("event frame is not an array".into()))?;
    let name = items[0]
        .as_str()
        .ok_or_else(|| ClientError::Protocol("event name is not a string".into()))?
        .to_string();
    let payload = items.get(1).cloned().unwrap_or(Value::Null);

    Ok(Frame::Event {
        prefix,
        name,
        payload,
    })
}

/// The venue echoes `ns` back as sent; accept both integer and numeric
/// string forms.
fn decode_ns(v: Option<&Value>) -> Option<u64> {
    match v? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn truncate(raw: &str) -> &str {
    &raw[..raw.len().min(64)]
}
