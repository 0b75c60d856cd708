//! Wire protocol for the native-messaging channel.
//!
//! Framing is the standard native-messaging format: a **4-byte length prefix**
//! (`u32`, native endianness) followed by that many bytes of UTF-8 JSON. This
//! crate sits on the extension side of the pipe, so the caps are the mirror of
//! a host's: incoming (host -> extension) messages are limited to 1 MiB,
//! outgoing (extension -> host) to 64 MiB.
//!
//! On top of the framing live the envelope types: every outgoing message
//! carries a numeric `id` and a `type` tag; inbound traffic is either a
//! response correlated by `id`, or a push (`settings`, `bankingSession`)
//! that is never correlated, or a bare `server` identity marker.

use std::collections::BTreeMap;
use std::io::{self, Read};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum size of a message received from the host (host -> extension).
pub const MAX_INBOUND: usize = 1_048_576; // 1 MiB
/// Maximum size of a message sent to the host (extension -> host).
pub const MAX_OUTBOUND: usize = 64 * 1_048_576; // 64 MiB

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("outgoing message exceeds {max} bytes (got {len})")]
    OutboundTooLarge { len: usize, max: usize },
    #[error("incoming message exceeds {max} bytes (got {len})")]
    InboundTooLarge { len: usize, max: usize },
    #[error("i/o failure on native messaging pipe")]
    Io(#[from] io::Error),
    #[error("malformed JSON payload")]
    Json(#[from] serde_json::Error),
}

/// Encode a serializable value into a native-messaging frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(msg)?;
    if json.len() > MAX_OUTBOUND {
        return Err(CodecError::OutboundTooLarge {
            len: json.len(),
            max: MAX_OUTBOUND,
        });
    }
    let mut out = Vec::with_capacity(4 + json.len());
    out.extend_from_slice(&(json.len() as u32).to_ne_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// Decode a single frame from a blocking reader (useful in tests).
pub fn decode_frame<R: Read>(reader: &mut R, max_size: usize) -> Result<Value, CodecError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_ne_bytes(len_buf) as usize;
    let cap = max_size.min(MAX_INBOUND);
    if len > cap {
        return Err(CodecError::InboundTooLarge { len, max: cap });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Read one frame from an async reader. Returns `Ok(None)` on clean EOF,
/// which is how the host signals disconnect.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Value>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_ne_bytes(len_buf) as usize;
    if len > MAX_INBOUND {
        return Err(CodecError::InboundTooLarge {
            len,
            max: MAX_INBOUND,
        });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

/// Write one frame to an async writer and flush it.
pub async fn write_frame<W>(writer: &mut W, msg: &Value) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Message types understood by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "init")]
    Init,
    #[serde(rename = "scanrequest")]
    ScanRequest,
    #[serde(rename = "orspinfo")]
    OrspInfo,
    #[serde(rename = "ratingrequest")]
    RatingRequest,
    #[serde(rename = "checkwhitelist")]
    CheckWhitelist,
    #[serde(rename = "allowdomain")]
    AllowDomain,
    #[serde(rename = "userRating")]
    UserRating,
    #[serde(rename = "tabinfo")]
    TabInfo,
    #[serde(rename = "referrer")]
    Referrer,
    #[serde(rename = "DebugInfo")]
    DebugInfo,
}

impl MessageType {
    pub fn wire_name(self) -> &'static str {
        match self {
            MessageType::Init => "init",
            MessageType::ScanRequest => "scanrequest",
            MessageType::OrspInfo => "orspinfo",
            MessageType::RatingRequest => "ratingrequest",
            MessageType::CheckWhitelist => "checkwhitelist",
            MessageType::AllowDomain => "allowdomain",
            MessageType::UserRating => "userRating",
            MessageType::TabInfo => "tabinfo",
            MessageType::Referrer => "referrer",
            MessageType::DebugInfo => "DebugInfo",
        }
    }

    /// Types that must never hit the wire before the initialization
    /// handshake completes; they can trigger a block page, which needs
    /// customization details only available after init.
    pub fn requires_init(self) -> bool {
        matches!(
            self,
            MessageType::ScanRequest | MessageType::OrspInfo | MessageType::RatingRequest
        )
    }
}

/// Scan request flavors; the host dispatches on the numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRequestType {
    Primary,
    PrimaryNoBanking,
    Banking,
    BankingPreview,
    BankingTrigger,
}

impl ScanRequestType {
    pub fn code(self) -> i32 {
        match self {
            ScanRequestType::Primary => 1,
            ScanRequestType::PrimaryNoBanking => 3,
            ScanRequestType::Banking => 4,
            ScanRequestType::BankingPreview => 6,
            ScanRequestType::BankingTrigger => 7,
        }
    }
}

/// An outgoing message before the bridge stamps an id on it.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    ty: MessageType,
    body: Map<String, Value>,
}

impl OutboundMessage {
    pub fn new(ty: MessageType) -> Self {
        Self {
            ty,
            body: Map::new(),
        }
    }

    /// Attach a top-level payload field next to `id` and `type`.
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.body.insert(key.to_string(), value);
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.ty
    }

    /// Finalize into the wire envelope `{ id, type, <payload> }`.
    pub fn into_wire(self, id: u64) -> Value {
        let mut body = self.body;
        body.insert("id".to_string(), Value::from(id));
        body.insert(
            "type".to_string(),
            Value::from(self.ty.wire_name().to_string()),
        );
        Value::Object(body)
    }
}

/// A response delivered to a caller of the bridge. Always carries the id of
/// the request it answers; a body containing nothing but that id means the
/// host had nothing meaningful to say (or the connection dropped).
#[derive(Debug, Clone)]
pub struct Response {
    pub id: u64,
    pub body: Value,
}

impl Response {
    /// Synthetic response generated when a request cannot be answered.
    pub fn empty(id: u64) -> Self {
        let mut body = Map::new();
        body.insert("id".to_string(), Value::from(id));
        Self {
            id,
            body: Value::Object(body),
        }
    }

    /// True when the body carries only the correlation id.
    pub fn is_empty(&self) -> bool {
        match &self.body {
            Value::Object(map) => map.len() == 1 && map.contains_key("id"),
            _ => false,
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Deserialize the body into a typed view; malformed payloads yield
    /// `None` so callers fall back to defaults instead of failing.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.body.clone()).ok()
    }
}

/// Classification of one inbound message.
#[derive(Debug)]
pub enum Inbound {
    /// Numeric id: a response to a pending request.
    Response(Response),
    /// Settings push; carries the raw settings object.
    SettingsPush(Value),
    /// Banking-mode push.
    BankingPush(BankingSession),
    /// Anything else (e.g. a bare server identity marker).
    Other(Value),
}

/// Sort an inbound message into the response/push buckets. The `settings`
/// and `bankingSession` markers identify pushes that must never be matched
/// against pending requests; everything with a numeric id is a response.
pub fn classify(msg: Value) -> Inbound {
    let id = msg.get("id").cloned();
    match id {
        Some(Value::Number(n)) => Inbound::Response(Response {
            id: n.as_u64().unwrap_or(0),
            body: msg,
        }),
        Some(Value::String(s)) if s == "settings" => {
            let settings = msg.get("settings").cloned().unwrap_or(Value::Null);
            Inbound::SettingsPush(settings)
        }
        Some(Value::String(s)) if s == "bankingSession" => {
            let session = msg
                .get("bankingSession")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            Inbound::BankingPush(session)
        }
        _ => {
            if let Some(settings) = msg.get("settings") {
                Inbound::SettingsPush(settings.clone())
            } else {
                Inbound::Other(msg)
            }
        }
    }
}

/// Extract the host identity marker, present on most host messages.
pub fn server_identity(msg: &Value) -> Option<&str> {
    msg.get("server").and_then(Value::as_str)
}

/// How and why a page is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Allowed,
    Banking,
    Category,
    Child,
    Denied,
    General,
    Harmful,
    Illegal,
    Suspicious,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockDescriptor {
    #[serde(rename = "type")]
    pub kind: BlockType,
    #[serde(default)]
    pub url: Option<String>,
}

/// Category data from the reputation service: a list of single-entry maps,
/// e.g. `[{"safe": 100}, {"shopping": 100}, {"trustworthiness": 4}]`.
pub type CategoryList = Vec<BTreeMap<String, i64>>;

/// Value of the first category entry carrying `name`, if any.
pub fn category_value(name: &str, categories: &CategoryList) -> Option<i64> {
    categories
        .iter()
        .find_map(|entry| entry.get(name).copied())
}

/// Parsed scan / reputation verdict.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScanVerdict {
    #[serde(default)]
    pub block: Option<BlockDescriptor>,
    #[serde(rename = "ORSPData", default)]
    pub orsp_data: CategoryList,
    #[serde(rename = "isWhitelisted", default)]
    pub is_whitelisted: bool,
    #[serde(rename = "isBlacklisted", default)]
    pub is_blacklisted: bool,
}

/// Product settings pushed by the host. Unknown fields are ignored; fields
/// missing from a push keep their previous values (see [`Settings::merge`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub safe_search: bool,
    #[serde(default)]
    pub search_results: bool,
    #[serde(default)]
    pub block_ads: bool,
    #[serde(default)]
    pub trusted_shopping: bool,
    #[serde(default = "default_true")]
    pub trusted_shopping_popup_safe: bool,
    #[serde(default = "default_true")]
    pub trusted_shopping_popup_suspicious: bool,
    #[serde(default)]
    pub browsing_protection: bool,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub consent_manager: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            safe_search: false,
            search_results: false,
            block_ads: false,
            trusted_shopping: false,
            trusted_shopping_popup_safe: true,
            trusted_shopping_popup_suspicious: true,
            browsing_protection: false,
            debug_mode: false,
            consent_manager: false,
        }
    }
}

impl Settings {
    /// Overlay a (possibly partial) settings object onto the current values.
    pub fn merge(&mut self, patch: &Value) {
        let mut current = match serde_json::to_value(&*self) {
            Ok(Value::Object(map)) => map,
            _ => return,
        };
        if let Value::Object(incoming) = patch {
            for (key, value) in incoming {
                current.insert(key.clone(), value.clone());
            }
        }
        if let Ok(merged) = serde_json::from_value(Value::Object(current)) {
            *self = merged;
        }
    }
}

/// Banking-mode push payload.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct BankingSession {
    #[serde(default)]
    pub active: bool,
}

/// Tab lifecycle notifications sent alongside `tabinfo` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TabAction {
    Open,
    Complete,
    Close,
}
