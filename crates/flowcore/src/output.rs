use crate::error::ConversionError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Longest text rendering of an object or byte payload before it is cut off
pub const MAX_TEXT_LENGTH: usize = 10240;

/// HTTP-style status codes used throughout the hub
pub mod status {
    pub const OK: u16 = 200;
    pub const ACCEPTED: u16 = 202;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const CONFLICT: u16 = 409;
    pub const GONE: u16 = 410;
    pub const EXPECTATION_FAILED: u16 = 417;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const NOT_IMPLEMENTED: u16 = 501;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Payload of an [`Output`]; the variant fully determines how it is read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Payload {
    Empty,
    Error(String),
    Plain(String),
    Bytes(Vec<u8>),
    Object(serde_json::Value),
    Integer(i64),
    Float(f64),
}

/// Payload discriminant, also used as the persisted kind column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Empty,
    Error,
    Plain,
    Bytes,
    Object,
    Integer,
    Float,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Empty => "empty",
            OutputKind::Error => "error",
            OutputKind::Plain => "plain",
            OutputKind::Bytes => "bytes",
            OutputKind::Object => "object",
            OutputKind::Integer => "integer",
            OutputKind::Float => "float",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        let kind = match kind {
            "empty" => OutputKind::Empty,
            "error" => OutputKind::Error,
            "plain" => OutputKind::Plain,
            "bytes" => OutputKind::Bytes,
            "object" => OutputKind::Object,
            "integer" => OutputKind::Integer,
            "float" => OutputKind::Float,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result envelope exchanged between operators, flows, the store and transports.
///
/// An `Output` is immutable once built: the builder-style methods consume
/// the value and return a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    payload: Payload,
    status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
}

impl Output {
    fn new(payload: Payload, status: u16) -> Self {
        Self {
            payload,
            status,
            content_type: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Payload::Empty, status::OK)
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::new(Payload::Error(message.into()), code)
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(Payload::Plain(text.into()), status::OK)
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Payload::Bytes(data.into()), status::OK)
    }

    pub fn bytes_with_content_type(data: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self::bytes(data).with_content_type(content_type)
    }

    /// Serializes any value into an object payload. A value that cannot be
    /// represented as JSON produces an internal error output instead.
    pub fn object<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(json) => Self::json(json),
            Err(e) => Self::error(
                status::INTERNAL_SERVER_ERROR,
                format!("Output cannot be serialized: {}", e),
            ),
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::new(Payload::Object(value), status::OK)
    }

    pub fn integer(value: i64) -> Self {
        Self::new(Payload::Integer(value), status::OK)
    }

    pub fn float(value: f64) -> Self {
        Self::new(Payload::Float(value), status::OK)
    }

    pub fn with_status(mut self, code: u16) -> Self {
        self.status = code;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn kind(&self) -> OutputKind {
        match self.payload {
            Payload::Empty => OutputKind::Empty,
            Payload::Error(_) => OutputKind::Error,
            Payload::Plain(_) => OutputKind::Plain,
            Payload::Bytes(_) => OutputKind::Bytes,
            Payload::Object(_) => OutputKind::Object,
            Payload::Integer(_) => OutputKind::Integer,
            Payload::Float(_) => OutputKind::Float,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    /// Explicitly assigned content type, if any
    pub fn explicit_content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Content type to announce to a transport; inferred from the kind when
    /// none was assigned.
    pub fn content_type(&self) -> &str {
        if let Some(ct) = &self.content_type {
            return ct;
        }
        match self.payload {
            Payload::Empty | Payload::Error(_) | Payload::Plain(_) => "text/plain; charset=utf-8",
            Payload::Integer(_) | Payload::Float(_) => "text/plain; charset=utf-8",
            Payload::Object(_) => "application/json",
            Payload::Bytes(_) => "application/octet-stream",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, Payload::Error(_))
    }

    pub fn is_empty(&self) -> bool {
        match &self.payload {
            Payload::Empty => true,
            Payload::Plain(text) => text.is_empty(),
            Payload::Bytes(data) => data.is_empty(),
            _ => false,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.payload {
            Payload::Error(message) => Some(message),
            _ => None,
        }
    }

    pub fn is_form_data(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.split(';').next().unwrap_or("").trim() == FORM_CONTENT_TYPE)
            .unwrap_or(false)
    }

    /// Human-readable rendering; objects and bytes are truncated to
    /// [`MAX_TEXT_LENGTH`].
    pub fn to_text(&self) -> String {
        match &self.payload {
            Payload::Empty => String::new(),
            Payload::Error(message) => message.clone(),
            Payload::Plain(text) => text.clone(),
            Payload::Integer(value) => value.to_string(),
            Payload::Float(value) => value.to_string(),
            Payload::Bytes(data) => {
                let cut = data.len().min(MAX_TEXT_LENGTH);
                String::from_utf8_lossy(&data[..cut]).into_owned()
            }
            Payload::Object(value) => {
                let text = serde_json::to_string_pretty(value).unwrap_or_default();
                truncate(text, MAX_TEXT_LENGTH)
            }
        }
    }

    /// Full serialization of the payload, as sent over the wire
    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.payload {
            Payload::Bytes(data) => data.clone(),
            Payload::Object(value) => serde_json::to_vec(value).unwrap_or_default(),
            Payload::Empty => Vec::new(),
            Payload::Error(message) | Payload::Plain(message) => message.clone().into_bytes(),
            Payload::Integer(value) => value.to_string().into_bytes(),
            Payload::Float(value) => value.to_string().into_bytes(),
        }
    }

    /// Payload as a JSON value. Text and bytes holding JSON are parsed,
    /// anything else becomes a JSON string.
    pub fn to_json(&self) -> serde_json::Value {
        match &self.payload {
            Payload::Empty => serde_json::Value::Null,
            Payload::Object(value) => value.clone(),
            Payload::Integer(value) => serde_json::Value::from(*value),
            Payload::Float(value) => serde_json::Value::from(*value),
            Payload::Error(message) => serde_json::Value::String(message.clone()),
            Payload::Plain(text) => serde_json::from_str(text)
                .unwrap_or_else(|_| serde_json::Value::String(text.clone())),
            Payload::Bytes(data) => serde_json::from_slice(data).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(data).into_owned())
            }),
        }
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, ConversionError> {
        match &self.payload {
            Payload::Object(value) => Ok(T::deserialize(value)?),
            Payload::Plain(text) => Ok(serde_json::from_str(text)?),
            Payload::Bytes(data) => Ok(serde_json::from_slice(data)?),
            Payload::Integer(value) => Ok(T::deserialize(serde_json::Value::from(*value))?),
            Payload::Float(value) => Ok(T::deserialize(serde_json::Value::from(*value))?),
            Payload::Empty | Payload::Error(_) => Err(ConversionError::Unsupported(self.kind())),
        }
    }

    /// Flattens the payload into `dotted.key -> string` pairs so it can feed
    /// another operation's arguments.
    pub fn to_args_map(&self) -> Result<BTreeMap<String, String>, ConversionError> {
        if self.is_form_data() {
            let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(&self.to_bytes())?;
            return Ok(pairs.into_iter().collect());
        }
        let value = match &self.payload {
            Payload::Empty => return Ok(BTreeMap::new()),
            Payload::Object(value) => value.clone(),
            Payload::Plain(text) => serde_json::from_str(text)?,
            Payload::Bytes(data) => serde_json::from_slice(data)?,
            _ => return Err(ConversionError::Unsupported(self.kind())),
        };
        if !value.is_object() {
            return Err(ConversionError::NotAMap);
        }
        let mut flat = BTreeMap::new();
        flatten_into(&mut flat, String::new(), &value);
        Ok(flat)
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_error() {
            write!(f, "Error {}: {}", self.status, self.to_text())
        } else {
            f.write_str(&self.to_text())
        }
    }
}

impl From<String> for Output {
    fn from(text: String) -> Self {
        Output::plain(text)
    }
}

impl From<&str> for Output {
    fn from(text: &str) -> Self {
        Output::plain(text)
    }
}

impl From<serde_json::Value> for Output {
    fn from(value: serde_json::Value) -> Self {
        Output::json(value)
    }
}

fn truncate(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text
}

fn flatten_into(out: &mut BTreeMap<String, String>, prefix: String, value: &serde_json::Value) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", prefix, key)
        }
    };
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                flatten_into(out, join(key), nested);
            }
        }
        serde_json::Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                flatten_into(out, join(&index.to_string()), nested);
            }
        }
        serde_json::Value::String(text) => {
            out.insert(prefix, text.clone());
        }
        serde_json::Value::Null => {
            out.insert(prefix, String::new());
        }
        other => {
            out.insert(prefix, other.to_string());
        }
    }
}
