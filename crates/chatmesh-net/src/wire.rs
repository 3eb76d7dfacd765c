//! Wire format: newline-delimited JSON records.
//!
//! Two shapes travel over every session:
//!
//! ```text
//! Request:  {"action": "...", "payload": {...} | null}
//! Response: {"action": "...", "status": "success" | "error", "message": "...", "data": {...} | null}
//! ```
//!
//! A record carrying a `status` field is a response; anything else with an
//! `action` is a request.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NetError, Result};

/// Key under which responses echo the caller's correlation id.
pub const CORRELATION_KEY: &str = "correlationId";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl Request {
    pub fn new(action: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            action: action.into(),
            payload,
        }
    }

    /// A payload field, if the payload is an object carrying it.
    pub fn payload_field(&self, key: &str) -> Option<&Value> {
        self.payload.as_ref().and_then(|p| p.get(key))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub action: String,
    pub status: Status,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Response {
    pub fn success(action: impl Into<String>, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            action: action.into(),
            status: Status::Success,
            message: message.into(),
            data,
        }
    }

    pub fn error(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            status: Status::Error,
            message: message.into(),
            data: None,
        }
    }

    /// Success response whose data is the JSON form of `data`.
    pub fn with_data<T: Serialize>(action: impl Into<String>, data: &T) -> Result<Self> {
        Ok(Self::success(action, "ok", Some(serde_json::to_value(data)?)))
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// The correlation id echoed in `data`, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get(CORRELATION_KEY))
            .and_then(Value::as_str)
    }

    /// Decode `data` into a typed reply.
    ///
    /// An error status is surfaced as [`NetError::Remote`].
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T> {
        if !self.is_success() {
            return Err(NetError::Remote {
                action: self.action.clone(),
                message: self.message.clone(),
            });
        }
        let data = self.data.clone().ok_or_else(|| NetError::InvalidPayload {
            action: self.action.clone(),
            reason: "response carries no data".into(),
        })?;
        serde_json::from_value(data).map_err(|e| NetError::InvalidPayload {
            action: self.action.clone(),
            reason: e.to_string(),
        })
    }
}

/// One line read off a session.
#[derive(Clone, Debug, PartialEq)]
pub enum WireMessage {
    Request(Request),
    Response(Response),
}

impl WireMessage {
    /// Classify and decode a single line.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line.trim())?;
        if value.get("status").is_some() {
            return Ok(WireMessage::Response(serde_json::from_value(value)?));
        }
        match value.get("action") {
            Some(Value::String(_)) => Ok(WireMessage::Request(serde_json::from_value(value)?)),
            _ => Err(NetError::Protocol(
                "record has neither a status nor an action".into(),
            )),
        }
    }

    /// Encode as one line, without the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        Ok(match self {
            WireMessage::Request(r) => serde_json::to_string(r)?,
            WireMessage::Response(r) => serde_json::to_string(r)?,
        })
    }

    pub fn action(&self) -> &str {
        match self {
            WireMessage::Request(r) => &r.action,
            WireMessage::Response(r) => &r.action,
        }
    }
}

impl From<Request> for WireMessage {
    fn from(r: Request) -> Self {
        WireMessage::Request(r)
    }
}

impl From<Response> for WireMessage {
    fn from(r: Response) -> Self {
        WireMessage::Response(r)
    }
}
