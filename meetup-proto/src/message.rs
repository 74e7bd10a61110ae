//! Signaling message envelope
//!
//! Every frame on the signaling connection is one JSON object tagged by
//! `type`:
//!
//! ```json
//! {"type":"request","id":7,"method":"produce","data":{}}
//! {"type":"response","id":7,"ok":true,"data":{}}
//! {"type":"response","id":7,"ok":false,"errorCode":409,"errorReason":"..."}
//! {"type":"notification","method":"peerClosed","data":{}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One signaling frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// A request expecting exactly one response with the same `id`
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        data: Value,
    },

    /// Answer to a request
    Response {
        id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
        #[serde(rename = "errorCode", default, skip_serializing_if = "Option::is_none")]
        error_code: Option<i32>,
        #[serde(rename = "errorReason", default, skip_serializing_if = "Option::is_none")]
        error_reason: Option<String>,
    },

    /// Fire-and-forget message, no response
    Notification {
        method: String,
        #[serde(default)]
        data: Value,
    },
}

impl Message {
    pub fn request(id: u64, method: impl Into<String>, data: Value) -> Self {
        Self::Request {
            id,
            method: method.into(),
            data,
        }
    }

    pub fn success(id: u64, data: Value) -> Self {
        Self::Response {
            id,
            ok: true,
            data,
            error_code: None,
            error_reason: None,
        }
    }

    pub fn error(id: u64, code: i32, reason: impl Into<String>) -> Self {
        Self::Response {
            id,
            ok: false,
            data: Value::Null,
            error_code: Some(code),
            error_reason: Some(reason.into()),
        }
    }

    pub fn notification(method: impl Into<String>, data: Value) -> Self {
        Self::Notification {
            method: method.into(),
            data,
        }
    }

    /// Method name for requests and notifications
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    /// Encode as a text frame
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a text frame
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
