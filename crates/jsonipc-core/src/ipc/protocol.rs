//! Jsonipc wire envelopes.
//!
//! One WebSocket text message carries exactly one JSON envelope:
//!
//! ```text
//! call:  {"id": 10001, "this": 42, "method": "getName", "args": []}
//! reply: {"id": 10001, "result": "demo"}
//! reply: {"id": 10001, "error": {"code": "NotFound", "message": "no such method"}}
//! ```

use crate::{JsonipcError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Correlation identifier linking a call to its reply.
pub type CallId = u64;

/// Engine-assigned identifier of a remote object.
pub type ObjectId = u64;

/// Outbound call envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub id: CallId,
    /// Target object, `null` for the bootstrap call.
    pub this: Option<ObjectId>,
    pub method: String,
    pub args: Vec<Value>,
}

impl CallEnvelope {
    pub fn new(
        id: CallId,
        this: Option<ObjectId>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            id,
            this,
            method: method.into(),
            args,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Inbound reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFault>,
}

impl ReplyEnvelope {
    pub fn success(id: CallId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: CallId, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RemoteFault {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Settle the reply: an `error` member wins over `result`, and a missing
    /// result resolves to `null`.
    pub fn into_outcome(self) -> Result<Value> {
        match self.error {
            Some(fault) => Err(JsonipcError::Remote {
                code: fault.code,
                message: fault.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Error object carried by a failed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFault {
    #[serde(deserialize_with = "code_as_string")]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Engines report codes as strings; JSON-RPC style peers use numbers.
fn code_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Code {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Code::deserialize(deserializer)? {
        Code::Text(s) => s,
        Code::Number(n) => n.to_string(),
    })
}

/// Parse an inbound payload into a reply envelope.
pub fn parse_reply(raw: &str) -> Result<ReplyEnvelope> {
    let malformed = |e: serde_json::Error| JsonipcError::Protocol {
        message: format!("Malformed reply envelope: {}", e),
    };

    let value: Value = serde_json::from_str(raw).map_err(malformed)?;
    if !value.is_object() {
        return Err(JsonipcError::Protocol {
            message: format!("Reply envelope must be a JSON object, got {}", value),
        });
    }
    serde_json::from_value(value).map_err(malformed)
}
