//! Wire types for host-worker communication.
//!
//! One JSON object per line in each direction:
//! - host → worker: `{"method": .., "params": .., "id": ..}`
//! - worker → host: `{"id": .., "result": ..}` or `{"id": .., "error": {..}}`
//!
//! Responses are matched to requests purely by `id`; arrival order carries
//! no meaning.

use serde::{Deserialize, Serialize};

/// The mandatory first call; the worker accepts nothing else before it.
pub const HANDSHAKE_METHOD: &str = "initialize";

/// Call issued by the host to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub method: String,
    pub params: serde_json::Value,
    pub id: u64,
}

/// Reply from the worker.
///
/// `id` is nullable on the wire: the worker answers lines it could not
/// parse with `"id": null`. Such replies match no pending call and are
/// dropped by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFault>,
}

impl WireResponse {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            result: None,
            error: Some(RemoteFault {
                code: None,
                message: message.into(),
                traceback: None,
            }),
        }
    }

    /// Collapse the result-XOR-error pair into one outcome.
    ///
    /// An error object wins over any result; a success with a JSON `null`
    /// result is a legitimate outcome (several worker methods return
    /// nothing).
    pub fn into_outcome(self) -> Result<serde_json::Value, RemoteFault> {
        match self.error {
            Some(fault) => Err(fault),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// Business-level error reported by the worker.
///
/// The worker always sends `message`; `code` and `traceback` appear on
/// dispatch failures and are kept for diagnostics but never shown raw to
/// the interface layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFault {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl std::fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
