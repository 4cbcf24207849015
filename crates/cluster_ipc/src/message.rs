use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire envelope exchanged between cluster processes.
///
/// Every message a process sends or receives has this shape, whatever the
/// transport underneath (an in-process hub, or newline-delimited JSON over
/// stdin/stdout towards the master).
///
/// ```ignore
/// use cluster_ipc::message::Envelope;
/// use serde_json::json;
///
/// let env = Envelope::new("metrics:flush", "worker-1", Some("vs"), json!({"n": 3}));
/// let line = serde_json::to_string(&env).unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub body: Value,
}

impl Envelope {
    pub fn new(
        action: impl Into<String>,
        from: impl Into<String>,
        to: Option<&str>,
        body: Value,
    ) -> Self {
        Self {
            action: action.into(),
            from: from.into(),
            to: to.map(str::to_owned),
            body,
        }
    }

    /// Parsed view of `action`.
    pub fn kind(&self) -> Action {
        Action::from(self.action.as_str())
    }
}

pub const CLUSTER_READY: &str = "cluster:ready";
pub const IPC_FEED: &str = "#ipc_feed#";

/// The actions the core interprets. Anything else is handed to application
/// subscribers untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    ClusterReady,
    Feed,
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::ClusterReady => CLUSTER_READY,
            Action::Feed => IPC_FEED,
            Action::Other(name) => name,
        }
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        match s {
            CLUSTER_READY => Action::ClusterReady,
            IPC_FEED => Action::Feed,
            other => Action::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status codes carried by feed responses.
pub mod status {
    pub const OK: u16 = 200;
    pub const NOT_FOUND: u16 = 404;
    pub const HANDLER_FAILURE: u16 = 500;
    pub const HANDLER_REJECTED: u16 = 600;
    pub const TIMEOUT: u16 = 608;
}

/// Correlated call sent by the caller to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRequest {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    pub id: u64,
}

/// Reply to a [`FeedRequest`], carrying the request's id.
///
/// `data` is omitted on the wire when absent; `null` reads back as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedResponse {
    pub status: u16,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl FeedResponse {
    pub fn ok(id: u64, data: Option<Value>) -> Self {
        let data = data.filter(|v| !v.is_null());
        Self { status: status::OK, id, data }
    }

    pub fn not_found(id: u64) -> Self {
        Self { status: status::NOT_FOUND, id, data: None }
    }

    pub fn fail(id: u64, status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            id,
            data: Some(Value::String(message.into())),
        }
    }

    /// Message text for a non-200 response. Strings are used verbatim,
    /// other JSON values are rendered, absent data yields an empty string.
    pub fn message(&self) -> String {
        match &self.data {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// Body of an `#ipc_feed#` envelope: a request carries `event`, a response
/// carries `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeedBody {
    Request(FeedRequest),
    Response(FeedResponse),
}
