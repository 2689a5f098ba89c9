//! Request and response envelopes.

use crate::{Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Top-level grouping separating framework services from application ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Sys,
    User,
}

impl Namespace {
    /// Wire name of the namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Sys => "sys",
            Namespace::User => "user",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sys" => Ok(Namespace::Sys),
            "user" => Ok(Namespace::User),
            other => Err(RpcError::NoSuchNamespace(other.to_string())),
        }
    }
}

/// A remote call: which service method on which server type, with what
/// positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcMessage {
    pub namespace: Namespace,
    #[serde(default)]
    pub server_type: String,
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl RpcMessage {
    /// A call with no arguments.
    pub fn new(
        namespace: Namespace,
        server_type: impl Into<String>,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            namespace,
            server_type: server_type.into(),
            service: service.into(),
            method: method.into(),
            args: Vec::new(),
        }
    }

    /// Set the positional arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// `namespace.service.method`, used in log lines.
    pub fn route(&self) -> String {
        format!("{}.{}.{}", self.namespace, self.service, self.method)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u32,
    pub msg: RpcMessage,
}

/// Response to one request.
///
/// `resp` follows the error-first convention: the first element is `null` on
/// success or a serialized [`RemoteError`], the rest are the results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u32,
    #[serde(default)]
    pub resp: Vec<Value>,
}

impl ResponseEnvelope {
    /// A response carrying `results` behind a null error slot.
    pub fn success(id: u32, results: Vec<Value>) -> Self {
        let mut resp = Vec::with_capacity(results.len() + 1);
        resp.push(Value::Null);
        resp.extend(results);
        Self { id, resp }
    }

    /// A response carrying `err` in the error slot.
    pub fn failure(id: u32, err: &RpcError) -> Self {
        let remote = serde_json::to_value(err.to_remote()).unwrap_or(Value::Null);
        Self {
            id,
            resp: vec![remote],
        }
    }

    /// Split the error-first array into a result.
    pub fn into_result(self) -> Result<Vec<Value>> {
        let mut iter = self.resp.into_iter();
        match iter.next() {
            None | Some(Value::Null) => Ok(iter.collect()),
            Some(err) => Err(RemoteError::from_value(err).into()),
        }
    }
}

/// Error carried in the first slot of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    /// Interpret whatever the peer put in the error slot.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(msg) => Self { msg, stack: None },
            other => serde_json::from_value(other.clone()).unwrap_or_else(|_| Self {
                msg: other.to_string(),
                stack: None,
            }),
        }
    }
}
