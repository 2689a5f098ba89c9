//! Wire protocol shared by mailboxes and acceptors.
//!
//! Envelopes travel either as JSON text or as table-indexed binary codec
//! records, inside length-prefixed frames. Both peers must agree on the
//! [`WireFormat`]. Receivers accept a single record or a batch in either
//! format.

mod frame;
mod message;

pub use frame::{read_frame, write_frame, Frame, FrameKind};
pub use message::{Namespace, RemoteError, RequestEnvelope, ResponseEnvelope, RpcMessage};

use crate::codec::{self, BeanRegistry, ServiceTable};
use crate::{Result, RpcError};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Envelope encoding used on a connection.
#[derive(Debug, Clone, Default)]
pub enum WireFormat {
    #[default]
    Json,
    Binary {
        table: Arc<ServiceTable>,
        beans: Arc<BeanRegistry>,
    },
}

impl WireFormat {
    /// Binary format with no registered bean types.
    pub fn binary(table: ServiceTable) -> Self {
        WireFormat::Binary {
            table: Arc::new(table),
            beans: Arc::new(BeanRegistry::new()),
        }
    }

    /// Binary format resolving beans against `beans`.
    pub fn binary_with_beans(table: ServiceTable, beans: BeanRegistry) -> Self {
        WireFormat::Binary {
            table: Arc::new(table),
            beans: Arc::new(beans),
        }
    }

    /// Name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::Binary { .. } => "binary",
        }
    }

    /// Frame one or more requests. A single request is written unbatched.
    pub fn encode_requests(&self, requests: &[RequestEnvelope]) -> Result<Frame> {
        match self {
            WireFormat::Json => encode_json(requests),
            WireFormat::Binary { table, .. } => {
                let records = requests
                    .iter()
                    .map(|req| table.encode_request(req.id, &req.msg))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(binary_frame(records))
            }
        }
    }

    /// Decode a request frame, batched or not.
    pub fn decode_requests(&self, frame: Frame) -> Result<Vec<RequestEnvelope>> {
        match self {
            WireFormat::Json => decode_json(frame),
            WireFormat::Binary { table, beans } => binary_records(frame)?
                .iter()
                .map(|record| Ok(table.decode_request(record, beans)?))
                .collect(),
        }
    }

    /// Frame one or more responses. A single response is written unbatched.
    pub fn encode_responses(&self, responses: &[ResponseEnvelope]) -> Result<Frame> {
        match self {
            WireFormat::Json => encode_json(responses),
            WireFormat::Binary { .. } => {
                let records = responses
                    .iter()
                    .map(codec::encode_response)
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(binary_frame(records))
            }
        }
    }

    /// Decode a response frame, batched or not.
    pub fn decode_responses(&self, frame: Frame) -> Result<Vec<ResponseEnvelope>> {
        match self {
            WireFormat::Json => decode_json(frame),
            WireFormat::Binary { beans, .. } => binary_records(frame)?
                .iter()
                .map(|record| Ok(codec::decode_response(record, beans)?))
                .collect(),
        }
    }
}

fn encode_json<T: serde::Serialize>(items: &[T]) -> Result<Frame> {
    let bytes = match items {
        [single] => serde_json::to_vec(single)?,
        many => serde_json::to_vec(many)?,
    };
    Ok(Frame::Json(bytes))
}

fn decode_json<T: DeserializeOwned>(frame: Frame) -> Result<Vec<T>> {
    let bytes = match frame {
        Frame::Json(bytes) => bytes,
        other => return Err(unexpected(&other, "json")),
    };
    let value: serde_json::Value = serde_json::from_slice(&bytes)?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| Ok(serde_json::from_value(item)?))
            .collect(),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}

fn binary_frame(mut records: Vec<Vec<u8>>) -> Frame {
    if records.len() == 1 {
        Frame::Binary(records.remove(0))
    } else {
        Frame::BinaryBatch(records)
    }
}

fn binary_records(frame: Frame) -> Result<Vec<Vec<u8>>> {
    match frame {
        Frame::Binary(record) => Ok(vec![record]),
        Frame::BinaryBatch(records) => Ok(records),
        other => Err(unexpected(&other, "binary")),
    }
}

fn unexpected(frame: &Frame, expected: &str) -> RpcError {
    RpcError::Frame {
        message: format!("expected {} frame, got {:?}", expected, frame.kind()),
    }
}

/// Best-effort request id from a JSON frame that failed to decode.
///
/// Only single (unbatched) requests are considered.
pub fn salvage_request_id(frame: &Frame) -> Option<u32> {
    let Frame::Json(bytes) = frame else {
        return None;
    };
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    value
        .get("id")?
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
}
