//! Length-prefixed transport framing.
//!
//! ```text
//! [u32 BE: len][u8 kind][payload of len - 1 bytes]
//! ```
//!
//! A binary batch payload is `[u32 BE count]` followed by `[u32 BE len][record]`
//! for every record.

use crate::config::RpcConfig;
use crate::{Result, RpcError};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Discriminator byte following the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Ping = 1,
    Pong = 2,
    Json = 3,
    Binary = 4,
    BinaryBatch = 5,
}

impl TryFrom<u8> for FrameKind {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Ping),
            2 => Ok(FrameKind::Pong),
            3 => Ok(FrameKind::Json),
            4 => Ok(FrameKind::Binary),
            5 => Ok(FrameKind::BinaryBatch),
            other => Err(RpcError::Frame {
                message: format!("unknown frame kind {}", other),
            }),
        }
    }
}

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ping,
    Pong,
    /// A JSON object or a JSON array of objects.
    Json(Vec<u8>),
    /// One binary codec record.
    Binary(Vec<u8>),
    /// Several binary codec records written together.
    BinaryBatch(Vec<Vec<u8>>),
}

impl Frame {
    /// Kind byte this frame is written with.
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Ping => FrameKind::Ping,
            Frame::Pong => FrameKind::Pong,
            Frame::Json(_) => FrameKind::Json,
            Frame::Binary(_) => FrameKind::Binary,
            Frame::BinaryBatch(_) => FrameKind::BinaryBatch,
        }
    }

    /// Serialize the frame including its length prefix.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let payload_len = match self {
            Frame::Ping | Frame::Pong => 0,
            Frame::Json(p) | Frame::Binary(p) => p.len(),
            Frame::BinaryBatch(records) => 4 + records.iter().map(|r| 4 + r.len()).sum::<usize>(),
        };
        let len = payload_len + 1;
        if len > RpcConfig::MAX_FRAME_SIZE {
            return Err(oversized(len));
        }

        let mut bytes = BytesMut::with_capacity(4 + len);
        bytes.put_u32(len as u32);
        bytes.put_u8(self.kind() as u8);
        match self {
            Frame::Ping | Frame::Pong => {}
            Frame::Json(p) | Frame::Binary(p) => bytes.put_slice(p),
            Frame::BinaryBatch(records) => {
                bytes.put_u32(records.len() as u32);
                for record in records {
                    bytes.put_u32(record.len() as u32);
                    bytes.put_slice(record);
                }
            }
        }
        Ok(bytes.freeze())
    }

    fn from_parts(kind: FrameKind, payload: Vec<u8>) -> Result<Self> {
        match kind {
            FrameKind::Ping => Ok(Frame::Ping),
            FrameKind::Pong => Ok(Frame::Pong),
            FrameKind::Json => Ok(Frame::Json(payload)),
            FrameKind::Binary => Ok(Frame::Binary(payload)),
            FrameKind::BinaryBatch => split_batch(&payload).map(Frame::BinaryBatch),
        }
    }
}

/// Read one frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(RpcError::Frame {
            message: "empty frame".to_string(),
        });
    }
    if len > RpcConfig::MAX_FRAME_SIZE {
        return Err(oversized(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let kind = FrameKind::try_from(body[0])?;
    body.remove(0);
    Frame::from_parts(kind, body).map(Some)
}

/// Write one frame to an async writer and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = frame.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

fn split_batch(payload: &[u8]) -> Result<Vec<Vec<u8>>> {
    let truncated = || RpcError::Frame {
        message: "truncated binary batch".to_string(),
    };
    let read_u32 = |at: usize| -> Result<usize> {
        payload
            .get(at..at + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or_else(truncated)
    };

    let count = read_u32(0)?;
    let mut pos = 4;
    let mut records = Vec::with_capacity(count.min(payload.len() / 4));
    for _ in 0..count {
        let len = read_u32(pos)?;
        pos += 4;
        let record = payload.get(pos..pos + len).ok_or_else(truncated)?;
        records.push(record.to_vec());
        pos += len;
    }
    if pos != payload.len() {
        return Err(RpcError::Frame {
            message: format!("{} trailing bytes after binary batch", payload.len() - pos),
        });
    }
    Ok(records)
}

fn oversized(len: usize) -> RpcError {
    RpcError::Validation {
        field: "frame".to_string(),
        message: format!(
            "frame size {} exceeds maximum {}",
            len,
            RpcConfig::MAX_FRAME_SIZE
        ),
    }
}
