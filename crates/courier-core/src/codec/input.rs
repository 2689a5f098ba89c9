//! Bounds-checked read cursor.

use super::{tag, BeanRegistry, CodecError, Value};

/// Deepest list nesting accepted, matching serde_json's recursion limit.
pub const MAX_DEPTH: usize = 128;

/// Read cursor over an encoded byte slice.
///
/// Every read is checked against the content length; reading past it fails
/// with [`CodecError::OutOfBounds`]. Nested lists deeper than [`MAX_DEPTH`]
/// fail with [`CodecError::TooDeep`].
#[derive(Debug, Clone)]
pub struct InputBuffer<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
    beans: Option<&'a BeanRegistry>,
}

impl<'a> InputBuffer<'a> {
    /// A cursor at the start of `buf` with no bean registry.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            depth: 0,
            beans: None,
        }
    }

    /// Resolve bean ids against `beans` when reading values.
    pub fn with_beans(mut self, beans: &'a BeanRegistry) -> Self {
        self.beans = Some(beans);
        self
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    // Fixed-width primitives, little-endian.

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// Length-prefixed raw bytes.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_len()?;
        self.take(len)
    }

    /// Length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    /// Tagged value, recursing into lists.
    pub fn read_value(&mut self) -> Result<Value, CodecError> {
        let kind = self.read_i16()?;
        let value = match kind {
            tag::NULL => Value::Null,
            tag::BLOB => Value::Blob(self.read_bytes()?.to_vec()),
            tag::LIST => {
                let len = self.read_len()?;
                if self.depth >= MAX_DEPTH {
                    return Err(CodecError::TooDeep(MAX_DEPTH));
                }
                self.depth += 1;
                let items = self.read_items(len);
                self.depth -= 1;
                Value::List(items?)
            }
            tag::STRING => Value::String(self.read_string()?),
            tag::OBJECT => {
                let text = self.read_string()?;
                let obj = serde_json::from_str(&text)
                    .map_err(|e| CodecError::InvalidJson(e.to_string()))?;
                Value::Object(obj)
            }
            tag::BEAN => {
                let id = self.read_string()?;
                let mut bean = self
                    .beans
                    .and_then(|beans| beans.create(&id))
                    .ok_or(CodecError::UnknownBean(id))?;
                bean.read_fields(self)?;
                Value::Bean(bean)
            }
            tag::BOOLEAN => Value::Boolean(self.read_bool()?),
            tag::FLOAT => Value::Float(self.read_f64()?),
            tag::INT => Value::Int(self.read_i64()?),
            other => return Err(CodecError::UnknownTag(other)),
        };
        Ok(value)
    }

    fn read_items(&mut self, len: usize) -> Result<Vec<Value>, CodecError> {
        // Each element needs at least its two-byte tag.
        let mut items = Vec::with_capacity(len.min(self.remaining() / 2));
        for _ in 0..len {
            items.push(self.read_value()?);
        }
        Ok(items)
    }

    fn read_len(&mut self) -> Result<usize, CodecError> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| CodecError::NegativeLength(len))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.check(len)?;
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn check(&self, len: usize) -> Result<(), CodecError> {
        if self.pos.saturating_add(len) > self.buf.len() {
            return Err(CodecError::OutOfBounds {
                position: self.pos,
                requested: len,
                length: self.buf.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OutputBuffer;

    #[test]
    fn test_primitive_reads() {
        let mut out = OutputBuffer::new();
        out.write_u8(9);
        out.write_i16(-2);
        out.write_u32(70_000);
        out.write_f32(1.5);
        out.write_string("ok").unwrap();
        let bytes = out.into_bytes();

        let mut input = InputBuffer::new(&bytes);
        assert_eq!(input.read_u8().unwrap(), 9);
        assert_eq!(input.read_i16().unwrap(), -2);
        assert_eq!(input.read_u32().unwrap(), 70_000);
        assert_eq!(input.read_f32().unwrap(), 1.5);
        assert_eq!(input.read_string().unwrap(), "ok");
        assert_eq!(input.remaining(), 0);
    }

    #[test]
    fn test_read_past_end() {
        let bytes = [1u8, 2, 3];
        let mut input = InputBuffer::new(&bytes);
        let err = input.read_i32().unwrap_err();
        match err {
            CodecError::OutOfBounds {
                position,
                requested,
                length,
            } => {
                assert_eq!(position, 0);
                assert_eq!(requested, 4);
                assert_eq!(length, 3);
            }
            other => panic!("Expected OutOfBounds, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_length_rejected() {
        let bytes = (-5i32).to_le_bytes();
        let mut input = InputBuffer::new(&bytes);
        assert!(matches!(
            input.read_bytes(),
            Err(CodecError::NegativeLength(-5))
        ));
    }

    fn nested_lists(depth: usize) -> Vec<u8> {
        let mut out = OutputBuffer::new();
        for _ in 0..depth {
            out.write_i16(tag::LIST);
            out.write_i32(1);
        }
        out.write_i16(tag::NULL);
        out.into_bytes()
    }

    #[test]
    fn test_nesting_limit() {
        let ok = nested_lists(MAX_DEPTH);
        assert!(InputBuffer::new(&ok).read_value().is_ok());

        let too_deep = nested_lists(MAX_DEPTH + 1);
        assert!(matches!(
            InputBuffer::new(&too_deep).read_value(),
            Err(CodecError::TooDeep(MAX_DEPTH))
        ));
    }

    #[test]
    fn test_hostile_nesting_fails_cleanly() {
        // A megabyte of list headers, each claiming one more nested list.
        let bytes = nested_lists(1024 * 1024 / 6);
        let mut input = InputBuffer::new(&bytes);
        assert!(matches!(input.read_value(), Err(CodecError::TooDeep(_))));

        // The cursor stays usable after the failure.
        assert_eq!(input.depth, 0);
    }

    #[test]
    fn test_huge_list_length_fails_without_allocating() {
        let mut out = OutputBuffer::new();
        out.write_i16(tag::LIST);
        out.write_i32(i32::MAX);
        let bytes = out.into_bytes();

        let result = InputBuffer::new(&bytes).read_value();
        assert!(matches!(result, Err(CodecError::OutOfBounds { .. })));
    }
}
