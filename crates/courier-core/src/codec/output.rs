//! Growable write cursor.

use super::{tag, CodecError, Value};

const BUFFER_SIZE_DEFAULT: usize = 32;

/// Write cursor over a growable byte buffer.
///
/// Capacity doubles on demand (or jumps straight to the required size when
/// doubling is not enough) and never shrinks. The backing storage may be
/// larger than the written content, so callers take [`as_bytes`] or
/// [`into_bytes`] rather than the raw buffer.
///
/// [`as_bytes`]: OutputBuffer::as_bytes
/// [`into_bytes`]: OutputBuffer::into_bytes
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    buf: Vec<u8>,
    count: usize,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    /// A buffer with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(BUFFER_SIZE_DEFAULT)
    }

    /// A buffer with `capacity` zeroed bytes of backing storage.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            count: 0,
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Size of the backing storage.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The written content, trimmed to its length.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.count]
    }

    /// The written content; the spare capacity is dropped.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.buf.truncate(self.count);
        self.buf
    }

    // Fixed-width primitives, little-endian.

    pub fn write_u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(u8::from(v));
    }

    pub fn write_i16(&mut self, v: i16) {
        self.put(&v.to_le_bytes());
    }

    pub fn write_u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.put(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.put(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.put(&v.to_le_bytes());
    }

    /// Length-prefixed raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let len = length_prefix(bytes.len())?;
        self.ensure_capacity(bytes.len() + 4);
        self.write_i32(len);
        self.put(bytes);
        Ok(())
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_string(&mut self, s: &str) -> Result<(), CodecError> {
        self.write_bytes(s.as_bytes())
    }

    /// Tagged value, recursing into lists.
    pub fn write_value(&mut self, value: &Value) -> Result<(), CodecError> {
        match value {
            Value::Null => self.write_i16(tag::NULL),
            Value::Blob(bytes) => {
                self.write_i16(tag::BLOB);
                self.write_bytes(bytes)?;
            }
            Value::List(items) => {
                self.write_i16(tag::LIST);
                self.write_i32(length_prefix(items.len())?);
                for item in items {
                    self.write_value(item)?;
                }
            }
            Value::String(s) => {
                self.write_i16(tag::STRING);
                self.write_string(s)?;
            }
            Value::Object(obj) => {
                self.write_i16(tag::OBJECT);
                let text =
                    serde_json::to_string(obj).map_err(|e| CodecError::InvalidJson(e.to_string()))?;
                self.write_string(&text)?;
            }
            Value::Bean(bean) => {
                self.write_i16(tag::BEAN);
                self.write_string(bean.bean_id())?;
                bean.write_fields(self)?;
            }
            Value::Boolean(b) => {
                self.write_i16(tag::BOOLEAN);
                self.write_bool(*b);
            }
            Value::Float(f) => {
                if f.is_nan() {
                    self.write_i16(tag::NULL);
                } else {
                    self.write_i16(tag::FLOAT);
                    self.write_f64(*f);
                }
            }
            Value::Int(i) => {
                self.write_i16(tag::INT);
                self.write_i64(*i);
            }
        }
        Ok(())
    }

    fn put(&mut self, bytes: &[u8]) {
        self.ensure_capacity(bytes.len());
        self.buf[self.count..self.count + bytes.len()].copy_from_slice(bytes);
        self.count += bytes.len();
    }

    fn ensure_capacity(&mut self, len: usize) {
        let min_capacity = self.count + len;
        if min_capacity > self.buf.len() {
            self.grow(min_capacity);
        }
    }

    fn grow(&mut self, min_capacity: usize) {
        let doubled = self.buf.len().saturating_mul(2);
        let new_capacity = doubled.max(min_capacity);
        self.buf.resize(new_capacity, 0);
    }
}

fn length_prefix(len: usize) -> Result<i32, CodecError> {
    i32::try_from(len).map_err(|_| CodecError::TooLarge(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_doubles() {
        let mut out = OutputBuffer::with_capacity(4);
        out.write_i32(1);
        assert_eq!(out.capacity(), 4);

        out.write_u8(2);
        assert_eq!(out.capacity(), 8);
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn test_capacity_jumps_to_required_size() {
        let mut out = OutputBuffer::with_capacity(4);
        out.write_bytes(&[7u8; 40]).unwrap();
        assert_eq!(out.capacity(), 44);
        assert_eq!(out.len(), 44);
    }

    #[test]
    fn test_trimmed_output() {
        let mut out = OutputBuffer::new();
        out.write_i16(tag::NULL);
        assert_eq!(out.capacity(), 32);
        assert_eq!(out.as_bytes(), &[1, 0]);
        assert_eq!(out.into_bytes(), vec![1, 0]);
    }

    #[test]
    fn test_string_layout() {
        let mut out = OutputBuffer::new();
        out.write_string("ab").unwrap();
        assert_eq!(out.as_bytes(), &[2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn test_nan_float_written_as_null() {
        let mut out = OutputBuffer::new();
        out.write_value(&Value::Float(f64::NAN)).unwrap();
        assert_eq!(out.as_bytes(), &tag::NULL.to_le_bytes());
    }
}
