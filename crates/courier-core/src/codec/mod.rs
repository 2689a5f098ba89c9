//! Binary codec for RPC values and envelopes.
//!
//! Values are written with a two-byte type tag followed by the payload for
//! that kind. All multi-byte integers are little-endian and every
//! variable-length payload carries an `i32` length prefix:
//!
//! ```text
//! [i16 tag][payload]
//!   null     -
//!   blob     [i32 len][bytes]
//!   list     [i32 len][value]*
//!   string   [i32 len][utf-8]
//!   object   [i32 len][utf-8 JSON text]
//!   bean     [i32 len][utf-8 bean id][bean fields]
//!   boolean  [u8]
//!   float    [f64]
//!   int      [i64]
//! ```
//!
//! The codec trusts the length prefixes it reads; framing and authentication
//! of record boundaries belong to the transport.

mod envelope;
mod input;
mod output;
mod value;

pub use envelope::{decode_response, encode_response, ServiceTable};
pub use input::{InputBuffer, MAX_DEPTH};
pub use output::OutputBuffer;
pub use value::{Bean, BeanRegistry, Value};

use thiserror::Error;

/// Type tags for every value kind the codec understands.
pub(crate) mod tag {
    pub const NULL: i16 = 1;
    pub const BLOB: i16 = 2;
    pub const LIST: i16 = 3;
    pub const STRING: i16 = 4;
    pub const OBJECT: i16 = 5;
    pub const BEAN: i16 = 6;
    pub const BOOLEAN: i16 = 7;
    pub const FLOAT: i16 = 8;
    pub const INT: i16 = 9;
}

/// Errors raised while encoding or decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Read of {requested} bytes at offset {position} exceeds content length {length}")]
    OutOfBounds {
        position: usize,
        requested: usize,
        length: usize,
    },

    #[error("Negative length prefix {0}")]
    NegativeLength(i32),

    #[error("Payload of {0} bytes does not fit a length prefix")]
    TooLarge(usize),

    #[error("Lists nested deeper than {0} levels")]
    TooDeep(usize),

    #[error("Unknown type tag {0}")]
    UnknownTag(i16),

    #[error("Invalid UTF-8 in string payload")]
    InvalidUtf8,

    #[error("Invalid JSON object payload: {0}")]
    InvalidJson(String),

    #[error("Bean type not registered: {0}")]
    UnknownBean(String),

    #[error("{kind} not present in service table: {name}")]
    UnknownName { kind: &'static str, name: String },

    #[error("{kind} index {index} not present in service table")]
    UnknownIndex { kind: &'static str, index: i16 },

    #[error("Expected {expected}, found {found}")]
    UnexpectedKind {
        expected: &'static str,
        found: &'static str,
    },
}

/// Encode a single value into a fresh, trimmed byte vector.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut out = OutputBuffer::new();
    out.write_value(value)?;
    Ok(out.into_bytes())
}

/// Decode a single value, resolving beans against `beans`.
pub fn decode_value(bytes: &[u8], beans: &BeanRegistry) -> Result<Value, CodecError> {
    InputBuffer::new(bytes).with_beans(beans).read_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Position {
        x: i32,
        y: i32,
        label: String,
    }

    impl Bean for Position {
        fn bean_id(&self) -> &str {
            "position"
        }

        fn write_fields(&self, out: &mut OutputBuffer) -> Result<(), CodecError> {
            out.write_i32(self.x);
            out.write_i32(self.y);
            out.write_string(&self.label)
        }

        fn read_fields(&mut self, input: &mut InputBuffer<'_>) -> Result<(), CodecError> {
            self.x = input.read_i32()?;
            self.y = input.read_i32()?;
            self.label = input.read_string()?;
            Ok(())
        }

        fn clone_bean(&self) -> Box<dyn Bean> {
            Box::new(self.clone())
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn roundtrip(value: Value) -> Value {
        let bytes = encode_value(&value).unwrap();
        decode_value(&bytes, &BeanRegistry::new()).unwrap()
    }

    #[test]
    fn test_roundtrip_every_kind() {
        let values = vec![
            Value::Null,
            Value::Blob(vec![0, 1, 2, 255]),
            Value::String("héllo".into()),
            Value::Object(json!({"uid": 7, "tags": ["a", "b"]})),
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Float(3.25),
            Value::Float(-0.1),
            Value::Int(-42),
            Value::Int(i64::MAX),
            Value::List(vec![
                Value::Int(1),
                Value::String("two".into()),
                Value::List(vec![Value::Null, Value::Float(0.5)]),
            ]),
        ];

        for value in values {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn test_float_bits_preserved() {
        let v = Value::Float(f64::MIN_POSITIVE);
        match roundtrip(v) {
            Value::Float(f) => assert_eq!(f.to_bits(), f64::MIN_POSITIVE.to_bits()),
            other => panic!("Expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_number_classification() {
        assert_eq!(Value::from_f64(2.0), Value::Int(2));
        assert_eq!(Value::from_f64(2.5), Value::Float(2.5));
        assert_eq!(Value::from_f64(f64::NAN), Value::Null);

        let bytes = encode_value(&Value::from_f64(f64::NAN)).unwrap();
        assert_eq!(bytes, tag::NULL.to_le_bytes().to_vec());
    }

    #[test]
    fn test_bean_roundtrip_with_registry() {
        let mut beans = BeanRegistry::new();
        beans.register("position", || Box::new(Position::default()));

        let original = Position {
            x: 10,
            y: -3,
            label: "spawn".into(),
        };
        let bytes = encode_value(&Value::Bean(Box::new(original.clone()))).unwrap();
        let decoded = decode_value(&bytes, &beans).unwrap();

        match decoded {
            Value::Bean(bean) => {
                let pos = bean.as_any().downcast_ref::<Position>().unwrap();
                assert_eq!(pos, &original);
            }
            other => panic!("Expected bean, got {:?}", other),
        }
    }

    #[test]
    fn test_unregistered_bean_fails() {
        let bytes = encode_value(&Value::Bean(Box::new(Position::default()))).unwrap();
        let result = decode_value(&bytes, &BeanRegistry::new());
        assert!(matches!(result, Err(CodecError::UnknownBean(id)) if id == "position"));
    }

    #[test]
    fn test_truncated_input_is_out_of_bounds() {
        let bytes = encode_value(&Value::String("truncated".into())).unwrap();
        let result = decode_value(&bytes[..bytes.len() - 2], &BeanRegistry::new());
        assert!(matches!(result, Err(CodecError::OutOfBounds { .. })));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let bytes = 42i16.to_le_bytes();
        let result = decode_value(&bytes, &BeanRegistry::new());
        assert!(matches!(result, Err(CodecError::UnknownTag(42))));
    }
}
