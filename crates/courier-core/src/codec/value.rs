//! The closed set of value kinds carried by the binary codec.

use super::{CodecError, InputBuffer, OutputBuffer};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A named structure with its own field-by-field serialization.
///
/// The bean id is written ahead of the fields; the decoder looks it up in a
/// [`BeanRegistry`] to obtain an empty instance and lets it read its fields.
pub trait Bean: std::fmt::Debug + Send + Sync {
    /// Type id written ahead of the fields.
    fn bean_id(&self) -> &str;

    fn write_fields(&self, out: &mut OutputBuffer) -> Result<(), CodecError>;

    fn read_fields(&mut self, input: &mut InputBuffer<'_>) -> Result<(), CodecError>;

    fn clone_bean(&self) -> Box<dyn Bean>;

    fn as_any(&self) -> &dyn Any;

    /// JSON view used when a bean has to cross a JSON-only boundary.
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "$id": self.bean_id() })
    }
}

impl Clone for Box<dyn Bean> {
    fn clone(&self) -> Self {
        self.clone_bean()
    }
}

type BeanFactory = Arc<dyn Fn() -> Box<dyn Bean> + Send + Sync>;

/// Registered bean constructors keyed by bean id.
#[derive(Clone, Default)]
pub struct BeanRegistry {
    factories: HashMap<String, BeanFactory>,
}

impl BeanRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor producing an empty bean for `id`.
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Bean> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    /// A fresh, empty bean for `id`.
    pub fn create(&self, id: &str) -> Option<Box<dyn Bean>> {
        self.factories.get(id).map(|factory| factory())
    }

    /// Whether `id` has a constructor.
    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }
}

impl std::fmt::Debug for BeanRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeanRegistry")
            .field("ids", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A codec value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Blob(Vec<u8>),
    List(Vec<Value>),
    String(String),
    /// Opaque structured data, carried as JSON text.
    Object(serde_json::Value),
    Bean(Box<dyn Bean>),
    Boolean(bool),
    Float(f64),
    Int(i64),
}

impl Value {
    /// Classify a raw number: `NaN` is null, anything with a fractional part
    /// (or outside the integer range) is a float, the rest are integers.
    pub fn from_f64(v: f64) -> Self {
        if v.is_nan() {
            return Value::Null;
        }
        if v.fract() != 0.0 || v < i64::MIN as f64 || v >= i64::MAX as f64 {
            return Value::Float(v);
        }
        Value::Int(v as i64)
    }

    /// Name of the value kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Blob(_) => "blob",
            Value::List(_) => "list",
            Value::String(_) => "string",
            Value::Object(_) => "object",
            Value::Bean(_) => "bean",
            Value::Boolean(_) => "boolean",
            Value::Float(_) => "float",
            Value::Int(_) => "int",
        }
    }

    /// Convert into a JSON value for JSON-only consumers.
    ///
    /// Blobs become arrays of byte values and beans use [`Bean::to_json`].
    pub fn into_json(self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Blob(bytes) => Json::Array(bytes.into_iter().map(Json::from).collect()),
            Value::List(items) => Json::Array(items.into_iter().map(Value::into_json).collect()),
            Value::String(s) => Json::String(s),
            Value::Object(obj) => obj,
            Value::Bean(bean) => bean.to_json(),
            Value::Boolean(b) => Json::Bool(b),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Int(i) => Json::from(i),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Boolean(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::from_f64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            obj @ Json::Object(_) => Value::Object(obj),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bean(a), Value::Bean(b)) => {
                if a.bean_id() != b.bean_id() {
                    return false;
                }
                let mut left = OutputBuffer::new();
                let mut right = OutputBuffer::new();
                match (a.write_fields(&mut left), b.write_fields(&mut right)) {
                    (Ok(()), Ok(())) => left.as_bytes() == right.as_bytes(),
                    _ => false,
                }
            }
            _ => false,
        }
    }
}
