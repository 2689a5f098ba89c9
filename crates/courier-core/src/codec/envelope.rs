//! Table-indexed binary envelopes.
//!
//! ```text
//! request:  [u32 id][i16 namespace][i16 service][i16 method][list args]
//! response: [u32 id][list resp]
//! ```
//!
//! The server type is not carried; the receiving gateway already is one.

use super::{BeanRegistry, CodecError, InputBuffer, OutputBuffer, Value};
use crate::protocol::{Namespace, RequestEnvelope, ResponseEnvelope, RpcMessage};
use std::collections::HashMap;

/// Shared lookup table mapping namespace, service and method names to small
/// indices.
///
/// Both ends of a connection must build the table from the same name sets.
/// Names are sorted and deduplicated on construction so that the indices do
/// not depend on registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTable {
    namespaces: NameIndex,
    services: NameIndex,
    methods: NameIndex,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct NameIndex {
    names: Vec<String>,
    index: HashMap<String, i16>,
}

impl NameIndex {
    fn build<I, S>(names: I) -> Result<Self, CodecError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        if names.len() > i16::MAX as usize {
            return Err(CodecError::TooLarge(names.len()));
        }
        let index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as i16))
            .collect();
        Ok(Self { names, index })
    }

    fn lookup(&self, kind: &'static str, name: &str) -> Result<i16, CodecError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| CodecError::UnknownName {
                kind,
                name: name.to_string(),
            })
    }

    fn resolve(&self, kind: &'static str, index: i16) -> Result<&str, CodecError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.names.get(i))
            .map(String::as_str)
            .ok_or(CodecError::UnknownIndex { kind, index })
    }
}

impl ServiceTable {
    /// Build a table from the three name sets.
    pub fn new<N, S, M>(namespaces: N, services: S, methods: M) -> Result<Self, CodecError>
    where
        N: IntoIterator,
        N::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
        M: IntoIterator,
        M::Item: Into<String>,
    {
        Ok(Self {
            namespaces: NameIndex::build(namespaces)?,
            services: NameIndex::build(services)?,
            methods: NameIndex::build(methods)?,
        })
    }

    /// Namespace names, in index order.
    pub fn namespaces(&self) -> &[String] {
        &self.namespaces.names
    }

    /// Service names, in index order.
    pub fn services(&self) -> &[String] {
        &self.services.names
    }

    /// Method names, in index order.
    pub fn methods(&self) -> &[String] {
        &self.methods.names
    }

    /// Whether every name in `other` also has an index here.
    pub fn covers(&self, other: &ServiceTable) -> bool {
        let contains = |index: &NameIndex, names: &[String]| {
            names.iter().all(|name| index.index.contains_key(name))
        };
        contains(&self.namespaces, &other.namespaces.names)
            && contains(&self.services, &other.services.names)
            && contains(&self.methods, &other.methods.names)
    }

    /// Encode a request, replacing names with table indices.
    pub fn encode_request(&self, id: u32, msg: &RpcMessage) -> Result<Vec<u8>, CodecError> {
        let mut out = OutputBuffer::new();
        out.write_u32(id);
        out.write_i16(self.namespaces.lookup("namespace", msg.namespace.as_str())?);
        out.write_i16(self.services.lookup("service", &msg.service)?);
        out.write_i16(self.methods.lookup("method", &msg.method)?);
        let args = Value::List(msg.args.iter().cloned().map(Value::from).collect());
        out.write_value(&args)?;
        Ok(out.into_bytes())
    }

    /// Decode a request produced by [`encode_request`](Self::encode_request).
    pub fn decode_request(
        &self,
        bytes: &[u8],
        beans: &BeanRegistry,
    ) -> Result<RequestEnvelope, CodecError> {
        let mut input = InputBuffer::new(bytes).with_beans(beans);
        let id = input.read_u32()?;
        let namespace = self.namespaces.resolve("namespace", input.read_i16()?)?;
        let namespace: Namespace = namespace.parse().map_err(|_| CodecError::UnknownName {
            kind: "namespace",
            name: namespace.to_string(),
        })?;
        let service = self.services.resolve("service", input.read_i16()?)?.to_string();
        let method = self.methods.resolve("method", input.read_i16()?)?.to_string();
        let args = read_list(&mut input)?;

        Ok(RequestEnvelope {
            id,
            msg: RpcMessage {
                namespace,
                server_type: String::new(),
                service,
                method,
                args,
            },
        })
    }
}

/// Encode a response record.
pub fn encode_response(resp: &ResponseEnvelope) -> Result<Vec<u8>, CodecError> {
    let mut out = OutputBuffer::new();
    out.write_u32(resp.id);
    let values = Value::List(resp.resp.iter().cloned().map(Value::from).collect());
    out.write_value(&values)?;
    Ok(out.into_bytes())
}

/// Decode a response record.
pub fn decode_response(bytes: &[u8], beans: &BeanRegistry) -> Result<ResponseEnvelope, CodecError> {
    let mut input = InputBuffer::new(bytes).with_beans(beans);
    let id = input.read_u32()?;
    let resp = read_list(&mut input)?;
    Ok(ResponseEnvelope { id, resp })
}

fn read_list(input: &mut InputBuffer<'_>) -> Result<Vec<serde_json::Value>, CodecError> {
    match input.read_value()? {
        Value::List(items) => Ok(items.into_iter().map(Value::into_json).collect()),
        Value::Null => Ok(Vec::new()),
        other => Err(CodecError::UnexpectedKind {
            expected: "list",
            found: other.kind(),
        }),
    }
}
