//! Remote service proxies.
//!
//! A proxy forwards calls on a declared [`ServiceInterface`] to servers of
//! one type. Interfaces are registered on the client per namespace and
//! server type; the client builds [`ServiceProxy`] handles on demand.

use super::router::RouteParam;
use super::rpc_client::Client;
use crate::config::CallOptions;
use crate::protocol::{Namespace, RpcMessage};
use crate::{Result, RpcError};
use futures::future;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One remotely callable method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    /// Expected argument count, if the method fixes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arity: Option<usize>,
}

/// Statically declared shape of a remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInterface {
    pub name: String,
    pub methods: Vec<MethodSpec>,
}

impl ServiceInterface {
    /// An interface with no methods yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Declare a method that takes any number of arguments.
    pub fn with_method(mut self, name: impl Into<String>) -> Self {
        self.methods.push(MethodSpec {
            name: name.into(),
            arity: None,
        });
        self
    }

    /// Declare a method that takes exactly `arity` arguments.
    pub fn with_method_arity(mut self, name: impl Into<String>, arity: usize) -> Self {
        self.methods.push(MethodSpec {
            name: name.into(),
            arity: Some(arity),
        });
        self
    }

    /// Declaration for `name`, if any.
    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Reject calls to undeclared methods or with the wrong argument count.
    pub fn check_call(&self, method: &str, args: &[Value]) -> Result<()> {
        let spec = self
            .method(method)
            .ok_or_else(|| RpcError::NoSuchMethod(format!("{}.{}", self.name, method)))?;
        match spec.arity {
            Some(arity) if arity != args.len() => Err(RpcError::Validation {
                field: format!("{}.{}", self.name, method),
                message: format!("expected {} arguments, got {}", arity, args.len()),
            }),
            _ => Ok(()),
        }
    }
}

/// Interfaces served by one server type in one namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRecord {
    pub namespace: Namespace,
    pub server_type: String,
    pub interface: ServiceInterface,
}

impl ProxyRecord {
    /// Record an interface served by `server_type` in `namespace`.
    pub fn new(
        namespace: Namespace,
        server_type: impl Into<String>,
        interface: ServiceInterface,
    ) -> Self {
        Self {
            namespace,
            server_type: server_type.into(),
            interface,
        }
    }
}

/// Registered interfaces: namespace -> server type -> service -> interface.
#[derive(Debug, Default)]
pub(crate) struct ProxyTable {
    entries: HashMap<Namespace, HashMap<String, HashMap<String, Arc<ServiceInterface>>>>,
}

impl ProxyTable {
    /// Add a record. A service already registered under the same namespace
    /// and server type is replaced; other services are kept.
    pub(crate) fn insert(&mut self, record: ProxyRecord) {
        self.entries
            .entry(record.namespace)
            .or_default()
            .entry(record.server_type)
            .or_default()
            .insert(record.interface.name.clone(), Arc::new(record.interface));
    }

    pub(crate) fn get(
        &self,
        namespace: Namespace,
        server_type: &str,
        service: &str,
    ) -> Option<Arc<ServiceInterface>> {
        self.entries
            .get(&namespace)?
            .get(server_type)?
            .get(service)
            .cloned()
    }

    pub(crate) fn services(&self, namespace: Namespace, server_type: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .get(&namespace)
            .and_then(|types| types.get(server_type))
            .map(|services| services.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// Where [`ServiceProxy::to_server`] sends a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTarget {
    Id(String),
    /// Every live server of the proxy's type.
    All,
}

impl From<&str> for ServerTarget {
    fn from(id: &str) -> Self {
        if id == "*" {
            ServerTarget::All
        } else {
            ServerTarget::Id(id.to_string())
        }
    }
}

/// Call-forwarding handle for one remote service.
#[derive(Debug, Clone)]
pub struct ServiceProxy {
    client: Client,
    namespace: Namespace,
    server_type: String,
    interface: Arc<ServiceInterface>,
}

impl ServiceProxy {
    pub(crate) fn new(
        client: Client,
        namespace: Namespace,
        server_type: String,
        interface: Arc<ServiceInterface>,
    ) -> Self {
        Self {
            client,
            namespace,
            server_type,
            interface,
        }
    }

    /// Namespace the proxied service lives in.
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Server type calls are routed to.
    pub fn server_type(&self) -> &str {
        &self.server_type
    }

    pub fn interface(&self) -> &ServiceInterface {
        &self.interface
    }

    /// Route the call with the client's strategy and wait for the reply.
    pub async fn invoke(
        &self,
        route_param: RouteParam,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>> {
        self.invoke_with(route_param, method, args, CallOptions::default())
            .await
    }

    /// Like [`invoke`](Self::invoke) with explicit call options.
    pub async fn invoke_with(
        &self,
        route_param: RouteParam,
        method: &str,
        args: Vec<Value>,
        opts: CallOptions,
    ) -> Result<Vec<Value>> {
        let msg = self.message(method, args)?;
        let server_id = self.client.route(&route_param, &msg)?;
        self.client.rpc_invoke(server_id, msg, opts).await
    }

    /// Send the call to a chosen server, or to all of them.
    ///
    /// With [`ServerTarget::All`] every live server gets the call
    /// concurrently; the first failure in server order is returned, otherwise
    /// one JSON array of reply values per server.
    pub async fn to_server(
        &self,
        target: impl Into<ServerTarget>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let msg = self.message(method, args)?;
        match target.into() {
            ServerTarget::Id(server_id) => {
                self.client
                    .rpc_invoke(server_id, msg, CallOptions::default())
                    .await
            }
            ServerTarget::All => {
                let servers = self.client.membership(&self.server_type);
                let calls = servers.into_iter().map(|server| {
                    self.client
                        .rpc_invoke(server.id, msg.clone(), CallOptions::default())
                });
                future::join_all(calls)
                    .await
                    .into_iter()
                    .map(|reply| reply.map(Value::Array))
                    .collect()
            }
        }
    }

    fn message(&self, method: &str, args: Vec<Value>) -> Result<RpcMessage> {
        self.interface.check_call(method, &args)?;
        Ok(RpcMessage::new(
            self.namespace,
            self.server_type.clone(),
            self.interface.name.clone(),
            method,
        )
        .with_args(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn player_remote() -> ServiceInterface {
        ServiceInterface::new("playerRemote")
            .with_method_arity("move", 2)
            .with_method("kick")
    }

    #[test]
    fn test_check_call() {
        let iface = player_remote();
        assert!(iface.check_call("move", &[json!(1), json!(2)]).is_ok());
        assert!(iface.check_call("kick", &[]).is_ok());
        assert!(matches!(
            iface.check_call("move", &[json!(1)]),
            Err(RpcError::Validation { .. })
        ));
        assert!(matches!(
            iface.check_call("fly", &[]),
            Err(RpcError::NoSuchMethod(_))
        ));
    }

    #[test]
    fn test_table_merges_by_service() {
        let mut table = ProxyTable::default();
        table.insert(ProxyRecord::new(Namespace::User, "area", player_remote()));
        table.insert(ProxyRecord::new(
            Namespace::User,
            "area",
            ServiceInterface::new("mapRemote").with_method("load"),
        ));
        table.insert(ProxyRecord::new(
            Namespace::User,
            "area",
            ServiceInterface::new("playerRemote").with_method("leave"),
        ));

        assert_eq!(
            table.services(Namespace::User, "area"),
            vec!["mapRemote", "playerRemote"]
        );
        let player = table.get(Namespace::User, "area", "playerRemote").unwrap();
        assert!(player.method("leave").is_some());
        assert!(player.method("move").is_none());
        assert!(table.get(Namespace::Sys, "area", "playerRemote").is_none());
    }

    #[test]
    fn test_server_target_from_str() {
        assert_eq!(ServerTarget::from("*"), ServerTarget::All);
        assert_eq!(
            ServerTarget::from("area-1"),
            ServerTarget::Id("area-1".into())
        );
    }

    #[test]
    fn test_interface_json_shape() {
        let iface: ServiceInterface = serde_json::from_value(json!({
            "name": "chatRemote",
            "methods": [{"name": "send", "arity": 3}, {"name": "leave"}]
        }))
        .unwrap();
        assert_eq!(iface.method("send").unwrap().arity, Some(3));
        assert_eq!(iface.method("leave").unwrap().arity, None);
    }
}
