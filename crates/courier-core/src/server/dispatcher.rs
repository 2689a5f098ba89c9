//! Resolves `(namespace, service, method)` against the current catalog.

use super::service::ServiceCatalog;
use crate::protocol::RpcMessage;
use crate::{Result, RpcError};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Routes inbound calls to local method handlers.
///
/// The catalog can be swapped while calls are in flight; each call resolves
/// against the catalog current when it arrived.
#[derive(Debug)]
pub struct Dispatcher {
    catalog: RwLock<Arc<ServiceCatalog>>,
}

impl Dispatcher {
    /// A dispatcher over `catalog`.
    pub fn new(catalog: ServiceCatalog) -> Self {
        Self {
            catalog: RwLock::new(Arc::new(catalog)),
        }
    }

    /// The current catalog.
    pub fn catalog(&self) -> Arc<ServiceCatalog> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap the catalog. In-flight calls keep the one they started with.
    pub fn replace(&self, catalog: ServiceCatalog) {
        *self
            .catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
    }

    /// Find the method for `msg` and run it.
    pub async fn route(&self, msg: RpcMessage) -> Result<Vec<Value>> {
        let catalog = self.catalog();
        let services = catalog
            .namespace(msg.namespace)
            .ok_or_else(|| RpcError::NoSuchNamespace(msg.namespace.to_string()))?;
        let service = services
            .get(&msg.service)
            .ok_or_else(|| RpcError::NoSuchService(msg.service.clone()))?;
        let handler = service
            .handler(&msg.method)
            .ok_or_else(|| RpcError::NoSuchMethod(msg.method.clone()))?;

        debug!("dispatching {}", msg.route());
        handler(msg.args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Namespace;
    use crate::server::Service;
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        let math = Service::new("mathRemote").sync_method("add", |args| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(vec![json!(sum)])
        });
        Dispatcher::new(ServiceCatalog::new().with_service(Namespace::User, math))
    }

    fn call(ns: Namespace, service: &str, method: &str) -> RpcMessage {
        RpcMessage::new(ns, "math", service, method).with_args(vec![json!(2), json!(3)])
    }

    #[tokio::test]
    async fn test_route_invokes_handler() {
        let result = dispatcher()
            .route(call(Namespace::User, "mathRemote", "add"))
            .await
            .unwrap();
        assert_eq!(result, vec![json!(5)]);
    }

    #[tokio::test]
    async fn test_missing_levels_are_distinct_errors() {
        let d = dispatcher();
        match d.route(call(Namespace::Sys, "mathRemote", "add")).await {
            Err(RpcError::NoSuchNamespace(ns)) => assert_eq!(ns, "sys"),
            other => panic!("Expected NoSuchNamespace, got: {:?}", other),
        }
        match d.route(call(Namespace::User, "chatRemote", "add")).await {
            Err(RpcError::NoSuchService(s)) => assert_eq!(s, "chatRemote"),
            other => panic!("Expected NoSuchService, got: {:?}", other),
        }
        match d.route(call(Namespace::User, "mathRemote", "mul")).await {
            Err(RpcError::NoSuchMethod(m)) => assert_eq!(m, "mul"),
            other => panic!("Expected NoSuchMethod, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replace_swaps_catalog() {
        let d = dispatcher();
        let before = d.catalog();
        d.replace(ServiceCatalog::new());
        assert!(matches!(
            d.route(call(Namespace::User, "mathRemote", "add")).await,
            Err(RpcError::NoSuchNamespace(_))
        ));
        // Snapshots taken earlier are unaffected.
        assert!(before.get(Namespace::User, "mathRemote").is_some());
    }
}
