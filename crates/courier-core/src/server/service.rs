//! Locally served services and the catalog the dispatcher resolves against.

use crate::codec::ServiceTable;
use crate::config::RemotePath;
use crate::protocol::Namespace;
use crate::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

/// Future returned by a method handler: the reply values or an error.
pub type MethodFuture = BoxFuture<'static, Result<Vec<Value>>>;

/// A remotely callable method, invoked with the call's positional arguments.
pub type MethodHandler = Arc<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;

/// A named set of method handlers.
#[derive(Clone)]
pub struct Service {
    name: String,
    methods: HashMap<String, MethodHandler>,
}

impl Service {
    /// A service with no methods.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Register an async method.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Value>>> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |args| handler(args).boxed());
        self.methods.insert(name.into(), handler);
        self
    }

    /// Register a method that completes without suspending.
    pub fn sync_method<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        self.method(name, move |args| {
            let result = handler(args);
            async move { result }
        })
    }

    /// Service name as addressed by callers.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handler for `method`, if registered.
    pub fn handler(&self, method: &str) -> Option<MethodHandler> {
        self.methods.get(method).cloned()
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.method_names())
            .finish()
    }
}

/// namespace -> service name -> service.
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    namespaces: HashMap<Namespace, HashMap<String, Service>>,
}

impl ServiceCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service, replacing any service with the same name.
    pub fn insert(&mut self, namespace: Namespace, service: Service) {
        self.namespaces
            .entry(namespace)
            .or_default()
            .insert(service.name.clone(), service);
    }

    /// Add a service under `namespace`, replacing one with the same name.
    pub fn with_service(mut self, namespace: Namespace, service: Service) -> Self {
        self.insert(namespace, service);
        self
    }

    /// Services registered under `namespace`.
    pub fn namespace(&self, namespace: Namespace) -> Option<&HashMap<String, Service>> {
        self.namespaces.get(&namespace)
    }

    /// Look up one service.
    pub fn get(&self, namespace: Namespace, service: &str) -> Option<&Service> {
        self.namespaces.get(&namespace)?.get(service)
    }

    /// Service names under `namespace`, sorted.
    pub fn service_names(&self, namespace: Namespace) -> Vec<String> {
        let mut names: Vec<String> = self
            .namespaces
            .get(&namespace)
            .map(|services| services.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Total number of services across namespaces.
    pub fn len(&self) -> usize {
        self.namespaces.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lookup table for the binary wire format, covering every service and
    /// method in the catalog. Clients must build theirs from the same names.
    pub fn service_table(&self) -> Result<ServiceTable> {
        let mut services = BTreeSet::new();
        let mut methods = BTreeSet::new();
        for service in self.namespaces.values().flat_map(HashMap::values) {
            services.insert(service.name.clone());
            methods.extend(service.methods.keys().cloned());
        }
        let namespaces = [Namespace::Sys, Namespace::User].map(|ns| ns.as_str());
        Ok(ServiceTable::new(namespaces, services, methods)?)
    }
}

/// Loads the services found under one configured path.
///
/// Implementations decide what a path means (a plugin directory, a config
/// file, a static registry); the gateway only needs the services.
pub trait ServiceLoader: Send + Sync {
    fn load(&self, path: &RemotePath) -> Result<Vec<Service>>;
}

/// Build a catalog by loading every path under its namespace.
pub fn load_catalog(paths: &[RemotePath], loader: &dyn ServiceLoader) -> Result<ServiceCatalog> {
    let mut catalog = ServiceCatalog::new();
    for path in paths {
        for service in loader.load(path)? {
            catalog.insert(path.namespace, service);
        }
    }
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RpcError;
    use serde_json::json;

    fn echo() -> Service {
        Service::new("echoRemote")
            .sync_method("echo", Ok)
            .method("twice", |args| async move {
                let mut out = args.clone();
                out.extend(args);
                Ok(out)
            })
    }

    #[tokio::test]
    async fn test_service_methods() {
        let service = echo();
        assert_eq!(service.method_names(), vec!["echo", "twice"]);

        let twice = service.handler("twice").unwrap();
        assert_eq!(twice(vec![json!(1)]).await.unwrap(), vec![json!(1), json!(1)]);
        assert!(service.handler("missing").is_none());
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = ServiceCatalog::new().with_service(Namespace::User, echo());
        assert!(catalog.get(Namespace::User, "echoRemote").is_some());
        assert!(catalog.get(Namespace::Sys, "echoRemote").is_none());
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.service_names(Namespace::User), vec!["echoRemote"]);
    }

    #[test]
    fn test_service_table_covers_catalog() {
        let catalog = ServiceCatalog::new()
            .with_service(Namespace::User, echo())
            .with_service(
                Namespace::Sys,
                Service::new("msgRemote").sync_method("forward", Ok),
            );
        let table = catalog.service_table().unwrap();
        assert_eq!(table.namespaces(), &["sys", "user"]);
        assert_eq!(table.services(), &["echoRemote", "msgRemote"]);
        assert_eq!(table.methods(), &["echo", "forward", "twice"]);
    }

    struct FixedLoader;

    impl ServiceLoader for FixedLoader {
        fn load(&self, path: &RemotePath) -> Result<Vec<Service>> {
            match path.path.to_str() {
                Some("remote/echo") => Ok(vec![echo()]),
                _ => Err(RpcError::Config {
                    message: format!("no services under {}", path.path.display()),
                }),
            }
        }
    }

    #[test]
    fn test_load_catalog() {
        let paths = vec![RemotePath::new(Namespace::User, "remote/echo")];
        let catalog = load_catalog(&paths, &FixedLoader).unwrap();
        assert!(catalog.get(Namespace::User, "echoRemote").is_some());

        let bad = vec![RemotePath::new(Namespace::Sys, "remote/missing")];
        assert!(matches!(
            load_catalog(&bad, &FixedLoader),
            Err(RpcError::Config { .. })
        ));
    }
}
