//! Built-in services hosted by `courier-node serve`.

use courier_core::{Namespace, RemotePath, RpcError, Service, ServiceCatalog, ServiceLoader};
use serde_json::{json, Value};
use std::time::Duration;

/// Serves the built-in services for whichever namespace a path is tagged with.
///
/// The path itself only has to name a known service group: `sys` paths must
/// end in `sys`, user paths in `demo`.
pub struct DemoLoader {
    node_id: String,
}

impl DemoLoader {
    /// Loader whose `sysRemote.whoami` answers with `node_id`.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    /// Every service this loader can produce, used to derive the binary
    /// service table on both ends of a connection.
    pub fn full_catalog(&self) -> ServiceCatalog {
        let mut catalog = ServiceCatalog::new();
        for service in self.sys_services() {
            catalog.insert(Namespace::Sys, service);
        }
        for service in self.user_services() {
            catalog.insert(Namespace::User, service);
        }
        catalog
    }

    fn sys_services(&self) -> Vec<Service> {
        let node_id = self.node_id.clone();
        vec![Service::new("sysRemote")
            .sync_method("ping", |_| Ok(vec![json!("pong")]))
            .sync_method("whoami", move |_| Ok(vec![json!(node_id)]))]
    }

    fn user_services(&self) -> Vec<Service> {
        let echo = Service::new("echoRemote")
            .sync_method("echo", Ok)
            .method("delayed", |args: Vec<Value>| async move {
                let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(args)
            });

        let math = Service::new("mathRemote")
            .sync_method("add", |args| {
                let mut sum = 0.0;
                for arg in &args {
                    sum += arg.as_f64().ok_or_else(|| RpcError::Validation {
                        field: "args".to_string(),
                        message: format!("not a number: {}", arg),
                    })?;
                }
                Ok(vec![json!(sum)])
            })
            .sync_method("div", |args| match (args.first(), args.get(1)) {
                (Some(a), Some(b)) => {
                    let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                    if b == 0.0 {
                        return Err(RpcError::Validation {
                            field: "args".to_string(),
                            message: "division by zero".to_string(),
                        });
                    }
                    Ok(vec![json!(a / b)])
                }
                _ => Err(RpcError::Validation {
                    field: "args".to_string(),
                    message: "div takes two arguments".to_string(),
                }),
            });

        vec![echo, math]
    }
}

impl ServiceLoader for DemoLoader {
    fn load(&self, path: &RemotePath) -> courier_core::Result<Vec<Service>> {
        let group = path
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        match (path.namespace, group) {
            (Namespace::Sys, "sys") => Ok(self.sys_services()),
            (Namespace::User, "demo") => Ok(self.user_services()),
            _ => Err(RpcError::Config {
                message: format!(
                    "no built-in {} services under {}",
                    path.namespace,
                    path.path.display()
                ),
            }),
        }
    }
}

/// Paths served when none are configured.
pub fn default_paths() -> Vec<RemotePath> {
    vec![
        RemotePath::new(Namespace::Sys, "remote/sys"),
        RemotePath::new(Namespace::User, "remote/demo"),
    ]
}
