//! RPC client: routing and proxies on top of a mail station.

use super::filter::Filter;
use super::mailstation::{ErrorHandler, MailStation, StationEvent};
use super::proxy::{ProxyRecord, ProxyTable, ServiceProxy};
use super::registry::{MembershipListener, ServerInfo};
use super::router::{RouteParam, Router};
use crate::config::{CallOptions, ClientOptions};
use crate::protocol::{Namespace, RpcMessage};
use crate::{Result, RpcError};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Inited,
    Started,
    Closed,
}

struct ClientInner {
    opts: ClientOptions,
    station: MailStation,
    router: Router,
    proxies: RwLock<ProxyTable>,
    status: Mutex<ClientStatus>,
}

/// Handle to an RPC client. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Validate `opts` and build a client. A missing client id is generated.
    pub fn new(mut opts: ClientOptions) -> Result<Self> {
        opts.validate()?;
        if opts.client_id.is_empty() {
            opts.client_id = uuid::Uuid::new_v4().to_string();
        }
        let station = MailStation::new(&opts);
        let router = Router::new(&opts);

        Ok(Self {
            inner: Arc::new(ClientInner {
                opts,
                station,
                router,
                proxies: RwLock::new(ProxyTable::default()),
                status: Mutex::new(ClientStatus::Inited),
            }),
        })
    }

    /// Start the station. Fails unless the client is freshly built.
    pub async fn start(&self) -> Result<()> {
        {
            let mut status = self.lock_status();
            if *status != ClientStatus::Inited {
                return Err(RpcError::AlreadyStarted {
                    component: "rpc client",
                });
            }
            *status = ClientStatus::Started;
        }
        if let Err(e) = self.inner.station.start().await {
            *self.lock_status() = ClientStatus::Inited;
            return Err(e);
        }
        info!("rpc client {} started", self.inner.opts.client_id);
        Ok(())
    }

    /// Stop the client; see [`MailStation::stop`] for `force`.
    pub fn stop(&self, force: bool) -> Result<()> {
        {
            let mut status = self.lock_status();
            if *status != ClientStatus::Started {
                warn!("rpc client {} is not running", self.inner.opts.client_id);
                return Err(RpcError::NotStarted);
            }
            *status = ClientStatus::Closed;
        }
        self.inner.station.stop(force)
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ClientStatus {
        *self.lock_status()
    }

    fn lock_status(&self) -> MutexGuard<'_, ClientStatus> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Id used in log lines; generated when the options left it empty.
    pub fn client_id(&self) -> &str {
        &self.inner.opts.client_id
    }

    /// The validated options the client was built with.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.opts
    }

    /// The underlying mail station.
    pub fn station(&self) -> &MailStation {
        &self.inner.station
    }

    /// Send `msg` to a specific server.
    pub async fn rpc_invoke(
        &self,
        server_id: impl Into<String>,
        msg: RpcMessage,
        opts: CallOptions,
    ) -> Result<Vec<Value>> {
        if self.status() != ClientStatus::Started {
            return Err(RpcError::NotStarted);
        }
        self.inner.station.dispatch(server_id, msg, opts).await
    }

    /// Pick a server for `msg` with the configured routing.
    pub fn route(&self, route_param: &RouteParam, msg: &RpcMessage) -> Result<String> {
        self.inner.router.route(&self.inner.station, route_param, msg)
    }

    /// Live servers of a type, from the route context when one is set.
    pub fn membership(&self, server_type: &str) -> Vec<ServerInfo> {
        match &self.inner.opts.route_context {
            Some(context) => context.servers_by_type(server_type),
            None => self.inner.station.servers_by_type(server_type),
        }
    }

    // Membership

    /// Register a peer with the station.
    pub fn add_server(&self, server: ServerInfo) {
        self.inner.station.add_server(server);
    }

    /// Register several peers with the station.
    pub fn add_servers(&self, servers: Vec<ServerInfo>) {
        self.inner.station.add_servers(servers);
    }

    /// Unregister a peer and close its mailbox.
    pub fn remove_server(&self, server_id: &str) {
        self.inner.station.remove_server(server_id);
    }

    /// Unregister several peers.
    pub fn remove_servers<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inner.station.remove_servers(ids);
    }

    /// Reset the registry to exactly `servers`.
    pub fn replace_servers(&self, servers: Vec<ServerInfo>) {
        self.inner.station.replace_servers(servers);
    }

    /// Subscribe to registry add/remove notifications.
    pub fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.inner.station.add_listener(listener);
    }

    // Filters and errors

    /// Append a filter to the before chain.
    pub fn before(&self, filter: Arc<dyn Filter>) {
        self.inner.station.before(filter);
    }

    /// Append a filter to the after chain.
    pub fn after(&self, filter: Arc<dyn Filter>) {
        self.inner.station.after(filter);
    }

    /// Register a filter on both chains.
    pub fn filter(&self, filter: Arc<dyn Filter>) {
        self.inner.station.filter(filter);
    }

    /// Route dispatch failures to `handler`.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        self.inner.station.set_error_handler(handler);
    }

    /// Subscribe to station events.
    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.inner.station.subscribe()
    }

    // Proxies

    /// Register a service interface, replacing any with the same name, namespace and server type.
    pub fn add_proxy(&self, record: ProxyRecord) {
        info!(
            "adding proxy {}.{}.{}",
            record.namespace, record.server_type, record.interface.name
        );
        self.inner
            .proxies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record);
    }

    /// Register several service interfaces.
    pub fn add_proxies(&self, records: Vec<ProxyRecord>) {
        for record in records {
            self.add_proxy(record);
        }
    }

    /// Proxy for a registered service, if any.
    pub fn proxy(
        &self,
        namespace: Namespace,
        server_type: &str,
        service: &str,
    ) -> Option<ServiceProxy> {
        let interface = self
            .inner
            .proxies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace, server_type, service)?;
        Some(ServiceProxy::new(
            self.clone(),
            namespace,
            server_type.to_string(),
            interface,
        ))
    }

    /// Names of the services registered for a server type.
    pub fn proxy_services(&self, namespace: Namespace, server_type: &str) -> Vec<String> {
        self.inner
            .proxies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .services(namespace, server_type)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.opts.client_id)
            .field("router", &self.inner.router)
            .finish()
    }
}
