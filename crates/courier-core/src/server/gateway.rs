//! Gateway: acceptor plus dispatcher behind a start/stop lifecycle.

use super::acceptor::{Acceptor, AcceptorHandle, AcceptorSettings};
use super::dispatcher::Dispatcher;
use super::service::{load_catalog, ServiceCatalog, ServiceLoader};
use crate::codec::ServiceTable;
use crate::config::{RpcConfig, ServerOptions};
use crate::protocol::WireFormat;
use crate::{Result, RpcError};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Notifications published by a running gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// A connection or request-level failure.
    Error { message: String },
    /// The gateway stopped.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Inited,
    Started,
    Closed,
}

struct GatewayState {
    status: GatewayStatus,
    acceptor: Option<AcceptorHandle>,
}

/// Server side of the transport.
pub struct Gateway {
    opts: ServerOptions,
    dispatcher: Arc<Dispatcher>,
    events: broadcast::Sender<GatewayEvent>,
    state: Mutex<GatewayState>,
}

impl Gateway {
    /// Build a gateway over `catalog` without loading anything from disk.
    pub fn new(opts: ServerOptions, catalog: ServiceCatalog) -> Result<Self> {
        opts.validate()?;
        let (events, _) = broadcast::channel(RpcConfig::EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            opts,
            dispatcher: Arc::new(Dispatcher::new(catalog)),
            events,
            state: Mutex::new(GatewayState {
                status: GatewayStatus::Inited,
                acceptor: None,
            }),
        })
    }

    /// Bind the listener and start accepting. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut state = self.state();
            if state.status != GatewayStatus::Inited {
                return Err(RpcError::AlreadyStarted { component: "gateway" });
            }
            state.status = GatewayStatus::Started;
        }

        let settings = AcceptorSettings {
            buffer_msg: self.opts.buffer_msg,
            interval: self.opts.interval,
            wire_format: self.opts.wire_format.clone(),
            max_connections: self.opts.max_connections,
        };
        let bind = format!("{}:{}", self.opts.host, self.opts.port);
        let handle =
            match Acceptor::start(&bind, settings, self.dispatcher.clone(), self.events.clone())
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    self.state().status = GatewayStatus::Inited;
                    return Err(e);
                }
            };

        let addr = handle.addr();
        self.state().acceptor = Some(handle);
        info!(
            "gateway started on {} ({} services, {} wire format)",
            addr,
            self.dispatcher.catalog().len(),
            self.opts.wire_format.name()
        );
        Ok(addr)
    }

    /// Stop accepting and close every connection.
    pub fn stop(&self) -> Result<()> {
        let acceptor = {
            let mut state = self.state();
            if state.status != GatewayStatus::Started {
                return Err(RpcError::NotStarted);
            }
            state.status = GatewayStatus::Closed;
            state.acceptor.take()
        };
        if let Some(mut acceptor) = acceptor {
            acceptor.shutdown();
        }
        let _ = self.events.send(GatewayEvent::Closed);
        info!("gateway stopped");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn status(&self) -> GatewayStatus {
        self.state().status
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state().acceptor.as_ref().map(AcceptorHandle::addr)
    }

    /// The options the gateway was built with.
    pub fn options(&self) -> &ServerOptions {
        &self.opts
    }

    /// Snapshot of the catalog requests are currently dispatched against.
    pub fn catalog(&self) -> Arc<ServiceCatalog> {
        self.dispatcher.catalog()
    }

    /// Swap in a new catalog. Calls already dispatched finish on the old one.
    ///
    /// See [`reload`](Self::reload) for the binary wire format caveat.
    pub fn replace_catalog(&self, catalog: ServiceCatalog) {
        self.dispatcher.replace(catalog);
        self.check_wire_table();
    }

    /// Reload every configured path and swap the catalog.
    ///
    /// On a load error the current catalog stays in place.
    ///
    /// With [`WireFormat::Binary`] the service table is fixed when the
    /// gateway is built, and peers share it. Services or methods added by a
    /// reload have no index in that table, so binary peers cannot reach them
    /// (their requests fail to decode with an unknown index) until both ends
    /// are rebuilt with a new table. A warning is logged when this happens.
    pub fn reload(&self, loader: &dyn ServiceLoader) -> Result<()> {
        let catalog = load_catalog(&self.opts.paths, loader)?;
        info!("reloaded {} services", catalog.len());
        self.dispatcher.replace(catalog);
        self.check_wire_table();
        Ok(())
    }

    /// Binary lookup table for the current catalog.
    pub fn service_table(&self) -> Result<ServiceTable> {
        self.dispatcher.catalog().service_table()
    }

    /// Whether the wire format can address everything in the current
    /// catalog. Always true for JSON.
    pub fn wire_table_is_current(&self) -> bool {
        match &self.opts.wire_format {
            WireFormat::Json => true,
            WireFormat::Binary { table, .. } => self
                .service_table()
                .map(|current| table.covers(&current))
                .unwrap_or(false),
        }
    }

    /// Subscribe to gateway events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    fn check_wire_table(&self) {
        if !self.wire_table_is_current() {
            warn!(
                "binary service table does not cover the reloaded catalog, \
                 new services are unreachable over binary frames"
            );
        }
    }

    fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("opts", &self.opts)
            .field("status", &self.status())
            .finish()
    }
}

/// Validate `opts`, load the configured service paths and build a gateway.
pub fn create_server(opts: ServerOptions, loader: &dyn ServiceLoader) -> Result<Gateway> {
    opts.validate()?;
    let catalog = load_catalog(&opts.paths, loader)?;
    Gateway::new(opts, catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemotePath;
    use crate::protocol::Namespace;
    use crate::server::Service;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        loads: AtomicUsize,
    }

    impl ServiceLoader for CountingLoader {
        fn load(&self, _path: &RemotePath) -> Result<Vec<Service>> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Service::new(format!("gen{}Remote", n)).sync_method("ping", Ok)])
        }
    }

    fn opts() -> ServerOptions {
        ServerOptions::new(0)
            .with_host("127.0.0.1")
            .with_path(RemotePath::new(Namespace::User, "remote"))
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let loader = CountingLoader {
            loads: AtomicUsize::new(0),
        };
        let gateway = create_server(opts(), &loader).unwrap();
        let mut events = gateway.subscribe();
        assert!(gateway.local_addr().is_none());

        let addr = gateway.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(gateway.local_addr(), Some(addr));
        assert!(matches!(
            gateway.start().await,
            Err(RpcError::AlreadyStarted { component: "gateway" })
        ));

        gateway.stop().unwrap();
        assert_eq!(events.recv().await.unwrap(), GatewayEvent::Closed);
        assert!(matches!(gateway.stop(), Err(RpcError::NotStarted)));
    }

    #[tokio::test]
    async fn test_reload_swaps_catalog() {
        let loader = CountingLoader {
            loads: AtomicUsize::new(0),
        };
        let gateway = create_server(opts(), &loader).unwrap();
        assert!(gateway.catalog().get(Namespace::User, "gen0Remote").is_some());

        gateway.reload(&loader).unwrap();
        let catalog = gateway.catalog();
        assert!(catalog.get(Namespace::User, "gen0Remote").is_none());
        assert!(catalog.get(Namespace::User, "gen1Remote").is_some());
    }

    #[test]
    fn test_reload_outgrows_binary_table() {
        let loader = CountingLoader {
            loads: AtomicUsize::new(0),
        };
        let table = ServiceTable::new(["sys", "user"], ["gen0Remote"], ["ping"]).unwrap();
        let gateway =
            create_server(opts().with_wire_format(WireFormat::binary(table)), &loader).unwrap();
        assert!(gateway.wire_table_is_current());

        gateway.reload(&loader).unwrap();
        assert!(!gateway.wire_table_is_current());

        let json = create_server(opts(), &loader).unwrap();
        json.reload(&loader).unwrap();
        assert!(json.wire_table_is_current());
    }

    #[test]
    fn test_invalid_options_rejected() {
        let loader = CountingLoader {
            loads: AtomicUsize::new(0),
        };
        let result = create_server(ServerOptions::new(0).with_host(""), &loader);
        assert!(matches!(result, Err(RpcError::Validation { .. })));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }
}
