//! Server side of the transport.
//!
//! A [`Gateway`] accepts peer connections and resolves each inbound call
//! against a [`ServiceCatalog`] of locally registered services.

mod acceptor;
mod dispatcher;
mod gateway;
mod service;

pub use acceptor::{Acceptor, AcceptorHandle, AcceptorSettings};
pub use dispatcher::Dispatcher;
pub use gateway::{create_server, Gateway, GatewayEvent, GatewayStatus};
pub use service::{load_catalog, MethodFuture, MethodHandler, Service, ServiceCatalog, ServiceLoader};
