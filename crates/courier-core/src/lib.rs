//! Courier Core - RPC transport for clustered servers.
//!
//! Each node runs a [`Client`] that routes calls to peer nodes by server type
//! and a [`Gateway`] that accepts calls from peers and dispatches them to
//! local services.
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_core::{Client, ClientOptions, Namespace, RouteStrategy, RpcMessage, ServerInfo};
//!
//! #[tokio::main]
//! async fn main() -> courier_core::Result<()> {
//!     let client = Client::new(ClientOptions::new().with_router_type(RouteStrategy::RoundRobin))?;
//!     client.add_server(ServerInfo::new("area-1", "127.0.0.1", 3051, "area"));
//!     client.start().await?;
//!
//!     let msg = RpcMessage::new(Namespace::User, "area", "playerRemote", "move")
//!         .with_args(vec![serde_json::json!(10), serde_json::json!(20)]);
//!     let server_id = client.route(&serde_json::json!("uid-1"), &msg)?;
//!     let reply = client.rpc_invoke(server_id, msg, Default::default()).await?;
//!     println!("reply: {:?}", reply);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

// Re-export commonly used types
pub use client::{
    BlackholeFactory, Client, ClientStatus, ConsistentHash, CustomRouter, ErrorHandler, Filter,
    FilterAction, MailStation, Mailbox, MailboxFactory, MembershipEvent, MembershipListener,
    MembershipSource, ProxyRecord, RouteParam, ServerInfo, ServerTarget, ServiceInterface,
    ServiceProxy, StationEvent, TcpMailboxFactory,
};
pub use codec::{Bean, BeanRegistry, ServiceTable};
pub use config::{
    CallOptions, ClientConfig, ClientOptions, FailMode, HashAlgorithm, RemotePath, RouteStrategy,
    RpcConfig, ServerConfig, ServerOptions,
};
pub use error::{Result, RpcError, StationErrorKind};
pub use protocol::{Namespace, RemoteError, RpcMessage, WireFormat};
pub use server::{create_server, Gateway, GatewayEvent, Service, ServiceCatalog, ServiceLoader};
