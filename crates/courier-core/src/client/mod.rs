//! Client side of the transport.
//!
//! [`Client`] routes calls by server type and hands them to the
//! [`MailStation`], which keeps one [`Mailbox`] per peer and runs the
//! filter chains around every send.

mod consistent_hash;
mod filter;
mod mailbox;
mod mailstation;
mod proxy;
mod registry;
mod router;
mod rpc_client;

pub use consistent_hash::ConsistentHash;
pub use filter::{from_fn, Filter, FilterAction, FilterChain};
pub use mailbox::{
    BlackholeFactory, BlackholeMailbox, CloseNotifier, Mailbox, MailboxClosed, MailboxFactory,
    MailboxSettings, MailboxStatus, TcpMailbox, TcpMailboxFactory,
};
pub use mailstation::{ErrorHandler, MailStation, StationEvent, StationStatus};
pub use proxy::{MethodSpec, ProxyRecord, ServerTarget, ServiceInterface, ServiceProxy};
pub use registry::{MembershipEvent, MembershipListener, MembershipSource, Registry, ServerInfo};
pub use router::{CustomRouter, RouteParam, Router};
pub use rpc_client::{Client, ClientStatus};
