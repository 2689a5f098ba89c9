//! Per-peer connections.
//!
//! A mailbox owns exactly one connection to one peer and correlates
//! responses with requests by id. The station creates mailboxes lazily
//! through a [`MailboxFactory`] and hears about lost connections through the
//! [`CloseNotifier`] handed to each one.

mod blackhole;
mod tcp;

pub use blackhole::{BlackholeFactory, BlackholeMailbox};
pub use tcp::{TcpMailbox, TcpMailboxFactory};

use super::registry::ServerInfo;
use crate::config::{CallOptions, ClientOptions};
use crate::protocol::{ResponseEnvelope, RpcMessage, WireFormat};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxStatus {
    Uninitialized,
    Connecting,
    Connected,
    Closed,
}

/// The subset of client options a mailbox needs.
#[derive(Debug, Clone)]
pub struct MailboxSettings {
    pub client_id: String,
    pub buffer_msg: bool,
    pub keepalive: Duration,
    pub interval: Duration,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub wire_format: WireFormat,
}

impl Default for MailboxSettings {
    fn default() -> Self {
        Self::from(&ClientOptions::default())
    }
}

impl From<&ClientOptions> for MailboxSettings {
    fn from(opts: &ClientOptions) -> Self {
        Self {
            client_id: opts.client_id.clone(),
            buffer_msg: opts.buffer_msg,
            keepalive: opts.keepalive,
            interval: opts.interval,
            timeout: opts.timeout,
            connect_timeout: opts.connect_timeout,
            wire_format: opts.wire_format.clone(),
        }
    }
}

/// A mailbox reporting that its connection is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxClosed {
    pub server_id: String,
    /// Distinguishes successive mailboxes for the same peer.
    pub generation: u64,
}

/// Handle a mailbox uses to report a lost or failed connection.
#[derive(Debug, Clone)]
pub struct CloseNotifier {
    server_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<MailboxClosed>,
}

impl CloseNotifier {
    /// Notifier for mailbox `generation` of `server_id`, reporting on `tx`.
    pub fn new(
        server_id: impl Into<String>,
        generation: u64,
        tx: mpsc::UnboundedSender<MailboxClosed>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            generation,
            tx,
        }
    }

    /// A notifier nobody listens to.
    pub fn detached(server_id: impl Into<String>) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self::new(server_id, 0, tx)
    }

    /// Peer this notifier reports for.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Report the connection as closed. Ignored once the station is gone.
    pub fn notify(&self) {
        let _ = self.tx.send(MailboxClosed {
            server_id: self.server_id.clone(),
            generation: self.generation,
        });
    }
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    fn server_id(&self) -> &str;

    fn status(&self) -> MailboxStatus;

    /// Open the connection.
    ///
    /// On failure the mailbox also fires its close notification.
    async fn connect(&self) -> Result<()>;

    /// Send one request and wait for its response, a timeout or a disconnect.
    async fn send(&self, msg: RpcMessage, opts: CallOptions) -> Result<ResponseEnvelope>;

    /// Release the connection. Idempotent.
    fn close(&self);
}

pub trait MailboxFactory: Send + Sync {
    fn create(
        &self,
        server: &ServerInfo,
        settings: &MailboxSettings,
        closer: CloseNotifier,
    ) -> Arc<dyn Mailbox>;
}
