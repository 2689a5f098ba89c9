use super::{CloseNotifier, Mailbox, MailboxFactory, MailboxSettings, MailboxStatus};
use crate::client::registry::ServerInfo;
use crate::config::CallOptions;
use crate::protocol::{ResponseEnvelope, RpcMessage};
use crate::{Result, RpcError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// A mailbox that never connects and swallows every message.
#[derive(Debug, Clone)]
pub struct BlackholeMailbox {
    server_id: String,
}

impl BlackholeMailbox {
    /// Create a blackhole standing in for `server_id`.
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }
}

#[async_trait]
impl Mailbox for BlackholeMailbox {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn status(&self) -> MailboxStatus {
        MailboxStatus::Uninitialized
    }

    async fn connect(&self) -> Result<()> {
        Err(RpcError::ConnectFailed {
            server_id: self.server_id.clone(),
            message: "fail to connect to remote server and switch to blackhole".to_string(),
        })
    }

    async fn send(&self, msg: RpcMessage, _opts: CallOptions) -> Result<ResponseEnvelope> {
        info!("message into blackhole: {}", msg.route());
        Err(RpcError::SendFailed {
            server_id: self.server_id.clone(),
            message: "message was forwarded to blackhole".to_string(),
        })
    }

    fn close(&self) {}
}

/// Factory handing out [`BlackholeMailbox`]es.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlackholeFactory;

impl MailboxFactory for BlackholeFactory {
    fn create(
        &self,
        server: &ServerInfo,
        _settings: &MailboxSettings,
        _closer: CloseNotifier,
    ) -> Arc<dyn Mailbox> {
        Arc::new(BlackholeMailbox::new(server.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Namespace;

    #[tokio::test]
    async fn test_blackhole_rejects_everything() {
        let server = ServerInfo::new("void-1", "127.0.0.1", 1, "void");
        let mailbox = BlackholeFactory.create(
            &server,
            &MailboxSettings::default(),
            CloseNotifier::detached("void-1"),
        );

        assert!(matches!(
            mailbox.connect().await,
            Err(RpcError::ConnectFailed { .. })
        ));
        let msg = RpcMessage::new(Namespace::User, "void", "sinkRemote", "drop");
        assert!(matches!(
            mailbox.send(msg, CallOptions::default()).await,
            Err(RpcError::SendFailed { .. })
        ));
        assert_eq!(mailbox.server_id(), "void-1");
    }
}
