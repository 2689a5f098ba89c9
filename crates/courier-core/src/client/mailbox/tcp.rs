//! TCP mailbox.
//!
//! One connection per peer, split into a writer task fed by a channel (so
//! wire order equals call order) and a reader task that resolves pending
//! requests by id. Optional tasks flush the send buffer and check liveness.

use super::{CloseNotifier, Mailbox, MailboxFactory, MailboxSettings, MailboxStatus};
use crate::client::registry::ServerInfo;
use crate::config::CallOptions;
use crate::protocol::{read_frame, write_frame, Frame, RequestEnvelope, ResponseEnvelope, RpcMessage};
use crate::{Result, RpcError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Creates a [`TcpMailbox`] per peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpMailboxFactory;

impl MailboxFactory for TcpMailboxFactory {
    fn create(
        &self,
        server: &ServerInfo,
        settings: &MailboxSettings,
        closer: CloseNotifier,
    ) -> Arc<dyn Mailbox> {
        Arc::new(TcpMailbox::new(server.clone(), settings.clone(), closer))
    }
}

pub struct TcpMailbox {
    shared: Arc<Shared>,
}

struct Shared {
    server: ServerInfo,
    settings: MailboxSettings,
    closer: CloseNotifier,
    state: Mutex<State>,
}

struct State {
    status: MailboxStatus,
    next_id: u32,
    requests: HashMap<u32, PendingRequest>,
    /// Requests waiting for the next flush when buffering.
    queue: Vec<RequestEnvelope>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    tasks: Vec<JoinHandle<()>>,
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
}

struct PendingRequest {
    tx: oneshot::Sender<Result<ResponseEnvelope>>,
    timer: JoinHandle<()>,
}

impl TcpMailbox {
    /// Create an unconnected mailbox for `server`.
    pub fn new(server: ServerInfo, settings: MailboxSettings, closer: CloseNotifier) -> Self {
        Self {
            shared: Arc::new(Shared {
                server,
                settings,
                closer,
                state: Mutex::new(State {
                    status: MailboxStatus::Uninitialized,
                    next_id: 0,
                    requests: HashMap::new(),
                    queue: Vec::new(),
                    outbound: None,
                    tasks: Vec::new(),
                    last_ping: None,
                    last_pong: None,
                }),
            }),
        }
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.state().requests.len()
    }
}

impl Drop for TcpMailbox {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Mailbox for TcpMailbox {
    fn server_id(&self) -> &str {
        &self.shared.server.id
    }

    fn status(&self) -> MailboxStatus {
        self.shared.state().status
    }

    async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        let server_id = shared.server.id.clone();
        {
            let mut state = shared.state();
            match state.status {
                MailboxStatus::Uninitialized => state.status = MailboxStatus::Connecting,
                MailboxStatus::Closed => return Err(RpcError::MailboxClosed { server_id }),
                _ => {
                    return Err(RpcError::ConnectFailed {
                        server_id,
                        message: "mailbox has already connected".to_string(),
                    })
                }
            }
        }

        let addr = shared.server.addr();
        let timeout = shared.settings.connect_timeout;
        let stream = match time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!(
                    "rpc client {} failed to connect to remote server {} at {}: {}",
                    shared.settings.client_id, server_id, addr, e
                );
                shared.fail_connect();
                return Err(RpcError::ConnectFailed {
                    server_id,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                error!(
                    "rpc client {} connect to remote server {} timed out after {:?}",
                    shared.settings.client_id, server_id, timeout
                );
                shared.fail_connect();
                return Err(RpcError::ConnectTimeout { server_id, timeout });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", server_id, e);
        }
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = shared.state();
        if state.status != MailboxStatus::Connecting {
            // Closed while the connect was in flight.
            return Err(RpcError::MailboxClosed { server_id });
        }
        state.status = MailboxStatus::Connected;
        state.outbound = Some(tx);
        state
            .tasks
            .push(tokio::spawn(write_loop(server_id.clone(), writer, rx)));
        state.tasks.push(tokio::spawn(read_loop(shared.clone(), reader)));
        if shared.settings.buffer_msg {
            state.tasks.push(tokio::spawn(flush_loop(shared.clone())));
        }
        state.tasks.push(tokio::spawn(keepalive_loop(shared.clone())));

        info!("rpc client {} connected to {} at {}", shared.settings.client_id, server_id, addr);
        Ok(())
    }

    async fn send(&self, msg: RpcMessage, opts: CallOptions) -> Result<ResponseEnvelope> {
        let shared = &self.shared;
        let server_id = shared.server.id.clone();

        let rx = {
            let mut state = shared.state();
            match state.status {
                MailboxStatus::Connected => {}
                MailboxStatus::Closed => return Err(RpcError::MailboxClosed { server_id }),
                _ => return Err(RpcError::MailboxNotConnected { server_id }),
            }

            let id = state.next_id;
            state.next_id = id.wrapping_add(1);
            let timeout = opts.timeout.unwrap_or(shared.settings.timeout);
            let (tx, rx) = oneshot::channel();
            let timer = tokio::spawn(request_timer(shared.clone(), id, timeout));
            state.requests.insert(id, PendingRequest { tx, timer });

            let envelope = RequestEnvelope { id, msg };
            if shared.settings.buffer_msg {
                state.queue.push(envelope);
            } else {
                let sent = shared
                    .settings
                    .wire_format
                    .encode_requests(std::slice::from_ref(&envelope))
                    .and_then(|frame| shared.push_frame(&state, frame));
                if let Err(e) = sent {
                    if let Some(req) = state.requests.remove(&id) {
                        req.timer.abort();
                    }
                    return Err(e);
                }
            }
            rx
        };

        rx.await
            .unwrap_or(Err(RpcError::Disconnected { server_id }))
    }

    fn close(&self) {
        let tasks = {
            let mut state = self.shared.state();
            if state.status == MailboxStatus::Closed {
                return;
            }
            state.status = MailboxStatus::Closed;
            state.queue.clear();
            state.outbound = None;
            std::mem::take(&mut state.tasks)
        };
        // Pending requests keep their timers and fail on timeout.
        for task in tasks {
            task.abort();
        }
        debug!("rpc mailbox for {} closed", self.shared.server.id);
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail_connect(&self) {
        self.state().status = MailboxStatus::Closed;
        self.closer.notify();
    }

    fn push_frame(&self, state: &State, frame: Frame) -> Result<()> {
        let outbound = state
            .outbound
            .as_ref()
            .ok_or_else(|| RpcError::MailboxNotConnected {
                server_id: self.server.id.clone(),
            })?;
        outbound.send(frame).map_err(|_| RpcError::SendFailed {
            server_id: self.server.id.clone(),
            message: "connection writer has stopped".to_string(),
        })
    }

    fn resolve(&self, resp: ResponseEnvelope) {
        let pending = self.state().requests.remove(&resp.id);
        match pending {
            Some(req) => {
                req.timer.abort();
                let _ = req.tx.send(Ok(resp));
            }
            None => debug!(
                "Dropping response {} from {}: no pending request",
                resp.id, self.server.id
            ),
        }
    }

    fn flush(&self) {
        let mut state = self.state();
        if state.status == MailboxStatus::Closed || state.queue.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut state.queue);
        let format = &self.settings.wire_format;

        let frame = match format.encode_requests(&batch) {
            Ok(frame) => frame,
            Err(e) => {
                // One bad request must not sink the whole batch.
                warn!("rpc batch encode for {} failed, sending singly: {}", self.server.id, e);
                for envelope in batch {
                    let sent = format
                        .encode_requests(std::slice::from_ref(&envelope))
                        .and_then(|frame| self.push_frame(&state, frame));
                    if let Err(e) = sent {
                        if let Some(req) = state.requests.remove(&envelope.id) {
                            req.timer.abort();
                            let _ = req.tx.send(Err(e));
                        }
                    }
                }
                return;
            }
        };
        if let Err(e) = self.push_frame(&state, frame) {
            warn!("rpc flush to {} failed: {}", self.server.id, e);
        }
    }

    fn check_keepalive(&self) {
        let now = Instant::now();
        let limit = self.settings.keepalive * 2;
        let mut state = self.state();
        if state.status == MailboxStatus::Closed {
            return;
        }

        let (last_ping, last_pong) = (state.last_ping, state.last_pong);
        match last_ping {
            Some(ping) if last_pong.map_or(true, |pong| pong < ping) => {
                if now.duration_since(ping) > limit {
                    error!(
                        "rpc client {} keepalive to {} timed out after {:?}",
                        self.settings.client_id, self.server.id, limit
                    );
                    state.last_ping = None;
                    drop(state);
                    self.closer.notify();
                }
            }
            _ => {
                if let Err(e) = self.push_frame(&state, Frame::Ping) {
                    debug!("Failed to ping {}: {}", self.server.id, e);
                }
                state.last_ping = Some(now);
            }
        }
    }

    fn on_disconnect(&self) {
        let requests = {
            let mut state = self.state();
            if state.status == MailboxStatus::Closed {
                return;
            }
            std::mem::take(&mut state.requests)
        };
        for (_, req) in requests {
            req.timer.abort();
            let _ = req.tx.send(Err(RpcError::Disconnected {
                server_id: self.server.id.clone(),
            }));
        }
        self.closer.notify();
    }
}

async fn write_loop(
    server_id: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!("rpc write to {} failed: {}", server_id, e);
            break;
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Pong)) => shared.state().last_pong = Some(Instant::now()),
            Ok(Some(Frame::Ping)) => {
                let state = shared.state();
                let _ = shared.push_frame(&state, Frame::Pong);
            }
            Ok(Some(frame)) => match shared.settings.wire_format.decode_responses(frame) {
                Ok(responses) => {
                    for resp in responses {
                        shared.resolve(resp);
                    }
                }
                Err(e) => error!(
                    "rpc client {} failed to process message from {}: {}",
                    shared.settings.client_id, shared.server.id, e
                ),
            },
            Ok(None) => {
                info!(
                    "rpc client {} disconnected from remote server {}",
                    shared.settings.client_id, shared.server.id
                );
                break;
            }
            Err(e) => {
                error!(
                    "rpc socket to {} ({}) failed: {}",
                    shared.server.id,
                    shared.server.addr(),
                    e
                );
                break;
            }
        }
    }
    shared.on_disconnect();
}

async fn flush_loop(shared: Arc<Shared>) {
    let mut ticker = time::interval(shared.settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        shared.flush();
    }
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let period = shared.settings.keepalive;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        shared.check_keepalive();
    }
}

async fn request_timer(shared: Arc<Shared>, id: u32, timeout: Duration) {
    time::sleep(timeout).await;
    let pending = shared.state().requests.remove(&id);
    if let Some(req) = pending {
        warn!(
            "rpc {} callback timeout {:?}, request {} to {} at {}",
            shared.settings.client_id,
            timeout,
            id,
            shared.server.id,
            shared.server.addr()
        );
        let _ = req.tx.send(Err(RpcError::RequestTimeout {
            server_id: shared.server.id.clone(),
            request_id: id,
            timeout,
        }));
    }
}
