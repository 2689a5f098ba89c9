//! Mail station: the client-side orchestrator.
//!
//! The station owns the server registry, one mailbox per peer, a bounded
//! queue of calls waiting for each peer's first connection, and the
//! before/after filter chains. Every call goes through [`MailStation::dispatch`]:
//!
//! 1. a call for a peer that is still connecting is queued;
//! 2. a call for a peer with no mailbox creates one, starts the connect and
//!    is queued;
//! 3. anything else runs the before chain, is sent through the mailbox and
//!    runs the after chain on the reply.
//!
//! Once a connect succeeds the queue is replayed through the same path, so
//! queued calls see the filters too. A failed connect evicts the mailbox and
//! leaves the queue in place until the next dispatch triggers a new attempt.

use super::filter::{Filter, FilterChain};
use super::mailbox::{
    CloseNotifier, Mailbox, MailboxClosed, MailboxFactory, MailboxSettings, TcpMailboxFactory,
};
use super::registry::{MembershipEvent, MembershipListener, MembershipSource, Registry, ServerInfo};
use crate::config::{CallOptions, ClientOptions, RpcConfig};
use crate::error::StationErrorKind;
use crate::protocol::RpcMessage;
use crate::{Result, RpcError};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, info, warn};

/// Receives every dispatch-path failure as `(error, server_id, msg, opts)`.
pub type ErrorHandler = Arc<dyn Fn(&RpcError, &str, &RpcMessage, &CallOptions) + Send + Sync>;

/// Notifications published on the station event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StationEvent {
    /// A failure that no error handler consumed.
    Error {
        kind: StationErrorKind,
        server_id: String,
        message: String,
    },
    /// A mailbox lost its connection and was evicted.
    Close { server_id: String },
    AddServer(ServerInfo),
    RemoveServer { server_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationStatus {
    Inited,
    Started,
    Closed,
}

struct MailboxEntry {
    mailbox: Arc<dyn Mailbox>,
    generation: u64,
}

/// A call parked until its peer finishes connecting.
struct PendingCall {
    msg: RpcMessage,
    opts: CallOptions,
    /// Fired when the replay takes the call off the queue.
    started: oneshot::Sender<()>,
    tx: oneshot::Sender<Result<Vec<Value>>>,
}

/// The caller's end of a [`PendingCall`].
struct Queued {
    started: oneshot::Receiver<()>,
    rx: oneshot::Receiver<Result<Vec<Value>>>,
}

struct StationState {
    status: StationStatus,
    registry: Registry,
    mailboxes: HashMap<String, MailboxEntry>,
    connecting: HashSet<String>,
    pending: HashMap<String, VecDeque<PendingCall>>,
    next_generation: u64,
}

struct Inner {
    client_id: String,
    settings: MailboxSettings,
    pending_size: usize,
    grace_timeout: Duration,
    factory: Arc<dyn MailboxFactory>,
    state: Mutex<StationState>,
    before: RwLock<FilterChain>,
    after: RwLock<FilterChain>,
    error_handler: RwLock<Option<ErrorHandler>>,
    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
    events: broadcast::Sender<StationEvent>,
    close_tx: mpsc::UnboundedSender<MailboxClosed>,
    close_rx: Mutex<Option<mpsc::UnboundedReceiver<MailboxClosed>>>,
}

/// What a dispatch does once the station lock is released.
enum Step {
    Wait(Queued),
    Connect {
        mailbox: Arc<dyn Mailbox>,
        generation: u64,
        queued: Queued,
    },
    Send,
}

/// Client-side connection manager. Cheap to clone.
#[derive(Clone)]
pub struct MailStation {
    inner: Arc<Inner>,
}

impl MailStation {
    /// Build a station from client options. Nothing connects until [`start`](Self::start) and the first dispatch.
    pub fn new(opts: &ClientOptions) -> Self {
        let factory = opts
            .mailbox_factory
            .clone()
            .unwrap_or_else(|| Arc::new(TcpMailboxFactory));
        let (events, _) = broadcast::channel(RpcConfig::EVENT_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                client_id: opts.client_id.clone(),
                settings: MailboxSettings::from(opts),
                pending_size: opts.pending_size,
                grace_timeout: opts.grace_timeout,
                factory,
                state: Mutex::new(StationState {
                    status: StationStatus::Inited,
                    registry: Registry::new(),
                    mailboxes: HashMap::new(),
                    connecting: HashSet::new(),
                    pending: HashMap::new(),
                    next_generation: 0,
                }),
                before: RwLock::new(FilterChain::new()),
                after: RwLock::new(FilterChain::new()),
                error_handler: RwLock::new(None),
                listeners: RwLock::new(Vec::new()),
                events,
                close_tx,
                close_rx: Mutex::new(Some(close_rx)),
            }),
        }
    }

    /// Start accepting dispatches.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state();
            if state.status != StationStatus::Inited {
                return Err(RpcError::AlreadyStarted {
                    component: "mail station",
                });
            }
            state.status = StationStatus::Started;
        }

        let close_rx = self
            .inner
            .close_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rx) = close_rx {
            tokio::spawn(close_loop(Arc::downgrade(&self.inner), rx));
        }
        info!("mail station for {} started", self.inner.client_id);
        Ok(())
    }

    /// Stop the station.
    ///
    /// A forced stop closes every mailbox now; otherwise mailboxes stay open
    /// for the grace period so in-flight replies can arrive.
    pub fn stop(&self, force: bool) -> Result<()> {
        {
            let mut state = self.inner.state();
            if state.status != StationStatus::Started {
                warn!("mail station for {} is not running", self.inner.client_id);
                return Err(RpcError::NotStarted);
            }
            state.status = StationStatus::Closed;
        }

        if force {
            self.inner.close_all();
        } else {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                time::sleep(inner.grace_timeout).await;
                inner.close_all();
            });
        }
        info!("mail station for {} stopped (force: {})", self.inner.client_id, force);
        Ok(())
    }

    /// Current lifecycle state.
    pub fn status(&self) -> StationStatus {
        self.inner.state().status
    }

    /// Send `msg` to `server_id` and wait for the reply's result values.
    ///
    /// Failures are also routed to the error handler, or logged and
    /// published as [`StationEvent::Error`] when none is set.
    pub async fn dispatch(
        &self,
        server_id: impl Into<String>,
        msg: RpcMessage,
        opts: CallOptions,
    ) -> Result<Vec<Value>> {
        self.inner.clone().dispatch(server_id.into(), msg, opts).await
    }

    // Registry mutations

    /// Register a server and mark it online. Servers with an empty id are ignored.
    pub fn add_server(&self, server: ServerInfo) {
        let added = self.inner.state().registry.add(server.clone());
        if !added {
            warn!("ignoring server with empty id: {:?}", server);
            return;
        }
        debug!("added server {} ({})", server.id, server.server_type);
        self.inner.notify(MembershipEvent::Added(server.clone()));
        let _ = self.inner.events.send(StationEvent::AddServer(server));
    }

    /// Register several servers, emitting one add event each.
    pub fn add_servers(&self, servers: Vec<ServerInfo>) {
        for server in servers {
            self.add_server(server);
        }
    }

    /// Mark a server offline and close its mailbox.
    pub fn remove_server(&self, server_id: &str) {
        let (server_type, entry) = {
            let mut state = self.inner.state();
            let server_type = state.registry.remove(server_id);
            (server_type, state.mailboxes.remove(server_id))
        };
        if let Some(entry) = entry {
            entry.mailbox.close();
        }
        debug!("removed server {}", server_id);
        self.inner.notify(MembershipEvent::Removed {
            server_id: server_id.to_string(),
            server_type,
        });
        let _ = self.inner.events.send(StationEvent::RemoveServer {
            server_id: server_id.to_string(),
        });
    }

    /// Remove several servers, closing their mailboxes.
    pub fn remove_servers<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in ids {
            self.remove_server(id.as_ref());
        }
    }

    /// Reset membership to exactly `servers`.
    ///
    /// Existing mailboxes stay open. Listeners see a removal for every
    /// server that drops out and an addition for every server in the list.
    pub fn replace_servers(&self, servers: Vec<ServerInfo>) {
        let dropped: Vec<(String, String)> = {
            let mut state = self.inner.state();
            let keep: HashSet<&str> = servers.iter().map(|s| s.id.as_str()).collect();
            let mut dropped = Vec::new();
            for server_type in state.registry.server_types() {
                for id in state.registry.online_ids(&server_type) {
                    if !keep.contains(id.as_str()) {
                        dropped.push((id, server_type.clone()));
                    }
                }
            }
            state.registry.replace(servers.clone());
            dropped
        };

        for (server_id, server_type) in dropped {
            self.inner.notify(MembershipEvent::Removed {
                server_id: server_id.clone(),
                server_type: Some(server_type),
            });
            let _ = self.inner.events.send(StationEvent::RemoveServer { server_id });
        }
        for server in servers.into_iter().filter(|s| !s.id.is_empty()) {
            self.inner.notify(MembershipEvent::Added(server.clone()));
            let _ = self.inner.events.send(StationEvent::AddServer(server));
        }
    }

    // Registry queries

    /// Registry entry for `server_id`, online or not.
    pub fn server(&self, server_id: &str) -> Option<ServerInfo> {
        self.inner.state().registry.get(server_id).cloned()
    }

    /// Whether `server_id` is registered and online.
    pub fn is_online(&self, server_id: &str) -> bool {
        self.inner.state().registry.is_online(server_id)
    }

    /// Ids of the online servers of a type, in registration order.
    pub fn online_ids(&self, server_type: &str) -> Vec<String> {
        self.inner.state().registry.online_ids(server_type)
    }

    /// Online servers of a type, in registration order.
    pub fn servers_by_type(&self, server_type: &str) -> Vec<ServerInfo> {
        self.inner.state().registry.servers_by_type(server_type)
    }

    // Filters and observers

    /// Append a filter to the before chain.
    pub fn before(&self, filter: Arc<dyn Filter>) {
        write(&self.inner.before).push(filter);
    }

    /// Append several filters to the before chain.
    pub fn before_all(&self, filters: Vec<Arc<dyn Filter>>) {
        write(&self.inner.before).extend(filters);
    }

    /// Append a filter to the after chain.
    pub fn after(&self, filter: Arc<dyn Filter>) {
        write(&self.inner.after).push(filter);
    }

    /// Append several filters to the after chain.
    pub fn after_all(&self, filters: Vec<Arc<dyn Filter>>) {
        write(&self.inner.after).extend(filters);
    }

    /// Register the same filter on both chains.
    pub fn filter(&self, filter: Arc<dyn Filter>) {
        self.before(filter.clone());
        self.after(filter);
    }

    /// Route dispatch failures to `handler` instead of logging them and publishing [`StationEvent::Error`].
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *write(&self.inner.error_handler) = Some(handler);
    }

    /// Subscribe to registry add/remove notifications. Listeners are called
    /// synchronously and must not call back into the station.
    pub fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        write(&self.inner.listeners).push(listener);
    }

    /// Subscribe to station events.
    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.inner.events.subscribe()
    }

    // Introspection

    /// Whether a mailbox (connected or connecting) exists for `server_id`.
    pub fn has_mailbox(&self, server_id: &str) -> bool {
        self.inner.state().mailboxes.contains_key(server_id)
    }

    /// Number of live mailboxes.
    pub fn mailbox_count(&self) -> usize {
        self.inner.state().mailboxes.len()
    }

    /// Whether a connect to `server_id` is in flight.
    pub fn is_connecting(&self, server_id: &str) -> bool {
        self.inner.state().connecting.contains(server_id)
    }

    /// Calls queued for a peer that has not connected yet.
    pub fn pending_count(&self, server_id: &str) -> usize {
        self.inner
            .state()
            .pending
            .get(server_id)
            .map_or(0, VecDeque::len)
    }
}

impl MembershipSource for MailStation {
    fn servers_by_type(&self, server_type: &str) -> Vec<ServerInfo> {
        MailStation::servers_by_type(self, server_type)
    }
}

impl std::fmt::Debug for MailStation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailStation")
            .field("client_id", &self.inner.client_id)
            .field("status", &self.status())
            .finish()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, StationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(
        self: Arc<Self>,
        server_id: String,
        msg: RpcMessage,
        opts: CallOptions,
    ) -> BoxFuture<'static, Result<Vec<Value>>> {
        async move {
            let step = match self.plan(&server_id, &msg, &opts) {
                Ok(step) => step,
                Err(e) => return Err(self.fail(e, &server_id, &msg, &opts)),
            };

            match step {
                Step::Wait(queued) => self.wait(queued, &server_id, &msg, &opts).await,
                Step::Connect {
                    mailbox,
                    generation,
                    queued,
                } => {
                    tokio::spawn(self.clone().connect(
                        server_id.clone(),
                        mailbox,
                        generation,
                        msg.clone(),
                        opts.clone(),
                    ));
                    self.wait(queued, &server_id, &msg, &opts).await
                }
                Step::Send => self.send(server_id, msg, opts).await,
            }
        }
        .boxed()
    }

    /// Decide what to do with a call, under the station lock.
    fn plan(&self, server_id: &str, msg: &RpcMessage, opts: &CallOptions) -> Result<Step> {
        let mut state = self.state();
        if state.status != StationStatus::Started {
            return Err(RpcError::NotStarted);
        }

        if state.connecting.contains(server_id) {
            return self.enqueue(&mut state, server_id, msg, opts).map(Step::Wait);
        }
        if state.mailboxes.contains_key(server_id) {
            return Ok(Step::Send);
        }

        let server = match state.registry.get(server_id) {
            Some(server) if state.registry.is_online(server_id) => server.clone(),
            _ => {
                return Err(RpcError::NoTargetServer {
                    server_id: server_id.to_string(),
                })
            }
        };

        // Queue first so a full queue leaves no mailbox behind.
        let queued = self.enqueue(&mut state, server_id, msg, opts)?;
        let generation = state.next_generation;
        state.next_generation += 1;
        let closer = CloseNotifier::new(server_id, generation, self.close_tx.clone());
        let mailbox = self.factory.create(&server, &self.settings, closer);
        state.mailboxes.insert(
            server_id.to_string(),
            MailboxEntry {
                mailbox: mailbox.clone(),
                generation,
            },
        );
        state.connecting.insert(server_id.to_string());

        Ok(Step::Connect {
            mailbox,
            generation,
            queued,
        })
    }

    fn enqueue(
        &self,
        state: &mut StationState,
        server_id: &str,
        msg: &RpcMessage,
        opts: &CallOptions,
    ) -> Result<Queued> {
        let queue = state.pending.entry(server_id.to_string()).or_default();
        // Callers that gave up no longer count against the bound.
        queue.retain(|call| !call.tx.is_closed());
        if queue.len() >= self.pending_size {
            warn!(
                "pending queue for {} is full ({} calls), dropping {}",
                server_id,
                self.pending_size,
                msg.route()
            );
            return Err(RpcError::PendingQueueFull {
                server_id: server_id.to_string(),
                limit: self.pending_size,
            });
        }
        let (started_tx, started) = oneshot::channel();
        let (tx, rx) = oneshot::channel();
        queue.push_back(PendingCall {
            msg: msg.clone(),
            opts: opts.clone(),
            started: started_tx,
            tx,
        });
        Ok(Queued { started, rx })
    }

    /// Wait for a queued call to be replayed.
    ///
    /// The request timeout bounds only the time spent in the queue. Once the
    /// replay has taken the call, the replayed dispatch owns it: it applies
    /// the mailbox timeout, routes its own failures, and its result is
    /// returned unchanged.
    async fn wait(
        &self,
        queued: Queued,
        server_id: &str,
        msg: &RpcMessage,
        opts: &CallOptions,
    ) -> Result<Vec<Value>> {
        let Queued { mut started, rx } = queued;
        let timeout = opts.timeout.unwrap_or(self.settings.timeout);
        let taken = match time::timeout(timeout, &mut started).await {
            // A dropped sender means the queue was cleared; `rx` reports it.
            Ok(_) => true,
            Err(_) => {
                // Closing first settles a replay racing with the deadline.
                started.close();
                started.try_recv().is_ok()
            }
        };
        if !taken {
            return Err(self.fail(
                RpcError::ConnectTimeout {
                    server_id: server_id.to_string(),
                    timeout,
                },
                server_id,
                msg,
                opts,
            ));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.fail(
                RpcError::MailboxClosed {
                    server_id: server_id.to_string(),
                },
                server_id,
                msg,
                opts,
            )),
        }
    }

    async fn connect(
        self: Arc<Self>,
        server_id: String,
        mailbox: Arc<dyn Mailbox>,
        generation: u64,
        msg: RpcMessage,
        opts: CallOptions,
    ) {
        match mailbox.connect().await {
            Ok(()) => {
                let queued = {
                    let mut state = self.state();
                    state.connecting.remove(&server_id);
                    state.pending.remove(&server_id).unwrap_or_default()
                };
                debug!("flushing {} queued calls to {}", queued.len(), server_id);

                let replays: Vec<_> = queued
                    .into_iter()
                    .filter_map(|call| {
                        let PendingCall {
                            msg,
                            opts,
                            started,
                            tx,
                        } = call;
                        // Callers that already timed out are not replayed.
                        if tx.is_closed() || started.send(()).is_err() {
                            return None;
                        }
                        let inner = self.clone();
                        let id = server_id.clone();
                        Some(async move {
                            let result = inner.dispatch(id, msg, opts).await;
                            let _ = tx.send(result);
                        })
                    })
                    .collect();
                // One task, polled in queue order, keeps wire order.
                future::join_all(replays).await;
            }
            Err(e) => {
                let evicted = {
                    let mut state = self.state();
                    state.connecting.remove(&server_id);
                    match state.mailboxes.get(&server_id) {
                        Some(entry) if entry.generation == generation => {
                            state.mailboxes.remove(&server_id)
                        }
                        _ => None,
                    }
                };
                if let Some(entry) = evicted {
                    entry.mailbox.close();
                }
                self.fail(e, &server_id, &msg, &opts);
            }
        }
    }

    async fn send(
        &self,
        server_id: String,
        msg: RpcMessage,
        opts: CallOptions,
    ) -> Result<Vec<Value>> {
        let before = read(&self.before).clone();
        let (target, msg, opts) = match before.run(server_id.clone(), msg.clone(), opts.clone()) {
            Ok(call) => call,
            Err(e) => return Err(self.fail(e, &server_id, &msg, &opts)),
        };

        let mailbox = self
            .state()
            .mailboxes
            .get(&target)
            .map(|entry| entry.mailbox.clone());
        let Some(mailbox) = mailbox else {
            return Err(self.fail(
                RpcError::MailboxNotFound {
                    server_id: target.clone(),
                },
                &target,
                &msg,
                &opts,
            ));
        };

        let response = match mailbox.send(msg.clone(), opts.clone()).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(e, &target, &msg, &opts)),
        };

        let after = read(&self.after).clone();
        if let Err(e) = after.run(target.clone(), msg.clone(), opts.clone()) {
            return Err(self.fail(e, &target, &msg, &opts));
        }
        response.into_result()
    }

    /// Route a failure and hand it back for the caller.
    fn fail(&self, err: RpcError, server_id: &str, msg: &RpcMessage, opts: &CallOptions) -> RpcError {
        let handler = read(&self.error_handler).clone();
        match handler {
            Some(handler) => handler(&err, server_id, msg, opts),
            None => {
                let kind = err.station_kind();
                error!(
                    "rpc {} to {} failed ({}): {}",
                    msg.route(),
                    server_id,
                    kind,
                    err
                );
                let _ = self.events.send(StationEvent::Error {
                    kind,
                    server_id: server_id.to_string(),
                    message: err.to_string(),
                });
            }
        }
        err
    }

    fn notify(&self, event: MembershipEvent) {
        let listeners = read(&self.listeners).clone();
        for listener in listeners {
            listener.on_membership(&event);
        }
    }

    fn on_mailbox_closed(&self, closed: MailboxClosed) {
        let entry = {
            let mut state = self.state();
            match state.mailboxes.get(&closed.server_id) {
                Some(entry) if entry.generation == closed.generation => {
                    state.mailboxes.remove(&closed.server_id)
                }
                _ => None,
            }
        };
        if let Some(entry) = entry {
            entry.mailbox.close();
            debug!("mailbox for {} closed", closed.server_id);
            let _ = self.events.send(StationEvent::Close {
                server_id: closed.server_id,
            });
        }
    }

    fn close_all(&self) {
        let entries: Vec<MailboxEntry> = {
            let mut state = self.state();
            state.connecting.clear();
            // Dropping the senders wakes every queued caller.
            state.pending.clear();
            state.mailboxes.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.mailbox.close();
        }
    }
}

async fn close_loop(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<MailboxClosed>) {
    while let Some(closed) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_mailbox_closed(closed);
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
