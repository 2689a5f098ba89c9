//! Inbound connections.
//!
//! The accept loop hands each connection to its own task. A connection task
//! reads frames, answers pings, and spawns one task per request so slow
//! methods never block the connection. Replies go through a writer task,
//! either one frame per reply or coalesced on a flush timer.
//!
//! # Shutdown
//!
//! Stopping the acceptor ends the accept loop and signals every connection
//! task through a watch channel.

use super::dispatcher::Dispatcher;
use super::gateway::GatewayEvent;
use crate::protocol::{
    read_frame, salvage_request_id, write_frame, Frame, ResponseEnvelope, WireFormat,
};
use crate::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Connection-level settings.
#[derive(Debug, Clone)]
pub struct AcceptorSettings {
    pub buffer_msg: bool,
    pub interval: Duration,
    pub wire_format: WireFormat,
    pub max_connections: usize,
}

/// Handle to a running acceptor. Dropping shuts it down.
pub struct AcceptorHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl AcceptorHandle {
    /// Address the listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for AcceptorHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

struct Connection {
    dispatcher: Arc<Dispatcher>,
    settings: AcceptorSettings,
    events: broadcast::Sender<GatewayEvent>,
    peer: SocketAddr,
}

pub struct Acceptor;

impl Acceptor {
    /// Bind `addr` and spawn the accept loop.
    pub async fn start(
        addr: &str,
        settings: AcceptorSettings,
        dispatcher: Arc<Dispatcher>,
        events: broadcast::Sender<GatewayEvent>,
    ) -> Result<AcceptorHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("rpc acceptor listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            settings,
            dispatcher,
            events,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(AcceptorHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        settings: AcceptorSettings,
        dispatcher: Arc<Dispatcher>,
        events: broadcast::Sender<GatewayEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("rpc acceptor shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= settings.max_connections {
                                warn!(
                                    "Rejecting rpc connection from {}: at max capacity ({})",
                                    peer_addr,
                                    settings.max_connections
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let conn = Arc::new(Connection {
                                dispatcher: dispatcher.clone(),
                                settings: settings.clone(),
                                events: events.clone(),
                                peer: peer_addr,
                            });
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("rpc connection from {}", peer_addr);
                                if let Err(e) = conn.clone().run(stream, &mut conn_shutdown).await {
                                    debug!("rpc connection {} ended: {}", peer_addr, e);
                                    let _ = conn.events.send(GatewayEvent::Error {
                                        message: format!("connection {}: {}", peer_addr, e),
                                    });
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("rpc accept error: {}", e);
                            let _ = events.send(GatewayEvent::Error {
                                message: format!("accept failed: {}", e),
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Outbound side of one connection.
#[derive(Clone)]
struct Responder {
    wire_format: WireFormat,
    /// Replies waiting for the next flush; `None` when not buffering.
    queue: Option<Arc<Mutex<Vec<ResponseEnvelope>>>>,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl Responder {
    fn send(&self, response: ResponseEnvelope) {
        if let Some(queue) = &self.queue {
            queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(response);
            return;
        }
        match self
            .wire_format
            .encode_responses(std::slice::from_ref(&response))
        {
            Ok(frame) => {
                let _ = self.outbound.send(frame);
            }
            Err(e) => error!("failed to encode response {}: {}", response.id, e),
        }
    }

    fn flush(&self) {
        let Some(queue) = &self.queue else {
            return;
        };
        let pending = std::mem::take(&mut *queue.lock().unwrap_or_else(PoisonError::into_inner));
        if pending.is_empty() {
            return;
        }
        match self.wire_format.encode_responses(&pending) {
            Ok(frame) => {
                let _ = self.outbound.send(frame);
            }
            Err(e) => {
                // One bad reply must not sink the rest of the batch.
                warn!("batch encode failed ({}), sending {} replies singly", e, pending.len());
                for response in pending {
                    match self
                        .wire_format
                        .encode_responses(std::slice::from_ref(&response))
                    {
                        Ok(frame) => {
                            let _ = self.outbound.send(frame);
                        }
                        Err(e) => error!("failed to encode response {}: {}", response.id, e),
                    }
                }
            }
        }
    }
}

impl Connection {
    async fn run(
        self: Arc<Self>,
        stream: TcpStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let responder = Responder {
            wire_format: self.settings.wire_format.clone(),
            queue: self
                .settings
                .buffer_msg
                .then(|| Arc::new(Mutex::new(Vec::new()))),
            outbound,
        };

        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, self.peer));
        let flush_task = self
            .settings
            .buffer_msg
            .then(|| tokio::spawn(flush_loop(responder.clone(), self.settings.interval)));

        let result = loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown_rx.changed() => break Ok(()),
            };
            self.on_frame(frame, &responder);
        };

        if let Some(task) = flush_task {
            task.abort();
        }
        responder.flush();
        drop(responder);
        if *shutdown_rx.borrow() {
            writer_task.abort();
        }
        result
    }

    fn on_frame(self: &Arc<Self>, frame: Frame, responder: &Responder) {
        match frame {
            Frame::Ping => {
                let _ = responder.outbound.send(Frame::Pong);
            }
            Frame::Pong => {}
            frame => {
                let retained = matches!(frame, Frame::Json(_)).then(|| frame.clone());
                match self.settings.wire_format.decode_requests(frame) {
                    Ok(requests) => {
                        for request in requests {
                            let conn = self.clone();
                            let responder = responder.clone();
                            tokio::spawn(async move {
                                let id = request.id;
                                let route = request.msg.route();
                                let response = match conn.dispatcher.route(request.msg).await {
                                    Ok(values) => ResponseEnvelope::success(id, values),
                                    Err(e) => {
                                        warn!("rpc {} from {} failed: {}", route, conn.peer, e);
                                        ResponseEnvelope::failure(id, &e)
                                    }
                                };
                                responder.send(response);
                            });
                        }
                    }
                    Err(e) => {
                        match retained.as_ref().and_then(salvage_request_id) {
                            Some(id) => responder.send(ResponseEnvelope::failure(id, &e)),
                            None => warn!("dropping undecodable frame from {}: {}", self.peer, e),
                        }
                        let _ = self.events.send(GatewayEvent::Error {
                            message: format!("bad request from {}: {}", self.peer, e),
                        });
                    }
                }
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    peer: SocketAddr,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!("write to {} failed: {}", peer, e);
            break;
        }
    }
}

async fn flush_loop(responder: Responder, period: Duration) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        responder.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Namespace, RequestEnvelope, RpcMessage};
    use crate::server::{Service, ServiceCatalog};
    use serde_json::{json, Value};

    fn settings(buffer_msg: bool) -> AcceptorSettings {
        AcceptorSettings {
            buffer_msg,
            interval: Duration::from_millis(20),
            wire_format: WireFormat::Json,
            max_connections: 4,
        }
    }

    async fn start(buffer_msg: bool) -> (AcceptorHandle, broadcast::Receiver<GatewayEvent>) {
        let echo = Service::new("echoRemote")
            .sync_method("echo", Ok)
            .method("slow", |args| async move {
                time::sleep(Duration::from_millis(50)).await;
                Ok(args)
            });
        let dispatcher = Arc::new(Dispatcher::new(
            ServiceCatalog::new().with_service(Namespace::User, echo),
        ));
        let (events, rx) = broadcast::channel(16);
        let handle = Acceptor::start("127.0.0.1:0", settings(buffer_msg), dispatcher, events)
            .await
            .unwrap();
        (handle, rx)
    }

    fn request(id: u32, method: &str, arg: Value) -> RequestEnvelope {
        RequestEnvelope {
            id,
            msg: RpcMessage::new(Namespace::User, "echo", "echoRemote", method)
                .with_args(vec![arg]),
        }
    }

    async fn send(stream: &mut TcpStream, requests: &[RequestEnvelope]) {
        let frame = WireFormat::Json.encode_requests(requests).unwrap();
        write_frame(stream, &frame).await.unwrap();
    }

    async fn recv(stream: &mut TcpStream) -> Vec<ResponseEnvelope> {
        let frame = read_frame(stream).await.unwrap().unwrap();
        WireFormat::Json.decode_responses(frame).unwrap()
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (handle, _events) = start(false).await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        send(&mut stream, &[request(7, "echo", json!("hi"))]).await;
        let replies = recv(&mut stream).await;
        assert_eq!(replies, vec![ResponseEnvelope::success(7, vec![json!("hi")])]);
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (handle, _events) = start(false).await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        write_frame(&mut stream, &Frame::Ping).await.unwrap();
        assert_eq!(read_frame(&mut stream).await.unwrap(), Some(Frame::Pong));
    }

    #[tokio::test]
    async fn test_unknown_method_gets_error_reply() {
        let (handle, _events) = start(false).await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        send(&mut stream, &[request(3, "missing", json!(1))]).await;
        let reply = recv(&mut stream).await.remove(0);
        assert_eq!(reply.id, 3);
        match reply.into_result() {
            Err(crate::RpcError::Remote { message, .. }) => {
                assert_eq!(message, "no such method: missing")
            }
            other => panic!("Expected remote error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undecodable_request_with_id_gets_reply() {
        let (handle, mut events) = start(false).await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let bad = serde_json::to_vec(&json!({"id": 11, "msg": {"namespace": "nowhere"}})).unwrap();
        write_frame(&mut stream, &Frame::Json(bad)).await.unwrap();
        let reply = recv(&mut stream).await.remove(0);
        assert_eq!(reply.id, 11);
        assert!(reply.into_result().is_err());
        assert!(matches!(
            events.recv().await.unwrap(),
            GatewayEvent::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_replies_out_of_order_by_id() {
        let (handle, _events) = start(false).await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        send(
            &mut stream,
            &[request(1, "slow", json!("a")), request(2, "echo", json!("b"))],
        )
        .await;
        let first = recv(&mut stream).await.remove(0);
        let second = recv(&mut stream).await.remove(0);
        assert_eq!(first.id, 2);
        assert_eq!(second.id, 1);
    }

    #[tokio::test]
    async fn test_buffered_replies_are_batched() {
        let (handle, _events) = start(true).await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let requests: Vec<_> = (0..3).map(|i| request(i, "echo", json!(i))).collect();
        send(&mut stream, &requests).await;

        let mut replies = Vec::new();
        let mut frames = 0;
        while replies.len() < 3 {
            replies.extend(recv(&mut stream).await);
            frames += 1;
        }
        // Coalesced by the flush timer.
        assert!(frames < 3, "got {} frames for 3 replies", frames);
        replies.sort_by_key(|r| r.id);
        assert_eq!(replies[2], ResponseEnvelope::success(2, vec![json!(2)]));
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (handle, _events) = start(false).await;
        let mut open = Vec::new();
        for _ in 0..4 {
            let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
            // Round trip so the server has counted the connection.
            write_frame(&mut stream, &Frame::Ping).await.unwrap();
            read_frame(&mut stream).await.unwrap();
            open.push(stream);
        }

        let mut extra = TcpStream::connect(handle.addr()).await.unwrap();
        write_frame(&mut extra, &Frame::Ping).await.ok();
        let result = time::timeout(Duration::from_millis(500), read_frame(&mut extra)).await;
        match result {
            Ok(Ok(None)) | Ok(Err(_)) => {}
            other => panic!("Expected refused connection, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (mut handle, _events) = start(false).await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        write_frame(&mut stream, &Frame::Ping).await.unwrap();
        read_frame(&mut stream).await.unwrap();

        handle.shutdown();
        let result = time::timeout(Duration::from_secs(1), read_frame(&mut stream)).await;
        assert!(matches!(result, Ok(Ok(None)) | Ok(Err(_))));
    }
}
