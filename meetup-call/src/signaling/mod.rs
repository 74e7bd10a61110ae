//! Request/response and notification channel to the signaling server
//!
//! One `SignalingChannel` wraps one connection for the lifetime of one call
//! session:
//!
//! - client requests are correlated to responses by a numeric id and resolved
//!   by the reader task, so a response can arrive while the dispatcher is busy
//! - server requests and notifications go through a single dispatcher task
//!   and reach the `InboundHandler` strictly in arrival order
//! - every server request is answered exactly once; silence is turned into a
//!   408 reject, a handler that returns without answering into a 500 reject

mod connector;
mod websocket;

pub use connector::{Endpoint, SignalingConnector, SignalingLink};
pub use websocket::WebSocketConnector;

use async_trait::async_trait;
use meetup_proto::{error_codes, Message};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SignalingConfig;
use crate::error::SignalingError;

type Outbound = Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>;

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value, SignalingError>>,
}

#[derive(Default)]
struct PendingTable {
    /// Set once the channel is closed or lost; later requests fail with it
    closed: Option<SignalingError>,
    entries: HashMap<u64, PendingRequest>,
}

impl PendingTable {
    fn fail_all(&mut self, error: &SignalingError) -> usize {
        if self.closed.is_none() {
            self.closed = Some(error.clone());
        }
        let entries = std::mem::take(&mut self.entries);
        let count = entries.len();
        for (_, entry) in entries {
            let _ = entry.tx.send(Err(error.clone()));
        }
        count
    }
}

/// Removes a pending entry when the waiting request future goes away
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingTable>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().entries.remove(&self.id);
    }
}

enum Inbound {
    Request { id: u64, method: String, data: Value },
    Notification { method: String, data: Value },
    Disconnected,
}

/// Receives everything the server sends on its own initiative.
///
/// Called from one dispatcher task, one message at a time.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Must answer `request` (accept or reject) before returning
    async fn on_server_request(&self, request: ServerRequest);

    async fn on_notification(&self, notification: Notification);

    /// The connection dropped without `close()` being called
    async fn on_disconnected(&self);
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub data: Value,
}

impl Notification {
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

struct Responder {
    id: u64,
    method: String,
    outbound: Option<mpsc::WeakUnboundedSender<Message>>,
    answered: AtomicBool,
}

impl Responder {
    fn answer(&self, message: Message) -> Result<(), SignalingError> {
        if self.answered.swap(true, Ordering::SeqCst) {
            return Err(SignalingError::Protocol(format!(
                "{} request {} already answered",
                self.method, self.id
            )));
        }
        let sender = self
            .outbound
            .as_ref()
            .and_then(mpsc::WeakUnboundedSender::upgrade)
            .ok_or(SignalingError::ConnectionLost)?;
        sender
            .send(message)
            .map_err(|_| SignalingError::ConnectionLost)
    }

    /// Rejects the request if nobody answered it yet; returns whether it did
    fn reject_unanswered(&self, code: i32, reason: &str) -> bool {
        if self.answered.load(Ordering::SeqCst) {
            return false;
        }
        let _ = self.answer(Message::error(self.id, code, reason));
        true
    }
}

/// A request initiated by the server, answered with `accept` or `reject`
pub struct ServerRequest {
    id: u64,
    method: String,
    data: Value,
    responder: Arc<Responder>,
}

impl ServerRequest {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub const fn data(&self) -> &Value {
        &self.data
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    pub fn accept(&self, data: Value) -> Result<(), SignalingError> {
        debug!(id = self.id, method = %self.method, "Accepting server request");
        self.responder.answer(Message::success(self.id, data))
    }

    pub fn reject(&self, code: i32, reason: impl Into<String>) -> Result<(), SignalingError> {
        let reason = reason.into();
        debug!(id = self.id, method = %self.method, code, reason = %reason, "Rejecting server request");
        self.responder.answer(Message::error(self.id, code, reason))
    }

    #[must_use]
    pub fn is_answered(&self) -> bool {
        self.responder.answered.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ServerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRequest")
            .field("id", &self.id)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// Single-use signaling connection
pub struct SignalingChannel {
    config: SignalingConfig,
    connector: Arc<dyn SignalingConnector>,
    opened: AtomicBool,
    next_id: AtomicU64,
    pending: Arc<Mutex<PendingTable>>,
    outbound: Outbound,
    events_tx: mpsc::UnboundedSender<Inbound>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    shutdown: CancellationToken,
}

impl SignalingChannel {
    pub fn new(connector: Arc<dyn SignalingConnector>, config: SignalingConfig) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            connector,
            opened: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(PendingTable::default())),
            outbound: Arc::new(Mutex::new(None)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Connect to `endpoint`. Only the first call may proceed; the channel
    /// cannot be reopened after it closed.
    pub async fn open(&self, endpoint: &Endpoint) -> Result<(), SignalingError> {
        if self.opened.swap(true, Ordering::SeqCst) {
            return Err(SignalingError::AlreadyOpen);
        }

        let link = tokio::select! {
            () = self.shutdown.cancelled() => return Err(SignalingError::Cancelled),
            result = tokio::time::timeout(self.config.open_timeout(), self.connector.connect(endpoint)) => {
                match result {
                    Ok(link) => link?,
                    Err(_) => {
                        return Err(SignalingError::Timeout {
                            method: "open".to_string(),
                        })
                    }
                }
            }
        };

        {
            let mut outbound = self.outbound.lock();
            if self.shutdown.is_cancelled() {
                return Err(SignalingError::Cancelled);
            }
            *outbound = Some(link.outbound);
        }

        tokio::spawn(read_loop(
            link.inbound,
            self.pending.clone(),
            self.events_tx.clone(),
            self.shutdown.clone(),
        ));

        info!(
            room_id = %endpoint.room_id,
            peer_id = %endpoint.peer_id,
            "Signaling channel open"
        );
        Ok(())
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.outbound.lock().is_some() && self.pending.lock().closed.is_none()
    }

    /// Send a request and decode its response
    pub async fn request<P, T>(&self, method: &str, payload: &P) -> Result<T, SignalingError>
    where
        P: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let data = serde_json::to_value(payload)
            .map_err(|e| SignalingError::Protocol(format!("invalid {method} payload: {e}")))?;
        let response = self.request_value(method, data).await?;
        T::deserialize(&response)
            .map_err(|e| SignalingError::Protocol(format!("invalid {method} response: {e}")))
    }

    /// Send a request whose response carries no data
    pub async fn request_ack<P>(&self, method: &str, payload: &P) -> Result<(), SignalingError>
    where
        P: Serialize + Sync + ?Sized,
    {
        let data = serde_json::to_value(payload)
            .map_err(|e| SignalingError::Protocol(format!("invalid {method} payload: {e}")))?;
        self.request_value(method, data).await.map(|_| ())
    }

    pub async fn request_value(&self, method: &str, data: Value) -> Result<Value, SignalingError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if let Some(error) = &pending.closed {
                return Err(error.clone());
            }
            pending.entries.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    tx,
                },
            );
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        match self.outbound.lock().as_ref() {
            Some(outbound) => outbound
                .send(Message::request(id, method, data))
                .map_err(|_| SignalingError::ConnectionLost)?,
            None => return Err(SignalingError::NotOpen),
        }
        debug!(id, method, "Sent signaling request");

        match tokio::time::timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SignalingError::Cancelled),
            Err(_) => {
                warn!(id, method, "Signaling request timed out");
                Err(SignalingError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Fire-and-forget message to the server
    pub fn notify<P>(&self, method: &str, payload: &P) -> Result<(), SignalingError>
    where
        P: Serialize + ?Sized,
    {
        let data = serde_json::to_value(payload)
            .map_err(|e| SignalingError::Protocol(format!("invalid {method} payload: {e}")))?;
        match self.outbound.lock().as_ref() {
            Some(outbound) => outbound
                .send(Message::notification(method, data))
                .map_err(|_| SignalingError::ConnectionLost),
            None => Err(SignalingError::NotOpen),
        }
    }

    /// Start delivering server requests and notifications to `handler`.
    ///
    /// Only one dispatcher may run per channel.
    pub fn spawn_dispatcher(
        &self,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<JoinHandle<()>, SignalingError> {
        let events = self.events_rx.lock().take().ok_or_else(|| {
            SignalingError::Protocol("dispatcher already running".to_string())
        })?;

        Ok(tokio::spawn(dispatch_loop(
            events,
            handler,
            self.outbound.clone(),
            self.shutdown.clone(),
            self.config.server_request_timeout(),
        )))
    }

    /// Cancel every pending request and drop the connection. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();

        let cancelled = self.pending.lock().fail_all(&SignalingError::Cancelled);
        if self.outbound.lock().take().is_some() {
            info!(cancelled, "Signaling channel closed");
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_loop(
    mut inbound: mpsc::UnboundedReceiver<Message>,
    pending: Arc<Mutex<PendingTable>>,
    events: mpsc::UnboundedSender<Inbound>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            message = inbound.recv() => message,
        };

        match message {
            Some(Message::Response {
                id,
                ok,
                data,
                error_code,
                error_reason,
            }) => {
                let Some(entry) = pending.lock().entries.remove(&id) else {
                    debug!(id, "Response for unknown or abandoned request");
                    continue;
                };
                let result = if ok {
                    Ok(data)
                } else {
                    let code = error_code.unwrap_or(error_codes::INTERNAL_ERROR);
                    let reason = error_reason.unwrap_or_default();
                    debug!(id, method = %entry.method, code, reason = %reason, "Request rejected");
                    Err(SignalingError::Rejected { code, reason })
                };
                let _ = entry.tx.send(result);
            }
            Some(Message::Request { id, method, data }) => {
                let _ = events.send(Inbound::Request { id, method, data });
            }
            Some(Message::Notification { method, data }) => {
                let _ = events.send(Inbound::Notification { method, data });
            }
            None => {
                if shutdown.is_cancelled() {
                    break;
                }
                let failed = pending.lock().fail_all(&SignalingError::ConnectionLost);
                warn!(failed, "Signaling connection lost");
                let _ = events.send(Inbound::Disconnected);
                break;
            }
        }
    }

    debug!("Signaling read loop terminated");
}

async fn dispatch_loop(
    mut events: mpsc::UnboundedReceiver<Inbound>,
    handler: Arc<dyn InboundHandler>,
    outbound: Outbound,
    shutdown: CancellationToken,
    server_request_timeout: Duration,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            Inbound::Request { id, method, data } => {
                let responder = Arc::new(Responder {
                    id,
                    method: method.clone(),
                    outbound: outbound
                        .lock()
                        .as_ref()
                        .map(mpsc::UnboundedSender::downgrade),
                    answered: AtomicBool::new(false),
                });
                let request = ServerRequest {
                    id,
                    method,
                    data,
                    responder: responder.clone(),
                };

                let outcome = tokio::select! {
                    () = shutdown.cancelled() => break,
                    outcome = tokio::time::timeout(
                        server_request_timeout,
                        handler.on_server_request(request),
                    ) => outcome,
                };

                match outcome {
                    Ok(()) => {
                        if responder.reject_unanswered(error_codes::INTERNAL_ERROR, "request not handled")
                        {
                            warn!(id, method = %responder.method, "Server request left unanswered by handler");
                        }
                    }
                    Err(_) => {
                        if responder.reject_unanswered(error_codes::REQUEST_TIMEOUT, "request timed out") {
                            warn!(
                                id,
                                method = %responder.method,
                                "Protocol error: server request not answered in time"
                            );
                        }
                    }
                }
            }
            Inbound::Notification { method, data } => {
                handler.on_notification(Notification { method, data }).await;
            }
            Inbound::Disconnected => {
                handler.on_disconnected().await;
                break;
            }
        }
    }

    debug!("Signaling dispatcher terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PeerId, RoomId};
    use serde_json::json;

    struct PipeConnector {
        link: Mutex<Option<SignalingLink>>,
    }

    #[async_trait]
    impl SignalingConnector for PipeConnector {
        async fn connect(&self, _endpoint: &Endpoint) -> Result<SignalingLink, SignalingError> {
            self.link
                .lock()
                .take()
                .ok_or_else(|| SignalingError::Connect("pipe already used".to_string()))
        }
    }

    struct ServerEnd {
        from_client: mpsc::UnboundedReceiver<Message>,
        to_client: Option<mpsc::UnboundedSender<Message>>,
    }

    impl ServerEnd {
        fn send(&self, message: Message) {
            if let Some(tx) = &self.to_client {
                tx.send(message).unwrap();
            }
        }

        async fn next_request(&mut self) -> (u64, String, Value) {
            match self.from_client.recv().await.unwrap() {
                Message::Request { id, method, data } => (id, method, data),
                other => panic!("expected request, got {other:?}"),
            }
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint {
            url: "ws://localhost:4443".to_string(),
            room_id: RoomId::from("R1"),
            peer_id: PeerId::from("P1"),
        }
    }

    async fn open_channel() -> (Arc<SignalingChannel>, ServerEnd) {
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(PipeConnector {
            link: Mutex::new(Some(SignalingLink {
                outbound: client_tx,
                inbound: client_rx,
            })),
        });
        let channel = SignalingChannel::new(connector, SignalingConfig::default());
        channel.open(&endpoint()).await.unwrap();
        (
            channel,
            ServerEnd {
                from_client,
                to_client: Some(to_client),
            },
        )
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        disconnected: AtomicBool,
        answer: bool,
        hang: bool,
    }

    #[async_trait]
    impl InboundHandler for Recorder {
        async fn on_server_request(&self, request: ServerRequest) {
            self.seen.lock().push(request.method().to_string());
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.answer {
                request.accept(json!({})).unwrap();
            }
        }

        async fn on_notification(&self, notification: Notification) {
            self.seen.lock().push(notification.method);
        }

        async fn on_disconnected(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_responses_resolve_by_id() {
        let (channel, mut server) = open_channel().await;

        let first = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request_value("first", json!({})).await })
        };
        let (first_id, method, _) = server.next_request().await;
        assert_eq!(method, "first");

        let second = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request_value("second", json!({})).await })
        };
        let (second_id, _, _) = server.next_request().await;

        server.send(Message::success(second_id, json!({"n": 2})));
        server.send(Message::success(first_id, json!({"n": 1})));

        assert_eq!(first.await.unwrap().unwrap()["n"], 1);
        assert_eq!(second.await.unwrap().unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn test_rejected_request() {
        let (channel, mut server) = open_channel().await;

        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request_ack("produce", &json!({})).await })
        };
        let (id, _, _) = server.next_request().await;
        server.send(Message::error(id, 403, "forbidden"));

        assert_eq!(
            call.await.unwrap().unwrap_err(),
            SignalingError::Rejected {
                code: 403,
                reason: "forbidden".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let (channel, _server) = open_channel().await;

        let err = channel
            .request_value("getRouterRtpCapabilities", json!({}))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SignalingError::Timeout {
                method: "getRouterRtpCapabilities".to_string()
            }
        );
        assert!(channel.pending.lock().entries.is_empty());
    }

    #[tokio::test]
    async fn test_second_open_is_rejected() {
        let (channel, _server) = open_channel().await;
        assert_eq!(
            channel.open(&endpoint()).await.unwrap_err(),
            SignalingError::AlreadyOpen
        );
    }

    #[tokio::test]
    async fn test_close_cancels_pending_requests() {
        let (channel, mut server) = open_channel().await;

        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request_value("join", json!({})).await })
        };
        server.next_request().await;

        channel.close();
        channel.close();

        assert_eq!(call.await.unwrap().unwrap_err(), SignalingError::Cancelled);
        assert!(!channel.is_open());
        assert_eq!(
            channel.request_value("join", json!({})).await.unwrap_err(),
            SignalingError::Cancelled
        );
    }

    #[tokio::test]
    async fn test_connection_drop_fails_pending_and_notifies() {
        let (channel, mut server) = open_channel().await;
        let handler = Arc::new(Recorder::default());
        let dispatcher = channel.spawn_dispatcher(handler.clone()).unwrap();

        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request_value("join", json!({})).await })
        };
        server.next_request().await;
        server.to_client = None;

        assert_eq!(
            call.await.unwrap().unwrap_err(),
            SignalingError::ConnectionLost
        );
        dispatcher.await.unwrap();
        assert!(handler.disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_inbound_messages_dispatched_in_order() {
        let (channel, mut server) = open_channel().await;
        let handler = Arc::new(Recorder {
            answer: true,
            ..Recorder::default()
        });
        channel.spawn_dispatcher(handler.clone()).unwrap();

        server.send(Message::notification("newPeer", json!({"id": "P2"})));
        server.send(Message::request(90, "newConsumer", json!({})));
        server.send(Message::notification("peerClosed", json!({"peerId": "P2"})));

        match server.from_client.recv().await.unwrap() {
            Message::Response { id, ok, .. } => {
                assert_eq!(id, 90);
                assert!(ok);
            }
            other => panic!("unexpected {other:?}"),
        }
        tokio::task::yield_now().await;
        while handler.seen.lock().len() < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *handler.seen.lock(),
            vec!["newPeer", "newConsumer", "peerClosed"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_server_request_rejected_with_408() {
        let (channel, mut server) = open_channel().await;
        let handler = Arc::new(Recorder {
            hang: true,
            ..Recorder::default()
        });
        channel.spawn_dispatcher(handler).unwrap();

        server.send(Message::request(5, "newConsumer", json!({})));

        match server.from_client.recv().await.unwrap() {
            Message::Response {
                id, ok, error_code, ..
            } => {
                assert_eq!(id, 5);
                assert!(!ok);
                assert_eq!(error_code, Some(error_codes::REQUEST_TIMEOUT));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_returning_without_answer_rejects_with_500() {
        let (channel, mut server) = open_channel().await;
        channel
            .spawn_dispatcher(Arc::new(Recorder::default()))
            .unwrap();

        server.send(Message::request(6, "mystery", json!({})));

        match server.from_client.recv().await.unwrap() {
            Message::Response { error_code, .. } => {
                assert_eq!(error_code, Some(error_codes::INTERNAL_ERROR));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_request_answered_once() {
        let (channel, mut server) = open_channel().await;
        let responder = Arc::new(Responder {
            id: 1,
            method: "newConsumer".to_string(),
            outbound: channel
                .outbound
                .lock()
                .as_ref()
                .map(mpsc::UnboundedSender::downgrade),
            answered: AtomicBool::new(false),
        });
        let request = ServerRequest {
            id: 1,
            method: "newConsumer".to_string(),
            data: Value::Null,
            responder,
        };

        request.accept(json!({})).unwrap();
        assert!(matches!(
            request.reject(500, "late"),
            Err(SignalingError::Protocol(_))
        ));
        assert!(request.is_answered());
        assert!(matches!(
            server.from_client.recv().await.unwrap(),
            Message::Response { ok: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_request_before_open() {
        let (client_tx, _from_client) = mpsc::unbounded_channel();
        let (_to_client, client_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(PipeConnector {
            link: Mutex::new(Some(SignalingLink {
                outbound: client_tx,
                inbound: client_rx,
            })),
        });
        let channel = SignalingChannel::new(connector, SignalingConfig::default());

        assert_eq!(
            channel.request_value("join", json!({})).await.unwrap_err(),
            SignalingError::NotOpen
        );
        assert!(channel.notify("hello", &json!({})).is_err());
    }
}
