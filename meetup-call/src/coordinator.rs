//! Call-session state machine
//!
//! The coordinator owns everything that lives for one session (signaling
//! channel, transports, producers, consumers, peers) in a `SessionRuntime`.
//! State transitions happen under one lifecycle lock; teardown is
//! synchronous and runs under that lock, so a session is either fully live
//! or fully released.

use async_trait::async_trait;
use meetup_proto::methods::{
    ActiveSpeakerNotification, ConsumerIdNotification, DeviceInfo, JoinRequest, JoinResponse,
    NewConsumerRequest, PeerClosedNotification, PeerInfo, ACTIVE_SPEAKER, CONSUMER_CLOSED,
    CONSUMER_PAUSED, CONSUMER_RESUMED, JOIN, NEW_CONSUMER, NEW_PEER, PEER_CLOSED,
};
use meetup_proto::{error_codes, MediaKind};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capabilities::{CapabilityNegotiator, CapabilityProfile};
use crate::config::CallConfig;
use crate::consumer::{Consumer, ConsumerRegistry};
use crate::error::{Error, NegotiationError, Result, SignalingError};
use crate::media::{MediaDevices, MediaEngine, OwnedTrack};
use crate::peer::{Peer, PeerDirectory};
use crate::producer::{ProduceParams, ProducerRegistry};
use crate::session::{CallEvent, CallState, LocalStream, RemoteStream, RoomOptions, Session};
use crate::signaling::{
    Endpoint, InboundHandler, Notification, ServerRequest, SignalingChannel, SignalingConnector,
};
use crate::transport::{Direction, TransportEvent, TransportManager};
use crate::types::{ConsumerId, PeerId, RoomId};

const EVENT_CAPACITY: usize = 256;

/// Everything owned by one connect/disconnect cycle
struct SessionRuntime {
    channel: Arc<SignalingChannel>,
    transports: TransportManager,
    producers: ProducerRegistry,
    consumers: ConsumerRegistry,
    peers: PeerDirectory,
    profile: Mutex<Option<CapabilityProfile>>,
    active_speaker: Mutex<Option<PeerId>>,
    /// Why the session failed, recorded before the lifecycle lock is released
    failure: Mutex<Option<Error>>,
    cancel: CancellationToken,
}

impl SessionRuntime {
    fn profile(&self) -> Option<CapabilityProfile> {
        self.profile.lock().clone()
    }

    /// What ended the session; `Cancelled` when it was a disconnect
    fn take_failure(&self) -> Error {
        self.failure.lock().take().unwrap_or(Error::Cancelled)
    }

    /// Release every resource of the session, in dependency order
    fn teardown(&self) {
        self.cancel.cancel();
        self.producers.close_all();
        self.transports.shut_down();
        self.transports.close(Direction::Send);
        self.transports.close_with(Direction::Recv, || {
            self.consumers.close_all(&self.peers);
        });
        // Consumers bound after the recv transport closed
        self.consumers.close_all(&self.peers);
        self.peers.clear();
        self.channel.close();
        *self.active_speaker.lock() = None;
    }
}

struct Lifecycle {
    state: CallState,
    current: Option<Arc<SessionRuntime>>,
}

struct Inner {
    config: CallConfig,
    room_id: RoomId,
    peer_id: PeerId,
    display_name: String,
    device: DeviceInfo,
    engine: Arc<dyn MediaEngine>,
    devices: Arc<dyn MediaDevices>,
    connector: Arc<dyn SignalingConnector>,
    lifecycle: Mutex<Lifecycle>,
    state: watch::Sender<CallState>,
    events: broadcast::Sender<CallEvent>,
}

impl Inner {
    fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, lifecycle: &mut Lifecycle, next: CallState) {
        if lifecycle.state == next {
            return;
        }
        info!(
            room_id = %self.room_id,
            from = %lifecycle.state,
            to = %next,
            "Call state changed"
        );
        lifecycle.state = next;
        self.state.send_replace(next);
        self.emit(CallEvent::StateChanged(next));
    }

    fn is_current(lifecycle: &Lifecycle, runtime: &Arc<SessionRuntime>) -> bool {
        lifecycle
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, runtime))
    }

    /// Move `runtime` to `Failed` if it is still the live session and
    /// record `error` as the cause
    fn fail(&self, runtime: &Arc<SessionRuntime>, error: Error) {
        let mut lifecycle = self.lifecycle.lock();
        if !Self::is_current(&lifecycle, runtime)
            || !matches!(lifecycle.state, CallState::Connecting | CallState::Joined)
        {
            return;
        }

        error!(room_id = %self.room_id, error = %error, "Call session failed");
        runtime.teardown();
        lifecycle.current = None;
        self.set_state(&mut lifecycle, CallState::Failed);
        self.emit(CallEvent::ConnectionFailed {
            reason: error.to_string(),
            retryable: error.is_retryable(),
        });
        *runtime.failure.lock() = Some(error);
    }

    fn joined_runtime(&self) -> Result<Arc<SessionRuntime>> {
        let lifecycle = self.lifecycle.lock();
        match (&lifecycle.state, &lifecycle.current) {
            (CallState::Joined, Some(runtime)) => Ok(runtime.clone()),
            _ => Err(Error::NotReady),
        }
    }

    fn current_runtime(&self) -> Option<Arc<SessionRuntime>> {
        self.lifecycle.lock().current.clone()
    }

    async fn establish(
        self: &Arc<Self>,
        runtime: &Arc<SessionRuntime>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<()> {
        let endpoint = Endpoint {
            url: self.config.signaling.url.clone(),
            room_id: self.room_id.clone(),
            peer_id: self.peer_id.clone(),
        };
        runtime.channel.open(&endpoint).await?;
        runtime.channel.spawn_dispatcher(Arc::new(SessionEvents {
            inner: Arc::downgrade(self),
            runtime: runtime.clone(),
        }))?;
        tokio::spawn(watch_transports(
            Arc::downgrade(self),
            runtime.clone(),
            transport_events,
        ));

        let profile = CapabilityNegotiator::load(&runtime.channel, &self.engine.rtp_capabilities()).await?;
        *runtime.profile.lock() = Some(profile.clone());

        runtime
            .transports
            .create(Direction::Send, Some(&profile))
            .await?;
        runtime
            .transports
            .create(Direction::Recv, Some(&profile))
            .await?;

        let join = JoinRequest {
            display_name: self.display_name.clone(),
            rtp_capabilities: profile.rtp_capabilities().clone(),
            device: Some(self.device.clone()),
        };
        let response: JoinResponse = runtime.channel.request(JOIN, &join).await?;
        for info in response.peers {
            if let Some(peer) = runtime.peers.add(info) {
                self.emit(CallEvent::PeerJoined(peer));
            }
        }
        Ok(())
    }

    /// Wait for an in-flight connect to finish
    async fn settled(&self) {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state != CallState::Connecting || rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn watch_transports(
    inner: Weak<Inner>,
    runtime: Arc<SessionRuntime>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let event = tokio::select! {
        biased;
        () = runtime.cancel.cancelled() => return,
        event = events.recv() => event,
    };

    if let (Some(TransportEvent::Failed { direction, reason }), Some(inner)) = (event, inner.upgrade()) {
        inner.fail(&runtime, Error::Transport { direction, reason });
    }
}

/// Handles what the server sends during one session
struct SessionEvents {
    inner: Weak<Inner>,
    runtime: Arc<SessionRuntime>,
}

impl SessionEvents {
    async fn consume(&self, request: NewConsumerRequest) -> Result<Consumer> {
        if let Some(inner) = self.inner.upgrade() {
            // The join response may still be on its way
            inner.settled().await;
        }
        let recv = self
            .runtime
            .transports
            .get(Direction::Recv)
            .ok_or(Error::TransportNotReady(Direction::Recv))?;
        self.runtime
            .consumers
            .consume(&recv, &self.runtime.peers, request)
            .await
    }

    async fn handle_new_consumer(&self, inner: &Inner, request: ServerRequest) {
        let descriptor: NewConsumerRequest = match request.parse() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(error = %e, "Malformed newConsumer request");
                let _ = request.reject(error_codes::BAD_REQUEST, e.to_string());
                return;
            }
        };
        let consumer_id = descriptor.id.clone();

        match self.consume(descriptor).await {
            Ok(consumer) => {
                if let Err(e) = request.accept(json!({})) {
                    warn!(consumer_id = %consumer.id, error = %e, "Could not accept newConsumer");
                    self.runtime
                        .consumers
                        .remove(&consumer.id, &self.runtime.peers);
                    return;
                }
                inner.emit(CallEvent::ConsumerAdded(consumer));
            }
            Err(e) => {
                if e.is_cancelled() {
                    debug!(consumer_id = %consumer_id, "newConsumer interrupted by teardown");
                } else {
                    warn!(consumer_id = %consumer_id, error = %e, "Rejecting newConsumer");
                }
                let _ = request.reject(e.reject_code(), e.to_string());
            }
        }
    }

    fn handle_peer_closed(&self, inner: &Inner, peer_id: PeerId) {
        let Some((peer, consumers)) = self.runtime.peers.remove(&peer_id, &self.runtime.consumers) else {
            debug!(peer_id = %peer_id, "peerClosed for unknown peer");
            return;
        };

        for consumer in consumers {
            inner.emit(CallEvent::ConsumerRemoved {
                consumer_id: consumer.id,
                peer_id: consumer.peer_id,
            });
        }
        {
            let mut speaker = self.runtime.active_speaker.lock();
            if speaker.as_ref() == Some(&peer.id) {
                *speaker = None;
            }
        }
        inner.emit(CallEvent::PeerLeft(peer.id));
    }

    fn handle_consumer_closed(&self, inner: &Inner, consumer_id: &ConsumerId) {
        match self
            .runtime
            .consumers
            .remove(consumer_id, &self.runtime.peers)
        {
            Some(consumer) => inner.emit(CallEvent::ConsumerRemoved {
                consumer_id: consumer.id,
                peer_id: consumer.peer_id,
            }),
            None => debug!(consumer_id = %consumer_id, "consumerClosed for unknown consumer"),
        }
    }
}

#[async_trait]
impl InboundHandler for SessionEvents {
    async fn on_server_request(&self, request: ServerRequest) {
        let Some(inner) = self.inner.upgrade() else {
            let _ = request.reject(error_codes::INTERNAL_ERROR, "session gone");
            return;
        };

        match request.method() {
            NEW_CONSUMER => self.handle_new_consumer(&inner, request).await,
            method => {
                warn!(method, "Unknown server request");
                let _ = request.reject(
                    error_codes::METHOD_NOT_FOUND,
                    format!("unknown method {method}"),
                );
            }
        }
    }

    async fn on_notification(&self, notification: Notification) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        let handled = match notification.method.as_str() {
            NEW_PEER => notification.parse::<PeerInfo>().map(|info| {
                if let Some(peer) = self.runtime.peers.add(info) {
                    inner.emit(CallEvent::PeerJoined(peer));
                }
            }),
            PEER_CLOSED => notification
                .parse::<PeerClosedNotification>()
                .map(|n| self.handle_peer_closed(&inner, PeerId::from(n.peer_id))),
            CONSUMER_CLOSED => notification
                .parse::<ConsumerIdNotification>()
                .map(|n| self.handle_consumer_closed(&inner, &ConsumerId::from(n.consumer_id))),
            CONSUMER_PAUSED | CONSUMER_RESUMED => {
                let paused = notification.method == CONSUMER_PAUSED;
                notification.parse::<ConsumerIdNotification>().map(|n| {
                    let consumer_id = ConsumerId::from(n.consumer_id);
                    if let Err(e) = self.runtime.consumers.set_paused(&consumer_id, paused) {
                        debug!(error = %e, "Ignoring consumer pause update");
                    }
                })
            }
            ACTIVE_SPEAKER => notification
                .parse::<ActiveSpeakerNotification>()
                .map(|n| {
                    let peer_id = n.peer_id.map(PeerId::from);
                    *self.runtime.active_speaker.lock() = peer_id.clone();
                    inner.emit(CallEvent::ActiveSpeaker {
                        peer_id,
                        volume: n.volume,
                    });
                }),
            method => {
                debug!(method, "Ignoring unknown notification");
                Ok(())
            }
        };

        if let Err(e) = handled {
            warn!(method = %notification.method, error = %e, "Malformed notification");
        }
    }

    async fn on_disconnected(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.fail(
                &self.runtime,
                Error::Signaling(SignalingError::ConnectionLost),
            );
        }
    }
}

/// Drives one participant's call in one room
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    pub fn new(
        config: CallConfig,
        options: RoomOptions,
        engine: Arc<dyn MediaEngine>,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn SignalingConnector>,
    ) -> Self {
        let (state, _) = watch::channel(CallState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let device = options
            .device
            .unwrap_or_else(|| config.media.device_info());

        Self {
            inner: Arc::new(Inner {
                room_id: options.room_id,
                peer_id: options.peer_id.unwrap_or_else(PeerId::generate),
                display_name: options.display_name,
                device,
                config,
                engine,
                devices,
                connector,
                lifecycle: Mutex::new(Lifecycle {
                    state: CallState::Idle,
                    current: None,
                }),
                state,
                events,
            }),
        }
    }

    /// Open the signaling channel, negotiate, create both transports and join.
    ///
    /// Fails with `AlreadyActive` unless the session is idle, closed or
    /// failed. Any failure on the way leaves the session `Failed`.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let (runtime, transport_events) = {
            let mut lifecycle = inner.lifecycle.lock();
            if !lifecycle.state.can_connect() {
                return Err(Error::AlreadyActive(lifecycle.state));
            }

            let channel = SignalingChannel::new(inner.connector.clone(), inner.config.signaling.clone());
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let runtime = Arc::new(SessionRuntime {
                transports: TransportManager::new(channel.clone(), inner.engine.clone(), events_tx),
                producers: ProducerRegistry::new(
                    channel.clone(),
                    inner.config.signaling.request_timeout(),
                ),
                consumers: ConsumerRegistry::new(),
                peers: PeerDirectory::new(),
                profile: Mutex::new(None),
                active_speaker: Mutex::new(None),
                failure: Mutex::new(None),
                cancel: CancellationToken::new(),
                channel,
            });
            lifecycle.current = Some(runtime.clone());
            inner.set_state(&mut lifecycle, CallState::Connecting);
            (runtime, events_rx)
        };

        info!(room_id = %inner.room_id, peer_id = %inner.peer_id, "Connecting call session");
        match inner.establish(&runtime, transport_events).await {
            Ok(()) => {
                let mut lifecycle = inner.lifecycle.lock();
                if Inner::is_current(&lifecycle, &runtime) && lifecycle.state == CallState::Connecting {
                    inner.set_state(&mut lifecycle, CallState::Joined);
                    return Ok(());
                }
            }
            Err(e) => {
                // No-op if a transport failure or a disconnect got there first
                inner.fail(&runtime, e);
            }
        }
        Err(runtime.take_failure())
    }

    /// Leave the room and release everything. Idempotent; does nothing
    /// unless connecting or joined.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock();
        if !matches!(lifecycle.state, CallState::Connecting | CallState::Joined) {
            return;
        }

        inner.set_state(&mut lifecycle, CallState::Leaving);
        if let Some(runtime) = lifecycle.current.take() {
            runtime.teardown();
        }
        inner.set_state(&mut lifecycle, CallState::Closed);
    }

    pub async fn enable_mic(&self) -> Result<()> {
        self.enable(MediaKind::Audio).await
    }

    pub async fn disable_mic(&self) -> Result<()> {
        self.disable(MediaKind::Audio).await
    }

    pub async fn enable_webcam(&self) -> Result<()> {
        self.enable(MediaKind::Video).await
    }

    pub async fn disable_webcam(&self) -> Result<()> {
        self.disable(MediaKind::Video).await
    }

    pub async fn mute_mic(&self) -> Result<()> {
        self.inner.joined_runtime()?.producers.pause(MediaKind::Audio).await
    }

    pub async fn unmute_mic(&self) -> Result<()> {
        self.inner.joined_runtime()?.producers.resume(MediaKind::Audio).await
    }

    pub async fn mute_webcam(&self) -> Result<()> {
        self.inner.joined_runtime()?.producers.pause(MediaKind::Video).await
    }

    pub async fn unmute_webcam(&self) -> Result<()> {
        self.inner.joined_runtime()?.producers.resume(MediaKind::Video).await
    }

    async fn enable(&self, kind: MediaKind) -> Result<()> {
        let inner = &self.inner;
        let runtime = inner.joined_runtime()?;
        let profile = runtime.profile().ok_or(Error::NotReady)?;
        if !profile.can_produce(kind) {
            return Err(NegotiationError::UnsupportedKind(kind).into());
        }
        let codec = profile
            .preferred_codec(kind)
            .cloned()
            .ok_or(NegotiationError::UnsupportedKind(kind))?;

        let reservation = runtime.producers.reserve(kind)?;
        let send = runtime
            .transports
            .get(Direction::Send)
            .ok_or(Error::TransportNotReady(Direction::Send))?;

        let track = match inner.devices.acquire(kind).await {
            Ok(track) => OwnedTrack::new(track),
            Err(e) => {
                warn!(kind = %kind, error = %e, "Could not open capture device");
                inner.emit(CallEvent::MediaWarning {
                    kind,
                    reason: e.to_string(),
                });
                return Err(Error::MediaAcquisition {
                    kind,
                    reason: e.to_string(),
                });
            }
        };

        let params = ProduceParams {
            codec,
            encodings: inner.config.media.encodings_for(kind),
            codec_options: inner.config.media.codec_options_for(kind),
        };
        let producer = match runtime
            .producers
            .produce(reservation, &send, track, params)
            .await
        {
            Ok(producer) => producer,
            Err(e) if e.is_session_fatal() => {
                inner.fail(&runtime, e);
                return Err(runtime.take_failure());
            }
            Err(e) => return Err(e),
        };

        inner.emit(CallEvent::ProducerAdded {
            kind,
            producer_id: producer.id,
        });
        Ok(())
    }

    async fn disable(&self, kind: MediaKind) -> Result<()> {
        let Some(runtime) = self.inner.current_runtime() else {
            return Ok(());
        };
        if runtime.producers.close(kind).await {
            self.inner.emit(CallEvent::ProducerClosed(kind));
        }
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }

    /// The live session, if any
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        let lifecycle = self.inner.lifecycle.lock();
        let runtime = lifecycle.current.as_ref()?;
        Some(Session {
            room_id: self.inner.room_id.clone(),
            peer_id: self.inner.peer_id.clone(),
            display_name: self.inner.display_name.clone(),
            state: lifecycle.state,
            profile: runtime.profile(),
        })
    }

    #[must_use]
    pub fn local_stream(&self) -> LocalStream {
        self.inner
            .current_runtime()
            .map(|runtime| LocalStream {
                audio: runtime.producers.get(MediaKind::Audio),
                video: runtime.producers.get(MediaKind::Video),
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn remote_streams(&self) -> BTreeMap<PeerId, RemoteStream> {
        self.inner
            .current_runtime()
            .map(|runtime| runtime.peers.remote_streams(&runtime.consumers))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        self.inner
            .current_runtime()
            .map(|runtime| runtime.peers.list())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn active_speaker(&self) -> Option<PeerId> {
        self.inner
            .current_runtime()
            .and_then(|runtime| runtime.active_speaker.lock().clone())
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.disconnect();
    }
}
