//! Send and receive transports
//!
//! A session owns at most one transport per direction. Creating one is the
//! first phase (`createWebRtcTransport`, then the engine builds the local
//! side); the second phase happens when the engine first needs the network
//! and raises `on_connect`, which is forwarded as `connectWebRtcTransport`.

use async_trait::async_trait;
use meetup_proto::methods::{
    ConnectWebRtcTransportRequest, CreateWebRtcTransportRequest, ProduceRequest, ProduceResponse,
    TransportOptions, CONNECT_WEBRTC_TRANSPORT, CREATE_WEBRTC_TRANSPORT, PRODUCE,
};
use meetup_proto::{DtlsParameters, MediaKind, RtpParameters};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::capabilities::CapabilityProfile;
use crate::error::{Error, Result, SignalingError};
use crate::media::{
    EngineConnectionState, EngineTransport, MediaEngine, TransportListener, TransportParams,
};
use crate::signaling::SignalingChannel;
use crate::types::{ProducerId, TransportId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Recv => "recv",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Reported to the session when a transport fails on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Failed { direction: Direction, reason: String },
}

/// Apply a state change. `Closed` is terminal and `Failed` only moves to
/// `Closed`. Returns whether the state changed.
fn transition(state: &watch::Sender<TransportState>, next: TransportState) -> bool {
    state.send_if_modified(|current| {
        let allowed = match *current {
            TransportState::Closed => false,
            TransportState::Failed => next == TransportState::Closed,
            _ => *current != next,
        };
        if allowed {
            *current = next;
        }
        allowed
    })
}

pub struct TransportHandle {
    params: TransportParams,
    state: Arc<watch::Sender<TransportState>>,
    engine: Arc<dyn EngineTransport>,
}

impl TransportHandle {
    #[must_use]
    pub const fn id(&self) -> &TransportId {
        &self.params.id
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.params.direction
    }

    #[must_use]
    pub const fn params(&self) -> &TransportParams {
        &self.params
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn EngineTransport> {
        &self.engine
    }

    /// A consume may start on a transport that never connected (the consume
    /// drives the handshake) or one that is connected.
    pub fn ensure_consumable(&self) -> Result<()> {
        match self.state() {
            TransportState::New | TransportState::Connected => Ok(()),
            TransportState::Connecting | TransportState::Failed | TransportState::Closed => {
                Err(Error::TransportNotReady(self.direction()))
            }
        }
    }

    /// Wait until an in-flight handshake settles
    pub async fn wait_usable(&self, timeout: Duration) -> Result<()> {
        let direction = self.direction();
        let mut rx = self.state.subscribe();

        let settled = async move {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    TransportState::New | TransportState::Connected => return Ok(()),
                    TransportState::Connecting => {}
                    TransportState::Failed | TransportState::Closed => {
                        return Err(Error::TransportNotReady(direction))
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(Error::TransportNotReady(direction));
                }
            }
        };

        tokio::time::timeout(timeout, settled)
            .await
            .unwrap_or(Err(Error::TransportNotReady(direction)))
    }

    pub fn close(&self) {
        if transition(&self.state, TransportState::Closed) {
            self.engine.close();
            info!(
                transport_id = %self.params.id,
                direction = %self.params.direction,
                "Transport closed"
            );
        }
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("id", &self.params.id)
            .field("direction", &self.params.direction)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Engine callbacks for one transport
struct TransportConnector {
    transport_id: TransportId,
    direction: Direction,
    channel: Arc<SignalingChannel>,
    state: Arc<watch::Sender<TransportState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportConnector {
    fn fail(&self, reason: String) {
        if transition(&self.state, TransportState::Failed) {
            warn!(
                transport_id = %self.transport_id,
                direction = %self.direction,
                reason = %reason,
                "Transport failed"
            );
            let _ = self.events.send(TransportEvent::Failed {
                direction: self.direction,
                reason,
            });
        }
    }
}

#[async_trait]
impl TransportListener for TransportConnector {
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        transition(&self.state, TransportState::Connecting);
        debug!(transport_id = %self.transport_id, "Connecting transport");

        let request = ConnectWebRtcTransportRequest {
            transport_id: self.transport_id.to_string(),
            dtls_parameters,
        };
        match self
            .channel
            .request_ack(CONNECT_WEBRTC_TRANSPORT, &request)
            .await
        {
            Ok(()) => {
                transition(&self.state, TransportState::Connected);
                info!(
                    transport_id = %self.transport_id,
                    direction = %self.direction,
                    "Transport connected"
                );
                Ok(())
            }
            Err(SignalingError::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                let reason = format!("connect handshake failed: {e}");
                self.fail(reason.clone());
                Err(Error::Transport {
                    direction: self.direction,
                    reason,
                })
            }
        }
    }

    async fn on_produce(&self, kind: MediaKind, rtp_parameters: RtpParameters) -> Result<ProducerId> {
        let request = ProduceRequest {
            transport_id: self.transport_id.to_string(),
            kind,
            rtp_parameters,
            app_data: None,
        };
        let response: ProduceResponse = self.channel.request(PRODUCE, &request).await?;
        Ok(ProducerId::from(response.id))
    }

    fn on_connection_state_change(&self, state: EngineConnectionState) {
        debug!(transport_id = %self.transport_id, ?state, "Engine connection state");
        match state {
            EngineConnectionState::New => {}
            EngineConnectionState::Connecting | EngineConnectionState::Disconnected => {
                transition(&self.state, TransportState::Connecting);
            }
            EngineConnectionState::Connected => {
                transition(&self.state, TransportState::Connected);
            }
            EngineConnectionState::Failed => self.fail("ICE/DTLS connection failed".to_string()),
            EngineConnectionState::Closed => {
                transition(&self.state, TransportState::Closed);
            }
        }
    }
}

/// Owns the send and recv transports of one session
pub struct TransportManager {
    channel: Arc<SignalingChannel>,
    engine: Arc<dyn MediaEngine>,
    send: Mutex<Option<Arc<TransportHandle>>>,
    recv: Mutex<Option<Arc<TransportHandle>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shut_down: AtomicBool,
}

impl TransportManager {
    pub fn new(
        channel: Arc<SignalingChannel>,
        engine: Arc<dyn MediaEngine>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            channel,
            engine,
            send: Mutex::new(None),
            recv: Mutex::new(None),
            events,
            shut_down: AtomicBool::new(false),
        }
    }

    const fn slot(&self, direction: Direction) -> &Mutex<Option<Arc<TransportHandle>>> {
        match direction {
            Direction::Send => &self.send,
            Direction::Recv => &self.recv,
        }
    }

    /// Create the transport for `direction`. Needs a negotiated profile.
    pub async fn create(
        &self,
        direction: Direction,
        profile: Option<&CapabilityProfile>,
    ) -> Result<Arc<TransportHandle>> {
        if profile.is_none() {
            return Err(Error::NotReady);
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        if self.slot(direction).lock().is_some() {
            return Err(Error::TransportExists(direction));
        }

        let request = CreateWebRtcTransportRequest {
            producing: direction == Direction::Send,
            consuming: direction == Direction::Recv,
        };
        let options: TransportOptions = self
            .channel
            .request(CREATE_WEBRTC_TRANSPORT, &request)
            .await
            .map_err(|e| match e {
                SignalingError::Rejected { .. }
                | SignalingError::Timeout { .. }
                | SignalingError::Protocol(_) => Error::Transport {
                    direction,
                    reason: e.to_string(),
                },
                other => Error::Signaling(other),
            })?;

        let params = TransportParams {
            id: TransportId::from(options.id),
            direction,
            ice_parameters: options.ice_parameters,
            ice_candidates: options.ice_candidates,
            dtls_parameters: options.dtls_parameters,
        };
        let state = Arc::new(watch::channel(TransportState::New).0);
        let listener = Arc::new(TransportConnector {
            transport_id: params.id.clone(),
            direction,
            channel: self.channel.clone(),
            state: state.clone(),
            events: self.events.clone(),
        });

        let engine = self
            .engine
            .create_transport(params.clone(), listener)
            .await
            .map_err(|e| Error::Transport {
                direction,
                reason: e.to_string(),
            })?;

        let handle = Arc::new(TransportHandle {
            params,
            state,
            engine,
        });

        {
            let mut slot = self.slot(direction).lock();
            let rejected = if self.shut_down.load(Ordering::SeqCst) {
                Some(Error::Cancelled)
            } else if slot.is_some() {
                Some(Error::TransportExists(direction))
            } else {
                None
            };
            if let Some(error) = rejected {
                drop(slot);
                handle.close();
                return Err(error);
            }
            *slot = Some(handle.clone());
        }

        info!(
            transport_id = %handle.id(),
            direction = %direction,
            "Transport created"
        );
        Ok(handle)
    }

    #[must_use]
    pub fn get(&self, direction: Direction) -> Option<Arc<TransportHandle>> {
        self.slot(direction).lock().clone()
    }

    /// Close the transport for `direction`, running `close_attached` for the
    /// media bound to it first
    pub fn close_with(&self, direction: Direction, close_attached: impl FnOnce()) {
        let handle = self.slot(direction).lock().take();
        close_attached();
        if let Some(handle) = handle {
            handle.close();
        }
    }

    pub fn close(&self, direction: Direction) {
        self.close_with(direction, || {});
    }

    /// Refuse new transports; creations in flight close what they built
    pub fn shut_down(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}
