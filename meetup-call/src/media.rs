//! Media engine and device seams
//!
//! ICE, DTLS and RTP are handled by an external WebRTC engine; local capture
//! devices by the platform. The orchestrator reaches both through the traits
//! in this module:
//!
//! - **`MediaEngine`**: builds send/recv transports from server parameters
//! - **`EngineTransport`**: produces local tracks, consumes remote producers
//! - **`TransportListener`**: implemented by the orchestrator; the engine calls
//!   it when it needs the server (connect handshake, produce id)
//! - **`MediaDevices`** / **`LocalTrack`**: camera and microphone capture

use async_trait::async_trait;
use meetup_proto::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpEncodingParameters, RtpParameters,
};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::error::Result;
use crate::transport::Direction;
use crate::types::{ConsumerId, ProducerId, TransportId};

/// Connection state as reported by the engine (ICE + DTLS combined)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks the engine raises on a transport.
///
/// The engine must not proceed until the returned future resolves: packets
/// may only flow once the server acknowledged the connect.
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Local DTLS parameters are ready; forward them to the server
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;

    /// A local track is about to be sent; the server assigns the producer id
    async fn on_produce(&self, kind: MediaKind, rtp_parameters: RtpParameters) -> Result<ProducerId>;

    fn on_connection_state_change(&self, state: EngineConnectionState);
}

/// Parameters returned by `createWebRtcTransport`
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub id: TransportId,
    pub direction: Direction,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Codecs and header extensions the engine can handle locally
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn EngineTransport>>;
}

pub struct ProduceOptions {
    pub track: Arc<dyn LocalTrack>,
    pub codec: RtpCodecCapability,
    pub encodings: Vec<RtpEncodingParameters>,
    pub codec_options: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> TransportId;

    /// Start sending a local track. Raises `on_connect` first if the
    /// transport never connected, then `on_produce`.
    async fn produce(&self, options: ProduceOptions) -> Result<Arc<dyn EngineProducer>>;

    /// Start receiving a remote producer. Raises `on_connect` first if the
    /// transport never connected.
    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn EngineConsumer>>;

    fn close(&self);
}

pub trait EngineProducer: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn pause(&self);
    fn resume(&self);
    fn close(&self);
}

pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> RemoteTrack;
    fn pause(&self);
    fn resume(&self);
    fn close(&self);
}

/// Received media track handed to the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// A captured camera or microphone track
pub trait LocalTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    /// Release the capture device
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("no {0} device available")]
    Unavailable(MediaKind),

    #[error("permission denied")]
    PermissionDenied,

    #[error("{0}")]
    Other(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the default capture device of `kind`
    async fn acquire(&self, kind: MediaKind) -> std::result::Result<Arc<dyn LocalTrack>, DeviceError>;
}

/// Owns a local track and stops it when dropped.
///
/// Every acquired track lives inside one of these from acquisition until
/// release, so error paths release the device too.
pub struct OwnedTrack {
    track: Arc<dyn LocalTrack>,
}

impl OwnedTrack {
    #[must_use]
    pub fn new(track: Arc<dyn LocalTrack>) -> Self {
        Self { track }
    }

    #[must_use]
    pub fn track(&self) -> &Arc<dyn LocalTrack> {
        &self.track
    }

    #[must_use]
    pub fn id(&self) -> String {
        self.track.id()
    }

    pub fn stop(&self) {
        if !self.track.is_stopped() {
            self.track.stop();
        }
    }
}

impl Drop for OwnedTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for OwnedTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedTrack")
            .field("id", &self.track.id())
            .field("kind", &self.track.kind())
            .field("stopped", &self.track.is_stopped())
            .finish()
    }
}
