//! Meetup call-session orchestrator
//!
//! Client side of a multi-party call routed through an SFU. The orchestrator
//! speaks the signaling protocol, negotiates RTP capabilities with the
//! server's router, keeps one send and one receive transport, and tracks the
//! local producers and remote consumers of the session.
//!
//! ## Architecture
//!
//! - **`SessionCoordinator`**: public entry point, owns the session lifecycle
//! - **`SignalingChannel`**: request/response correlation over one connection
//! - **`CapabilityProfile`**: what the local engine and the router share
//! - **`TransportManager`**: send/recv transports and their connect handshake
//! - **`ProducerRegistry`** / **`ConsumerRegistry`**: local and remote tracks
//! - **`PeerDirectory`**: remote participants
//!
//! The WebRTC engine and the capture devices are supplied by the caller
//! through the traits in [`media`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meetup_call::{CallConfig, RoomOptions, SessionCoordinator, WebSocketConnector};
//! use std::sync::Arc;
//!
//! let config = CallConfig::load(Some("call.toml"))?;
//! let call = SessionCoordinator::new(
//!     config,
//!     RoomOptions::new("standup", "Ada"),
//!     engine,
//!     devices,
//!     Arc::new(WebSocketConnector::new()),
//! );
//!
//! call.connect().await?;
//! call.enable_mic().await?;
//! call.enable_webcam().await?;
//! ```

pub mod capabilities;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod media;
pub mod peer;
pub mod producer;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use capabilities::CapabilityProfile;
pub use config::{CallConfig, LoggingConfig, MediaConfig, SignalingConfig};
pub use consumer::Consumer;
pub use coordinator::SessionCoordinator;
pub use error::{Error, NegotiationError, Result, SignalingError};
pub use logging::init_logging;
pub use media::{
    DeviceError, EngineConsumer, EngineProducer, EngineTransport, LocalTrack, MediaDevices,
    MediaEngine, RemoteTrack, TransportListener,
};
pub use peer::Peer;
pub use producer::Producer;
pub use session::{CallEvent, CallState, LocalStream, RemoteStream, RoomOptions, Session};
pub use signaling::{SignalingConnector, WebSocketConnector};
pub use transport::{Direction, TransportState};
pub use types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};

pub use meetup_proto::MediaKind;
