//! Meetup signaling protocol definitions
//!
//! This crate contains the wire types exchanged between the call-session
//! orchestrator and the signaling server:
//!
//! - **`Message`**: the JSON envelope (request, response, notification)
//! - **`methods`**: method names and their request/response payloads
//! - **`rtp`**: RTP capabilities/parameters and ICE/DTLS descriptors
//! - **`error_codes`**: codes used when rejecting a request

pub mod error_codes;
pub mod message;
pub mod methods;
pub mod rtp;

pub use message::Message;
pub use rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtcpFeedback, RtcpParameters, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpEncodingParameters, RtpHeaderExtension, RtpHeaderExtensionParameters, RtpParameters,
};
