//! Signaling methods and their payloads

use crate::rtp::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Client → server requests
pub const GET_ROUTER_RTP_CAPABILITIES: &str = "getRouterRtpCapabilities";
pub const CREATE_WEBRTC_TRANSPORT: &str = "createWebRtcTransport";
pub const CONNECT_WEBRTC_TRANSPORT: &str = "connectWebRtcTransport";
pub const PRODUCE: &str = "produce";
pub const JOIN: &str = "join";
pub const PAUSE_PRODUCER: &str = "pauseProducer";
pub const RESUME_PRODUCER: &str = "resumeProducer";
pub const CLOSE_PRODUCER: &str = "closeProducer";

// Server → client requests
pub const NEW_CONSUMER: &str = "newConsumer";

// Server → client notifications
pub const NEW_PEER: &str = "newPeer";
pub const PEER_CLOSED: &str = "peerClosed";
pub const CONSUMER_CLOSED: &str = "consumerClosed";
pub const CONSUMER_PAUSED: &str = "consumerPaused";
pub const CONSUMER_RESUMED: &str = "consumerResumed";
pub const ACTIVE_SPEAKER: &str = "activeSpeaker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateWebRtcTransportRequest {
    pub producing: bool,
    pub consuming: bool,
}

/// Response to `createWebRtcTransport`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: String,
    pub ice_parameters: IceParameters,
    #[serde(default)]
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectWebRtcTransportRequest {
    pub transport_id: String,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub id: String,
}

/// Client device description sent with `join` and echoed in peer lists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub flag: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub display_name: String,
    pub rtp_capabilities: RtpCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

/// A remote participant, as listed by `join` and announced by `newPeer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
}

/// Payload of `pauseProducer`, `resumeProducer` and `closeProducer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerIdRequest {
    pub producer_id: String,
}

/// Server-initiated `newConsumer` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConsumerRequest {
    pub peer_id: String,
    pub producer_id: String,
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub producer_paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerClosedNotification {
    pub peer_id: String,
}

/// Payload of `consumerClosed`, `consumerPaused` and `consumerResumed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerIdNotification {
    pub consumer_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSpeakerNotification {
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub volume: Option<f64>,
}
