//! Session state and the views handed to the application

use meetup_proto::methods::DeviceInfo;
use meetup_proto::MediaKind;
use std::fmt;

use crate::capabilities::CapabilityProfile;
use crate::consumer::Consumer;
use crate::peer::Peer;
use crate::producer::Producer;
use crate::types::{ConsumerId, PeerId, ProducerId, RoomId};

/// Lifecycle of a call session.
///
/// `Idle → Connecting → Joined → Leaving → Closed`; `Failed` is reached from
/// `Connecting` or `Joined`. A new `connect()` is allowed from `Idle`,
/// `Closed` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    Connecting,
    Joined,
    Leaving,
    Closed,
    Failed,
}

impl CallState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Joined => "joined",
            Self::Leaving => "leaving",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    /// States from which `connect()` may start a new session
    #[must_use]
    pub const fn can_connect(&self) -> bool {
        matches!(self, Self::Idle | Self::Closed | Self::Failed)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which room to join and as whom
#[derive(Debug, Clone)]
pub struct RoomOptions {
    pub room_id: RoomId,
    pub display_name: String,
    /// Generated when not given
    pub peer_id: Option<PeerId>,
    /// Overrides the device announced from the media config
    pub device: Option<DeviceInfo>,
}

impl RoomOptions {
    pub fn new(room_id: impl Into<RoomId>, display_name: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            display_name: display_name.into(),
            peer_id: None,
            device: None,
        }
    }

    #[must_use]
    pub fn with_peer_id(mut self, peer_id: impl Into<PeerId>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.device = Some(device);
        self
    }
}

/// Snapshot of the live session
#[derive(Debug, Clone)]
pub struct Session {
    pub room_id: RoomId,
    pub peer_id: PeerId,
    pub display_name: String,
    pub state: CallState,
    pub profile: Option<CapabilityProfile>,
}

/// What the local participant is sending
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    pub audio: Option<Producer>,
    pub video: Option<Producer>,
}

impl LocalStream {
    #[must_use]
    pub const fn get(&self, kind: MediaKind) -> Option<&Producer> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// What is received from one remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub peer_id: PeerId,
    pub display_name: String,
    pub consumers: Vec<Consumer>,
}

impl RemoteStream {
    #[must_use]
    pub fn track(&self, kind: MediaKind) -> Option<&Consumer> {
        self.consumers.iter().find(|consumer| consumer.kind == kind)
    }
}

/// Changes pushed to the application
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    PeerJoined(Peer),
    PeerLeft(PeerId),
    ConsumerAdded(Consumer),
    ConsumerRemoved {
        consumer_id: ConsumerId,
        peer_id: PeerId,
    },
    ProducerAdded {
        kind: MediaKind,
        producer_id: ProducerId,
    },
    ProducerClosed(MediaKind),
    ActiveSpeaker {
        peer_id: Option<PeerId>,
        volume: Option<f64>,
    },
    /// A device could not be opened; the session carries on
    MediaWarning {
        kind: MediaKind,
        reason: String,
    },
    /// The session ended in `Failed`
    ConnectionFailed {
        reason: String,
        retryable: bool,
    },
}
