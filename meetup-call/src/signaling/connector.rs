use async_trait::async_trait;
use meetup_proto::Message;
use tokio::sync::mpsc;
use url::Url;

use crate::error::SignalingError;
use crate::types::{PeerId, RoomId};

/// Where a session connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub room_id: RoomId,
    pub peer_id: PeerId,
}

impl Endpoint {
    /// Server URL with `roomId` and `peerId` appended as query parameters
    pub fn to_url(&self) -> Result<Url, SignalingError> {
        let mut url =
            Url::parse(&self.url).map_err(|e| SignalingError::Connect(format!("{}: {e}", self.url)))?;
        url.query_pairs_mut()
            .append_pair("roomId", self.room_id.as_str())
            .append_pair("peerId", self.peer_id.as_str());
        Ok(url)
    }
}

/// Both halves of an established connection.
///
/// Dropping `outbound` closes the connection. `inbound` yields `None` once
/// the connection is gone.
pub struct SignalingLink {
    pub outbound: mpsc::UnboundedSender<Message>,
    pub inbound: mpsc::UnboundedReceiver<Message>,
}

/// Opens the byte-level connection underneath a `SignalingChannel`
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<SignalingLink, SignalingError>;
}
