use chrono::{DateTime, Utc};
use meetup_proto::methods::{DeviceInfo, PeerInfo};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use crate::consumer::{Consumer, ConsumerRegistry};
use crate::session::RemoteStream;
use crate::types::{ConsumerId, PeerId};

/// A remote participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
    pub device: Option<DeviceInfo>,
    pub joined_at: DateTime<Utc>,
    pub consumers: BTreeSet<ConsumerId>,
}

impl Peer {
    fn from_info(info: PeerInfo) -> Self {
        Self {
            id: PeerId::from(info.id),
            display_name: info.display_name,
            device: info.device,
            joined_at: Utc::now(),
            consumers: BTreeSet::new(),
        }
    }
}

/// Remote participants of the room.
///
/// When both are needed, the peer lock is taken before the consumer lock.
#[derive(Default)]
pub struct PeerDirectory {
    pub(crate) peers: Mutex<HashMap<PeerId, Peer>>,
}

impl PeerDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a peer. Returns `None` if it is already known.
    pub fn add(&self, info: PeerInfo) -> Option<Peer> {
        let peer = Peer::from_info(info);
        let mut peers = self.peers.lock();
        if peers.contains_key(&peer.id) {
            debug!(peer_id = %peer.id, "Peer already known");
            return None;
        }
        info!(peer_id = %peer.id, display_name = %peer.display_name, "Peer joined");
        peers.insert(peer.id.clone(), peer.clone());
        Some(peer)
    }

    /// Forget a peer and, in the same step, close all of its consumers
    pub fn remove(&self, peer_id: &PeerId, consumers: &ConsumerRegistry) -> Option<(Peer, Vec<Consumer>)> {
        let (peer, closed) = {
            let mut peers = self.peers.lock();
            let mut table = consumers.entries.lock();

            let peer = peers.remove(peer_id)?;
            let closed: Vec<_> = peer
                .consumers
                .iter()
                .filter_map(|id| table.remove(id))
                .collect();
            (peer, closed)
        };

        let closed = closed
            .into_iter()
            .map(|entry| {
                entry.engine.close();
                entry.info
            })
            .collect();
        info!(peer_id = %peer_id, "Peer left");
        Some((peer, closed))
    }

    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.lock().contains_key(peer_id)
    }

    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<Peer> {
        self.peers.lock().get(peer_id).cloned()
    }

    /// Peers ordered by join time
    #[must_use]
    pub fn list(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.lock().values().cloned().collect();
        peers.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        peers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every peer. Consumers must be closed first.
    pub fn clear(&self) {
        self.peers.lock().clear();
    }

    /// Each peer with the tracks received from it
    #[must_use]
    pub fn remote_streams(&self, consumers: &ConsumerRegistry) -> BTreeMap<PeerId, RemoteStream> {
        let peers = self.peers.lock();
        let table = consumers.entries.lock();

        peers
            .values()
            .map(|peer| {
                let consumers = peer
                    .consumers
                    .iter()
                    .filter_map(|id| table.get(id).map(|entry| entry.info.clone()))
                    .collect();
                (
                    peer.id.clone(),
                    RemoteStream {
                        peer_id: peer.id.clone(),
                        display_name: peer.display_name.clone(),
                        consumers,
                    },
                )
            })
            .collect()
    }
}
