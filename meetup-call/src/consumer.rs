//! Remote consumers
//!
//! Consumers are created on the server's `newConsumer` request and bound to
//! the peer that owns the remote producer. Binding happens under the peer
//! lock, so a `peerClosed` handled concurrently either sees the consumer and
//! closes it or makes the bind fail.

use meetup_proto::methods::NewConsumerRequest;
use meetup_proto::MediaKind;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::media::{ConsumeOptions, EngineConsumer, RemoteTrack};
use crate::peer::PeerDirectory;
use crate::transport::TransportHandle;
use crate::types::{ConsumerId, PeerId, ProducerId};

/// Read-only view of a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumer {
    pub id: ConsumerId,
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub track: RemoteTrack,
    pub paused: bool,
}

pub(crate) struct ConsumerEntry {
    pub(crate) info: Consumer,
    pub(crate) engine: Arc<dyn EngineConsumer>,
}

#[derive(Default)]
pub struct ConsumerRegistry {
    pub(crate) entries: Mutex<HashMap<ConsumerId, ConsumerEntry>>,
    closed: AtomicBool,
}

/// Reject descriptors the engine could not decode
fn validate(request: &NewConsumerRequest) -> Result<()> {
    if request.rtp_parameters.codecs.is_empty() {
        return Err(Error::Consume("rtpParameters carry no codecs".to_string()));
    }
    if let Some(codec) = request
        .rtp_parameters
        .codecs
        .iter()
        .find(|codec| MediaKind::from_mime_type(&codec.mime_type) != Some(request.kind))
    {
        return Err(Error::Consume(format!(
            "codec {} does not match kind {}",
            codec.mime_type, request.kind
        )));
    }
    Ok(())
}

impl ConsumerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and bind the consumer described by a `newConsumer` request
    pub async fn consume(
        &self,
        transport: &TransportHandle,
        peers: &PeerDirectory,
        request: NewConsumerRequest,
    ) -> Result<Consumer> {
        transport.ensure_consumable()?;

        let peer_id = PeerId::from(request.peer_id.as_str());
        if !peers.contains(&peer_id) {
            return Err(Error::UnknownPeer(peer_id));
        }
        validate(&request)?;

        let id = ConsumerId::from(request.id.as_str());
        let engine = transport
            .engine()
            .consume(ConsumeOptions {
                id: id.clone(),
                producer_id: ProducerId::from(request.producer_id.as_str()),
                kind: request.kind,
                rtp_parameters: request.rtp_parameters,
            })
            .await?;

        let info = Consumer {
            id: id.clone(),
            peer_id: peer_id.clone(),
            producer_id: ProducerId::from(request.producer_id),
            kind: request.kind,
            track: engine.track(),
            paused: request.producer_paused,
        };

        let bound = {
            let mut peers = peers.peers.lock();
            let mut entries = self.entries.lock();

            if self.closed.load(Ordering::SeqCst) {
                Err(Error::Cancelled)
            } else if entries.contains_key(&id) {
                Err(Error::Consume(format!("consumer {id} already exists")))
            } else if let Some(peer) = peers.get_mut(&peer_id) {
                peer.consumers.insert(id.clone());
                entries.insert(
                    id.clone(),
                    ConsumerEntry {
                        info: info.clone(),
                        engine: engine.clone(),
                    },
                );
                Ok(())
            } else {
                // peerClosed arrived while the engine was busy
                Err(Error::UnknownPeer(peer_id.clone()))
            }
        };

        if let Err(e) = bound {
            engine.close();
            return Err(e);
        }

        info!(
            consumer_id = %id,
            peer_id = %peer_id,
            kind = %info.kind,
            paused = info.paused,
            "Consumer created"
        );
        Ok(info)
    }

    /// Close and forget one consumer
    pub fn remove(&self, consumer_id: &ConsumerId, peers: &PeerDirectory) -> Option<Consumer> {
        let entry = {
            let mut peers = peers.peers.lock();
            let mut entries = self.entries.lock();

            let entry = entries.remove(consumer_id)?;
            if let Some(peer) = peers.get_mut(&entry.info.peer_id) {
                peer.consumers.remove(consumer_id);
            }
            entry
        };

        entry.engine.close();
        debug!(consumer_id = %consumer_id, peer_id = %entry.info.peer_id, "Consumer closed");
        Some(entry.info)
    }

    pub fn set_paused(&self, consumer_id: &ConsumerId, paused: bool) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(consumer_id)
            .ok_or_else(|| Error::UnknownConsumer(consumer_id.clone()))?;

        if entry.info.paused != paused {
            entry.info.paused = paused;
            if paused {
                entry.engine.pause();
            } else {
                entry.engine.resume();
            }
            debug!(consumer_id = %consumer_id, paused, "Consumer pause state changed");
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, consumer_id: &ConsumerId) -> Option<Consumer> {
        self.entries
            .lock()
            .get(consumer_id)
            .map(|entry| entry.info.clone())
    }

    #[must_use]
    pub fn list(&self) -> Vec<Consumer> {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every consumer and refuse new bindings
    pub fn close_all(&self, peers: &PeerDirectory) -> Vec<Consumer> {
        let drained = {
            let mut peers = peers.peers.lock();
            let mut entries = self.entries.lock();
            self.closed.store(true, Ordering::SeqCst);
            for peer in peers.values_mut() {
                peer.consumers.clear();
            }
            std::mem::take(&mut *entries)
        };

        drained
            .into_values()
            .map(|entry| {
                entry.engine.close();
                entry.info
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilityProfile;
    use crate::config::SignalingConfig;
    use crate::media::{EngineConnectionState, MediaEngine as _};
    use crate::signaling::{Endpoint, SignalingChannel};
    use crate::test_helpers::{video_consumer_request, FakeEngine, FakeServer};
    use crate::transport::{Direction, TransportManager};
    use crate::types::RoomId;
    use meetup_proto::methods::{PeerInfo, CONNECT_WEBRTC_TRANSPORT};
    use tokio::sync::mpsc;

    struct Fixture {
        server: Arc<FakeServer>,
        engine: Arc<FakeEngine>,
        recv: Arc<TransportHandle>,
        peers: PeerDirectory,
        consumers: ConsumerRegistry,
        _manager: TransportManager,
    }

    async fn fixture() -> Fixture {
        let server = FakeServer::new();
        let engine = FakeEngine::new();
        let channel = SignalingChannel::new(server.connector(), SignalingConfig::default());
        channel
            .open(&Endpoint {
                url: "ws://localhost".to_string(),
                room_id: RoomId::from("R1"),
                peer_id: PeerId::from("P1"),
            })
            .await
            .unwrap();
        let profile =
            CapabilityProfile::from_router(FakeServer::router_capabilities(), &engine.rtp_capabilities())
                .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = TransportManager::new(channel, engine.clone(), tx);
        let recv = manager
            .create(Direction::Recv, Some(&profile))
            .await
            .unwrap();

        let peers = PeerDirectory::new();
        peers.add(PeerInfo {
            id: "P2".to_string(),
            display_name: "Ada".to_string(),
            device: None,
        });

        Fixture {
            server,
            engine,
            recv,
            peers,
            consumers: ConsumerRegistry::new(),
            _manager: manager,
        }
    }

    #[tokio::test]
    async fn test_consume_binds_to_peer() {
        let f = fixture().await;

        let consumer = f
            .consumers
            .consume(&f.recv, &f.peers, video_consumer_request("P2", "cons-1"))
            .await
            .unwrap();

        assert_eq!(consumer.kind, MediaKind::Video);
        assert_eq!(consumer.track.kind, MediaKind::Video);
        assert!(f.peers.get(&PeerId::from("P2")).unwrap().consumers.contains(&consumer.id));
        // the first consume drives the connect handshake
        assert_eq!(f.server.requests(CONNECT_WEBRTC_TRANSPORT).len(), 1);

        let streams = f.peers.remote_streams(&f.consumers);
        assert_eq!(streams[&PeerId::from("P2")].consumers.len(), 1);
    }

    #[tokio::test]
    async fn test_consume_rejects_while_connecting() {
        let f = fixture().await;
        f.engine
            .transport(Direction::Recv)
            .unwrap()
            .set_connection_state(EngineConnectionState::Connecting);

        let err = f
            .consumers
            .consume(&f.recv, &f.peers, video_consumer_request("P2", "cons-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TransportNotReady(Direction::Recv)));
        assert!(f.consumers.is_empty());
    }

    #[tokio::test]
    async fn test_consume_unknown_peer() {
        let f = fixture().await;
        let err = f
            .consumers
            .consume(&f.recv, &f.peers, video_consumer_request("P9", "cons-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_consume_validates_descriptor() {
        let f = fixture().await;

        let mut no_codecs = video_consumer_request("P2", "cons-1");
        no_codecs.rtp_parameters.codecs.clear();
        assert!(matches!(
            f.consumers.consume(&f.recv, &f.peers, no_codecs).await,
            Err(Error::Consume(_))
        ));

        let mut wrong_kind = video_consumer_request("P2", "cons-2");
        wrong_kind.kind = MediaKind::Audio;
        assert!(matches!(
            f.consumers.consume(&f.recv, &f.peers, wrong_kind).await,
            Err(Error::Consume(_))
        ));
        assert!(f.consumers.is_empty());
    }

    #[tokio::test]
    async fn test_peer_removal_cascades() {
        let f = fixture().await;
        for id in ["cons-1", "cons-2"] {
            f.consumers
                .consume(&f.recv, &f.peers, video_consumer_request("P2", id))
                .await
                .unwrap();
        }

        let (peer, closed) = f.peers.remove(&PeerId::from("P2"), &f.consumers).unwrap();

        assert_eq!(peer.id.as_str(), "P2");
        assert_eq!(closed.len(), 2);
        assert!(f.consumers.is_empty());
        let engine_transport = f.engine.transport(Direction::Recv).unwrap();
        assert!(engine_transport.consumers().iter().all(|c| c.is_closed()));
    }

    #[tokio::test]
    async fn test_remove_and_pause() {
        let f = fixture().await;
        let consumer = f
            .consumers
            .consume(&f.recv, &f.peers, video_consumer_request("P2", "cons-1"))
            .await
            .unwrap();

        f.consumers.set_paused(&consumer.id, true).unwrap();
        assert!(f.consumers.get(&consumer.id).unwrap().paused);
        assert!(matches!(
            f.consumers.set_paused(&ConsumerId::from("nope"), true),
            Err(Error::UnknownConsumer(_))
        ));

        assert!(f.consumers.remove(&consumer.id, &f.peers).is_some());
        assert!(f.consumers.remove(&consumer.id, &f.peers).is_none());
        assert!(f.peers.get(&PeerId::from("P2")).unwrap().consumers.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_refuses_late_binds() {
        let f = fixture().await;
        f.consumers
            .consume(&f.recv, &f.peers, video_consumer_request("P2", "cons-1"))
            .await
            .unwrap();

        assert_eq!(f.consumers.close_all(&f.peers).len(), 1);
        assert!(matches!(
            f.consumers
                .consume(&f.recv, &f.peers, video_consumer_request("P2", "cons-2"))
                .await,
            Err(Error::Cancelled)
        ));
        assert!(f.engine.transport(Direction::Recv).unwrap().consumers().iter().all(|c| c.is_closed()));
    }
}
