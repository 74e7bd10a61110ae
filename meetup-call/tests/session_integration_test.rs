//! End-to-end tests of the call session against the in-memory server
//!
//! Run with: cargo test -p meetup-call --test session_integration_test

use meetup_call::media::{DeviceError, EngineConnectionState};
use meetup_call::test_helpers::{video_consumer_request, FakeDevices, FakeEngine, FakeServer, Reply};
use meetup_call::{
    CallConfig, CallEvent, CallState, Direction, Error, MediaKind, PeerId, RoomOptions,
    SessionCoordinator, SignalingError,
};
use meetup_proto::error_codes;
use meetup_proto::methods::{
    CLOSE_PRODUCER, CONNECT_WEBRTC_TRANSPORT, CONSUMER_CLOSED, CONSUMER_PAUSED,
    GET_ROUTER_RTP_CAPABILITIES, JOIN, NEW_CONSUMER, NEW_PEER, PEER_CLOSED, PRODUCE,
};
use meetup_proto::Message;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Harness {
    server: Arc<FakeServer>,
    engine: Arc<FakeEngine>,
    devices: Arc<FakeDevices>,
    call: SessionCoordinator,
}

impl Harness {
    fn new() -> Self {
        let server = FakeServer::new();
        let engine = FakeEngine::new();
        let devices = FakeDevices::new();
        let call = SessionCoordinator::new(
            CallConfig::default(),
            RoomOptions::new("R1", "Ada").with_peer_id("P1"),
            engine.clone(),
            devices.clone(),
            server.connector(),
        );
        Self {
            server,
            engine,
            devices,
            call,
        }
    }

    /// Connected, with `P2` ("Grace") already in the room
    async fn joined() -> Self {
        let h = Self::new();
        h.server.set_join_peers(&[("P2", "Grace")]);
        h.call.connect().await.unwrap();
        h
    }

    async fn offer_consumer(&self, peer_id: &str, consumer_id: &str) -> Message {
        let data = serde_json::to_value(video_consumer_request(peer_id, consumer_id)).unwrap();
        self.server
            .request(NEW_CONSUMER, data)
            .await
            .expect("no response to newConsumer")
    }
}

fn error_code(response: &Message) -> Option<i32> {
    match response {
        Message::Response { ok: true, .. } => None,
        Message::Response { error_code, .. } => *error_code,
        other => panic!("not a response: {other:?}"),
    }
}

async fn wait_event(
    events: &mut broadcast::Receiver<CallEvent>,
    matches: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_connect_announces_existing_peers() {
    let h = Harness::new();
    h.server.set_join_peers(&[("P2", "Grace"), ("P3", "Linus")]);
    let mut events = h.call.events();

    h.call.connect().await.unwrap();

    let joined = wait_event(&mut events, |e| matches!(e, CallEvent::PeerJoined(_))).await;
    assert!(matches!(joined, CallEvent::PeerJoined(peer) if peer.id == PeerId::from("P2")));
    assert_eq!(h.call.peers().len(), 2);
    assert_eq!(h.call.remote_streams().len(), 2);

    let endpoint = &h.server.endpoints()[0];
    assert_eq!(endpoint.room_id.as_str(), "R1");
    assert_eq!(endpoint.peer_id.as_str(), "P1");

    let join = &h.server.requests(JOIN)[0];
    assert_eq!(join["displayName"], "Ada");
    assert!(join["rtpCapabilities"]["codecs"].as_array().is_some());
}

#[tokio::test]
async fn test_repeated_connect_keeps_one_channel() {
    let h = Harness::new();

    let (first, second) = tokio::join!(h.call.connect(), h.call.connect());

    assert!(first.is_ok() != second.is_ok());
    let err = first.err().or(second.err()).unwrap();
    assert!(matches!(err, Error::AlreadyActive(_)));

    assert!(matches!(
        h.call.connect().await,
        Err(Error::AlreadyActive(CallState::Joined))
    ));
    assert_eq!(h.server.opens(), 1);
    assert_eq!(h.server.requests(JOIN).len(), 1);
}

#[tokio::test]
async fn test_webcam_uses_first_router_codec_supported_locally() {
    let h = Harness::joined().await;

    h.call.enable_webcam().await.unwrap();

    // H264 is supported locally but the router only offers VP8
    let produce = &h.server.requests(PRODUCE)[0];
    assert_eq!(produce["kind"], "video");
    assert_eq!(produce["rtpParameters"]["codecs"][0]["mimeType"], "video/VP8");
    let profile = h.call.session().unwrap().profile.unwrap();
    assert_eq!(
        profile.preferred_codec(MediaKind::Video).unwrap().mime_type,
        "video/VP8"
    );
}

#[tokio::test]
async fn test_concurrent_enable_produces_once() {
    let h = Harness::joined().await;

    let (first, second) = tokio::join!(h.call.enable_webcam(), h.call.enable_webcam());

    let errors: Vec<Error> = [first, second].into_iter().filter_map(Result::err).collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], Error::AlreadyProducing(MediaKind::Video)));
    assert_eq!(h.server.requests(PRODUCE).len(), 1);
    assert_eq!(h.devices.tracks().len(), 1);
    assert!(h.call.local_stream().video.is_some());
}

#[tokio::test]
async fn test_enable_disable_round_trip() {
    let h = Harness::joined().await;
    let mut events = h.call.events();

    h.call.enable_mic().await.unwrap();
    let first = h.call.local_stream().audio.unwrap();
    assert_eq!(first.id.as_str(), "producer-1");
    wait_event(&mut events, |e| matches!(e, CallEvent::ProducerAdded { kind: MediaKind::Audio, .. })).await;

    h.call.disable_mic().await.unwrap();
    assert!(h.call.local_stream().is_empty());
    assert_eq!(h.server.requests(CLOSE_PRODUCER)[0]["producerId"], "producer-1");
    assert_eq!(h.devices.tracks()[0].stop_count(), 1);
    wait_event(&mut events, |e| matches!(e, CallEvent::ProducerClosed(MediaKind::Audio))).await;

    // Disabling again is a no-op
    h.call.disable_mic().await.unwrap();
    assert_eq!(h.server.requests(CLOSE_PRODUCER).len(), 1);

    h.call.enable_mic().await.unwrap();
    assert_eq!(h.call.local_stream().audio.unwrap().id.as_str(), "producer-2");
    assert_eq!(h.devices.tracks().len(), 2);
    assert_eq!(h.devices.live_tracks(), 1);
}

#[tokio::test]
async fn test_mute_pauses_producer() {
    let h = Harness::joined().await;
    h.call.enable_mic().await.unwrap();

    h.call.mute_mic().await.unwrap();
    assert!(h.call.local_stream().audio.unwrap().paused);
    let engine_producer = h.engine.transport(Direction::Send).unwrap().producers()[0].clone();
    assert!(engine_producer.is_paused());

    h.call.unmute_mic().await.unwrap();
    assert!(!h.call.local_stream().audio.unwrap().paused);
    assert!(!engine_producer.is_paused());

    assert!(matches!(
        h.call.mute_webcam().await,
        Err(Error::NotProducing(MediaKind::Video))
    ));
}

#[tokio::test]
async fn test_device_failure_is_a_warning() {
    let h = Harness::joined().await;
    h.devices
        .fail_with(MediaKind::Video, DeviceError::PermissionDenied);
    let mut events = h.call.events();

    let err = h.call.enable_webcam().await.unwrap_err();

    assert!(matches!(err, Error::MediaAcquisition { kind: MediaKind::Video, .. }));
    let warning = wait_event(&mut events, |e| matches!(e, CallEvent::MediaWarning { .. })).await;
    assert!(matches!(warning, CallEvent::MediaWarning { kind: MediaKind::Video, .. }));
    assert_eq!(h.call.state(), CallState::Joined);
    assert!(h.server.requests(PRODUCE).is_empty());

    // The kind is free again and audio is unaffected
    h.call.enable_mic().await.unwrap();
    assert!(matches!(
        h.call.enable_webcam().await,
        Err(Error::MediaAcquisition { .. })
    ));
}

#[tokio::test]
async fn test_new_consumer_rejected_while_recv_transport_connecting() {
    let h = Harness::joined().await;
    let recv = h.engine.transport(Direction::Recv).unwrap();

    recv.set_connection_state(EngineConnectionState::Connecting);
    let response = h.offer_consumer("P2", "C1").await;
    assert_eq!(error_code(&response), Some(error_codes::TRANSPORT_NOT_READY));
    assert!(recv.consumers().is_empty());

    recv.set_connection_state(EngineConnectionState::Connected);
    let response = h.offer_consumer("P2", "C1").await;
    assert_eq!(error_code(&response), None);
    assert_eq!(recv.consumers().len(), 1);
}

#[tokio::test]
async fn test_new_consumer_for_unknown_peer_is_rejected() {
    let h = Harness::joined().await;

    let response = h.offer_consumer("P9", "C1").await;

    assert_eq!(error_code(&response), Some(error_codes::PEER_NOT_FOUND));
    assert!(h.call.remote_streams()[&PeerId::from("P2")].consumers.is_empty());
}

#[tokio::test]
async fn test_unknown_server_request_is_rejected() {
    let h = Harness::joined().await;

    let response = h.server.request("restartIce", json!({})).await.unwrap();

    assert_eq!(error_code(&response), Some(error_codes::METHOD_NOT_FOUND));
}

#[tokio::test]
async fn test_consumer_lifecycle_notifications() {
    let h = Harness::joined().await;
    let mut events = h.call.events();

    assert_eq!(error_code(&h.offer_consumer("P2", "C1").await), None);
    wait_event(&mut events, |e| matches!(e, CallEvent::ConsumerAdded(_))).await;
    let streams = h.call.remote_streams();
    let consumer = streams[&PeerId::from("P2")].track(MediaKind::Video).unwrap();
    assert_eq!(consumer.track.id, "track-C1");

    h.server.notify(CONSUMER_PAUSED, json!({"consumerId": "C1"}));
    h.server.notify(CONSUMER_CLOSED, json!({"consumerId": "C1"}));
    let removed = wait_event(&mut events, |e| matches!(e, CallEvent::ConsumerRemoved { .. })).await;
    assert!(matches!(
        removed,
        CallEvent::ConsumerRemoved { peer_id, .. } if peer_id == PeerId::from("P2")
    ));

    assert!(h.call.remote_streams()[&PeerId::from("P2")].consumers.is_empty());
    assert!(h.engine.transport(Direction::Recv).unwrap().consumers()[0].is_closed());
}

#[tokio::test]
async fn test_peer_closed_cascades_to_consumers() {
    let h = Harness::joined().await;
    let mut events = h.call.events();
    h.server.notify(NEW_PEER, json!({"id": "P3", "displayName": "Linus"}));
    wait_event(&mut events, |e| matches!(e, CallEvent::PeerJoined(_))).await;

    assert_eq!(error_code(&h.offer_consumer("P2", "C1").await), None);
    assert_eq!(error_code(&h.offer_consumer("P3", "C2").await), None);

    h.server.notify(PEER_CLOSED, json!({"peerId": "P2"}));
    let removed = wait_event(&mut events, |e| matches!(e, CallEvent::ConsumerRemoved { .. })).await;
    assert!(matches!(
        removed,
        CallEvent::ConsumerRemoved { consumer_id, .. } if consumer_id.as_str() == "C1"
    ));
    wait_event(&mut events, |e| matches!(e, CallEvent::PeerLeft(_))).await;

    let streams = h.call.remote_streams();
    assert!(!streams.contains_key(&PeerId::from("P2")));
    assert_eq!(streams[&PeerId::from("P3")].consumers.len(), 1);

    let consumers = h.engine.transport(Direction::Recv).unwrap().consumers();
    let closed: Vec<bool> = consumers.iter().map(|c| c.is_closed()).collect();
    assert_eq!(closed, vec![true, false]);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let h = Harness::joined().await;
    h.call.enable_mic().await.unwrap();
    h.call.enable_webcam().await.unwrap();
    assert_eq!(error_code(&h.offer_consumer("P2", "C1").await), None);
    let mut states = h.call.subscribe_state();

    h.call.disconnect();
    h.call.disconnect();

    assert_eq!(h.call.state(), CallState::Closed);
    assert!(states.has_changed().unwrap());
    assert_eq!(h.devices.tracks().len(), 2);
    assert!(h.devices.tracks().iter().all(|t| t.stop_count() == 1));
    assert!(h.engine.transports().iter().all(|t| t.is_closed()));
    assert!(h.call.session().is_none());
    assert!(h.call.local_stream().is_empty());
    assert!(h.call.remote_streams().is_empty());
    assert!(matches!(h.call.enable_mic().await, Err(Error::NotReady)));
}

#[tokio::test]
async fn test_disconnect_during_connect_cancels() {
    let h = Harness::new();
    h.server.set_reply(JOIN, Reply::Hold);

    let (result, ()) = tokio::join!(h.call.connect(), async {
        h.server.wait_for(JOIN, 1).await;
        h.call.disconnect();
    });

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(h.call.state(), CallState::Closed);
    assert_eq!(h.devices.live_tracks(), 0);
    assert_eq!(h.engine.transports().len(), 2);
    assert!(h.engine.transports().iter().all(|t| t.is_closed()));
}

#[tokio::test]
async fn test_connection_drop_fails_session() {
    let h = Harness::joined().await;
    h.call.enable_mic().await.unwrap();
    assert_eq!(error_code(&h.offer_consumer("P2", "C1").await), None);
    let mut events = h.call.events();
    let mut states = h.call.subscribe_state();

    h.server.drop_connection();

    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == CallState::Failed),
    )
    .await
    .unwrap()
    .unwrap();
    let failed = wait_event(&mut events, |e| matches!(e, CallEvent::ConnectionFailed { .. })).await;
    assert!(matches!(failed, CallEvent::ConnectionFailed { retryable: true, .. }));

    assert_eq!(h.devices.live_tracks(), 0);
    assert!(h.engine.transports().iter().all(|t| t.is_closed()));
    assert!(h.call.local_stream().is_empty());
    assert!(h.call.remote_streams().is_empty());
    assert!(h.call.peers().is_empty());

    // A fresh session can be started afterwards
    h.call.connect().await.unwrap();
    assert_eq!(h.server.opens(), 2);
}

#[tokio::test]
async fn test_transport_failure_during_connect_reports_cause() {
    let h = Harness::new();
    h.server.set_reply(JOIN, Reply::Hold);

    let (result, ()) = tokio::join!(h.call.connect(), async {
        h.server.wait_for(JOIN, 1).await;
        h.engine
            .transport(Direction::Send)
            .unwrap()
            .set_connection_state(EngineConnectionState::Failed);
    });

    let err = result.unwrap_err();
    assert!(matches!(
        err,
        Error::Transport {
            direction: Direction::Send,
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(h.call.state(), CallState::Failed);
    assert!(h.engine.transports().iter().all(|t| t.is_closed()));

    h.server.clear_reply(JOIN);
    h.call.connect().await.unwrap();
}

#[tokio::test]
async fn test_recv_transport_failure_tears_session_down() {
    let h = Harness::joined().await;
    h.call.enable_mic().await.unwrap();
    assert_eq!(error_code(&h.offer_consumer("P2", "C1").await), None);
    let mut events = h.call.events();
    let mut states = h.call.subscribe_state();

    h.engine
        .transport(Direction::Recv)
        .unwrap()
        .set_connection_state(EngineConnectionState::Failed);

    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == CallState::Failed),
    )
    .await
    .unwrap()
    .unwrap();
    let failed = wait_event(&mut events, |e| matches!(e, CallEvent::ConnectionFailed { .. })).await;
    assert!(matches!(failed, CallEvent::ConnectionFailed { retryable: true, .. }));

    assert_eq!(h.devices.live_tracks(), 0);
    assert_eq!(h.engine.transports().len(), 2);
    assert!(h.engine.transports().iter().all(|t| t.is_closed()));
    assert!(h.engine.transport(Direction::Recv).unwrap().consumers()[0].is_closed());
    assert!(h.call.peers().is_empty());
    assert!(h.call.remote_streams().is_empty());
    assert!(h.call.local_stream().is_empty());
}

#[tokio::test]
async fn test_rejected_transport_connect_fails_first_enable() {
    let h = Harness::joined().await;
    h.server
        .set_reply(CONNECT_WEBRTC_TRANSPORT, Reply::Reject(500, "dtls mismatch".to_string()));
    let mut events = h.call.events();

    let err = h.call.enable_webcam().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Transport {
            direction: Direction::Send,
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(h.call.state(), CallState::Failed);
    let failed = wait_event(&mut events, |e| matches!(e, CallEvent::ConnectionFailed { .. })).await;
    assert!(matches!(failed, CallEvent::ConnectionFailed { retryable: true, .. }));

    assert_eq!(h.server.requests(CONNECT_WEBRTC_TRANSPORT).len(), 1);
    assert!(h.server.requests(PRODUCE).is_empty());
    assert_eq!(h.devices.tracks().len(), 1);
    assert_eq!(h.devices.live_tracks(), 0);
    assert!(h.engine.transports().iter().all(|t| t.is_closed()));
    assert!(h.call.local_stream().is_empty());
}

#[tokio::test]
async fn test_refused_connection_fails_connect() {
    let h = Harness::new();
    h.server.refuse_connections(true);

    let err = h.call.connect().await.unwrap_err();

    assert!(matches!(err, Error::Signaling(SignalingError::Connect(_))));
    assert!(err.is_retryable());
    assert_eq!(h.call.state(), CallState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_fails_connect() {
    let h = Harness::new();
    h.server.set_reply(GET_ROUTER_RTP_CAPABILITIES, Reply::Hold);

    let err = h.call.connect().await.unwrap_err();

    assert!(matches!(
        &err,
        Error::Signaling(SignalingError::Timeout { method }) if method == GET_ROUTER_RTP_CAPABILITIES
    ));
    assert!(err.is_retryable());
    assert_eq!(h.call.state(), CallState::Failed);
    assert!(h.engine.transports().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_server_request_times_out() {
    let h = Harness::new();
    h.server.set_join_peers(&[("P2", "Grace")]);
    h.server.set_reply(JOIN, Reply::Hold);
    let data: Value = serde_json::to_value(video_consumer_request("P2", "C1")).unwrap();

    // The consumer waits for the join, which never completes
    let (result, response) = tokio::join!(h.call.connect(), async {
        h.server.wait_for(JOIN, 1).await;
        h.server.request(NEW_CONSUMER, data).await
    });

    assert_eq!(
        error_code(&response.unwrap()),
        Some(error_codes::REQUEST_TIMEOUT)
    );
    assert!(matches!(
        result,
        Err(Error::Signaling(SignalingError::Timeout { ref method })) if method == JOIN
    ));
    assert_eq!(h.call.state(), CallState::Failed);
}
