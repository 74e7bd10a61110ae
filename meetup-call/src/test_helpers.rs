//! In-memory fakes for exercising the orchestrator without a network,
//! a WebRTC stack or capture devices
//!
//! - **`FakeServer`** / **`MemoryConnector`**: scripted signaling server
//! - **`FakeEngine`** / **`FakeTransport`**: media engine that runs the
//!   connect and produce callbacks like a real one
//! - **`FakeDevices`** / **`FakeTrack`**: capture devices that count stops

use async_trait::async_trait;
use meetup_proto::methods::{
    NewConsumerRequest, PeerInfo, TransportOptions, CREATE_WEBRTC_TRANSPORT,
    GET_ROUTER_RTP_CAPABILITIES, JOIN, PRODUCE,
};
use meetup_proto::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind, Message,
    RtcpParameters, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::error::{Error, Result, SignalingError};
use crate::media::{
    ConsumeOptions, DeviceError, EngineConnectionState, EngineConsumer, EngineProducer,
    EngineTransport, LocalTrack, MediaDevices, MediaEngine, ProduceOptions, RemoteTrack,
    TransportListener, TransportParams,
};
use crate::signaling::{Endpoint, SignalingConnector, SignalingLink};
use crate::transport::Direction;
use crate::types::{ConsumerId, ProducerId, TransportId};

fn codec(kind: MediaKind, mime_type: &str, payload_type: u8, clock_rate: u32) -> RtpCodecCapability {
    RtpCodecCapability {
        kind,
        mime_type: mime_type.to_string(),
        preferred_payload_type: Some(payload_type),
        clock_rate,
        channels: (kind == MediaKind::Audio).then_some(2),
        parameters: BTreeMap::new(),
        rtcp_feedback: Vec::new(),
    }
}

fn fake_dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Auto,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AB:CD:EF".to_string(),
        }],
    }
}

/// A `newConsumer` descriptor for a VP8 stream from `peer_id`
#[must_use]
pub fn video_consumer_request(peer_id: &str, consumer_id: &str) -> NewConsumerRequest {
    NewConsumerRequest {
        peer_id: peer_id.to_string(),
        producer_id: format!("remote-{consumer_id}"),
        id: consumer_id.to_string(),
        kind: MediaKind::Video,
        rtp_parameters: RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 101,
                clock_rate: 90000,
                channels: None,
                parameters: BTreeMap::new(),
                rtcp_feedback: Vec::new(),
            }],
            ..RtpParameters::default()
        },
        producer_paused: false,
        app_data: None,
    }
}

/// How the fake server answers a request method
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(Value),
    Reject(i32, String),
    /// Never answer
    Hold,
}

#[derive(Default)]
struct ServerState {
    opens: usize,
    refuse: bool,
    connection: u64,
    endpoints: Vec<Endpoint>,
    to_client: Option<mpsc::UnboundedSender<Message>>,
    requests: Vec<(String, Value)>,
    notifications: Vec<(String, Value)>,
    replies: HashMap<String, Reply>,
    join_peers: Vec<PeerInfo>,
    transports: u64,
    producers: u64,
    next_request_id: u64,
    awaiting: HashMap<u64, oneshot::Sender<Message>>,
}

/// Signaling server living in the test process
#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
    requested: Notify,
}

impl FakeServer {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Opus and VP8 (with RTX) only
    #[must_use]
    pub fn router_capabilities() -> RtpCapabilities {
        let mut rtx = codec(MediaKind::Video, "video/rtx", 102, 90000);
        rtx.parameters.insert("apt".to_string(), json!(101));
        RtpCapabilities {
            codecs: vec![
                codec(MediaKind::Audio, "audio/opus", 100, 48000),
                codec(MediaKind::Video, "video/VP8", 101, 90000),
                rtx,
            ],
            header_extensions: Vec::new(),
        }
    }

    #[must_use]
    pub fn connector(self: &Arc<Self>) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            server: self.clone(),
        })
    }

    /// Number of connections opened so far
    #[must_use]
    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state.lock().endpoints.clone()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Payloads of every request received for `method`
    #[must_use]
    pub fn requests(&self, method: &str) -> Vec<Value> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Request methods in arrival order
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    #[must_use]
    pub fn notifications(&self) -> Vec<(String, Value)> {
        self.state.lock().notifications.clone()
    }

    /// Wait until `count` requests for `method` arrived
    pub async fn wait_for(&self, method: &str, count: usize) {
        loop {
            let notified = self.requested.notified();
            if self.requests(method).len() >= count {
                return;
            }
            notified.await;
        }
    }

    pub fn set_reply(&self, method: &str, reply: Reply) {
        self.state.lock().replies.insert(method.to_string(), reply);
    }

    pub fn clear_reply(&self, method: &str) {
        self.state.lock().replies.remove(method);
    }

    /// Peers listed in the `join` response
    pub fn set_join_peers(&self, peers: &[(&str, &str)]) {
        self.state.lock().join_peers = peers
            .iter()
            .map(|(id, name)| PeerInfo {
                id: (*id).to_string(),
                display_name: (*name).to_string(),
                device: None,
            })
            .collect();
    }

    pub fn notify(&self, method: &str, data: Value) {
        let _ = self.send(Message::notification(method, data));
    }

    /// Send a server request and wait for the client's response
    pub async fn request(&self, method: &str, data: Value) -> Option<Message> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.state.lock();
            state.next_request_id += 1;
            let id = 1000 + state.next_request_id;
            state.awaiting.insert(id, tx);
            id
        };
        if !self.send(Message::request(id, method, data)) {
            self.state.lock().awaiting.remove(&id);
            return None;
        }
        rx.await.ok()
    }

    /// Drop the connection as if the network went away
    pub fn drop_connection(&self) {
        self.state.lock().to_client = None;
    }

    fn send(&self, message: Message) -> bool {
        self.state
            .lock()
            .to_client
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    fn accept(self: &Arc<Self>, endpoint: &Endpoint) -> std::result::Result<SignalingLink, SignalingError> {
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();

        let connection = {
            let mut state = self.state.lock();
            if state.refuse {
                return Err(SignalingError::Connect("connection refused".to_string()));
            }
            state.opens += 1;
            state.connection += 1;
            state.endpoints.push(endpoint.clone());
            state.to_client = Some(to_client);
            state.connection
        };

        tokio::spawn(self.clone().serve(connection, from_client));
        Ok(SignalingLink {
            outbound: client_tx,
            inbound: client_rx,
        })
    }

    async fn serve(self: Arc<Self>, connection: u64, mut from_client: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = from_client.recv().await {
            self.handle(message);
        }

        let mut state = self.state.lock();
        if state.connection == connection {
            state.to_client = None;
        }
    }

    fn handle(&self, message: Message) {
        match message {
            Message::Request { id, method, data } => {
                let reply = {
                    let mut state = self.state.lock();
                    state.requests.push((method.clone(), data.clone()));
                    match state.replies.get(&method).cloned() {
                        Some(reply) => reply,
                        None => Reply::Ok(Self::default_reply(&mut state, &method, &data)),
                    }
                };
                self.requested.notify_waiters();

                match reply {
                    Reply::Ok(data) => {
                        let _ = self.send(Message::success(id, data));
                    }
                    Reply::Reject(code, reason) => {
                        let _ = self.send(Message::error(id, code, reason));
                    }
                    Reply::Hold => {}
                }
            }
            Message::Response { id, .. } => {
                if let Some(tx) = self.state.lock().awaiting.remove(&id) {
                    let _ = tx.send(message);
                }
            }
            Message::Notification { method, data } => {
                self.state.lock().notifications.push((method, data));
            }
        }
    }

    fn default_reply(state: &mut ServerState, method: &str, data: &Value) -> Value {
        match method {
            GET_ROUTER_RTP_CAPABILITIES => {
                serde_json::to_value(Self::router_capabilities()).unwrap_or_default()
            }
            CREATE_WEBRTC_TRANSPORT => {
                state.transports += 1;
                let direction = if data["producing"].as_bool() == Some(true) {
                    "send"
                } else {
                    "recv"
                };
                let options = TransportOptions {
                    id: format!("{direction}-transport-{}", state.transports),
                    ice_parameters: ice_parameters(),
                    ice_candidates: vec![host_candidate()],
                    dtls_parameters: fake_dtls(),
                };
                serde_json::to_value(options).unwrap_or_default()
            }
            PRODUCE => {
                state.producers += 1;
                json!({"id": format!("producer-{}", state.producers)})
            }
            JOIN => json!({"peers": state.join_peers}),
            _ => json!({}),
        }
    }
}

/// Connects `SignalingChannel`s to a `FakeServer`
pub struct MemoryConnector {
    server: Arc<FakeServer>,
}

#[async_trait]
impl SignalingConnector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> std::result::Result<SignalingLink, SignalingError> {
        self.server.accept(endpoint)
    }
}

#[derive(Debug)]
pub struct FakeProducer {
    id: ProducerId,
    kind: MediaKind,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl FakeProducer {
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl EngineProducer for FakeProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }
    fn kind(&self) -> MediaKind {
        self.kind
    }
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }
    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct FakeConsumer {
    id: ConsumerId,
    kind: MediaKind,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl FakeConsumer {
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl EngineConsumer for FakeConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }
    fn kind(&self) -> MediaKind {
        self.kind
    }
    fn track(&self) -> RemoteTrack {
        RemoteTrack {
            id: format!("track-{}", self.id),
            kind: self.kind,
        }
    }
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }
    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeTransport {
    params: TransportParams,
    listener: Arc<dyn TransportListener>,
    connected: tokio::sync::Mutex<bool>,
    closed: AtomicBool,
    producers: Mutex<Vec<Arc<FakeProducer>>>,
    consumers: Mutex<Vec<Arc<FakeConsumer>>>,
}

impl FakeTransport {
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.params.direction
    }

    /// Run the connect handshake unless it already succeeded
    pub async fn connect(&self) -> Result<()> {
        let mut connected = self.connected.lock().await;
        if !*connected {
            self.listener.on_connect(fake_dtls()).await?;
            *connected = true;
        }
        Ok(())
    }

    /// Report an ICE/DTLS state change as the engine would
    pub fn set_connection_state(&self, state: EngineConnectionState) {
        self.listener.on_connection_state_change(state);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn producers(&self) -> Vec<Arc<FakeProducer>> {
        self.producers.lock().clone()
    }

    #[must_use]
    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.consumers.lock().clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Engine(format!("transport {} is closed", self.params.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EngineTransport for FakeTransport {
    fn id(&self) -> TransportId {
        self.params.id.clone()
    }

    async fn produce(&self, options: ProduceOptions) -> Result<Arc<dyn EngineProducer>> {
        self.ensure_open()?;
        self.connect().await?;

        let kind = options.codec.kind;
        let rtp_parameters = RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: options.codec.mime_type.clone(),
                payload_type: options.codec.preferred_payload_type.unwrap_or(96),
                clock_rate: options.codec.clock_rate,
                channels: options.codec.channels,
                parameters: options.codec.parameters.clone(),
                rtcp_feedback: options.codec.rtcp_feedback.clone(),
            }],
            header_extensions: Vec::new(),
            encodings: options.encodings,
            rtcp: RtcpParameters {
                cname: Some(options.track.id()),
                reduced_size: true,
            },
        };

        let id = self.listener.on_produce(kind, rtp_parameters).await?;
        let producer = Arc::new(FakeProducer {
            id,
            kind,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.producers.lock().push(producer.clone());
        Ok(producer)
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn EngineConsumer>> {
        self.ensure_open()?;
        self.connect().await?;

        let consumer = Arc::new(FakeConsumer {
            id: options.id,
            kind: options.kind,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().push(consumer.clone());
        Ok(consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for producer in self.producers.lock().iter() {
            producer.close();
        }
        for consumer in self.consumers.lock().iter() {
            consumer.close();
        }
    }
}

/// Media engine with local support for Opus, VP8, H264 and RTX
pub struct FakeEngine {
    capabilities: RtpCapabilities,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeEngine {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_capabilities(RtpCapabilities {
            codecs: vec![
                codec(MediaKind::Audio, "audio/opus", 111, 48000),
                codec(MediaKind::Video, "video/H264", 125, 90000),
                codec(MediaKind::Video, "video/VP8", 96, 90000),
                codec(MediaKind::Video, "video/rtx", 97, 90000),
            ],
            header_extensions: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_capabilities(capabilities: RtpCapabilities) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            transports: Mutex::new(Vec::new()),
        })
    }

    /// The most recent transport created for `direction`
    #[must_use]
    pub fn transport(&self, direction: Direction) -> Option<Arc<FakeTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|t| t.direction() == direction)
            .cloned()
    }

    #[must_use]
    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().clone()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn EngineTransport>> {
        let transport = Arc::new(FakeTransport {
            params,
            listener,
            connected: tokio::sync::Mutex::new(false),
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    stops: AtomicUsize,
}

impl FakeTrack {
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl LocalTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }
    fn kind(&self) -> MediaKind {
        self.kind
    }
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
    fn is_stopped(&self) -> bool {
        self.stop_count() > 0
    }
}

/// Capture devices handing out `FakeTrack`s
#[derive(Default)]
pub struct FakeDevices {
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
    failures: Mutex<HashMap<MediaKind, DeviceError>>,
}

impl FakeDevices {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every acquisition of `kind` fail with `error`
    pub fn fail_with(&self, kind: MediaKind, error: DeviceError) {
        self.failures.lock().insert(kind, error);
    }

    /// Every track handed out, in order
    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().clone()
    }

    /// Tracks handed out and not stopped yet
    #[must_use]
    pub fn live_tracks(&self) -> usize {
        self.tracks
            .lock()
            .iter()
            .filter(|track| !track.is_stopped())
            .count()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, kind: MediaKind) -> std::result::Result<Arc<dyn LocalTrack>, DeviceError> {
        if let Some(error) = self.failures.lock().get(&kind) {
            return Err(error.clone());
        }

        let mut tracks = self.tracks.lock();
        let track = Arc::new(FakeTrack {
            id: format!("{kind}-{}", tracks.len() + 1),
            kind,
            stops: AtomicUsize::new(0),
        });
        tracks.push(track.clone());
        Ok(track)
    }
}

/// Loopback host candidate announced for every fake transport
#[must_use]
pub fn host_candidate() -> IceCandidate {
    IceCandidate {
        foundation: "udpcandidate".to_string(),
        priority: 1_076_302_079,
        ip: "127.0.0.1".to_string(),
        protocol: "udp".to_string(),
        port: 40000,
        candidate_type: "host".to_string(),
        tcp_type: None,
    }
}

/// ICE parameters matching `host_candidate`
#[must_use]
pub fn ice_parameters() -> IceParameters {
    IceParameters {
        username_fragment: "frag".to_string(),
        password: "secret".to_string(),
        ice_lite: true,
    }
}
