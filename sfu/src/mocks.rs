//! Test doubles shared by the module tests: a scripted rtp engine, capture sinks for the
//! signaling channel, and prebuilt lobby wiring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::config::LobbyConfig;
use crate::endpoint::{Endpoint, EndpointCommand};
use crate::engine::{EndpointOptions, EndpointRole, RtpEngine};
use crate::error::Error;
use crate::hub::{Hub, LiveStreamSender};
use crate::metrics::MetricsGraph;
use crate::repository::SessionRepository;
use crate::session::{Session, SessionItem};
use crate::signal::MessageSink;
use crate::track::{Purpose, TrackDispatcher, TrackInfo, TrackKind};

/// Smallest session description the sdp parser accepts.
pub(crate) const MINIMAL_SDP: &str =
    "v=0\r\no=- 4215775240449105457 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

pub(crate) fn mocked_offer() -> RTCSessionDescription {
    RTCSessionDescription::offer(MINIMAL_SDP.to_string()).expect("offer fixture")
}

pub(crate) fn mocked_answer() -> RTCSessionDescription {
    RTCSessionDescription::answer(MINIMAL_SDP.to_string()).expect("answer fixture")
}

pub(crate) fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn track_info(session_id: Uuid, purpose: Purpose, kind: TrackKind) -> TrackInfo {
    let mime_type = match kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    let capability = RTCRtpCodecCapability {
        mime_type: mime_type.to_owned(),
        ..Default::default()
    };
    let track = Arc::new(TrackLocalStaticRTP::new(
        capability,
        Uuid::new_v4().to_string(),
        session_id.to_string(),
    ));
    TrackInfo::new(session_id, purpose, kind, track)
}

/// One endpoint the mock engine handed out: the registered callbacks plus everything the
/// lobby side enqueued on it.
#[derive(Debug)]
pub(crate) struct MockEndpointHandle {
    pub role: EndpointRole,
    pub session_id: Uuid,
    pub options: StdMutex<EndpointOptions>,
    pub received: StdMutex<Vec<EndpointCommand>>,
    pub closed: CancellationToken,
}

impl MockEndpointHandle {
    pub fn commands(&self) -> Vec<EndpointCommand> {
        self.received.lock().unwrap().clone()
    }

    pub async fn wait_for_commands(&self, count: usize) -> Vec<EndpointCommand> {
        for _ in 0..100 {
            {
                let received = self.received.lock().unwrap();
                if received.len() >= count {
                    return received.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "endpoint received {} commands, expected {}",
            self.received.lock().unwrap().len(),
            count
        );
    }

    /// Simulates the ICE failed transition of the underlying peer connection.
    pub fn fire_lost_connection(&self) {
        let options = self.options.lock().unwrap();
        if let Some(hook) = options.on_lost_connection.as_ref() {
            hook();
        }
    }

    /// Hands the current hub tracks over like an engine would while building the egress.
    pub async fn current_tracks(&self) -> Result<Vec<TrackInfo>, Error> {
        let query = {
            let options = self.options.lock().unwrap();
            options
                .get_current_tracks
                .as_ref()
                .map(|hook| hook(self.session_id))
        };
        match query {
            Some(future) => future.await,
            None => Ok(Vec::new()),
        }
    }
}

/// Engine double that answers every handshake with a canned description and records the
/// endpoints it produced.
#[derive(Debug)]
pub(crate) struct MockRtpEngine {
    answer: Option<RTCSessionDescription>,
    fail: AtomicBool,
    config: LobbyConfig,
    endpoints: StdMutex<Vec<Arc<MockEndpointHandle>>>,
}

impl MockRtpEngine {
    pub fn answering() -> Arc<Self> {
        Arc::new(Self {
            answer: Some(mocked_answer()),
            fail: AtomicBool::new(false),
            config: LobbyConfig::short(),
            endpoints: StdMutex::new(Vec::new()),
        })
    }

    /// Never resolves a local description, handshakes run into the waiting timeout.
    pub fn holding() -> Arc<Self> {
        Arc::new(Self {
            answer: None,
            fail: AtomicBool::new(false),
            config: LobbyConfig::short(),
            endpoints: StdMutex::new(Vec::new()),
        })
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn endpoints(&self) -> Vec<Arc<MockEndpointHandle>> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn last_endpoint(&self) -> Arc<MockEndpointHandle> {
        self.endpoints
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no endpoint was established")
    }
}

#[async_trait]
impl RtpEngine for MockRtpEngine {
    async fn establish_endpoint(
        &self,
        session_id: Uuid,
        _live_stream_id: Uuid,
        _offer: Option<RTCSessionDescription>,
        role: EndpointRole,
        options: EndpointOptions,
    ) -> Result<Endpoint, Error> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(Error::new_engine("mock engine failure"));
        }

        let (endpoint, mut driver) = Endpoint::new(role, &self.config);
        if let Some(answer) = &self.answer {
            let _ = driver.description_tx.send(Some(answer.clone()));
        }

        let handle = Arc::new(MockEndpointHandle {
            role,
            session_id,
            options: StdMutex::new(options),
            received: StdMutex::new(Vec::new()),
            closed: driver.closed.clone(),
        });

        {
            let handle = handle.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        command = driver.commands.recv() => match command {
                            Some(command) => handle.received.lock().unwrap().push(command),
                            None => break,
                        },
                        _ = driver.closed.cancelled() => break,
                    }
                }
            });
        }

        self.endpoints.lock().unwrap().push(handle);
        Ok(endpoint)
    }
}

/// Captures everything written to the signaling channel.
#[derive(Debug, Default)]
pub(crate) struct CaptureSink {
    sent: StdMutex<Vec<String>>,
    fail: AtomicBool,
}

impl CaptureSink {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl MessageSink for CaptureSink {
    async fn send_text(&self, text: String) -> Result<(), Error> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(Error::new_engine("capture sink failure"));
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }
}

/// Records which tracks were routed into the lobby wide live stream.
#[derive(Debug, Default)]
pub(crate) struct RecordingLiveSender {
    added: StdMutex<Vec<String>>,
    removed: StdMutex<Vec<String>>,
}

impl RecordingLiveSender {
    pub fn added(&self) -> Vec<String> {
        self.added.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl LiveStreamSender for RecordingLiveSender {
    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) {
        use webrtc::track::track_local::TrackLocal;
        self.added.lock().unwrap().push(track.id().to_string());
    }

    async fn remove_track(&self, track: Arc<TrackLocalStaticRTP>) {
        use webrtc::track::track_local::TrackLocal;
        self.removed.lock().unwrap().push(track.id().to_string());
    }
}

/// Records graph observations as flat strings, enough to assert ordering and presence.
#[derive(Debug, Default)]
pub(crate) struct CountingGraph {
    events: StdMutex<Vec<String>>,
}

impl CountingGraph {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl MetricsGraph for CountingGraph {
    fn build_node(&self, node_id: &str, _live_stream_id: &str, _kind: &str) {
        self.record(format!("build:{}", node_id));
    }

    fn update_inc(&self, node_id: &str, purpose: Purpose) {
        self.record(format!("inc:{}:{}", node_id, purpose));
    }

    fn update_dec(&self, node_id: &str, purpose: Purpose) {
        self.record(format!("dec:{}:{}", node_id, purpose));
    }

    fn add_edge(&self, node_id: &str, _live_stream_id: &str, _kind: &str) {
        self.record(format!("add_edge:{}", node_id));
    }

    fn delete_edge(&self, node_id: &str, _live_stream_id: &str, _kind: &str) {
        self.record(format!("delete_edge:{}", node_id));
    }

    fn delete_node(&self, node_id: &str) {
        self.record(format!("delete_node:{}", node_id));
    }
}

/// Hub, repository and garbage channel wired up the way a lobby does it, without the
/// sequencer in between.
pub(crate) struct LobbyFixture {
    pub live_stream_id: Uuid,
    pub ctx: CancellationToken,
    pub config: LobbyConfig,
    pub engine: Arc<MockRtpEngine>,
    pub repository: Arc<SessionRepository>,
    pub hub: Arc<Hub>,
    pub live_sender: Arc<RecordingLiveSender>,
    pub metrics: Arc<CountingGraph>,
    pub garbage_tx: mpsc::Sender<SessionItem>,
    garbage_rx: Mutex<mpsc::Receiver<SessionItem>>,
}

pub(crate) async fn lobby_fixture() -> LobbyFixture {
    lobby_fixture_with(MockRtpEngine::answering()).await
}

pub(crate) async fn lobby_fixture_with(engine: Arc<MockRtpEngine>) -> LobbyFixture {
    init_logging();
    let live_stream_id = Uuid::new_v4();
    let ctx = CancellationToken::new();
    let config = LobbyConfig::short();
    let repository = Arc::new(SessionRepository::new());
    let live_sender = Arc::new(RecordingLiveSender::default());
    let metrics = Arc::new(CountingGraph::default());
    let hub = Hub::new(
        ctx.child_token(),
        repository.clone(),
        live_stream_id,
        Some(live_sender.clone() as Arc<dyn LiveStreamSender>),
        metrics.clone() as Arc<dyn MetricsGraph>,
        &config,
    );
    let (garbage_tx, garbage_rx) = mpsc::channel(8);

    LobbyFixture {
        live_stream_id,
        ctx,
        config,
        engine,
        repository,
        hub,
        live_sender,
        metrics,
        garbage_tx,
        garbage_rx: Mutex::new(garbage_rx),
    }
}

impl LobbyFixture {
    pub fn new_session(&self, user_id: Uuid) -> Arc<Session> {
        Session::new(
            self.ctx.child_token(),
            user_id,
            self.hub.clone(),
            self.engine.clone() as Arc<dyn RtpEngine>,
            self.garbage_tx.clone(),
            self.config.clone(),
        )
    }

    /// A session that published and listens: ingress established, messenger open, egress
    /// established.
    pub async fn listening_session(&self, user_id: Uuid) -> Arc<Session> {
        let session = self.new_session(user_id);
        let ctx = CancellationToken::new();
        session
            .create_ingress(&ctx, mocked_offer())
            .await
            .expect("ingress fixture");
        session
            .signal()
            .open_messenger(Arc::new(CaptureSink::default()))
            .await;
        session
            .create_egress(&ctx, None)
            .await
            .expect("egress fixture");
        session
    }

    pub async fn recv_garbage(&self) -> Option<SessionItem> {
        let mut rx = self.garbage_rx.lock().await;
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// The hub implements the dispatcher contract, expose it like the engine sees it.
    #[allow(dead_code)]
    pub fn dispatcher(&self) -> Arc<dyn TrackDispatcher> {
        self.hub.clone()
    }
}
