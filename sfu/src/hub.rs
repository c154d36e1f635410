use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::config::LobbyConfig;
use crate::engine::EndpointRole;
use crate::error::{Error, HubErrorKind};
use crate::metrics::MetricsGraph;
use crate::repository::SessionRepository;
use crate::track::{Purpose, TrackDispatcher, TrackFilter, TrackInfo};

/// Lobby wide sink for tracks with [`Purpose::Main`], e.g. the pipeline that feeds the
/// public live stream of the lobby.
#[async_trait]
pub trait LiveStreamSender: Send + Sync + fmt::Debug {
    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>);
    async fn remove_track(&self, track: Arc<TrackLocalStaticRTP>);
}

pub(crate) enum HubRequest {
    AddTrack(TrackInfo),
    RemoveTrack(TrackInfo),
    GetTrackList {
        session_id: Uuid,
        filters: Vec<TrackFilter>,
        reply: oneshot::Sender<Vec<TrackInfo>>,
    },
    RemoveSessionTracks {
        session_id: Uuid,
        reply: oneshot::Sender<usize>,
    },
}

/// Track registry and fan-out dispatcher of one lobby. All state lives inside a single task
/// that drains the request inbox, so the track map never needs a lock. Ingress endpoints
/// push discovered tracks in, every other session's egress endpoint gets them pushed out.
#[derive(Debug)]
pub struct Hub {
    pub live_stream_id: Uuid,
    requests: mpsc::Sender<HubRequest>,
    ctx: CancellationToken,
    dispatch_timeout: Duration,
}

impl Hub {
    pub(crate) fn new(
        ctx: CancellationToken,
        sessions: Arc<SessionRepository>,
        live_stream_id: Uuid,
        sender: Option<Arc<dyn LiveStreamSender>>,
        metrics: Arc<dyn MetricsGraph>,
        config: &LobbyConfig,
    ) -> Arc<Self> {
        let (request_tx, request_rx) = mpsc::channel(config.request_queue_size);

        let state = HubState {
            live_stream_id,
            sessions,
            sender,
            metrics,
            tracks: HashMap::new(),
            metric_nodes: HashMap::new(),
        };
        {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                state.run(request_rx, ctx).await;
            });
        }

        Arc::new(Self {
            live_stream_id,
            requests: request_tx,
            ctx,
            dispatch_timeout: config.hub_dispatch_timeout,
        })
    }

    /// Snapshot of the current tracks. Filters run inside the hub task, so the list reflects
    /// every add and remove enqueued before this request and none after.
    pub async fn get_track_list(
        &self,
        session_id: Uuid,
        filters: Vec<TrackFilter>,
    ) -> Result<Vec<TrackInfo>, Error> {
        let (reply, reply_rx) = oneshot::channel();
        self.enqueue(HubRequest::GetTrackList {
            session_id,
            filters,
            reply,
        })
        .await?;
        self.await_reply(reply_rx).await
    }

    /// Drops every track the given session published and fans the removals out. Runs before
    /// session teardown completes.
    pub(crate) async fn remove_session_tracks(&self, session_id: Uuid) -> Result<usize, Error> {
        let (reply, reply_rx) = oneshot::channel();
        self.enqueue(HubRequest::RemoveSessionTracks { session_id, reply })
            .await?;
        self.await_reply(reply_rx).await
    }

    async fn enqueue(&self, request: HubRequest) -> Result<(), Error> {
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => Err(Error::new_hub(
                format!("hub {} already closed", self.live_stream_id),
                HubErrorKind::AlreadyClosedError,
            )),
            res = self.requests.send_timeout(request, self.dispatch_timeout) => match res {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => Err(Error::new_hub(
                    format!("hub {} did not accept within deadline", self.live_stream_id),
                    HubErrorKind::DispatchTimeoutError,
                )),
                Err(SendTimeoutError::Closed(_)) => Err(Error::new_hub(
                    format!("hub {} already closed", self.live_stream_id),
                    HubErrorKind::AlreadyClosedError,
                )),
            },
        }
    }

    async fn await_reply<T>(&self, reply: oneshot::Receiver<T>) -> Result<T, Error> {
        match tokio::time::timeout(self.dispatch_timeout, reply).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::new_hub(
                format!("hub {} already closed", self.live_stream_id),
                HubErrorKind::AlreadyClosedError,
            )),
            Err(_) => Err(Error::new_hub(
                format!("hub {} reply expired", self.live_stream_id),
                HubErrorKind::DispatchTimeoutError,
            )),
        }
    }
}

#[async_trait]
impl TrackDispatcher for Hub {
    async fn dispatch_add_track(&self, track: TrackInfo) {
        tracing::debug!(
            "Hub {} dispatches add track {} session={} purpose={} kind={}",
            self.live_stream_id,
            track.id(),
            track.session_id(),
            track.purpose(),
            track.kind()
        );
        if let Err(err) = self.enqueue(HubRequest::AddTrack(track)).await {
            tracing::error!("Hub {} dropped add track: {}", self.live_stream_id, err);
        }
    }

    async fn dispatch_remove_track(&self, track: TrackInfo) {
        tracing::debug!(
            "Hub {} dispatches remove track {} session={} purpose={} kind={}",
            self.live_stream_id,
            track.id(),
            track.session_id(),
            track.purpose(),
            track.kind()
        );
        if let Err(err) = self.enqueue(HubRequest::RemoveTrack(track)).await {
            tracing::error!("Hub {} dropped remove track: {}", self.live_stream_id, err);
        }
    }
}

#[derive(Default)]
struct GraphNode {
    tracks: u64,
    main_tracks: u64,
}

struct HubState {
    live_stream_id: Uuid,
    sessions: Arc<SessionRepository>,
    sender: Option<Arc<dyn LiveStreamSender>>,
    metrics: Arc<dyn MetricsGraph>,
    tracks: HashMap<String, TrackInfo>,
    metric_nodes: HashMap<String, GraphNode>,
}

impl HubState {
    async fn run(mut self, mut requests: mpsc::Receiver<HubRequest>, ctx: CancellationToken) {
        tracing::debug!("Hub {} started", self.live_stream_id);
        let stream = self.live_stream_id.to_string();
        self.metrics.build_node(&stream, &stream, "hub");

        loop {
            tokio::select! {
                Some(request) = requests.recv() => match request {
                    HubRequest::AddTrack(track) => self.on_add_track(track).await,
                    HubRequest::RemoveTrack(track) => self.on_remove_track(track).await,
                    HubRequest::GetTrackList { session_id, filters, reply } => {
                        self.on_get_track_list(session_id, filters, reply)
                    }
                    HubRequest::RemoveSessionTracks { session_id, reply } => {
                        self.on_remove_session_tracks(session_id, reply).await
                    }
                },
                _ = ctx.cancelled() => break,
            }
        }

        self.metrics.delete_node(&stream);
        tracing::debug!("Hub {} stopped", self.live_stream_id);
    }

    async fn on_add_track(&mut self, track: TrackInfo) {
        self.increase_node_stats(track.session_id(), EndpointRole::Ingress, track.purpose());
        self.metrics
            .update_inc(&self.live_stream_id.to_string(), track.purpose());

        if track.purpose() == Purpose::Main {
            if let Some(sender) = &self.sender {
                sender.add_track(track.track_local()).await;
            }
        }

        self.tracks.insert(track.id().to_string(), track.clone());

        for session in self.sessions.all() {
            if session.id == track.session_id() {
                continue;
            }
            tracing::debug!(
                "Hub {} forwards track {} to session {}",
                self.live_stream_id,
                track.id(),
                session.id
            );
            if let Err(err) = session.add_track(&track).await {
                // One slow subscriber must not stall the rest of the lobby.
                tracing::error!(
                    "Hub {} could not forward track {} to session {}: {}",
                    self.live_stream_id,
                    track.id(),
                    session.id,
                    err
                );
                continue;
            }
            self.increase_node_stats(session.id, EndpointRole::Egress, track.purpose());
        }
    }

    async fn on_remove_track(&mut self, track: TrackInfo) {
        self.metrics
            .update_dec(&self.live_stream_id.to_string(), track.purpose());
        self.decrease_node_stats(track.session_id(), EndpointRole::Ingress, track.purpose());

        if track.purpose() == Purpose::Main {
            if let Some(sender) = &self.sender {
                sender.remove_track(track.track_local()).await;
            }
        }

        self.tracks.remove(track.id());

        for session in self.sessions.all() {
            if session.id == track.session_id() {
                continue;
            }
            if let Err(err) = session.remove_track(&track).await {
                tracing::error!(
                    "Hub {} could not withdraw track {} from session {}: {}",
                    self.live_stream_id,
                    track.id(),
                    session.id,
                    err
                );
                continue;
            }
            self.decrease_node_stats(session.id, EndpointRole::Egress, track.purpose());
        }
    }

    fn on_get_track_list(
        &mut self,
        session_id: Uuid,
        filters: Vec<TrackFilter>,
        reply: oneshot::Sender<Vec<TrackInfo>>,
    ) {
        let list: Vec<TrackInfo> = self
            .tracks
            .values()
            .filter(|track| filters.iter().all(|filter| filter(track)))
            .cloned()
            .collect();
        for track in &list {
            self.increase_node_stats(session_id, EndpointRole::Egress, track.purpose());
        }
        let _ = reply.send(list);
    }

    async fn on_remove_session_tracks(&mut self, session_id: Uuid, reply: oneshot::Sender<usize>) {
        let owned: Vec<TrackInfo> = self
            .tracks
            .values()
            .filter(|track| track.session_id() == session_id)
            .cloned()
            .collect();
        for track in &owned {
            self.on_remove_track(track.clone()).await;
        }
        let _ = reply.send(owned.len());
    }

    fn increase_node_stats(&mut self, session_id: Uuid, role: EndpointRole, purpose: Purpose) {
        let node_id = session_id.to_string();
        let key = format!("{}{}", role, node_id);
        let stream = self.live_stream_id.to_string();

        if !self.metric_nodes.contains_key(&key) {
            self.metrics.build_node(&node_id, &stream, &role.to_string());
            self.metrics.add_edge(&node_id, &stream, &role.to_string());
        }
        let node = self.metric_nodes.entry(key).or_default();
        match purpose {
            Purpose::Main => node.main_tracks += 1,
            Purpose::Guest => node.tracks += 1,
        }
        self.metrics.update_inc(&node_id, purpose);
    }

    fn decrease_node_stats(&mut self, session_id: Uuid, role: EndpointRole, purpose: Purpose) {
        let node_id = session_id.to_string();
        let key = format!("{}{}", role, node_id);
        let stream = self.live_stream_id.to_string();

        if let Some(node) = self.metric_nodes.get_mut(&key) {
            match purpose {
                Purpose::Main => node.main_tracks = node.main_tracks.saturating_sub(1),
                Purpose::Guest => node.tracks = node.tracks.saturating_sub(1),
            }
            let drained = node.tracks == 0 && node.main_tracks == 0;
            self.metrics.update_dec(&node_id, purpose);
            if drained {
                self.metrics
                    .delete_edge(&node_id, &stream, &role.to_string());
                self.metric_nodes.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointCommand;
    use crate::mocks;
    use crate::track::{filter_for_session, filter_not_main, TrackKind};

    #[tokio::test]
    async fn track_list_reflects_previous_adds_and_removes() {
        let fixture = mocks::lobby_fixture().await;
        let publisher = Uuid::new_v4();
        let track = mocks::track_info(publisher, Purpose::Guest, TrackKind::Audio);

        fixture.hub.dispatch_add_track(track.clone()).await;
        let list = fixture
            .hub
            .get_track_list(Uuid::new_v4(), vec![])
            .await
            .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id(), track.id());

        fixture.hub.dispatch_remove_track(track).await;
        let list = fixture
            .hub
            .get_track_list(Uuid::new_v4(), vec![])
            .await
            .unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn track_list_excludes_the_asking_session() {
        let fixture = mocks::lobby_fixture().await;
        let asker = Uuid::new_v4();
        let own = mocks::track_info(asker, Purpose::Guest, TrackKind::Audio);
        let foreign = mocks::track_info(Uuid::new_v4(), Purpose::Guest, TrackKind::Video);

        fixture.hub.dispatch_add_track(own).await;
        fixture.hub.dispatch_add_track(foreign.clone()).await;

        let list = fixture
            .hub
            .get_track_list(asker, vec![filter_for_session(asker)])
            .await
            .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id(), foreign.id());
    }

    #[tokio::test]
    async fn track_list_can_exclude_main_tracks() {
        let fixture = mocks::lobby_fixture().await;
        let main = mocks::track_info(Uuid::new_v4(), Purpose::Main, TrackKind::Video);
        let guest = mocks::track_info(Uuid::new_v4(), Purpose::Guest, TrackKind::Video);

        fixture.hub.dispatch_add_track(main).await;
        fixture.hub.dispatch_add_track(guest.clone()).await;

        let list = fixture
            .hub
            .get_track_list(Uuid::new_v4(), vec![filter_not_main()])
            .await
            .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id(), guest.id());
    }

    #[tokio::test]
    async fn published_tracks_fan_out_to_listening_sessions() {
        let fixture = mocks::lobby_fixture().await;
        let listener = fixture.listening_session(Uuid::new_v4()).await;
        let publisher = fixture.new_session(Uuid::new_v4());
        fixture.repository.add(listener.clone());
        fixture.repository.add(publisher.clone());

        let track = mocks::track_info(publisher.id, Purpose::Guest, TrackKind::Audio);
        fixture.hub.dispatch_add_track(track.clone()).await;

        let egress = fixture.engine.last_endpoint();
        let commands = egress.wait_for_commands(1).await;
        match &commands[0] {
            EndpointCommand::AddTrack(received) => assert_eq!(received.id(), track.id()),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn publishers_do_not_subscribe_to_themselves() {
        let fixture = mocks::lobby_fixture().await;
        let listener = fixture.listening_session(Uuid::new_v4()).await;
        fixture.repository.add(listener.clone());

        // The listener publishes a track itself, nothing may be echoed back.
        let track = mocks::track_info(listener.id, Purpose::Guest, TrackKind::Audio);
        fixture.hub.dispatch_add_track(track).await;
        fixture
            .hub
            .get_track_list(Uuid::new_v4(), vec![])
            .await
            .unwrap();

        let egress = fixture.engine.last_endpoint();
        assert!(egress.commands().is_empty());
    }

    #[tokio::test]
    async fn removing_a_session_clears_its_tracks_and_subscriptions() {
        let fixture = mocks::lobby_fixture().await;
        let listener = fixture.listening_session(Uuid::new_v4()).await;
        let publisher = fixture.new_session(Uuid::new_v4());
        fixture.repository.add(listener.clone());
        fixture.repository.add(publisher.clone());

        let first = mocks::track_info(publisher.id, Purpose::Guest, TrackKind::Audio);
        let second = mocks::track_info(publisher.id, Purpose::Guest, TrackKind::Video);
        fixture.hub.dispatch_add_track(first).await;
        fixture.hub.dispatch_add_track(second).await;

        let removed = fixture
            .hub
            .remove_session_tracks(publisher.id)
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let list = fixture
            .hub
            .get_track_list(Uuid::new_v4(), vec![])
            .await
            .unwrap();
        assert!(list.is_empty());

        let egress = fixture.engine.last_endpoint();
        let commands = egress.wait_for_commands(4).await;
        let removes = commands
            .iter()
            .filter(|command| matches!(command, EndpointCommand::RemoveTrack(_)))
            .count();
        assert_eq!(removes, 2);
    }

    #[tokio::test]
    async fn main_tracks_feed_the_live_sender() {
        let fixture = mocks::lobby_fixture().await;
        let main = mocks::track_info(Uuid::new_v4(), Purpose::Main, TrackKind::Video);
        let guest = mocks::track_info(Uuid::new_v4(), Purpose::Guest, TrackKind::Audio);

        fixture.hub.dispatch_add_track(main.clone()).await;
        fixture.hub.dispatch_add_track(guest).await;
        fixture.hub.dispatch_remove_track(main.clone()).await;
        fixture
            .hub
            .get_track_list(Uuid::new_v4(), vec![])
            .await
            .unwrap();

        assert_eq!(fixture.live_sender.added(), vec![main.id().to_string()]);
        assert_eq!(fixture.live_sender.removed(), vec![main.id().to_string()]);
    }

    #[tokio::test]
    async fn metrics_graph_observes_publish_and_unpublish() {
        let fixture = mocks::lobby_fixture().await;
        let publisher = Uuid::new_v4();
        let track = mocks::track_info(publisher, Purpose::Guest, TrackKind::Audio);

        fixture.hub.dispatch_add_track(track.clone()).await;
        fixture.hub.dispatch_remove_track(track).await;
        fixture
            .hub
            .get_track_list(Uuid::new_v4(), vec![])
            .await
            .unwrap();

        let events = fixture.metrics.events();
        let node_id = publisher.to_string();
        assert!(events.contains(&format!("build:{}", fixture.live_stream_id)));
        assert!(events.contains(&format!("build:{}", node_id)));
        assert!(events.contains(&format!("inc:{}:guest", node_id)));
        assert!(events.contains(&format!("dec:{}:guest", node_id)));
        assert!(events.contains(&format!("delete_edge:{}", node_id)));
    }

    #[tokio::test]
    async fn closed_hub_rejects_requests() {
        let fixture = mocks::lobby_fixture().await;
        fixture.ctx.cancel();
        // Give the hub task a chance to observe the cancellation and drop its inbox.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let err = fixture
            .hub
            .get_track_list(Uuid::new_v4(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HubError(_)));
    }
}
