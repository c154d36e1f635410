use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::LobbyConfig;
use crate::endpoint::Endpoint;
use crate::engine::{EndpointOptions, EndpointRole, RtpEngine};
use crate::error::{Error, SessionErrorKind};
use crate::hub::Hub;
use crate::signal::Signal;
use crate::track::{filter_for_session, TrackDispatcher, TrackInfo};

/// Handed to the lobby sequencer to create or remove the session of a user. The reply tells
/// whether the repository changed.
#[derive(Debug)]
pub struct SessionItem {
    pub user_id: Uuid,
    pub done: oneshot::Sender<bool>,
}

impl SessionItem {
    pub fn new(user_id: Uuid) -> (Self, oneshot::Receiver<bool>) {
        let (done, done_rx) = oneshot::channel();
        (Self { user_id, done }, done_rx)
    }
}

/// One participant of a lobby: at most one ingress and one egress peer connection plus the
/// signaling helper shared by both. All operations run on the lobby sequencer, so the state
/// here is never touched concurrently.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    ctx: CancellationToken,
    hub: Arc<Hub>,
    engine: Arc<dyn RtpEngine>,
    signal: Arc<Signal>,
    ingress: Mutex<Option<Arc<Endpoint>>>,
    egress: Mutex<Option<Arc<Endpoint>>>,
    garbage: mpsc::Sender<SessionItem>,
    config: LobbyConfig,
}

impl Session {
    pub(crate) fn new(
        ctx: CancellationToken,
        user_id: Uuid,
        hub: Arc<Hub>,
        engine: Arc<dyn RtpEngine>,
        garbage: mpsc::Sender<SessionItem>,
        config: LobbyConfig,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let signal = Signal::new(ctx.clone(), id, user_id);

        tracing::debug!("Session {} is created for user {}", id, user_id);

        Arc::new(Self {
            id,
            user_id,
            ctx,
            hub,
            engine,
            signal,
            ingress: Mutex::new(None),
            egress: Mutex::new(None),
            garbage,
            config,
        })
    }

    /// Terminates the ingress handshake: establishes the publishing peer connection and
    /// returns its answer. On any error no endpoint is stored, the caller may retry.
    pub async fn create_ingress(
        &self,
        ctx: &CancellationToken,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, Error> {
        if self.ingress.lock().await.is_some() {
            return Err(Error::new_session(
                format!("session {} already publishes", self.id),
                SessionErrorKind::IngressAlreadyExistsError,
            ));
        }

        let options = EndpointOptions {
            on_data_channel: Some(self.signal.clone().ingress_channel_hook()),
            on_lost_connection: Some(self.lost_connection_hook()),
            track_dispatcher: Some(self.hub.clone() as Arc<dyn TrackDispatcher>),
            ..Default::default()
        };

        let endpoint = self
            .engine
            .establish_endpoint(
                self.id,
                self.hub.live_stream_id,
                Some(offer),
                EndpointRole::Ingress,
                options,
            )
            .await?;
        let endpoint = Arc::new(endpoint);

        let answer = match tokio::time::timeout(
            self.config.process_waiting_timeout,
            endpoint.get_local_description(ctx),
        )
        .await
        {
            Ok(Ok(answer)) => answer,
            Ok(Err(err)) => {
                endpoint.close();
                return Err(err);
            }
            Err(_) => {
                endpoint.close();
                return Err(Error::new_session(
                    format!("session {} ingress gathering expired", self.id),
                    SessionErrorKind::ProcessWaitingTimeoutError,
                ));
            }
        };

        *self.ingress.lock().await = Some(endpoint);
        Ok(answer)
    }

    /// Establishes the subscribing peer connection. The egress is renegotiated over the data
    /// channel the ingress handshake opened, so this waits for that channel first. Without an
    /// offer the engine produces the initial offer itself and the remote answer arrives later
    /// through [`Session::set_egress_answer`].
    pub async fn create_egress(
        &self,
        ctx: &CancellationToken,
        offer: Option<RTCSessionDescription>,
    ) -> Result<RTCSessionDescription, Error> {
        if self.egress.lock().await.is_some() {
            return Err(Error::new_session(
                format!("session {} already listens", self.id),
                SessionErrorKind::EgressAlreadyExistsError,
            ));
        }

        // The egress needs the signaling channel, and that channel is opened by the remote
        // peer during the ingress handshake.
        if self.ingress.lock().await.is_none() {
            return Err(Error::new_session(
                format!("session {} has no ingress for signaling", self.id),
                SessionErrorKind::NoSignalChannelError,
            ));
        }

        tokio::select! {
            res = self.signal.wait_for_messenger_setup_finished() => res?,
            _ = self.ctx.cancelled() => {
                return Err(Error::new_session(
                    format!("session {} closed while waiting for messenger", self.id),
                    SessionErrorKind::AlreadyClosedError,
                ))
            }
            _ = tokio::time::sleep(self.config.process_waiting_timeout) => {
                return Err(Error::new_session(
                    format!("session {} messenger wait expired", self.id),
                    SessionErrorKind::ProcessWaitingTimeoutError,
                ))
            }
        }

        let hub = self.hub.clone();
        let options = EndpointOptions {
            get_current_tracks: Some(Box::new(move |session_id| {
                let hub = hub.clone();
                Box::pin(async move {
                    hub.get_track_list(session_id, vec![filter_for_session(session_id)])
                        .await
                })
            })),
            on_data_channel: Some(self.signal.clone().empty_channel_hook()),
            on_negotiation_needed: Some(self.signal.clone().negotiation_needed_hook()),
            on_lost_connection: Some(self.lost_connection_hook()),
            ..Default::default()
        };

        let endpoint = self
            .engine
            .establish_endpoint(
                self.id,
                self.hub.live_stream_id,
                offer,
                EndpointRole::Egress,
                options,
            )
            .await?;
        let endpoint = Arc::new(endpoint);

        let sdp = match tokio::time::timeout(
            self.config.process_waiting_timeout,
            endpoint.get_local_description(ctx),
        )
        .await
        {
            Ok(Ok(sdp)) => sdp,
            Ok(Err(err)) => {
                endpoint.close();
                return Err(err);
            }
            Err(_) => {
                endpoint.close();
                return Err(Error::new_session(
                    format!("session {} egress gathering expired", self.id),
                    SessionErrorKind::ProcessWaitingTimeoutError,
                ));
            }
        };

        *self.egress.lock().await = Some(endpoint.clone());
        self.signal.add_egress_endpoint(endpoint).await;
        Ok(sdp)
    }

    /// Applies the remote answer that completes a server initiated egress negotiation.
    pub async fn set_egress_answer(&self, answer: RTCSessionDescription) -> Result<(), Error> {
        let egress = self.egress.lock().await.clone();
        match egress {
            Some(endpoint) => endpoint.set_answer(answer).await,
            None => Err(Error::new_session(
                format!("session {} has no egress to answer", self.id),
                SessionErrorKind::NoSignalChannelError,
            )),
        }
    }

    /// Closes both endpoints, removes every track this session published from the hub and
    /// cancels the session context.
    pub(crate) async fn leave(&self) {
        tracing::debug!("Session {} of user {} leaves", self.id, self.user_id);
        if let Some(endpoint) = self.ingress.lock().await.take() {
            endpoint.close();
        }
        if let Some(endpoint) = self.egress.lock().await.take() {
            endpoint.close();
        }
        if let Err(err) = self.hub.remove_session_tracks(self.id).await {
            tracing::warn!(
                "Session {} could not clear its tracks from the hub: {}",
                self.id,
                err
            );
        }
        self.ctx.cancel();
    }

    /// Forwards a foreign track to the egress endpoint. Invoked by the hub during fan-out;
    /// a session without an egress simply has nothing to update.
    pub(crate) async fn add_track(&self, track: &TrackInfo) -> Result<(), Error> {
        let egress = self.egress.lock().await.clone();
        match egress {
            Some(endpoint) => endpoint.add_track(track.clone()).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn remove_track(&self, track: &TrackInfo) -> Result<(), Error> {
        let egress = self.egress.lock().await.clone();
        match egress {
            Some(endpoint) => endpoint.remove_track(track.clone()).await,
            None => Ok(()),
        }
    }

    /// Builds the ICE-failed callback. Teardown is requested through the lobby garbage
    /// channel so it runs serialized with all other lobby operations.
    pub(crate) fn lost_connection_hook(&self) -> crate::engine::OnLostConnectionFn {
        let session_id = self.id;
        let user_id = self.user_id;
        let ctx = self.ctx.clone();
        let garbage = self.garbage.clone();
        Box::new(move || {
            tracing::warn!(
                "Session {} of user {} lost its connection",
                session_id,
                user_id
            );
            let ctx = ctx.clone();
            let garbage = garbage.clone();
            tokio::spawn(async move {
                if ctx.is_cancelled() {
                    tracing::debug!("Session {} already closed, nothing to tear down", session_id);
                    return;
                }
                let (item, done) = SessionItem::new(user_id);
                tokio::select! {
                    res = garbage.send(item) => {
                        if res.is_ok() {
                            let _ = done.await;
                            tracing::debug!("Session {} teardown finished", session_id);
                        }
                    }
                    _ = ctx.cancelled() => {
                        tracing::debug!("Session {} closed while requesting teardown", session_id);
                    }
                }
            });
        })
    }

    #[cfg(test)]
    pub(crate) fn signal(&self) -> &Arc<Signal> {
        &self.signal
    }

    #[cfg(test)]
    pub(crate) async fn has_ingress(&self) -> bool {
        self.ingress.lock().await.is_some()
    }

    #[cfg(test)]
    pub(crate) async fn has_egress(&self) -> bool {
        self.egress.lock().await.is_some()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        tracing::debug!("Session {} of user {} is dropped", self.id, self.user_id);
    }
}
