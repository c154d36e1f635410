use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::LobbyConfig;
use crate::engine::RtpEngine;
use crate::error::{Error, LobbyErrorKind};
use crate::hub::LiveStreamSender;
use crate::lobby::{Command, Lobby, LobbyItem};
use crate::metrics::{MetricsGraph, NoopGraph};

/// Result of entering a lobby as a publisher.
#[derive(Debug)]
pub struct LobbyAccess {
    pub answer: RTCSessionDescription,
    pub session_id: Uuid,
    pub resource_id: Uuid,
}

/// Result of starting to listen: our offer that the remote peer has to answer over the
/// signaling channel or via [`LobbyManager::listen`].
#[derive(Debug)]
pub struct ListenOffer {
    pub offer: RTCSessionDescription,
    pub session_id: Uuid,
}

#[derive(Debug)]
pub struct ListenConfirm {
    pub session_id: Uuid,
}

/// Process wide map from live stream id to lobby. Lobbies are created on first access and
/// reap themselves through the garbage channel once their last session left.
#[derive(Debug)]
pub struct LobbyManager {
    lobbies: Arc<Mutex<HashMap<Uuid, Arc<Lobby>>>>,
    garbage: mpsc::Sender<LobbyItem>,
    engine: Arc<dyn RtpEngine>,
    config: LobbyConfig,
    metrics: Arc<dyn MetricsGraph>,
    live_sender: Option<Arc<dyn LiveStreamSender>>,
}

impl LobbyManager {
    pub fn new(engine: Arc<dyn RtpEngine>) -> Arc<Self> {
        Self::with_parts(engine, LobbyConfig::default(), Arc::new(NoopGraph), None)
    }

    pub fn with_parts(
        engine: Arc<dyn RtpEngine>,
        config: LobbyConfig,
        metrics: Arc<dyn MetricsGraph>,
        live_sender: Option<Arc<dyn LiveStreamSender>>,
    ) -> Arc<Self> {
        let lobbies: Arc<Mutex<HashMap<Uuid, Arc<Lobby>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (garbage_tx, mut garbage_rx) = mpsc::channel::<LobbyItem>(config.request_queue_size);

        {
            let lobbies = lobbies.clone();
            tokio::spawn(async move {
                while let Some(item) = garbage_rx.recv().await {
                    let removed = lobbies
                        .lock()
                        .expect("lobby map poisoned")
                        .remove(&item.live_stream_id)
                        .is_some();
                    tracing::debug!(
                        "LobbyManager reaped lobby {} removed={}",
                        item.live_stream_id,
                        removed
                    );
                    let _ = item.done.send(());
                }
            });
        }

        Arc::new(Self {
            lobbies,
            garbage: garbage_tx,
            engine,
            config,
            metrics,
            live_sender,
        })
    }

    pub fn get_or_create_lobby(&self, live_stream_id: Uuid) -> Arc<Lobby> {
        let mut lobbies = self.lobbies.lock().expect("lobby map poisoned");
        lobbies
            .entry(live_stream_id)
            .or_insert_with(|| {
                Lobby::new(
                    live_stream_id,
                    self.engine.clone(),
                    self.garbage.clone(),
                    self.config.clone(),
                    self.metrics.clone(),
                    self.live_sender.clone(),
                )
            })
            .clone()
    }

    pub fn get_lobby(&self, live_stream_id: Uuid) -> Option<Arc<Lobby>> {
        self.lobbies
            .lock()
            .expect("lobby map poisoned")
            .get(&live_stream_id)
            .cloned()
    }

    pub fn delete(&self, live_stream_id: Uuid) -> bool {
        self.lobbies
            .lock()
            .expect("lobby map poisoned")
            .remove(&live_stream_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.lobbies.lock().expect("lobby map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Joins the live stream as a publisher: creates the lobby on demand, creates a session
    /// for the user and terminates the ingress handshake.
    pub async fn access_lobby(
        &self,
        ctx: &CancellationToken,
        live_stream_id: Uuid,
        user_id: Uuid,
        offer: RTCSessionDescription,
    ) -> Result<LobbyAccess, Error> {
        if ctx.is_cancelled() {
            return Err(Self::request_timeout());
        }
        let lobby = self.get_or_create_lobby(live_stream_id);
        lobby.new_session(ctx, user_id).await?;

        let (reply, reply_rx) = oneshot::channel();
        let command = Command::CreateIngress {
            user_id,
            ctx: ctx.clone(),
            offer,
            reply,
        };
        let answered = Self::dispatch(ctx, &lobby, command, reply_rx).await?;

        Ok(LobbyAccess {
            answer: answered.sdp,
            session_id: answered.session_id,
            resource_id: Uuid::new_v4(),
        })
    }

    /// Starts listening: establishes the egress endpoint of the user's session and returns
    /// our offer.
    pub async fn start_listen(
        &self,
        ctx: &CancellationToken,
        live_stream_id: Uuid,
        user_id: Uuid,
    ) -> Result<ListenOffer, Error> {
        if ctx.is_cancelled() {
            return Err(Self::request_timeout());
        }
        let lobby = self
            .get_lobby(live_stream_id)
            .ok_or_else(Self::no_session)?;

        let (reply, reply_rx) = oneshot::channel();
        let command = Command::CreateEgress {
            user_id,
            ctx: ctx.clone(),
            offer: None,
            reply,
        };
        let answered = Self::dispatch(ctx, &lobby, command, reply_rx).await?;

        Ok(ListenOffer {
            offer: answered.sdp,
            session_id: answered.session_id,
        })
    }

    /// Completes the listen handshake with the answer of the remote peer.
    pub async fn listen(
        &self,
        ctx: &CancellationToken,
        live_stream_id: Uuid,
        user_id: Uuid,
        answer: RTCSessionDescription,
    ) -> Result<ListenConfirm, Error> {
        if ctx.is_cancelled() {
            return Err(Self::request_timeout());
        }
        let lobby = self
            .get_lobby(live_stream_id)
            .ok_or_else(Self::no_session)?;

        let (reply, reply_rx) = oneshot::channel();
        let command = Command::CompleteEgress {
            user_id,
            answer,
            reply,
        };
        let session_id = Self::dispatch(ctx, &lobby, command, reply_rx).await?;

        Ok(ListenConfirm { session_id })
    }

    /// Removes the user's session. The lobby destroys itself once its last session left.
    pub async fn leave(
        &self,
        ctx: &CancellationToken,
        live_stream_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, Error> {
        if ctx.is_cancelled() {
            return Err(Self::request_timeout());
        }
        let lobby = self
            .get_lobby(live_stream_id)
            .ok_or_else(Self::no_session)?;

        match lobby.remove_session(ctx, user_id).await? {
            true => Ok(true),
            false => Err(Self::no_session()),
        }
    }

    async fn dispatch<T>(
        ctx: &CancellationToken,
        lobby: &Arc<Lobby>,
        command: Command,
        reply: oneshot::Receiver<Result<T, Error>>,
    ) -> Result<T, Error> {
        lobby.run_command(command).await;
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Self::request_timeout()),
            res = reply => match res {
                Ok(result) => result,
                Err(_) => Err(Error::new_lobby(
                    "lobby already closed".to_string(),
                    LobbyErrorKind::LobbyClosedError,
                )),
            },
        }
    }

    fn request_timeout() -> Error {
        Error::new_lobby(
            "request expired before the lobby replied".to_string(),
            LobbyErrorKind::RequestTimeoutError,
        )
    }

    fn no_session() -> Error {
        Error::new_lobby(
            "no session exists".to_string(),
            LobbyErrorKind::NoSessionError,
        )
    }
}

impl Drop for LobbyManager {
    fn drop(&mut self) {
        tracing::debug!("LobbyManager is dropped");
    }
}
