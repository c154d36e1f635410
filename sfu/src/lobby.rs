use std::sync::Arc;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::LobbyConfig;
use crate::engine::RtpEngine;
use crate::error::{Error, LobbyErrorKind};
use crate::hub::{Hub, LiveStreamSender};
use crate::metrics::MetricsGraph;
use crate::repository::SessionRepository;
use crate::session::{Session, SessionItem};

/// Tells the manager to forget an empty lobby. The sequencer blocks on `done` so that no
/// concurrent create can observe the lobby between emptiness and deletion.
#[derive(Debug)]
pub(crate) struct LobbyItem {
    pub live_stream_id: Uuid,
    pub done: oneshot::Sender<()>,
}

impl LobbyItem {
    pub fn new(live_stream_id: Uuid) -> (Self, oneshot::Receiver<()>) {
        let (done, done_rx) = oneshot::channel();
        (
            Self {
                live_stream_id,
                done,
            },
            done_rx,
        )
    }
}

#[derive(Debug)]
pub(crate) struct SdpReply {
    pub session_id: Uuid,
    pub sdp: RTCSessionDescription,
}

/// A session operation plus the slot its result is delivered on. Every command is answered
/// exactly once, either with the payload or with an error.
#[derive(Debug)]
pub(crate) enum Command {
    CreateIngress {
        user_id: Uuid,
        ctx: CancellationToken,
        offer: RTCSessionDescription,
        reply: oneshot::Sender<Result<SdpReply, Error>>,
    },
    CreateEgress {
        user_id: Uuid,
        ctx: CancellationToken,
        offer: Option<RTCSessionDescription>,
        reply: oneshot::Sender<Result<SdpReply, Error>>,
    },
    CompleteEgress {
        user_id: Uuid,
        answer: RTCSessionDescription,
        reply: oneshot::Sender<Result<Uuid, Error>>,
    },
}

impl Command {
    pub fn user_id(&self) -> Uuid {
        match self {
            Command::CreateIngress { user_id, .. } => *user_id,
            Command::CreateEgress { user_id, .. } => *user_id,
            Command::CompleteEgress { user_id, .. } => *user_id,
        }
    }

    pub fn fail(self, err: Error) {
        match self {
            Command::CreateIngress { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::CreateEgress { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::CompleteEgress { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// All sessions of one live stream. A single sequencer task owns every state change, which
/// keeps the group state free of data races without locks: callers hand items or commands
/// through bounded channels and wait on the embedded reply slot.
#[derive(Debug)]
pub struct Lobby {
    pub id: Uuid,
    ctx: CancellationToken,
    hub: Arc<Hub>,
    sessions: Arc<SessionRepository>,
    session_create: mpsc::Sender<SessionItem>,
    session_garbage: mpsc::Sender<SessionItem>,
    commands: mpsc::Sender<Command>,
    config: LobbyConfig,
}

impl Lobby {
    pub(crate) fn new(
        id: Uuid,
        engine: Arc<dyn RtpEngine>,
        lobby_garbage: mpsc::Sender<LobbyItem>,
        config: LobbyConfig,
        metrics: Arc<dyn MetricsGraph>,
        live_sender: Option<Arc<dyn LiveStreamSender>>,
    ) -> Arc<Self> {
        let ctx = CancellationToken::new();
        let sessions = Arc::new(SessionRepository::new());
        let hub = Hub::new(
            ctx.child_token(),
            sessions.clone(),
            id,
            live_sender,
            metrics,
            &config,
        );

        let (create_tx, create_rx) = mpsc::channel(config.request_queue_size);
        let (garbage_tx, garbage_rx) = mpsc::channel(config.request_queue_size);
        let (command_tx, command_rx) = mpsc::channel(config.request_queue_size);

        tracing::debug!("Lobby {} is created", id);

        {
            let ctx = ctx.clone();
            let hub = hub.clone();
            let sessions = sessions.clone();
            let garbage_tx = garbage_tx.clone();
            let config = config.clone();
            tokio::spawn(async move {
                sequencer(
                    id,
                    ctx,
                    hub,
                    sessions,
                    engine,
                    create_rx,
                    garbage_rx,
                    command_rx,
                    garbage_tx,
                    lobby_garbage,
                    config,
                )
                .await;
            });
        }

        Arc::new(Self {
            id,
            ctx,
            hub,
            sessions,
            session_create: create_tx,
            session_garbage: garbage_tx,
            commands: command_tx,
            config,
        })
    }

    /// Asks the sequencer to create a session for the user. Duplicate users are rejected by
    /// the repository.
    pub(crate) async fn new_session(
        &self,
        ctx: &CancellationToken,
        user_id: Uuid,
    ) -> Result<(), Error> {
        let (item, done) = SessionItem::new(user_id);
        self.post_item(ctx, &self.session_create, item, self.config.session_create_timeout)
            .await?;

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(request_timeout()),
            res = done => match res {
                Ok(true) => Ok(()),
                Ok(false) if self.ctx.is_cancelled() => Err(lobby_closed()),
                Ok(false) => Err(Error::new_lobby(
                    format!("user {} already joined lobby {}", user_id, self.id),
                    LobbyErrorKind::SessionAlreadyExistsError,
                )),
                Err(_) => Err(lobby_closed()),
            },
        }
    }

    /// Asks the sequencer to tear down the session of the user. Returns false when the user
    /// had no session.
    pub(crate) async fn remove_session(
        &self,
        ctx: &CancellationToken,
        user_id: Uuid,
    ) -> Result<bool, Error> {
        let (item, done) = SessionItem::new(user_id);
        self.post_item(ctx, &self.session_garbage, item, self.config.session_remove_timeout)
            .await?;

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(request_timeout()),
            res = done => res.map_err(|_| lobby_closed()),
        }
    }

    /// Hands a command to the sequencer. The reply slot embedded in the command is always
    /// signalled, a command posted to a closed lobby fails with `LobbyClosed`.
    pub(crate) async fn run_command(&self, command: Command) {
        if self.ctx.is_cancelled() {
            command.fail(lobby_closed());
            return;
        }
        if let Err(err) = self.commands.send(command).await {
            err.0.fail(lobby_closed());
        }
    }

    async fn post_item(
        &self,
        ctx: &CancellationToken,
        inbox: &mpsc::Sender<SessionItem>,
        item: SessionItem,
        timeout: std::time::Duration,
    ) -> Result<(), Error> {
        if ctx.is_cancelled() {
            return Err(request_timeout());
        }
        if self.ctx.is_cancelled() {
            return Err(lobby_closed());
        }
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(request_timeout()),
            _ = self.ctx.cancelled() => Err(lobby_closed()),
            res = inbox.send_timeout(item, timeout) => match res {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => Err(request_timeout()),
                Err(SendTimeoutError::Closed(_)) => Err(lobby_closed()),
            },
        }
    }

    /// The fan-out hub of this lobby, e.g. for querying the current track list.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_cancelled()
    }

    #[cfg(test)]
    pub(crate) fn sessions(&self) -> &Arc<SessionRepository> {
        &self.sessions
    }
}

impl Drop for Lobby {
    fn drop(&mut self) {
        tracing::debug!("Lobby {} is dropped", self.id);
        self.ctx.cancel();
    }
}

fn lobby_closed() -> Error {
    Error::new_lobby(
        "lobby already closed".to_string(),
        LobbyErrorKind::LobbyClosedError,
    )
}

fn request_timeout() -> Error {
    Error::new_lobby(
        "request expired before the lobby replied".to_string(),
        LobbyErrorKind::RequestTimeoutError,
    )
}

/// Session handling runs strictly sequential per lobby to avoid data races in the group
/// state, see the concurrency notes on [`Lobby`].
#[allow(clippy::too_many_arguments)]
async fn sequencer(
    id: Uuid,
    ctx: CancellationToken,
    hub: Arc<Hub>,
    sessions: Arc<SessionRepository>,
    engine: Arc<dyn RtpEngine>,
    mut create_rx: mpsc::Receiver<SessionItem>,
    mut garbage_rx: mpsc::Receiver<SessionItem>,
    mut command_rx: mpsc::Receiver<Command>,
    garbage_tx: mpsc::Sender<SessionItem>,
    lobby_garbage: mpsc::Sender<LobbyItem>,
    config: LobbyConfig,
) {
    tracing::debug!("Lobby {} sequencer started", id);
    loop {
        tokio::select! {
            Some(item) = create_rx.recv() => {
                // The lobby could have closed while the item sat in the inbox, check again.
                if ctx.is_cancelled() {
                    let _ = item.done.send(false);
                    continue;
                }
                let session = Session::new(
                    ctx.child_token(),
                    item.user_id,
                    hub.clone(),
                    engine.clone(),
                    garbage_tx.clone(),
                    config.clone(),
                );
                let ok = sessions.add(session);
                if !ok {
                    tracing::debug!("Lobby {} rejected duplicate user {}", id, item.user_id);
                }
                let _ = item.done.send(ok);
            }
            Some(item) = garbage_rx.recv() => {
                let ok = match sessions.find_by_user(item.user_id) {
                    Some(session) => {
                        session.leave().await;
                        sessions.delete_by_user(item.user_id)
                    }
                    None => false,
                };
                let _ = item.done.send(ok);

                if sessions.is_empty() && !ctx.is_cancelled() {
                    tracing::debug!("Lobby {} is empty and destroys itself", id);
                    let (garbage_item, done) = LobbyItem::new(id);
                    if lobby_garbage.send(garbage_item).await.is_ok() {
                        // Block until the manager dropped us, otherwise a concurrent create
                        // could still find this lobby and join a dead group.
                        let _ = done.await;
                    }
                    ctx.cancel();
                }
            }
            Some(command) = command_rx.recv() => {
                // The lobby could have closed while the command sat in the inbox, check again.
                if ctx.is_cancelled() {
                    command.fail(lobby_closed());
                    continue;
                }
                match sessions.find_by_user(command.user_id()) {
                    Some(session) => execute(command, session).await,
                    None => {
                        let user_id = command.user_id();
                        command.fail(Error::new_lobby(
                            format!("no session for user {}", user_id),
                            LobbyErrorKind::NoSessionError,
                        ));
                    }
                }
            }
            _ = ctx.cancelled() => {
                tracing::debug!("Lobby {} sequencer stopped", id);
                return;
            }
        }
    }
}

async fn execute(command: Command, session: Arc<Session>) {
    match command {
        Command::CreateIngress {
            ctx, offer, reply, ..
        } => {
            let result = session.create_ingress(&ctx, offer).await.map(|sdp| SdpReply {
                session_id: session.id,
                sdp,
            });
            let _ = reply.send(result);
        }
        Command::CreateEgress {
            ctx, offer, reply, ..
        } => {
            let result = session.create_egress(&ctx, offer).await.map(|sdp| SdpReply {
                session_id: session.id,
                sdp,
            });
            let _ = reply.send(result);
        }
        Command::CompleteEgress { answer, reply, .. } => {
            let result = session.set_egress_answer(answer).await.map(|_| session.id);
            let _ = reply.send(result);
        }
    }
}
