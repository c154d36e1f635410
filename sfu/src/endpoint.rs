use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::LobbyConfig;
use crate::engine::EndpointRole;
use crate::error::{Error, HubErrorKind, SessionErrorKind};

/// Commands the owning session enqueues for the engine side of the connection. Sender
/// changes are egress only and make the engine schedule a renegotiation.
#[derive(Debug, Clone)]
pub enum EndpointCommand {
    AddTrack(crate::track::TrackInfo),
    RemoveTrack(crate::track::TrackInfo),
    SetAnswer(RTCSessionDescription),
}

/// One peer connection. The lobby side holds this handle, the engine holds the matching
/// [`EndpointDriver`] and applies the commands to the actual
/// [`webrtc::peer_connection::RTCPeerConnection`].
#[derive(Debug)]
pub struct Endpoint {
    role: EndpointRole,
    description_rx: Mutex<watch::Receiver<Option<RTCSessionDescription>>>,
    cached_description: Mutex<Option<RTCSessionDescription>>,
    commands: mpsc::Sender<EndpointCommand>,
    closed: CancellationToken,
    dispatch_timeout: Duration,
}

/// Engine side of an [`Endpoint`]. The engine publishes the local description once ICE
/// gathering completed, drains the command inbox and observes `closed`.
#[derive(Debug)]
pub struct EndpointDriver {
    pub description_tx: watch::Sender<Option<RTCSessionDescription>>,
    pub commands: mpsc::Receiver<EndpointCommand>,
    pub closed: CancellationToken,
}

impl Endpoint {
    pub fn new(role: EndpointRole, config: &LobbyConfig) -> (Self, EndpointDriver) {
        let (description_tx, description_rx) = watch::channel(None);
        let (command_tx, command_rx) = mpsc::channel(config.endpoint_queue_size);
        let closed = CancellationToken::new();

        let endpoint = Self {
            role,
            description_rx: Mutex::new(description_rx),
            cached_description: Mutex::new(None),
            commands: command_tx,
            closed: closed.clone(),
            dispatch_timeout: config.hub_dispatch_timeout,
        };
        let driver = EndpointDriver {
            description_tx,
            commands: command_rx,
            closed,
        };

        (endpoint, driver)
    }

    pub fn role(&self) -> EndpointRole {
        self.role
    }

    /// Waits until ICE gathering completed and returns the local description. The first
    /// successful return is cached, later calls return the cached value immediately.
    pub async fn get_local_description(
        &self,
        ctx: &CancellationToken,
    ) -> Result<RTCSessionDescription, Error> {
        {
            let cached = self.cached_description.lock().await;
            if let Some(sdp) = cached.clone() {
                return Ok(sdp);
            }
        }

        let mut rx = self.description_rx.lock().await;
        let sdp = tokio::select! {
            _ = ctx.cancelled() => {
                return Err(Error::new_session(
                    format!("{} local description wait interrupted", self.role),
                    SessionErrorKind::AlreadyClosedError,
                ))
            }
            _ = self.closed.cancelled() => {
                return Err(Error::new_session(
                    format!("{} endpoint already closed", self.role),
                    SessionErrorKind::AlreadyClosedError,
                ))
            }
            changed = rx.wait_for(|description| description.is_some()) => match changed {
                Ok(description) => description.clone(),
                Err(_) => return Err(Error::new_engine("ice gathering aborted by the engine")),
            },
        };

        match sdp {
            Some(sdp) => {
                *self.cached_description.lock().await = Some(sdp.clone());
                Ok(sdp)
            }
            None => Err(Error::new_engine("ice gathering aborted by the engine")),
        }
    }

    /// Appends a track to the egress sender set and schedules a renegotiation.
    pub async fn add_track(&self, track: crate::track::TrackInfo) -> Result<(), Error> {
        if self.role != EndpointRole::Egress {
            tracing::warn!("ignoring add_track on {} endpoint", self.role);
            return Ok(());
        }
        self.enqueue(EndpointCommand::AddTrack(track)).await
    }

    /// Removes a track from the egress sender set and schedules a renegotiation.
    pub async fn remove_track(&self, track: crate::track::TrackInfo) -> Result<(), Error> {
        if self.role != EndpointRole::Egress {
            tracing::warn!("ignoring remove_track on {} endpoint", self.role);
            return Ok(());
        }
        self.enqueue(EndpointCommand::RemoveTrack(track)).await
    }

    /// Completes a renegotiation we initiated on an egress endpoint.
    pub async fn set_answer(&self, answer: RTCSessionDescription) -> Result<(), Error> {
        self.enqueue(EndpointCommand::SetAnswer(answer)).await
    }

    async fn enqueue(&self, command: EndpointCommand) -> Result<(), Error> {
        match self
            .commands
            .send_timeout(command, self.dispatch_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(Error::new_hub(
                format!("{} endpoint inbox did not accept within deadline", self.role),
                HubErrorKind::DispatchTimeoutError,
            )),
            Err(SendTimeoutError::Closed(_)) => Err(Error::new_session(
                format!("{} endpoint already closed", self.role),
                SessionErrorKind::AlreadyClosedError,
            )),
        }
    }

    /// Closes the underlying peer connection and cancels pending gather waits. Calling this
    /// more than once has no further effect.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!("{} endpoint is closed", self.role);
            self.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
