use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    LobbyError(#[from] LobbyError),
    #[error(transparent)]
    SessionError(#[from] SessionError),
    #[error(transparent)]
    HubError(#[from] HubError),
    #[error("rtp engine error: {0}")]
    RtpEngineError(Box<dyn std::error::Error + Send + Sync>),
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct LobbyError {
    pub kind: LobbyErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HubError {
    pub kind: HubErrorKind,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LobbyErrorKind {
    #[error("lobby already closed")]
    LobbyClosedError,
    #[error("lobby request timeout")]
    RequestTimeoutError,
    #[error("no session exists")]
    NoSessionError,
    #[error("session already exists")]
    SessionAlreadyExistsError,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionErrorKind {
    #[error("ingress endpoint already exists")]
    IngressAlreadyExistsError,
    #[error("egress endpoint already exists")]
    EgressAlreadyExistsError,
    #[error("no signal channel exists")]
    NoSignalChannelError,
    #[error("session already closed")]
    AlreadyClosedError,
    #[error("session process waiting timeout")]
    ProcessWaitingTimeoutError,
}

#[derive(Debug, thiserror::Error)]
pub enum HubErrorKind {
    #[error("hub already closed")]
    AlreadyClosedError,
    #[error("hub dispatch timeout")]
    DispatchTimeoutError,
}

impl Error {
    pub fn new_lobby(message: String, kind: LobbyErrorKind) -> Error {
        Error::LobbyError(LobbyError { kind, message })
    }

    pub fn new_session(message: String, kind: SessionErrorKind) -> Error {
        Error::SessionError(SessionError { kind, message })
    }

    pub fn new_hub(message: String, kind: HubErrorKind) -> Error {
        Error::HubError(HubError { kind, message })
    }

    pub fn new_engine(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Error {
        Error::RtpEngineError(err.into())
    }
}

impl fmt::Debug for LobbyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("streamhive::LobbyError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("streamhive::SessionError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("streamhive::HubError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}
