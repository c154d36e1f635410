use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use uuid::Uuid;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// Purpose decides whether a published track also feeds the lobby wide live sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Main,
    Guest,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Main => "main",
            Purpose::Guest => "guest",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// One published track as the hub sees it. The local track handle stays valid until the
/// owning session removes it.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct TrackInfo {
    id: String,
    session_id: Uuid,
    purpose: Purpose,
    kind: TrackKind,
    #[derivative(Debug = "ignore")]
    track: Arc<TrackLocalStaticRTP>,
}

impl TrackInfo {
    pub fn new(
        session_id: Uuid,
        purpose: Purpose,
        kind: TrackKind,
        track: Arc<TrackLocalStaticRTP>,
    ) -> Self {
        use webrtc::track::track_local::TrackLocal;

        Self {
            id: track.id().to_string(),
            session_id,
            purpose,
            kind,
            track,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn track_local(&self) -> Arc<TrackLocalStaticRTP> {
        self.track.clone()
    }
}

/// Predicate over hub tracks, used when a subscriber asks for the current track list.
pub type TrackFilter = Box<dyn Fn(&TrackInfo) -> bool + Send + Sync>;

/// Keeps tracks that are not owned by the given session.
pub fn filter_for_session(session_id: Uuid) -> TrackFilter {
    Box::new(move |track| track.session_id() != session_id)
}

/// Keeps tracks that do not feed the lobby wide live sender.
pub fn filter_not_main() -> TrackFilter {
    Box::new(|track| track.purpose() != Purpose::Main)
}

/// Receiver for track lifecycle events discovered by an ingress endpoint. The hub of the
/// session's lobby implements this.
#[async_trait]
pub trait TrackDispatcher: Send + Sync + fmt::Debug {
    async fn dispatch_add_track(&self, track: TrackInfo);
    async fn dispatch_remove_track(&self, track: TrackInfo);
}
