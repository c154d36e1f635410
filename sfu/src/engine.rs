use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use futures::future::BoxFuture;
use uuid::Uuid;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::track::{TrackDispatcher, TrackInfo};

pub type OnDataChannelFn = Box<dyn Fn(Arc<RTCDataChannel>) + Send + Sync>;
pub type OnLostConnectionFn = Box<dyn Fn() + Send + Sync>;
pub type OnNegotiationNeededFn = Box<dyn Fn(RTCSessionDescription) + Send + Sync>;
pub type GetCurrentTracksFn =
    Box<dyn Fn(Uuid) -> BoxFuture<'static, Result<Vec<TrackInfo>, Error>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Ingress,
    Egress,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRole::Ingress => f.write_str("ingress"),
            EndpointRole::Egress => f.write_str("egress"),
        }
    }
}

/// Callbacks a session registers on a new endpoint. The engine invokes them from its own
/// tasks, so every callback has to be cheap and must not block.
#[derive(Derivative, Default)]
#[derivative(Debug)]
pub struct EndpointOptions {
    /// Fired when the remote peer opens a data channel on this peer connection.
    #[derivative(Debug = "ignore")]
    pub on_data_channel: Option<OnDataChannelFn>,
    /// Fired exactly once when ICE transitions to failed.
    #[derivative(Debug = "ignore")]
    pub on_lost_connection: Option<OnLostConnectionFn>,
    /// Fired with a fresh local description whenever the egress sender set changed.
    #[derivative(Debug = "ignore")]
    pub on_negotiation_needed: Option<OnNegotiationNeededFn>,
    /// Queried by an egress endpoint for the tracks it should start out with.
    #[derivative(Debug = "ignore")]
    pub get_current_tracks: Option<GetCurrentTracksFn>,
    /// Receives tracks an ingress endpoint discovers on the wire.
    pub track_dispatcher: Option<Arc<dyn TrackDispatcher>>,
}

/// Capability contract of the WebRTC stack. The engine owns codec negotiation, ICE, RTP and
/// keyframe handling and knows nothing about lobbies.
///
/// `offer` is the remote description when the remote side initiates, which is always the
/// case for ingress. An egress endpoint can also be established without an offer, the engine
/// then produces the initial offer itself and the answer arrives later over the signaling
/// channel.
#[async_trait]
pub trait RtpEngine: Send + Sync + fmt::Debug {
    async fn establish_endpoint(
        &self,
        session_id: Uuid,
        live_stream_id: Uuid,
        offer: Option<RTCSessionDescription>,
        role: EndpointRole,
        options: EndpointOptions,
    ) -> Result<Endpoint, Error>;
}
