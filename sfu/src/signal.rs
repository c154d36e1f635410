use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::endpoint::Endpoint;
use crate::engine::{OnDataChannelFn, OnNegotiationNeededFn};
use crate::error::{Error, SessionErrorKind};

const KIND_OFFER: &str = "offer";
const KIND_ANSWER: &str = "answer";

/// Wire format of the signaling channel: newline delimited JSON objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SignalMessage {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
}

/// Write half of the signaling channel. A trait so tests can capture outbound messages
/// without a live data channel.
#[async_trait]
pub trait MessageSink: Send + Sync + fmt::Debug {
    async fn send_text(&self, text: String) -> Result<(), Error>;
}

/// [`MessageSink`] over the data channel the remote peer opened during the ingress
/// handshake.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ChannelMessenger {
    #[derivative(Debug = "ignore")]
    channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl MessageSink for ChannelMessenger {
    async fn send_text(&self, text: String) -> Result<(), Error> {
        self.channel.send_text(text).await?;
        Ok(())
    }
}

/// Renegotiation broker for one session. The ingress peer connection carries the data
/// channel, the egress peer connection is renegotiated over it: whenever the egress sender
/// set changes we write an offer, the remote answers on the same channel and the answer is
/// applied to the egress endpoint.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Signal {
    session_id: Uuid,
    user_id: Uuid,
    ctx: CancellationToken,
    messenger: Mutex<Option<Arc<dyn MessageSink>>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    egress: Mutex<Option<Arc<Endpoint>>>,
    #[derivative(Debug = "ignore")]
    keep_alive_channel: Mutex<Option<Arc<RTCDataChannel>>>,
}

impl Signal {
    pub(crate) fn new(ctx: CancellationToken, session_id: Uuid, user_id: Uuid) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        Arc::new(Self {
            session_id,
            user_id,
            ctx,
            messenger: Mutex::new(None),
            ready_tx,
            ready_rx,
            egress: Mutex::new(None),
            keep_alive_channel: Mutex::new(None),
        })
    }

    /// Resolves once the ingress data channel has opened and offers can be written.
    pub async fn wait_for_messenger_setup_finished(&self) -> Result<(), Error> {
        let mut ready = self.ready_rx.clone();
        let result = ready.wait_for(|ready| *ready).await;
        match result {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::new_session(
                "signal dropped while waiting for messenger".to_string(),
                SessionErrorKind::AlreadyClosedError,
            )),
        }
    }

    pub(crate) async fn add_egress_endpoint(&self, endpoint: Arc<Endpoint>) {
        *self.egress.lock().await = Some(endpoint);
    }

    /// Callback for the ingress peer connection: the remote peer opens the signaling
    /// channel there.
    pub(crate) fn ingress_channel_hook(self: Arc<Self>) -> OnDataChannelFn {
        Box::new(move |dc| self.clone().register_ingress_channel(dc))
    }

    /// Callback for the egress peer connection: the channel we open ourselves only keeps
    /// the connection alive and transports nothing we initiate.
    pub(crate) fn empty_channel_hook(self: Arc<Self>) -> OnDataChannelFn {
        Box::new(move |dc| {
            let signal = self.clone();
            tokio::spawn(async move {
                tracing::debug!(
                    "Signal for session {} holds egress channel, label={}",
                    signal.session_id,
                    dc.label()
                );
                *signal.keep_alive_channel.lock().await = Some(dc);
            });
        })
    }

    /// Callback for the egress peer connection: a changed sender set produced a fresh local
    /// description that has to reach the remote peer.
    pub(crate) fn negotiation_needed_hook(self: Arc<Self>) -> OnNegotiationNeededFn {
        Box::new(move |offer| {
            let signal = self.clone();
            tokio::spawn(async move {
                signal.send_offer(offer).await;
            });
        })
    }

    fn register_ingress_channel(self: Arc<Self>, dc: Arc<RTCDataChannel>) {
        tracing::debug!(
            "Signal for session {} received ingress channel, label={}",
            self.session_id,
            dc.label()
        );

        let signal = self.clone();
        let channel = dc.clone();
        dc.on_open(Box::new(enc!((signal, channel) move || {
            Box::pin(enc!((signal, channel) async move {
                signal
                    .open_messenger(Arc::new(ChannelMessenger { channel }))
                    .await;
            }))
        })));

        let signal = self.clone();
        dc.on_message(Box::new(enc!((signal) move |msg: DataChannelMessage| {
            Box::pin(enc!((signal) async move {
                signal.handle_message(&msg.data).await;
            }))
        })));
    }

    pub(crate) async fn open_messenger(&self, sink: Arc<dyn MessageSink>) {
        tracing::debug!(
            "Signal messenger for session {} user {} is ready",
            self.session_id,
            self.user_id
        );
        *self.messenger.lock().await = Some(sink);
        let _ = self.ready_tx.send_replace(true);
    }

    /// Writes an offer to the signaling channel. Failures are logged, losing one offer does
    /// not tear down the session.
    pub(crate) async fn send_offer(&self, offer: RTCSessionDescription) {
        let message = SignalMessage {
            kind: KIND_OFFER.to_string(),
            sdp: Some(offer.sdp),
        };
        // Holding the messenger lock serializes concurrent writers.
        let messenger = self.messenger.lock().await;
        match messenger.as_ref() {
            Some(sink) => {
                if let Err(err) = sink.send_text(Self::encode(&message)).await {
                    tracing::error!(
                        "Signal for session {} failed to write offer: {}",
                        self.session_id,
                        err
                    );
                }
            }
            None => tracing::warn!(
                "Signal for session {} has no messenger for offer",
                self.session_id
            ),
        }
    }

    /// Parses inbound channel data. Payloads can carry several newline delimited messages.
    pub(crate) async fn handle_message(&self, raw: &[u8]) {
        if self.ctx.is_cancelled() {
            tracing::debug!(
                "Signal for session {} dropped message, session closed",
                self.session_id
            );
            return;
        }

        let text = match std::str::from_utf8(raw) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(
                    "Signal for session {} received non-utf8 payload: {}",
                    self.session_id,
                    err
                );
                return;
            }
        };

        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str::<SignalMessage>(line) {
                Ok(message) => self.handle_signal_message(message).await,
                Err(err) => tracing::warn!(
                    "Signal for session {} received invalid message: {}",
                    self.session_id,
                    err
                ),
            }
        }
    }

    async fn handle_signal_message(&self, message: SignalMessage) {
        match message.kind.as_str() {
            KIND_ANSWER => {
                let Some(sdp) = message.sdp else {
                    tracing::warn!(
                        "Signal for session {} received answer without sdp",
                        self.session_id
                    );
                    return;
                };
                let answer = match RTCSessionDescription::answer(sdp) {
                    Ok(answer) => answer,
                    Err(err) => {
                        tracing::warn!(
                            "Signal for session {} received unparsable answer: {}",
                            self.session_id,
                            err
                        );
                        return;
                    }
                };
                let egress = self.egress.lock().await.clone();
                match egress {
                    Some(endpoint) => {
                        if let Err(err) = endpoint.set_answer(answer).await {
                            tracing::error!(
                                "Signal for session {} failed to apply answer: {}",
                                self.session_id,
                                err
                            );
                        }
                    }
                    None => tracing::warn!(
                        "Signal for session {} received answer without egress endpoint",
                        self.session_id
                    ),
                }
            }
            KIND_OFFER => {
                // Remote initiated renegotiation runs inside the engine, nothing to do here.
                tracing::debug!(
                    "Signal for session {} ignores inbound offer",
                    self.session_id
                );
            }
            other => tracing::warn!(
                "Signal for session {} dropped message of unknown kind {}",
                self.session_id,
                other
            ),
        }
    }

    fn encode(message: &SignalMessage) -> String {
        let mut text = serde_json::to_string(message).unwrap_or_default();
        text.push('\n');
        text
    }
}
