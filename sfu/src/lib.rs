#![deny(missing_debug_implementations)]
//! # Streamhive
//! Streamhive is the conferencing core of a live streaming SFU. A live stream owns a lobby,
//! every participant of the lobby owns a session, and each session publishes media through an
//! ingress peer connection while receiving everyone else's media through an egress peer
//! connection. The crate does not terminate RTP itself, it drives a pluggable
//! [`engine::RtpEngine`] and concentrates on the part that is hard to get right: serializing
//! lobby state changes, fanning published tracks out to subscribers and renegotiating egress
//! connections over a per-session data channel.

/// Timeouts and channel capacities for [`lobby::Lobby`] and [`session::Session`].
pub mod config;
/// One peer connection handle with its gathering signal and command inbox.
pub mod endpoint;
/// Capability contract for the underlying WebRTC engine.
pub mod engine;
pub mod error;
/// Per-lobby track registry and fan-out dispatcher.
pub mod hub;
/// Lobby is a module that serializes all session operations of one live stream.
pub mod lobby;
/// LobbyManager is a module that maps live stream ids to lobbies.
pub mod manager;
/// Observer sink for the lobby topology graph.
pub mod metrics;
/// Session storage owned by a lobby.
pub mod repository;
/// Session methods for one participant.
pub mod session;
/// Data channel based renegotiation helper.
pub mod signal;
/// Track related types for published media.
pub mod track;

#[cfg(test)]
pub(crate) mod mocks;
