// ABOUTME: Synchronized multi-room audio streaming client library
// ABOUTME: Wire protocol, clock sync, jitter buffer, player and controller

//! Client for a synchronized multi-room audio broadcast server.
//!
//! The server pushes timestamped, encoded PCM chunks over a persistent TCP
//! session; every attached client estimates the server clock from round-trip
//! probes and renders each sample at its presentation instant, so all rooms
//! play in phase.
//!
//! Entry point is [`controller::Controller`]; the lower layers
//! ([`protocol::client::ClientConnection`], [`sync::TimeProvider`],
//! [`audio::stream::Stream`], [`player::Player`]) are public for testing and
//! for embedding in other frontends.

pub mod audio;
pub mod controller;
pub mod error;
pub mod player;
pub mod protocol;
pub mod sync;

pub use error::{Error, Result};
