//! Single-stream audio jukebox engine.
//!
//! A long-lived playlist player: one track at a time is decoded to a fixed
//! raw PCM format and streamed through a small counting pipe into a playback
//! sink, while skip/set/clear/quit commands arrive concurrently from
//! operator threads.
//!
//! Data flow: transcoder → counting pipe → [`Player`] → audio out. Control
//! flow: operator call → [`Jukebox`] method → control channel → decode loop.

mod engine;
mod pipe;
mod player;
mod playlist;

pub use engine::{Jukebox, Status};
pub use pipe::PipeReader;
pub use player::{cpal_player, Player};
pub use playlist::{OutOfBounds, PlaylistItem};
