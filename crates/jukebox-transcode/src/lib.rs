//! Output profiles and the transcoder seam used by the jukebox engine.
//!
//! The engine plays exactly one raw PCM format and treats all codec work as
//! an external concern behind the [`Transcoder`] trait. The production
//! implementation shells out to ffmpeg ([`FfmpegTranscoder`]); tests
//! substitute in-memory fakes.

mod ffmpeg;

pub use ffmpeg::FfmpegTranscoder;

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

/// Sample rate of the raw PCM stream handed to the player, in Hz.
pub const SAMPLE_RATE: u32 = 48_000;
/// Bits per sample of the raw PCM stream.
pub const BITS_PER_SAMPLE: u32 = 16;
/// Channel count of the raw PCM stream.
pub const CHANNELS: u32 = 2;
/// PCM bit rate in bits per second.
pub const BIT_RATE: u32 = SAMPLE_RATE * BITS_PER_SAMPLE * CHANNELS;
/// PCM byte rate; the denominator for converting consumed bytes to seconds.
pub const BYTES_PER_SEC: u64 = (BIT_RATE / 8) as u64;

/// Cooperative cancellation flag shared between the engine and one decode.
///
/// The engine fires the token; the transcoder polls it between chunks and
/// treats a fired token as a normal way to stop, not as an error.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Requested output format for one transcode run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    sample_rate: u32,
    channels: u32,
    bits_per_sample: u32,
    seek: Duration,
}

impl Profile {
    /// The jukebox contract: PCM signed 16-bit little-endian, 48 kHz, stereo.
    pub fn pcm16le() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            bits_per_sample: BITS_PER_SAMPLE,
            seek: Duration::ZERO,
        }
    }

    /// Same profile, starting `seek` into the source instead of at zero.
    pub fn with_seek(mut self, seek: Duration) -> Self {
        self.seek = seek;
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn bits_per_sample(&self) -> u32 {
        self.bits_per_sample
    }

    pub fn seek(&self) -> Duration {
        self.seek
    }
}

/// Turns one source file into raw audio bytes in the requested profile.
///
/// Implementations must honor `token` promptly, write exclusively in the
/// format described by `profile`, and return `Ok` when cancelled.
pub trait Transcoder: Send + Sync {
    fn transcode(
        &self,
        token: &CancelToken,
        profile: &Profile,
        path: &Path,
        out: &mut dyn Write,
    ) -> Result<()>;
}
