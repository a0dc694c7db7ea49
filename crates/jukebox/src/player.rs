//! Player contract and the cpal-backed implementation.
//!
//! The engine only ever talks to [`Player`]; the real sink pulls raw PCM
//! from the pipe reader inside a CPAL output callback, while tests use an
//! in-memory double that drains the pipe at a controlled rate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Sender};

use jukebox_transcode::{CHANNELS, SAMPLE_RATE};

use crate::pipe::PipeReader;

/// Playback sink for the raw PCM stream.
///
/// All methods must be cheap and non-blocking; the engine calls them while
/// holding its playlist lock.
pub trait Player: Send + Sync {
    fn pause(&self);
    fn play(&self);
    fn is_playing(&self) -> bool;
    /// Discard bytes pulled from the pipe but not yet rendered.
    fn reset(&self);
    fn volume(&self) -> f64;
    fn set_volume(&self, volume: f64);
    /// Bytes taken from the pipe that have not reached the device yet.
    fn unplayed_buffer_size(&self) -> usize;
    /// Tear down the sink. Idempotent.
    fn close(&self);
}

/// Build the OS-audio player over the pipe reader.
///
/// This is the production player factory; it fails when no output device
/// offers the fixed 48 kHz stereo contract, which in turn fails engine
/// construction.
pub fn cpal_player(reader: PipeReader) -> Result<Arc<dyn Player>> {
    let player = CpalPlayer::new(reader)?;
    Ok(Arc::new(player))
}

struct CpalPlayer {
    shared: Arc<CallbackState>,
    close_tx: Mutex<Option<Sender<()>>>,
}

struct CallbackState {
    reader: PipeReader,
    staging: Mutex<VecDeque<u8>>,
    unplayed: AtomicUsize,
    playing: AtomicBool,
    gain_bits: AtomicU64,
}

impl CpalPlayer {
    fn new(reader: PipeReader) -> Result<Self> {
        let shared = Arc::new(CallbackState {
            reader,
            staging: Mutex::new(VecDeque::new()),
            unplayed: AtomicUsize::new(0),
            playing: AtomicBool::new(false),
            gain_bits: AtomicU64::new(1.0f64.to_bits()),
        });

        let (close_tx, close_rx) = bounded::<()>(0);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        // CPAL streams are not Send; a dedicated thread owns the stream for
        // the player's whole lifetime.
        let state = shared.clone();
        thread::spawn(move || {
            let stream = match build_stream(&state).and_then(|stream| {
                stream.play().context("start output stream")?;
                Ok(stream)
            }) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let _ = close_rx.recv();
            drop(stream);
        });

        ready_rx.recv().context("player thread exited")??;
        Ok(Self {
            shared,
            close_tx: Mutex::new(Some(close_tx)),
        })
    }
}

impl Player for CpalPlayer {
    fn pause(&self) {
        self.shared.playing.store(false, Ordering::Relaxed);
    }

    fn play(&self) {
        self.shared.playing.store(true, Ordering::Relaxed);
    }

    fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        let mut staging = self.shared.staging.lock().unwrap();
        staging.clear();
        self.shared.unplayed.store(0, Ordering::Relaxed);
    }

    fn volume(&self) -> f64 {
        f64::from_bits(self.shared.gain_bits.load(Ordering::Relaxed))
    }

    fn set_volume(&self, volume: f64) {
        self.shared.gain_bits.store(volume.to_bits(), Ordering::Relaxed);
    }

    fn unplayed_buffer_size(&self) -> usize {
        self.shared.unplayed.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.shared.playing.store(false, Ordering::Relaxed);
        if let Some(tx) = self.close_tx.lock().unwrap().take() {
            drop(tx);
        }
    }
}

fn build_stream(state: &Arc<CallbackState>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("no default output device"))?;
    let config = pick_output_config(&device)?;
    let sample_format = config.sample_format();
    let stream_config: cpal::StreamConfig = config.into();

    match sample_format {
        cpal::SampleFormat::F32 => build_stream_for::<f32>(&device, &stream_config, state),
        cpal::SampleFormat::I16 => build_stream_for::<i16>(&device, &stream_config, state),
        cpal::SampleFormat::I32 => build_stream_for::<i32>(&device, &stream_config, state),
        cpal::SampleFormat::U16 => build_stream_for::<u16>(&device, &stream_config, state),
        other => Err(anyhow!("unsupported sample format: {other:?}")),
    }
}

fn pick_output_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig> {
    let configs = device
        .supported_output_configs()
        .context("query output configs")?;
    configs
        .into_iter()
        .find(|config| {
            config.channels() as u32 == CHANNELS
                && config.min_sample_rate().0 <= SAMPLE_RATE
                && config.max_sample_rate().0 >= SAMPLE_RATE
        })
        .map(|config| config.with_sample_rate(cpal::SampleRate(SAMPLE_RATE)))
        .ok_or_else(|| anyhow!("no stereo 48 kHz output config"))
}

fn build_stream_for<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    state: &Arc<CallbackState>,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let state = state.clone();
    let err_fn = |err| tracing::warn!("stream error: {err}");
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| fill_output(data, &state),
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Refill from the pipe without blocking, decode s16le, apply gain, and
/// fill any shortfall with silence. Runs on the real-time audio thread.
fn fill_output<T>(data: &mut [T], state: &CallbackState)
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    if !state.playing.load(Ordering::Relaxed) {
        // Pause means pause: emit silence without draining the pipe.
        data.fill(<T as cpal::Sample>::from_sample::<f32>(0.0));
        return;
    }

    let gain = f64::from_bits(state.gain_bits.load(Ordering::Relaxed)) as f32;
    let needed = data.len() * 2;

    let mut staging = state.staging.lock().unwrap();
    while staging.len() < needed {
        let mut chunk = [0u8; 4096];
        let n = state.reader.try_read(&mut chunk);
        if n == 0 {
            break;
        }
        staging.extend(&chunk[..n]);
    }
    for slot in data.iter_mut() {
        *slot = <T as cpal::Sample>::from_sample::<f32>(next_sample(&mut staging, gain));
    }
    state.unplayed.store(staging.len(), Ordering::Relaxed);
}

/// Decode one little-endian i16 sample from the staging buffer and scale it;
/// a short buffer yields silence.
fn next_sample(staging: &mut VecDeque<u8>, gain: f32) -> f32 {
    if staging.len() < 2 {
        return 0.0;
    }
    let lo = staging.pop_front().unwrap();
    let hi = staging.pop_front().unwrap();
    (i16::from_le_bytes([lo, hi]) as f32 / 32_768.0) * gain
}
