//! The jukebox engine: playlist, pipe, player, and the decode control loop.
//!
//! Three rendezvous channels connect the operation surface to one
//! long-lived loop ([`Jukebox::decode_stream`]): `next` asks for a decode of
//! the item under the cursor, `cancel` aborts the in-flight decode and lets
//! it line up the following track, and `quit` terminates. Each decode
//! session runs on its own thread with its own cancellation token and
//! writes through a pipe writer bound to the pipe's reset generation; a
//! session whose generation went stale (a skip or shutdown reset the pipe
//! first) leaves the handover to whoever reset it.

use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use serde::Serialize;

use jukebox_transcode::{CancelToken, Profile, Transcoder, BYTES_PER_SEC};

use crate::pipe::{CountingPipe, PipeReader, PipeWriter, DEFAULT_CAPACITY};
use crate::player::Player;
use crate::playlist::{OutOfBounds, Playlist, PlaylistItem};

/// Point-in-time view of the engine for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub current_index: usize,
    pub playing: bool,
    pub gain: f64,
    /// Playback position within the current item, whole seconds.
    pub position_secs: u64,
}

pub struct Jukebox {
    transcoder: Arc<dyn Transcoder>,
    player: Arc<dyn Player>,
    pipe: CountingPipe,
    playlist: Arc<RwLock<Playlist>>,
    next_tx: Sender<()>,
    cancel_tx: Sender<()>,
    quit_tx: Mutex<Option<Sender<()>>>,
    quit_rx: Receiver<()>,
    loop_channels: Mutex<Option<LoopChannels>>,
}

struct LoopChannels {
    next_rx: Receiver<()>,
    cancel_rx: Receiver<()>,
    quit_rx: Receiver<()>,
}

impl Jukebox {
    /// Build an engine around `transcoder`, creating the player from
    /// `player_factory` with the read end of the PCM pipe.
    pub fn new<F>(transcoder: Arc<dyn Transcoder>, player_factory: F) -> Result<Self>
    where
        F: FnOnce(PipeReader) -> Result<Arc<dyn Player>>,
    {
        let pipe = CountingPipe::new(DEFAULT_CAPACITY);
        let player = player_factory(pipe.reader()).context("create player")?;

        let (next_tx, next_rx) = bounded(0);
        let (cancel_tx, cancel_rx) = bounded(0);
        let (quit_tx, quit_rx) = bounded::<()>(0);

        Ok(Self {
            transcoder,
            player,
            pipe,
            playlist: Arc::new(RwLock::new(Playlist::new())),
            next_tx,
            cancel_tx,
            quit_tx: Mutex::new(Some(quit_tx)),
            quit_rx: quit_rx.clone(),
            loop_channels: Mutex::new(Some(LoopChannels {
                next_rx,
                cancel_rx,
                quit_rx,
            })),
        })
    }

    /// Run the decode control loop until [`Jukebox::quit`].
    ///
    /// Call exactly once, on a dedicated thread; every other method expects
    /// this loop to be draining the control channels. A second call logs a
    /// warning and returns.
    pub fn decode_stream(&self) {
        let Some(channels) = self.loop_channels.lock().unwrap().take() else {
            tracing::warn!("decode stream is already running");
            return;
        };
        let mut current: Option<CancelToken> = None;

        loop {
            select! {
                recv(channels.next_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    if let Some(token) = current.take() {
                        token.cancel();
                    }
                    // Track-switch barrier: whatever the previous session
                    // buffered is gone before the new one starts.
                    self.pipe.reset();
                    current = Some(self.spawn_session());
                }
                recv(channels.cancel_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    if let Some(token) = &current {
                        token.cancel();
                        self.pipe.interrupt_writer();
                    }
                }
                recv(channels.quit_rx) -> _ => {
                    if let Some(token) = current.take() {
                        token.cancel();
                    }
                    self.pipe.interrupt_writer();
                    break;
                }
            }
        }
    }

    fn spawn_session(&self) -> CancelToken {
        let token = CancelToken::new();
        let session = DecodeSession {
            token: token.clone(),
            transcoder: self.transcoder.clone(),
            player: self.player.clone(),
            pipe: self.pipe.clone(),
            writer: self.pipe.writer(),
            playlist: self.playlist.clone(),
            next_tx: self.next_tx.clone(),
            quit_rx: self.quit_rx.clone(),
        };
        thread::spawn(move || session.run());
        token
    }

    /// Replace the playlist and start decoding from its first item.
    pub fn set_items(&self, items: Vec<PlaylistItem>) {
        self.playlist.write().unwrap().set(items);
        let _ = self.next_tx.send(());
    }

    pub fn append_items(&self, items: Vec<PlaylistItem>) {
        self.playlist.write().unwrap().append(items);
    }

    /// Remove the item at `index`; out of range is a silent no-op.
    pub fn remove_item(&self, index: usize) {
        self.playlist.write().unwrap().remove(index);
    }

    /// Empty the playlist and silence the player.
    pub fn clear_items(&self) {
        let mut playlist = self.playlist.write().unwrap();
        playlist.clear();
        self.player.reset();
        self.pipe.reset();
    }

    pub fn current(&self) -> Result<PlaylistItem, OutOfBounds> {
        self.playlist.read().unwrap().current().cloned()
    }

    /// Jump to `index` and restart it `offset_secs` in. Out of range is a
    /// silent no-op.
    pub fn skip(&self, index: usize, offset_secs: u64) {
        let mut playlist = self.playlist.write().unwrap();
        if !playlist.skip(index, Duration::from_secs(offset_secs)) {
            return;
        }
        self.player.play();
        // Reset before signalling: once skip returns, the reader can only
        // ever see bytes of the newly selected track.
        self.pipe.reset();
        // This send happens with the playlist write lock held; the loop's
        // next arm must never take that lock.
        let _ = self.next_tx.send(());
    }

    /// Abort the in-flight decode. The aborted session still advances the
    /// cursor and lines up the following track.
    pub fn cancel_decode(&self) {
        let _ = self.cancel_tx.send(());
    }

    pub fn pause(&self) {
        self.player.pause();
    }

    pub fn play(&self) {
        self.player.play();
    }

    pub fn set_gain(&self, gain: f64) {
        self.player.set_volume(gain);
    }

    pub fn get_gain(&self) -> f64 {
        self.player.volume()
    }

    /// Snapshot of the playlist; does not alias internal storage.
    pub fn get_items(&self) -> Vec<PlaylistItem> {
        self.playlist.read().unwrap().snapshot()
    }

    pub fn get_status(&self) -> Status {
        let playlist = self.playlist.read().unwrap();
        let mut status = Status {
            current_index: playlist.cursor(),
            playing: self.player.is_playing(),
            gain: self.player.volume(),
            position_secs: 0,
        };
        if let Ok(item) = playlist.current() {
            let played = self
                .pipe
                .count()
                .saturating_sub(self.player.unplayed_buffer_size() as u64);
            status.position_secs = played / BYTES_PER_SEC + item.seek().as_secs();
        }
        status
    }

    /// Terminate the engine: drop the playlist, stop the loop, close the
    /// player and the pipe. Not restartable; later calls are no-ops.
    pub fn quit(&self) {
        {
            let mut playlist = self.playlist.write().unwrap();
            playlist.clear();
            self.pipe.reset();
            self.player.close();
        }
        drop(self.quit_tx.lock().unwrap().take());
        self.pipe.close();
    }
}

/// One decode of the item under the cursor, bound to one cancellation
/// token and one pipe writer generation.
struct DecodeSession {
    token: CancelToken,
    transcoder: Arc<dyn Transcoder>,
    player: Arc<dyn Player>,
    pipe: CountingPipe,
    writer: PipeWriter,
    playlist: Arc<RwLock<Playlist>>,
    next_tx: Sender<()>,
    quit_rx: Receiver<()>,
}

impl DecodeSession {
    fn run(mut self) {
        let current = self.playlist.read().unwrap().current().cloned();
        let item = match current {
            Ok(item) => item,
            Err(OutOfBounds) => {
                // Ran past the end: fall back to the empty idle state.
                let mut playlist = self.playlist.write().unwrap();
                playlist.clear();
                self.player.reset();
                self.pipe.reset();
                return;
            }
        };

        let generation = self.writer.generation();
        let profile = Profile::pcm16le().with_seek(item.seek());
        if let Err(err) =
            self.transcoder
                .transcode(&self.token, &profile, item.path(), &mut self.writer)
        {
            // A corrupt file must not jam the playlist; log and move on.
            if !self.token.is_cancelled() {
                tracing::error!("decoding {:?}: {err:#}", item.path());
            }
        }

        // Let the player drain what this track buffered, then claim the
        // track-switch barrier. Losing the claim means a skip or shutdown
        // reset the pipe first and owns the handover.
        self.pipe.wait_drained(generation);
        if !self.pipe.reset_if_current(generation) {
            return;
        }
        self.playlist.write().unwrap().advance();

        // Line up the following track, unless the engine is shutting down.
        select! {
            send(self.next_tx, ()) -> _ => {}
            recv(self.quit_rx) -> _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn secs_to_bytes(secs: u64) -> usize {
        (secs * BYTES_PER_SEC) as usize
    }

    fn item(id: i64, path: &str) -> PlaylistItem {
        PlaylistItem::new(id, path)
    }

    /// Transcoder double: the file stem encodes the track length ("10s.mp3"
    /// is ten seconds) and the payload is silence at the PCM byte rate.
    struct MockTranscoder;

    impl Transcoder for MockTranscoder {
        fn transcode(
            &self,
            token: &CancelToken,
            profile: &Profile,
            path: &Path,
            out: &mut dyn Write,
        ) -> anyhow::Result<()> {
            let secs = track_secs(path);
            let seek = profile.seek().as_secs().min(secs);
            let mut remaining = (secs - seek) * BYTES_PER_SEC;
            let chunk = [0u8; 4096];
            while remaining > 0 {
                if token.is_cancelled() {
                    return Ok(());
                }
                let n = chunk.len().min(remaining as usize);
                if let Err(err) = out.write_all(&chunk[..n]) {
                    // Like the real transcoder: a vanished pipe is a normal
                    // stop even when the token has not fired yet.
                    if token.is_cancelled() || err.kind() == std::io::ErrorKind::BrokenPipe {
                        return Ok(());
                    }
                    return Err(err.into());
                }
                remaining -= n as u64;
            }
            Ok(())
        }
    }

    fn track_secs(path: &Path) -> u64 {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.strip_suffix('s'))
            .and_then(|stem| stem.parse().ok())
            .unwrap_or(0)
    }

    struct MockPlayer {
        reader: Mutex<PipeReader>,
        playing: AtomicBool,
        gain: Mutex<f64>,
    }

    impl MockPlayer {
        fn new(reader: PipeReader) -> Self {
            Self {
                reader: Mutex::new(reader),
                playing: AtomicBool::new(false),
                gain: Mutex::new(1.0),
            }
        }

        /// Drain `n` bytes from the pipe, like the audio sink playing them.
        fn read_n(&self, mut n: usize) {
            let mut reader = self.reader.lock().unwrap();
            let mut buf = [0u8; 1 << 15];
            while n > 0 {
                let want = n.min(buf.len());
                match reader.read(&mut buf[..want]) {
                    Ok(0) | Err(_) => break,
                    Ok(read) => n -= read,
                }
            }
        }
    }

    impl Player for MockPlayer {
        fn pause(&self) {
            self.playing.store(false, Ordering::Relaxed);
        }
        fn play(&self) {
            self.playing.store(true, Ordering::Relaxed);
        }
        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::Relaxed)
        }
        fn reset(&self) {
            self.playing.store(false, Ordering::Relaxed);
        }
        fn volume(&self) -> f64 {
            *self.gain.lock().unwrap()
        }
        fn set_volume(&self, gain: f64) {
            *self.gain.lock().unwrap() = gain;
        }
        fn unplayed_buffer_size(&self) -> usize {
            0
        }
        fn close(&self) {}
    }

    fn new_jukebox() -> (Arc<Jukebox>, Arc<MockPlayer>) {
        let slot: Arc<Mutex<Option<Arc<MockPlayer>>>> = Arc::default();
        let slot_in = slot.clone();
        let jukebox = Jukebox::new(Arc::new(MockTranscoder), move |reader| {
            let player = Arc::new(MockPlayer::new(reader));
            *slot_in.lock().unwrap() = Some(player.clone());
            Ok(player as Arc<dyn Player>)
        })
        .expect("create jukebox");

        let jukebox = Arc::new(jukebox);
        let runner = jukebox.clone();
        thread::spawn(move || runner.decode_stream());

        let player = slot.lock().unwrap().clone().expect("player installed");
        (jukebox, player)
    }

    fn with_timeout(limit: Duration, f: impl FnOnce() + Send + 'static) -> bool {
        let (done_tx, done_rx) = bounded(1);
        thread::spawn(move || {
            f();
            let _ = done_tx.send(());
        });
        done_rx.recv_timeout(limit).is_ok()
    }

    fn settle() {
        thread::sleep(Duration::from_millis(100));
    }

    #[track_caller]
    fn assert_status(jukebox: &Jukebox, index: usize, secs: u64, playing: bool) {
        let status = jukebox.get_status();
        assert_eq!(status.current_index, index);
        assert_eq!(status.position_secs, secs);
        assert_eq!(status.playing, playing);
        assert_eq!(status.gain, 1.0);
    }

    #[test]
    fn play_advances_through_the_playlist() {
        let (jukebox, player) = new_jukebox();

        jukebox.set_items(vec![item(0, "10s.mp3"), item(0, "10s.mp3")]);

        assert_status(&jukebox, 0, 0, false);
        jukebox.play();
        assert_status(&jukebox, 0, 0, true);
        jukebox.pause();
        assert_status(&jukebox, 0, 0, false);
        jukebox.play();
        assert_status(&jukebox, 0, 0, true);

        // The whole first track.
        player.read_n(secs_to_bytes(10));
        settle();
        assert_status(&jukebox, 1, 0, true);

        // Half the second.
        player.read_n(secs_to_bytes(5));
        assert_status(&jukebox, 1, 5, true);

        // The other half; past the end the playlist self-clears.
        player.read_n(secs_to_bytes(5));
        settle();
        assert_status(&jukebox, 0, 0, false);
        assert!(jukebox.get_items().is_empty());

        jukebox.quit();
    }

    #[test]
    fn skip_with_seek_offset() {
        let (jukebox, player) = new_jukebox();

        // Out of bounds before anything is set: prompt no-op.
        assert!(with_timeout(Duration::from_secs(1), {
            let jukebox = jukebox.clone();
            move || jukebox.skip(10, 10)
        }));
        assert_eq!(jukebox.get_status().current_index, 0);
        assert!(!jukebox.get_status().playing);

        jukebox.set_items(vec![
            item(0, "5s.mp3"),
            item(0, "5s.mp3"),
            item(0, "5s.mp3"),
        ]);
        jukebox.play();

        player.read_n(secs_to_bytes(1));
        let status = jukebox.get_status();
        assert!(status.playing);
        assert_eq!(status.position_secs, 1);

        // Restart the same track two seconds in.
        assert!(with_timeout(Duration::from_secs(1), {
            let jukebox = jukebox.clone();
            move || jukebox.skip(0, 2)
        }));
        player.read_n(secs_to_bytes(1));
        let status = jukebox.get_status();
        assert!(status.playing);
        assert_eq!(status.current_index, 0);
        assert_eq!(status.position_secs, 3);

        // Jump to the second track from the top.
        assert!(with_timeout(Duration::from_secs(1), {
            let jukebox = jukebox.clone();
            move || jukebox.skip(1, 0)
        }));
        player.read_n(secs_to_bytes(1));
        let status = jukebox.get_status();
        assert!(status.playing);
        assert_eq!(status.current_index, 1);
        assert_eq!(status.position_secs, 1);

        jukebox.quit();
    }

    #[test]
    fn quit_returns_even_mid_transcode() {
        let (jukebox, _player) = new_jukebox();

        jukebox.set_items(vec![item(0, "10s.mp3")]);
        jukebox.play();

        assert!(with_timeout(Duration::from_secs(1), {
            let jukebox = jukebox.clone();
            move || jukebox.quit()
        }));
    }

    #[test]
    fn quit_is_idempotent() {
        let (jukebox, _player) = new_jukebox();
        assert!(with_timeout(Duration::from_secs(1), {
            let jukebox = jukebox.clone();
            move || {
                jukebox.quit();
                jukebox.quit();
            }
        }));
    }

    #[test]
    fn playlist_mutation() {
        let (jukebox, _player) = new_jukebox();

        assert!(jukebox.get_items().is_empty());

        jukebox.set_items(vec![
            item(0, "5s.mp3"),
            item(1, "5s.mp3"),
            item(2, "5s.mp3"),
        ]);
        assert_eq!(jukebox.get_items().len(), 3);

        jukebox.append_items(vec![item(3, "5s.mp3")]);
        let ids: Vec<i64> = jukebox.get_items().iter().map(PlaylistItem::id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        jukebox.remove_item(1);
        let ids: Vec<i64> = jukebox.get_items().iter().map(PlaylistItem::id).collect();
        assert_eq!(ids, vec![0, 2, 3]);

        jukebox.remove_item(10);
        assert_eq!(jukebox.get_items().len(), 3);

        jukebox.quit();
    }

    #[test]
    fn gain_round_trips_exactly() {
        let (jukebox, _player) = new_jukebox();

        assert_eq!(jukebox.get_status().gain, 1.0);
        assert_eq!(jukebox.get_gain(), 1.0);

        jukebox.set_gain(0.0);
        assert_eq!(jukebox.get_status().gain, 0.0);
        assert_eq!(jukebox.get_gain(), 0.0);

        jukebox.set_gain(0.5);
        assert_eq!(jukebox.get_status().gain, 0.5);
        assert_eq!(jukebox.get_gain(), 0.5);

        jukebox.quit();
    }

    #[test]
    fn set_on_an_empty_list_self_clears() {
        let (jukebox, _player) = new_jukebox();

        jukebox.set_items(Vec::new());
        settle();

        assert!(jukebox.get_items().is_empty());
        assert_eq!(jukebox.get_status().current_index, 0);
        assert_eq!(jukebox.pipe.count(), 0);

        jukebox.quit();
    }

    #[test]
    fn clear_items_resets_cursor_pipe_and_player() {
        let (jukebox, player) = new_jukebox();

        jukebox.set_items(vec![item(0, "5s.mp3"), item(1, "5s.mp3")]);
        jukebox.play();
        player.read_n(secs_to_bytes(1));

        jukebox.clear_items();

        assert!(jukebox.get_items().is_empty());
        let status = jukebox.get_status();
        assert_eq!(status.current_index, 0);
        assert_eq!(status.position_secs, 0);
        assert!(!status.playing);
        assert_eq!(jukebox.pipe.count(), 0);

        jukebox.quit();
    }

    #[test]
    fn cancel_decode_lines_up_the_following_track() {
        let (jukebox, player) = new_jukebox();

        jukebox.set_items(vec![item(0, "10s.mp3"), item(1, "10s.mp3")]);
        jukebox.play();
        player.read_n(secs_to_bytes(1));

        jukebox.cancel_decode();
        settle();
        assert_eq!(jukebox.get_status().current_index, 1);

        player.read_n(secs_to_bytes(1));
        assert_eq!(jukebox.get_status().position_secs, 1);

        jukebox.quit();
    }

    #[test]
    fn current_is_out_of_bounds_when_nothing_is_queued() {
        let (jukebox, _player) = new_jukebox();
        assert_eq!(jukebox.current(), Err(OutOfBounds));
        jukebox.quit();
    }

    #[test]
    fn position_is_monotonic_within_a_track() {
        let (jukebox, player) = new_jukebox();

        jukebox.set_items(vec![item(0, "5s.mp3")]);
        jukebox.play();

        let mut last = 0;
        for _ in 0..4 {
            player.read_n(secs_to_bytes(1));
            let position = jukebox.get_status().position_secs;
            assert!(position >= last);
            last = position;
        }

        jukebox.quit();
    }

    #[test]
    fn decode_stream_runs_at_most_once() {
        let (jukebox, _player) = new_jukebox();
        // The helper already spawned the loop; a second call returns.
        assert!(with_timeout(Duration::from_secs(1), {
            let jukebox = jukebox.clone();
            move || jukebox.decode_stream()
        }));
        jukebox.quit();
    }
}
