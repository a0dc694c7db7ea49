//! Counting byte pipe between the decode sessions and the player.
//!
//! One writer (the active decode session) and one reader (the player) share
//! a small bounded buffer; a full buffer blocks the writer, which is what
//! rate-limits transcoding to playback speed. The reader-side byte counter
//! feeds playback position. `reset` is the track-switch barrier: it
//! atomically drops buffered bytes, zeroes the counter, and invalidates
//! every writer created before the reset.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Default buffer capacity in bytes (one OS page).
pub(crate) const DEFAULT_CAPACITY: usize = 4096;

/// Control handle for the pipe; clones share the same buffer.
#[derive(Clone)]
pub(crate) struct CountingPipe {
    shared: Arc<Shared>,
}

/// Read end handed to the player factory.
pub struct PipeReader {
    shared: Arc<Shared>,
}

/// Write end handed to one decode session. Bound to the reset generation it
/// was created under; writes fail once the pipe has been reset again.
pub(crate) struct PipeWriter {
    shared: Arc<Shared>,
    generation: u64,
}

struct Shared {
    capacity: usize,
    count: AtomicU64,
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
}

struct State {
    buf: VecDeque<u8>,
    generation: u64,
    closed: bool,
    interrupted: bool,
}

impl CountingPipe {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                capacity,
                count: AtomicU64::new(0),
                state: Mutex::new(State {
                    buf: VecDeque::new(),
                    generation: 0,
                    closed: false,
                    interrupted: false,
                }),
                readable: Condvar::new(),
                writable: Condvar::new(),
            }),
        }
    }

    pub(crate) fn reader(&self) -> PipeReader {
        PipeReader {
            shared: self.shared.clone(),
        }
    }

    /// Writer bound to the current reset generation.
    pub(crate) fn writer(&self) -> PipeWriter {
        let state = self.shared.state.lock().unwrap();
        PipeWriter {
            shared: self.shared.clone(),
            generation: state.generation,
        }
    }

    /// Bytes returned from the read side since the last reset.
    pub(crate) fn count(&self) -> u64 {
        self.shared.count.load(Ordering::Relaxed)
    }

    /// Drop buffered bytes, zero the counter, and invalidate writers.
    pub(crate) fn reset(&self) {
        let mut state = self.shared.state.lock().unwrap();
        reset_locked(&self.shared, &mut state);
        drop(state);
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }

    /// Reset only if no reset has happened since `generation` was observed.
    ///
    /// A decode session's tail and a concurrent skip both want to own the
    /// track-switch barrier; exactly one of them wins this call.
    pub(crate) fn reset_if_current(&self, generation: u64) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.generation != generation {
            return false;
        }
        reset_locked(&self.shared, &mut state);
        drop(state);
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
        true
    }

    /// Fail the current writer, waking it if it is blocked on a full buffer.
    /// Cleared by the next reset.
    pub(crate) fn interrupt_writer(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.interrupted = true;
        drop(state);
        self.shared.writable.notify_all();
    }

    /// End-of-stream for the reader; all subsequent writes fail.
    pub(crate) fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }

    /// Block until the buffer is empty, or until the pipe moved on (reset to
    /// a newer generation, interrupted, or closed).
    pub(crate) fn wait_drained(&self, generation: u64) {
        let mut state = self.shared.state.lock().unwrap();
        while !state.buf.is_empty()
            && state.generation == generation
            && !state.closed
            && !state.interrupted
        {
            state = self.shared.writable.wait(state).unwrap();
        }
    }
}

fn reset_locked(shared: &Shared, state: &mut State) {
    state.buf.clear();
    state.generation += 1;
    state.interrupted = false;
    shared.count.store(0, Ordering::Relaxed);
}

impl PipeWriter {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

impl Write for PipeWriter {
    /// Every write failure is reported as `BrokenPipe`, whether the pipe
    /// was closed, interrupted, or reset since this writer was created;
    /// writers treat all three as "the pipe went away".
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
            }
            if state.interrupted {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "writer interrupted",
                ));
            }
            if state.generation != self.generation {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe reset since this writer was created",
                ));
            }
            let space = self.shared.capacity - state.buf.len();
            if space > 0 {
                let n = space.min(buf.len());
                state.buf.extend(&buf[..n]);
                drop(state);
                self.shared.readable.notify_all();
                return Ok(n);
            }
            state = self.shared.writable.wait(state).unwrap();
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PipeReader {
    /// Non-blocking read for real-time callers; returns 0 when nothing is
    /// buffered right now.
    pub fn try_read(&self, buf: &mut [u8]) -> usize {
        let mut state = self.shared.state.lock().unwrap();
        let n = take(&self.shared, &mut state, buf);
        drop(state);
        if n > 0 {
            self.shared.writable.notify_all();
        }
        n
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock().unwrap();
        loop {
            let n = take(&self.shared, &mut state, buf);
            if n > 0 {
                drop(state);
                self.shared.writable.notify_all();
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            state = self.shared.readable.wait(state).unwrap();
        }
    }
}

fn take(shared: &Shared, state: &mut State, buf: &mut [u8]) -> usize {
    let n = buf.len().min(state.buf.len());
    for (slot, byte) in buf[..n].iter_mut().zip(state.buf.drain(..n)) {
        *slot = byte;
    }
    if n > 0 {
        shared.count.fetch_add(n as u64, Ordering::Relaxed);
    }
    n
}
