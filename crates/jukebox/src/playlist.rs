//! Playlist state: ordered items plus the cursor of the active track.
//!
//! `Playlist` is not synchronized on its own and stays crate-private; the
//! engine keeps the only instance behind one read-write lock and serializes
//! every mutation through it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Returned by `current` when the cursor points past the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("playlist index out of bounds")]
pub struct OutOfBounds;

/// One queued track: caller-chosen id, source path, and the offset the next
/// decode of this item starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistItem {
    id: i64,
    path: PathBuf,
    seek: Duration,
}

impl PlaylistItem {
    pub fn new(id: i64, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
            seek: Duration::ZERO,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seek(&self) -> Duration {
        self.seek
    }
}

#[derive(Debug, Default)]
pub(crate) struct Playlist {
    items: Vec<PlaylistItem>,
    cursor: usize,
}

impl Playlist {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Index of the currently-playing (or next-to-play) item. May point past
    /// the end, which is the "nothing playing" state.
    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    /// Owned copy of the items; never aliases internal storage.
    pub(crate) fn snapshot(&self) -> Vec<PlaylistItem> {
        self.items.clone()
    }

    /// Replace the sequence and rewind the cursor to the start.
    pub(crate) fn set(&mut self, items: Vec<PlaylistItem>) {
        self.items = items;
        self.cursor = 0;
    }

    /// Concatenate; the cursor stays where it is.
    pub(crate) fn append(&mut self, items: Vec<PlaylistItem>) {
        self.items.extend(items);
    }

    /// Delete the item at `index`; out of range is a silent no-op. The
    /// cursor is not adjusted, so removing below it shifts which item is
    /// current.
    pub(crate) fn remove(&mut self, index: usize) {
        if self.in_bounds(index) {
            self.items.remove(index);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
        self.cursor = 0;
    }

    pub(crate) fn current(&self) -> Result<&PlaylistItem, OutOfBounds> {
        if self.in_bounds(self.cursor) {
            Ok(&self.items[self.cursor])
        } else {
            Err(OutOfBounds)
        }
    }

    pub(crate) fn advance(&mut self) {
        self.cursor += 1;
    }

    /// Move the cursor to `index` and stamp that item's seek offset.
    /// Returns false (and changes nothing) out of range.
    pub(crate) fn skip(&mut self, index: usize, seek: Duration) -> bool {
        if !self.in_bounds(index) {
            return false;
        }
        self.cursor = index;
        self.items[index].seek = seek;
        true
    }

    fn in_bounds(&self, index: usize) -> bool {
        !self.items.is_empty() && index < self.items.len()
    }
}
