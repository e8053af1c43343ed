//! Pending-track queue
//!
//! A dedicated container rather than a general-purpose collection: players
//! only ever need FIFO advance plus a handful of mutations, and keeping the
//! surface closed keeps the ordering invariants in one place.

use std::collections::VecDeque;

use rand::seq::SliceRandom;
use tracing::debug;

use crate::model::Track;

/// Ordered sequence of pending tracks. Insertion order is significant and
/// duplicates are allowed unless explicitly removed with [`Queue::dedupe_by_uri`].
#[derive(Debug, Default)]
pub struct Queue {
    tracks: VecDeque<Track>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a track to the back of the queue
    pub fn add(&mut self, track: Track) {
        debug!(title = %track.info.title, "enqueued track");
        self.tracks.push_back(track);
    }

    /// Insert a track at the front of the queue (played next)
    pub fn add_front(&mut self, track: Track) {
        self.tracks.push_front(track);
    }

    /// Remove and return the next track to play
    pub fn pop(&mut self) -> Option<Track> {
        self.tracks.pop_front()
    }

    /// Remove the track at `index`. Out-of-range indices return `None` and
    /// leave the queue untouched.
    pub fn remove(&mut self, index: usize) -> Option<Track> {
        self.tracks.remove(index)
    }

    /// Peek at the next track without removing it
    pub fn first(&self) -> Option<&Track> {
        self.tracks.front()
    }

    /// Shuffle the queue in place
    pub fn shuffle(&mut self) {
        self.tracks.make_contiguous().shuffle(&mut rand::thread_rng());
    }

    /// Drop every pending track
    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    /// Remove later duplicates of tracks that share a uri, keeping the first
    /// occurrence. Tracks without a uri are never considered duplicates.
    pub fn dedupe_by_uri(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.tracks.retain(|track| match &track.info.uri {
            Some(uri) => seen.insert(uri.clone()),
            None => true,
        });
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }
}
