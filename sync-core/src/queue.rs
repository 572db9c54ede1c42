//! Queue and track model.
//!
//! The queue owns index correctness: every mutation leaves
//! `current_index` inside `[0, len)` when the queue is non-empty and `0`
//! when it is empty. What a mutation means for playback (pause, keep
//! going) is the coordinator's call, reported through [`RemoveOutcome`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Immutable track descriptor. The coordinator only interprets `id`,
/// `source` and `duration`; `meta` is display data forwarded verbatim.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub source: String,
    /// Track length in seconds.
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub meta: Value,
}

impl Track {
    /// A descriptor the coordinator is willing to schedule.
    pub fn is_playable(&self) -> bool {
        !self.id.is_empty() && self.duration.is_finite() && self.duration > 0.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("index {0} out of range")]
    OutOfRange(usize),
}

/// What a removal did to the playing position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// A non-current entry went away; the current track is unaffected.
    Untouched,
    /// The current track itself was removed; the index now points at
    /// another track (the old next, or track 0 after removing the tail).
    CurrentRemoved,
    /// Nothing is left.
    Emptied,
}

#[derive(Debug, Clone, Default)]
pub struct Queue {
    tracks: Vec<Track>,
    current_index: usize,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(tracks: Vec<Track>, current_index: usize) -> Self {
        let mut q = Self {
            tracks,
            current_index,
        };
        q.clamp_index();
        q
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current(&self) -> Option<&Track> {
        self.tracks.get(self.current_index)
    }

    pub fn append(&mut self, track: Track) {
        self.tracks.push(track);
    }

    /// Remove the entry at `i`, shifting `current_index` so playback
    /// continuity is preserved:
    /// - removing before the current track slides the index down;
    /// - removing the current track leaves the index on what was the next
    ///   track, or rewinds to track 0 when the tail was removed;
    /// - removing after the current track changes nothing.
    pub fn remove_at(&mut self, i: usize) -> Result<RemoveOutcome, QueueError> {
        if i >= self.tracks.len() {
            return Err(QueueError::OutOfRange(i));
        }
        self.tracks.remove(i);

        if self.tracks.is_empty() {
            self.current_index = 0;
            return Ok(RemoveOutcome::Emptied);
        }

        if i < self.current_index {
            self.current_index -= 1;
            Ok(RemoveOutcome::Untouched)
        } else if i == self.current_index {
            if self.current_index >= self.tracks.len() {
                self.current_index = 0;
            }
            Ok(RemoveOutcome::CurrentRemoved)
        } else {
            Ok(RemoveOutcome::Untouched)
        }
    }

    pub fn jump_to(&mut self, i: usize) -> Result<(), QueueError> {
        if i >= self.tracks.len() {
            return Err(QueueError::OutOfRange(i));
        }
        self.current_index = i;
        Ok(())
    }

    /// Move to the next track at end-of-track. Returns false when the
    /// queue is exhausted.
    pub fn advance(&mut self) -> bool {
        if self.current_index + 1 < self.tracks.len() {
            self.current_index += 1;
            true
        } else {
            false
        }
    }

    /// Replace the queue with a client-supplied ordering.
    ///
    /// The client also sends the index it believes is current, but that is
    /// only a fallback: the new index is recomputed by locating the
    /// previously-current track id in the new ordering, so a racing
    /// reorder cannot silently switch what the room is playing.
    pub fn reorder(&mut self, tracks: Vec<Track>, client_index: usize) {
        let previous_id = self.current().map(|t| t.id.clone());
        self.tracks = tracks;

        self.current_index = previous_id
            .and_then(|id| self.tracks.iter().position(|t| t.id == id))
            .unwrap_or(client_index);
        self.clamp_index();
    }

    fn clamp_index(&mut self) {
        if self.current_index >= self.tracks.len() {
            self.current_index = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str) -> Track {
        Track {
            id: id.into(),
            source: "youtube".into(),
            duration: 180.0,
            meta: Value::Null,
        }
    }

    fn queue(ids: &[&str], current: usize) -> Queue {
        Queue::from_parts(ids.iter().map(|id| track(id)).collect(), current)
    }

    #[test]
    fn test_remove_before_current_slides_index_down() {
        let mut q = queue(&["a", "b", "c"], 2);
        assert_eq!(q.remove_at(0), Ok(RemoveOutcome::Untouched));
        assert_eq!(q.current_index(), 1);
        assert_eq!(q.current().unwrap().id, "c");
    }

    #[test]
    fn test_remove_after_current_is_untouched() {
        let mut q = queue(&["a", "b", "c"], 0);
        assert_eq!(q.remove_at(2), Ok(RemoveOutcome::Untouched));
        assert_eq!(q.current_index(), 0);
        assert_eq!(q.current().unwrap().id, "a");
    }

    #[test]
    fn test_remove_current_points_at_old_next() {
        let mut q = queue(&["a", "b", "c"], 1);
        assert_eq!(q.remove_at(1), Ok(RemoveOutcome::CurrentRemoved));
        assert_eq!(q.current_index(), 1);
        assert_eq!(q.current().unwrap().id, "c");
    }

    #[test]
    fn test_remove_current_tail_rewinds_to_first() {
        let mut q = queue(&["a", "b"], 1);
        assert_eq!(q.remove_at(1), Ok(RemoveOutcome::CurrentRemoved));
        assert_eq!(q.current_index(), 0);
        assert_eq!(q.current().unwrap().id, "a");
    }

    #[test]
    fn test_remove_last_track_empties() {
        let mut q = queue(&["a"], 0);
        assert_eq!(q.remove_at(0), Ok(RemoveOutcome::Emptied));
        assert!(q.is_empty());
        assert_eq!(q.current_index(), 0);
    }

    #[test]
    fn test_remove_out_of_range() {
        let mut q = queue(&["a"], 0);
        assert_eq!(q.remove_at(3), Err(QueueError::OutOfRange(3)));
    }

    #[test]
    fn test_append_then_remove_last_restores_queue() {
        let mut q = queue(&["a", "b"], 1);
        q.append(track("c"));
        assert_eq!(q.remove_at(2), Ok(RemoveOutcome::Untouched));
        let ids: Vec<&str> = q.tracks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_advance_stops_at_tail() {
        let mut q = queue(&["a", "b"], 0);
        assert!(q.advance());
        assert_eq!(q.current_index(), 1);
        assert!(!q.advance());
        assert_eq!(q.current_index(), 1);
    }

    #[test]
    fn test_reorder_follows_current_track_id() {
        let mut q = queue(&["a", "b", "c"], 1);
        // Client moves the current track "b" to the front but lies about
        // the index.
        q.reorder(vec![track("b"), track("a"), track("c")], 2);
        assert_eq!(q.current_index(), 0);
        assert_eq!(q.current().unwrap().id, "b");
    }

    #[test]
    fn test_reorder_falls_back_to_client_index_when_track_gone() {
        let mut q = queue(&["a", "b"], 1);
        q.reorder(vec![track("c"), track("d")], 1);
        assert_eq!(q.current_index(), 1);
        assert_eq!(q.current().unwrap().id, "d");
    }

    #[test]
    fn test_reorder_clamps_bogus_client_index() {
        let mut q = queue(&["a", "b"], 0);
        q.reorder(vec![track("x")], 9);
        assert_eq!(q.current_index(), 0);
    }

    #[test]
    fn test_unplayable_tracks_are_detected() {
        let mut t = track("a");
        t.duration = 0.0;
        assert!(!t.is_playable());
        t.duration = f64::NAN;
        assert!(!t.is_playable());
    }
}
