//! Suppression of repeated now-playing announcements.
//!
//! The service replays its current state on every handshake and may publish
//! the same track several times while it plays. [`SongChangeDetector`] keeps
//! the last announced dedup key and lets only genuine changes through.

use std::sync::Mutex;

use crate::protocol::NowPlayingEvent;

/// Outcome of offering an event to the detector.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Change {
    /// A track that has not been announced yet.
    New,
    /// The same track as the last announcement, or nothing to show.
    Duplicate,
}

/// Holds the last announced dedup key.
///
/// Reading the previous key and storing the new one happens under a single
/// lock acquisition, so two frames racing with the same key cannot both be
/// reported as [`Change::New`].
#[derive(Debug, Default)]
pub struct SongChangeDetector {
    last_announced: Mutex<Option<String>>,
}

impl SongChangeDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `event` as the latest and reports whether it is a change.
    pub fn observe(&self, event: &NowPlayingEvent) -> Change {
        let previous = {
            let mut last = self
                .last_announced
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            last.replace(event.dedup_key.clone())
        };

        if previous.as_deref() == Some(event.dedup_key.as_str())
            || event.display_text.trim().is_empty()
        {
            Change::Duplicate
        } else {
            Change::New
        }
    }

    /// Forgets the last announcement, so the current track may be announced
    /// again on the next connection.
    pub fn reset(&self) {
        self.last_announced
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }

    /// The last announced dedup key, if any.
    #[must_use]
    pub fn last_announced(&self) -> Option<String> {
        self.last_announced
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn event(key: &str, text: &str) -> NowPlayingEvent {
        NowPlayingEvent {
            dedup_key: key.to_owned(),
            display_text: text.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn first_event_is_new_and_repeats_are_suppressed() {
        let detector = SongChangeDetector::new();
        assert_eq!(detector.observe(&event("1", "A")), Change::New);
        assert_eq!(detector.observe(&event("1", "A")), Change::Duplicate);
        assert_eq!(detector.observe(&event("2", "B")), Change::New);
        assert_eq!(detector.observe(&event("1", "A")), Change::New);
        assert_eq!(detector.last_announced().as_deref(), Some("1"));
    }

    #[test]
    fn blank_text_is_never_new() {
        let detector = SongChangeDetector::new();
        assert_eq!(detector.observe(&event("1", " ")), Change::Duplicate);
    }

    #[test]
    fn reset_allows_reannouncement() {
        let detector = SongChangeDetector::new();
        assert_eq!(detector.observe(&event("1", "A")), Change::New);
        detector.reset();
        assert_eq!(detector.last_announced(), None);
        assert_eq!(detector.observe(&event("1", "A")), Change::New);
    }

    #[test]
    fn concurrent_duplicates_pass_once() {
        let detector = Arc::new(SongChangeDetector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let detector = Arc::clone(&detector);
                std::thread::spawn(move || detector.observe(&event("same", "Track")))
            })
            .collect();

        let new = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|change| *change == Change::New)
            .count();
        assert_eq!(new, 1);
    }
}
