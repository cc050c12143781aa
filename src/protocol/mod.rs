//! Wire protocol of the now-playing broadcast service.
//!
//! The service speaks a small subset of a pub/sub protocol over a WebSocket:
//! * One outbound frame, the [`subscribe`] request sent right after the
//!   socket opens.
//! * Inbound frames in several [`envelope`] shapes that all carry the same
//!   logical "now playing" update.
//!
//! Both directions are JSON text frames.

pub mod envelope;
pub mod subscribe;

pub use envelope::normalize;
pub use subscribe::subscribe_frame;

use std::fmt;

/// Canonical now-playing update, independent of the envelope it arrived in.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct NowPlayingEvent {
    /// Identifies one play of one track. Two events with the same key
    /// describe the same announcement.
    pub dedup_key: String,

    /// Human-readable track text, never blank.
    pub display_text: String,

    /// Artist name, empty when unknown.
    pub artist: String,

    /// Track title, empty when unknown.
    pub title: String,
}

impl fmt::Display for NowPlayingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_text)
    }
}
