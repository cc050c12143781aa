//! Normalization of inbound frames into [`NowPlayingEvent`]s.
//!
//! Depending on server version and connection phase, the service wraps the
//! same now-playing fields in different envelopes:
//!
//! Handshake reply, replaying the channel's recent state:
//! ```json
//! {"connect": {"data": [{"np": {"now_playing": {"song": {...}}}}]}}
//! {"connect": {"subs": {"station:x": {"publications": [{"data": {...}}]}}}}
//! ```
//!
//! Live publications:
//! ```json
//! {"pub": {"data": {"np": {...}}}}
//! {"push": {"channel": "station:x", "pub": {"data": {"np": {...}}}}}
//! ```
//!
//! Anything else is taken to be a bare publication payload.
//!
//! Shapes overlap structurally, so they are tried in a fixed order and the
//! first one that recognizes the frame decides the outcome, even when that
//! outcome is "no event". New shapes are added by appending to [`MATCHERS`].

use serde_json::{Map, Value};

use super::NowPlayingEvent;

type Object = Map<String, Value>;

/// Result of offering a frame to a single envelope matcher.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Shape {
    /// The frame does not have this envelope's structure.
    Unmatched,
    /// The frame has this envelope's structure and yields at most one event.
    Matched(Option<NowPlayingEvent>),
}

/// A named envelope recognizer.
struct Matcher {
    name: &'static str,
    apply: fn(&Object) -> Shape,
}

/// Envelope recognizers in priority order.
const MATCHERS: &[Matcher] = &[
    Matcher {
        name: "connect",
        apply: connect_envelope,
    },
    Matcher {
        name: "pub",
        apply: pub_envelope,
    },
    Matcher {
        name: "push",
        apply: push_envelope,
    },
    Matcher {
        name: "publication",
        apply: bare_publication,
    },
];

/// Parses one complete text frame into zero or one now-playing event.
///
/// Never fails: malformed JSON, non-object frames and frames without a song
/// all yield `None`, logged at debug level at most.
#[must_use]
pub fn normalize(frame: &str) -> Option<NowPlayingEvent> {
    let frame = frame.trim();
    if frame.is_empty() || frame == "{}" {
        return None;
    }

    let root = match serde_json::from_str::<Value>(frame) {
        Ok(Value::Object(root)) => root,
        Ok(other) => {
            debug!("ignoring frame that is not an object: {other}");
            return None;
        }
        Err(e) => {
            debug!("ignoring malformed frame: {e}");
            return None;
        }
    };

    for matcher in MATCHERS {
        if let Shape::Matched(event) = (matcher.apply)(&root) {
            trace!("frame matched {} envelope", matcher.name);
            return event;
        }
    }

    None
}

/// Handshake reply. Carries replayed publications either as a `data` array
/// or per subscription under `subs.*.publications`. Yields the most recent
/// publication that holds a song.
fn connect_envelope(root: &Object) -> Shape {
    let Some(connect) = object(root, "connect") else {
        return Shape::Unmatched;
    };

    if let Some(data) = array(connect, "data") {
        let event = data
            .iter()
            .filter_map(Value::as_object)
            .filter_map(publication)
            .last();
        return Shape::Matched(event);
    }

    let Some(subs) = object(connect, "subs") else {
        return Shape::Matched(None);
    };

    let event = subs
        .values()
        .filter_map(Value::as_object)
        .filter_map(|sub| array(sub, "publications"))
        .flatten()
        .filter_map(Value::as_object)
        .filter_map(publication)
        .last();

    Shape::Matched(event)
}

fn pub_envelope(root: &Object) -> Shape {
    match object(root, "pub") {
        Some(payload) => Shape::Matched(publication(payload)),
        None => Shape::Unmatched,
    }
}

/// Newer servers nest `pub` in a `push` next to the channel name. Pushes
/// without a publication (joins, leaves) carry no song.
fn push_envelope(root: &Object) -> Shape {
    match object(root, "push") {
        Some(push) => Shape::Matched(object(push, "pub").and_then(publication)),
        None => Shape::Unmatched,
    }
}

fn bare_publication(root: &Object) -> Shape {
    Shape::Matched(publication(root))
}

/// Unwraps a publication payload down to the object holding the `song`.
///
/// Descends into optional `data` and `np` containers, then prefers a
/// `now_playing` or `current_song` child over the container itself.
fn publication(payload: &Object) -> Option<NowPlayingEvent> {
    let mut candidate = payload;
    if let Some(data) = object(candidate, "data") {
        candidate = data;
    }
    if let Some(np) = object(candidate, "np") {
        candidate = np;
    }

    let now_playing = object(candidate, "now_playing")
        .or_else(|| object(candidate, "current_song"))
        .unwrap_or(candidate);

    song(now_playing)
}

/// Extracts the event from an object with a nested `song`.
fn song(now_playing: &Object) -> Option<NowPlayingEvent> {
    let song = object(now_playing, "song")?;

    let artist = string(song, "artist").unwrap_or_default();
    let title = string(song, "title").unwrap_or_default();
    let display_text = match string(song, "text") {
        Some(text) => text,
        None => match (artist.is_empty(), title.is_empty()) {
            (false, false) => format!("{artist} - {title}"),
            (true, false) => title.clone(),
            (false, true) => artist.clone(),
            (true, true) => return None,
        },
    };

    let dedup_key = string(now_playing, "sh_id")
        .or_else(|| string(now_playing, "played_at"))
        .or_else(|| string(song, "id"))
        .unwrap_or_else(|| display_text.clone());

    Some(NowPlayingEvent {
        dedup_key,
        display_text,
        artist,
        title,
    })
}

fn object<'a>(parent: &'a Object, key: &str) -> Option<&'a Object> {
    parent.get(key).and_then(Value::as_object)
}

fn array<'a>(parent: &'a Object, key: &str) -> Option<&'a Vec<Value>> {
    parent.get(key).and_then(Value::as_array)
}

/// Reads a field as a non-blank string. Scalars other than strings are
/// stringified, since identifiers and timestamps arrive as numbers.
fn string(parent: &Object, key: &str) -> Option<String> {
    let value = match parent.get(key)? {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
