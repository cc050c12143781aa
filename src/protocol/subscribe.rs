//! The subscribe handshake.
//!
//! Sent once as a single text frame right after every successful open:
//!
//! ```json
//! {"subs": {"station:<topic>": {"recover": true}}}
//! ```
//!
//! `recover` asks the server to replay the channel's recent state in its
//! connect reply, so a fresh connection learns the current track without
//! waiting for the next change.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};

/// Channel namespace the service publishes now-playing updates under.
pub const TOPIC_PREFIX: &str = "station";

#[derive(Serialize)]
struct SubscribeRequest {
    subs: BTreeMap<String, Subscription>,
}

#[derive(Serialize)]
struct Subscription {
    recover: bool,
}

/// Builds the subscribe frame for `topic`.
///
/// # Errors
///
/// Returns `FailedPrecondition` when `topic` is blank: such a subscription
/// would never receive anything.
pub fn subscribe_frame(topic: &str) -> Result<String> {
    let topic = topic.trim();
    if topic.is_empty() {
        return Err(Error::failed_precondition("subscription topic is blank"));
    }

    let mut subs = BTreeMap::new();
    subs.insert(format!("{TOPIC_PREFIX}:{topic}"), Subscription { recover: true });

    let frame = serde_json::to_string(&SubscribeRequest { subs })?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn frame_matches_wire_format() {
        assert_eq!(
            subscribe_frame("sanctuary_radio").unwrap(),
            r#"{"subs":{"station:sanctuary_radio":{"recover":true}}}"#
        );
    }

    #[test]
    fn blank_topic_is_rejected() {
        let err = subscribe_frame("  ").unwrap_err();
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
    }
}
