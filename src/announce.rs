//! Delivery of announcements to the audience.
//!
//! Frames are handled on the connection task, which must not block on
//! delivery. [`AnnouncementDispatcher::dispatch`] renders the message and
//! queues it; a [`Presenter`] task takes messages off the queue in order and
//! hands each to the [`Audience`].

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    config::ConnectionConfig,
    protocol::NowPlayingEvent,
    template::{self, Value},
};

/// Whoever should see announcements.
pub trait Audience: Send + Sync {
    /// Shows `message` to everyone. Called from the presenter task only.
    fn send_to_all(&self, message: &str);
}

/// An [`Audience`] that writes announcements to the log.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogAudience;

impl Audience for LogAudience {
    fn send_to_all(&self, message: &str) {
        info!("{message}");
    }
}

/// A rendered announcement on its way to the presenter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announcement {
    pub message: String,
    pub event: NowPlayingEvent,
}

/// Renders announcements and queues them for the presenter.
#[derive(Clone, Debug)]
pub struct AnnouncementDispatcher {
    queue: mpsc::UnboundedSender<Announcement>,
}

impl AnnouncementDispatcher {
    /// Creates a dispatcher and the presenter that drains its queue.
    #[must_use]
    pub fn new() -> (Self, Presenter) {
        let (queue, pending) = mpsc::unbounded_channel();
        (Self { queue }, Presenter { pending })
    }

    /// Renders `event` with the format of `config` and queues it.
    ///
    /// Returns `false` if the presenter has gone away.
    pub fn dispatch(&self, event: &NowPlayingEvent, config: &ConnectionConfig) -> bool {
        let message = render(event, config);
        debug!("announcing {event}");

        self.queue
            .send(Announcement {
                message,
                event: event.clone(),
            })
            .is_ok()
    }
}

/// Renders the announcement for `event`.
///
/// Placeholders are `{song}`, `{artist}`, `{title}` and `{url}`.
#[must_use]
pub fn render(event: &NowPlayingEvent, config: &ConnectionConfig) -> String {
    template::render(
        &config.message_format,
        &[
            ("song", Value::Text(&event.display_text)),
            ("artist", Value::Text(&event.artist)),
            ("title", Value::Text(&event.title)),
            (
                "url",
                Value::Link {
                    label: &config.url_label,
                    url: &config.display_url,
                },
            ),
        ],
    )
}

/// Delivers queued announcements to an [`Audience`].
#[derive(Debug)]
pub struct Presenter {
    pending: mpsc::UnboundedReceiver<Announcement>,
}

impl Presenter {
    /// Delivers announcements until every dispatcher has been dropped.
    pub async fn run(mut self, audience: Arc<dyn Audience>) {
        while let Some(announcement) = self.pending.recv().await {
            trace!("presenting {}", announcement.event.dedup_key);
            audience.send_to_all(&announcement.message);
        }
        debug!("presenter stopped");
    }
}
