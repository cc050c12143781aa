//! Periodic status line showing the current song.
//!
//! The status line is pulled: on every tick it reads the last song text and
//! shows the rendered line only when it changed since the previous tick.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    config::StatusConfig,
    template::{self, Value},
};

/// Where status lines are shown.
pub trait StatusSink: Send + Sync {
    fn show(&self, line: &str);
}

/// A [`StatusSink`] that writes to the log.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn show(&self, line: &str) {
        info!("{line}");
    }
}

/// Renders the status line and remembers the last one shown.
#[derive(Clone, Debug)]
pub struct StatusLine {
    format: String,
    shown: Option<String>,
}

impl StatusLine {
    #[must_use]
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            shown: None,
        }
    }

    #[must_use]
    pub fn render(&self, song: &str) -> String {
        template::render(&self.format, &[("song", Value::Text(song))])
    }

    /// Renders the line for `song`, returning it only if it differs from the
    /// last line returned.
    pub fn refresh(&mut self, song: &str) -> Option<String> {
        let line = self.render(song);
        if self.shown.as_deref() == Some(line.as_str()) {
            return None;
        }

        self.shown = Some(line.clone());
        Some(line)
    }
}

/// Shows the status line every `config.interval` until `shutdown` fires.
pub async fn run<F>(
    config: StatusConfig,
    song: F,
    sink: Arc<dyn StatusSink>,
    shutdown: CancellationToken,
) where
    F: Fn() -> String + Send,
{
    if !config.enabled {
        return;
    }

    let mut line = StatusLine::new(config.format);
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let song = song();
                if song.is_empty() {
                    continue;
                }
                if let Some(line) = line.refresh(&song) {
                    sink.show(&line);
                }
            }
        }
    }

    trace!("status line stopped");
}
