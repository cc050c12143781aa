//! The now-playing service.
//!
//! [`Service`] ties the pieces together: it applies configuration, keeps one
//! connection to the broadcast service open while enabled, turns inbound
//! frames into announcements and reconnects after the connection is lost.
//!
//! Every entry point returns promptly and may be called from any thread.
//! Configuration is held as an immutable snapshot that is swapped wholesale;
//! readers clone the [`Arc`] and never see a partial update.

use std::{
    sync::{Arc, PoisonError, RwLock, Weak},
    time::Instant,
};

use tokio::runtime::Handle;

use crate::{
    announce::AnnouncementDispatcher,
    config::{self, keys, ConnectionConfig},
    connection::{ConnectionManager, ConnectionState, Listener},
    dedup::{Change, SongChangeDetector},
    error::{Error, Result},
    metrics::{self, MetricsSink},
    protocol,
    reconnect::ReconnectScheduler,
    store::ConfigStore,
    transport::Transport,
};

/// Outcome of applying a configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Applied {
    /// The endpoint URL after rewriting a legacy form, if it was rewritten.
    /// The caller should persist it.
    pub migrated_endpoint: Option<String>,
}

/// Handle to the service. Cheap to clone.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

struct Inner {
    /// Weak self-reference for the connection and reconnect tasks.
    me: Weak<Inner>,
    config: RwLock<Arc<ConnectionConfig>>,
    connection: Arc<ConnectionManager>,
    reconnect: ReconnectScheduler,
    detector: SongChangeDetector,
    dispatcher: AnnouncementDispatcher,
    metrics: Arc<dyn MetricsSink>,
    last_song_text: RwLock<String>,
}

impl Service {
    /// Creates a stopped service. Nothing connects until [`start`] or a
    /// reload with an enabled configuration.
    ///
    /// [`start`]: Self::start
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        dispatcher: AnnouncementDispatcher,
        metrics: Arc<dyn MetricsSink>,
        runtime: Handle,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            config: RwLock::new(Arc::new(ConnectionConfig::default())),
            connection: Arc::new(ConnectionManager::new(transport, runtime.clone())),
            reconnect: ReconnectScheduler::new(runtime),
            detector: SongChangeDetector::new(),
            dispatcher,
            metrics,
            last_song_text: RwLock::new(String::new()),
        });

        Self { inner }
    }

    /// Applies `config` and connects if it is enabled.
    pub fn start(&self, config: ConnectionConfig) -> Applied {
        info!("starting now-playing service");
        self.inner.apply(config)
    }

    /// Closes the connection, cancels any pending reconnect and disables the
    /// service. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Replaces the configuration and reconnects with it.
    ///
    /// The current connection is closed and the last announced song is
    /// forgotten, so the song playing after the reload is announced again.
    /// An enabled configuration without an endpoint or topic is applied as
    /// disabled.
    pub fn reload(&self, config: ConnectionConfig) -> Applied {
        self.inner.apply(config)
    }

    /// Reads the configuration from `store`, applies it and writes back
    /// derived or migrated values.
    ///
    /// Failing to write back is logged and does not fail the reload.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or parsed. The running
    /// configuration is left untouched in that case.
    pub fn reload_from(&self, store: &ConfigStore) -> Result<()> {
        let settings = store.settings()?;
        let resolved = config::resolve(&settings.radio);
        let mut updates = resolved.updates;

        let applied = self.inner.apply(resolved.config);
        if let Some(endpoint) = applied.migrated_endpoint {
            updates.push((keys::WEBSOCKET_URL, toml::Value::String(endpoint)));
        }

        if let Err(e) = store.update(keys::SECTION, &updates) {
            warn!("could not save configuration: {e}");
        }
        Ok(())
    }

    /// Turns delivery of announcements on or off without reconnecting.
    ///
    /// Song changes are still tracked while announcements are off.
    pub fn set_announcements_enabled(&self, enabled: bool) {
        self.inner.update_config(|config| config.announcements_enabled = enabled);
        info!(
            "announcements {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// Text of the most recent song change, empty before the first one.
    #[must_use]
    pub fn last_song_text(&self) -> String {
        self.inner
            .last_song_text
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<ConnectionConfig> {
        self.inner.config()
    }
}

impl Inner {
    fn config(&self) -> Arc<ConnectionConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_config(&self, config: ConnectionConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
    }

    /// Replaces the snapshot with a modified copy of the current one.
    fn update_config(&self, change: impl FnOnce(&mut ConnectionConfig)) {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = ConnectionConfig::clone(&config);
        change(&mut updated);
        *config = Arc::new(updated);
    }

    fn apply(&self, mut config: ConnectionConfig) -> Applied {
        let mut applied = Applied::default();
        if let Some(endpoint) = config::migrate_legacy_url(&config.endpoint_url) {
            info!("updating legacy websocket URL to {endpoint}");
            config.endpoint_url.clone_from(&endpoint);
            applied.migrated_endpoint = Some(endpoint);
        }

        let previous = self.config();
        let changed = previous.changed_fields(&config);
        if !changed.is_empty() {
            debug!("configuration changed: {}", changed.join(", "));
        }

        self.connection.close();
        self.reconnect.cancel_pending();
        self.detector.reset();

        if config.enabled {
            if let Err(e) = config.validate() {
                warn!("{e}; now-playing updates are disabled");
                config.enabled = false;
            }
        }

        let enabled = config.enabled;
        self.set_config(config);

        if enabled {
            self.connect();
        } else {
            debug!("now-playing updates are disabled");
        }

        applied
    }

    fn connect(&self) {
        let config = self.config();
        if !config.enabled {
            return;
        }

        let url = match config.validate() {
            Ok(url) => url,
            Err(e) => {
                warn!("not connecting: {e}");
                return;
            }
        };
        let handshake = match protocol::subscribe_frame(&config.subscription_topic) {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("not connecting: {e}");
                return;
            }
        };

        self.reconnect.cancel_pending();

        let listener: Weak<dyn Listener> = self.me.clone();
        if self.connection.connect(&url, handshake, listener) {
            debug!("subscribing to {}", config.subscription_topic);
        }
    }

    fn stop(&self) {
        self.connection.begin_shutdown();
        self.update_config(|config| config.enabled = false);
        self.reconnect.cancel_pending();
        let was_connected = self.connection.close();
        self.detector.reset();
        self.connection.finish_shutdown();

        if was_connected {
            info!("now-playing service stopped");
        }
    }

    fn handle_frame(&self, frame: &str) {
        let Some(event) = protocol::normalize(frame) else {
            return;
        };

        if self.detector.observe(&event) == Change::Duplicate {
            trace!("ignoring repeat of {}", event.dedup_key);
            return;
        }

        self.last_song_text
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clone_from(&event.display_text);

        let config = self.config();
        if !config.announcements_enabled {
            debug!("now playing {event} (announcements disabled)");
            return;
        }

        if !self.dispatcher.dispatch(&event, &config) {
            warn!("announcement for {event} dropped: presenter stopped");
        }
    }

    fn schedule_reconnect(&self) {
        let config = self.config();
        let me = self.me.clone();
        self.reconnect.schedule_after(config.reconnect_delay, move || {
            if let Some(inner) = me.upgrade() {
                inner.connect();
            }
        });
    }
}

impl Listener for Inner {
    fn is_enabled(&self) -> bool {
        self.config().enabled && self.connection.state() != ConnectionState::ShuttingDown
    }

    fn on_frame(&self, frame: &str) {
        let start = Instant::now();
        self.handle_frame(frame);

        if let Err(e) = self.metrics.record(metrics::HANDLE_MESSAGE, start.elapsed()) {
            debug!("could not record timing: {e}");
        }
    }

    fn on_disconnected(&self, error: &Error) {
        if !self.is_enabled() {
            trace!("not reconnecting: service disabled");
            return;
        }

        if error.is_transient() {
            warn!("now-playing connection lost: {error}");
        } else {
            error!("now-playing connection failed: {error}");
        }
        if self.config().debug_logging {
            debug!("{error:?}");
        }

        self.schedule_reconnect();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        announce::{testing::RecordingAudience, Audience},
        metrics::Timings,
        transport::testing::{closes, texts, PendingOpen, ScriptedTransport},
    };

    const HANDSHAKE: &str = r#"{"subs":{"station:sanctuary_radio":{"recover":true}}}"#;

    struct Harness {
        service: Service,
        opens: mpsc::UnboundedReceiver<PendingOpen>,
        audience: Arc<RecordingAudience>,
        timings: Arc<Timings>,
    }

    fn harness() -> Harness {
        let timings = Arc::new(Timings::new(true));
        Harness {
            timings: timings.clone(),
            ..harness_with(timings)
        }
    }

    fn harness_with(metrics: Arc<dyn MetricsSink>) -> Harness {
        let (transport, opens) = ScriptedTransport::new();
        let (dispatcher, presenter) = AnnouncementDispatcher::new();
        let audience = Arc::new(RecordingAudience::default());
        let service = Service::new(Arc::new(transport), dispatcher, metrics, Handle::current());

        let presented: Arc<dyn Audience> = audience.clone();
        tokio::spawn(presenter.run(presented));

        Harness {
            service,
            opens,
            audience,
            timings: Arc::new(Timings::new(false)),
        }
    }

    /// Blocks the first recorded sample until released.
    struct GatedMetrics {
        entered: std::sync::Mutex<Option<std::sync::mpsc::Sender<()>>>,
        release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl MetricsSink for GatedMetrics {
        fn record(&self, _operation: &'static str, _elapsed: Duration) -> Result<()> {
            if let Some(entered) = self.entered.lock().unwrap().take() {
                entered.send(()).unwrap();
                self.release.lock().unwrap().recv().unwrap();
            }
            Ok(())
        }
    }

    const OTHER_ENDPOINT: &str = "wss://relay.example.net/api/live/nowplaying/websocket";

    fn enabled() -> ConnectionConfig {
        ConnectionConfig {
            enabled: true,
            message_format: "{song}".to_owned(),
            reconnect_delay: Duration::from_secs(10),
            ..Default::default()
        }
    }

    fn publication(sh_id: u64, artist: &str, title: &str) -> String {
        format!(
            r#"{{"pub":{{"data":{{"np":{{"now_playing":{{"sh_id":{sh_id},"song":{{"artist":"{artist}","title":"{title}"}}}}}}}}}}}}"#
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn connects_once_and_announces_changes_only() {
        let mut h = harness();
        h.service.start(enabled());

        let open = h.opens.recv().await.unwrap();
        assert_eq!(open.url.as_str(), config::DEFAULT_ENDPOINT_URL);
        let mut peer = open.accept();
        settle().await;
        assert_eq!(h.service.state(), ConnectionState::Connected);
        assert_eq!(texts(&peer.drain_sent()), vec![HANDSHAKE]);

        peer.push(&publication(1, "A", "B"));
        peer.push(&publication(1, "A", "B"));
        peer.push("not json");
        peer.push("{}");
        peer.push(&publication(1, "A", "B"));
        peer.push(&publication(2, "C", "D"));
        settle().await;

        assert_eq!(h.audience.messages(), vec!["A - B", "C - D"]);
        assert_eq!(h.service.last_song_text(), "C - D");
        assert!(h.opens.try_recv().is_err());
        assert!(texts(&peer.drain_sent()).is_empty());

        let timings = h.timings.snapshot_and_reset().unwrap();
        assert_eq!(timings[0].operation, metrics::HANDLE_MESSAGE);
        assert_eq!(timings[0].count, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let mut h = harness();
        h.service.start(enabled());
        let mut peer = h.opens.recv().await.unwrap().accept();
        settle().await;

        h.service.stop();
        h.service.stop();
        settle().await;

        assert_eq!(h.service.state(), ConnectionState::Disconnected);
        assert!(!h.service.config().enabled);
        assert_eq!(closes(&peer.drain_sent()), 1);

        peer.push(&publication(1, "A", "B"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.audience.messages().is_empty());
        assert!(h.opens.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reload_reannounces_current_song() {
        let mut h = harness();
        h.service.start(enabled());
        let mut first = h.opens.recv().await.unwrap().accept();
        settle().await;
        first.push(&publication(1, "A", "B"));
        settle().await;

        h.service.reload(ConnectionConfig {
            endpoint_url: OTHER_ENDPOINT.to_owned(),
            ..enabled()
        });
        // Anything the old connection still sends is ignored.
        first.push(&publication(2, "Old", "Frame"));

        let open = h.opens.recv().await.unwrap();
        assert_eq!(open.url.as_str(), OTHER_ENDPOINT);
        let mut second = open.accept();
        settle().await;
        assert_eq!(closes(&first.drain_sent()), 1);
        assert_eq!(texts(&second.drain_sent()), vec![HANDSHAKE]);

        second.push(&publication(1, "A", "B"));
        settle().await;

        assert_eq!(h.audience.messages(), vec!["A - B", "A - B"]);
        assert!(h.opens.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reload_waits_for_frame_in_flight() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let mut h = harness_with(Arc::new(GatedMetrics {
            entered: std::sync::Mutex::new(Some(entered_tx)),
            release: std::sync::Mutex::new(release_rx),
        }));

        h.service.start(enabled());
        let mut first = h.opens.recv().await.unwrap().accept();
        assert!(first.sent.recv().await.is_some());
        first.push(&publication(1, "A", "B"));
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let service = h.service.clone();
        let reload = std::thread::spawn(move || {
            service.reload(ConnectionConfig {
                endpoint_url: OTHER_ENDPOINT.to_owned(),
                ..enabled()
            })
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reload.is_finished());

        release_tx.send(()).unwrap();
        tokio::task::spawn_blocking(move || reload.join())
            .await
            .unwrap()
            .unwrap();

        let open = h.opens.recv().await.unwrap();
        assert_eq!(open.url.as_str(), OTHER_ENDPOINT);
        let mut second = open.accept();
        assert!(second.sent.recv().await.is_some());
        second.push(&publication(1, "A", "B"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.audience.messages().len() < 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.audience.messages(), vec!["A - B", "A - B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_failure() {
        let mut h = harness();
        h.service.start(enabled());
        h.opens
            .recv()
            .await
            .unwrap()
            .fail(Error::unavailable("connection refused"));
        settle().await;
        assert_eq!(h.service.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(h.opens.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut peer = h.opens.recv().await.unwrap().accept();
        settle().await;
        assert_eq!(texts(&peer.drain_sent()), vec![HANDSHAKE]);

        peer.hang_up();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(h.opens.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_reconnect() {
        let mut h = harness();
        h.service.start(enabled());
        h.opens
            .recv()
            .await
            .unwrap()
            .fail(Error::unavailable("connection refused"));
        settle().await;

        h.service.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.opens.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_announcements_still_track_songs() {
        let mut h = harness();
        h.service.start(enabled());
        let peer = h.opens.recv().await.unwrap().accept();
        settle().await;

        h.service.set_announcements_enabled(false);
        peer.push(&publication(1, "A", "B"));
        settle().await;
        assert!(h.audience.messages().is_empty());
        assert_eq!(h.service.last_song_text(), "A - B");

        h.service.set_announcements_enabled(true);
        peer.push(&publication(1, "A", "B"));
        peer.push(&publication(2, "C", "D"));
        settle().await;
        assert_eq!(h.audience.messages(), vec!["C - D"]);
        assert_eq!(h.service.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_configuration_disables_service() {
        let mut h = harness();
        h.service.start(ConnectionConfig {
            subscription_topic: "  ".to_owned(),
            ..enabled()
        });
        settle().await;

        assert!(!h.service.config().enabled);
        assert_eq!(h.service.state(), ConnectionState::Disconnected);
        assert!(h.opens.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_endpoint_is_migrated() {
        let mut h = harness();
        let applied = h.service.start(ConnectionConfig {
            endpoint_url: "wss://radio.example.net/api/live/nowplaying/sanctuary_radio".to_owned(),
            ..enabled()
        });

        let migrated = "wss://radio.example.net/api/live/nowplaying/websocket";
        assert_eq!(applied.migrated_endpoint.as_deref(), Some(migrated));
        assert_eq!(h.opens.recv().await.unwrap().url.as_str(), migrated);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_from_store_persists_derived_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("onair.toml");
        std::fs::write(
            &path,
            "[radio]\nenabled = true\n\
             websocket-url = \"wss://radio.example.net/api/live/nowplaying/sanctuary_radio\"\n",
        )
        .unwrap();
        let store = ConfigStore::new(&path);

        let mut h = harness();
        h.service.reload_from(&store).unwrap();
        let open = h.opens.recv().await.unwrap();
        assert_eq!(
            open.url.as_str(),
            "wss://radio.example.net/api/live/nowplaying/websocket"
        );
        let mut peer = open.accept();
        settle().await;
        assert_eq!(texts(&peer.drain_sent()), vec![HANDSHAKE]);

        let saved = store.settings().unwrap().radio;
        assert_eq!(saved.station_shortcode.as_deref(), Some("sanctuary_radio"));
        assert_eq!(
            saved.websocket_url.as_deref(),
            Some("wss://radio.example.net/api/live/nowplaying/websocket")
        );
    }
}
