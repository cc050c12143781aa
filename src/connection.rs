//! Lifecycle of the single connection to the broadcast service.
//!
//! [`ConnectionManager`] owns at most one active connection plus at most one
//! attempt in flight. Every attempt is stamped with the slot's generation at
//! the time it started. Closing the slot bumps the generation, so anything
//! still holding the old stamp (a socket that finishes opening late, frames
//! from a connection being torn down) is recognized as stale and discarded
//! instead of being interrupted.
//!
//! The checks "is this connection still the active one" and "adopt this
//! connection" happen under the slot's lock, never by relying on the order
//! in which the transport completes. Frames are handed to the listener under
//! a shared delivery lock that [`ConnectionManager::close`] takes exclusively
//! before returning, so a frame that passed the "still active" check has been
//! fully handled by the time `close` returns.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak},
};

use futures_util::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    error::{Error, Result},
    transport::{Connection, Transport},
};

/// Frames larger than this are dropped unparsed.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Where the connection slot currently stands.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// The service is stopping; no new attempts are started.
    ShuttingDown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

/// Receives what happens on the active connection.
pub trait Listener: Send + Sync {
    /// Whether a freshly opened connection may still be adopted.
    fn is_enabled(&self) -> bool;

    /// A complete text frame from the active connection.
    fn on_frame(&self, frame: &str);

    /// An attempt failed, or the active connection was lost without being
    /// asked to close.
    fn on_disconnected(&self, error: &Error);
}

/// Ticket for one connection attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Attempt {
    generation: u64,
}

#[derive(Debug)]
struct Active {
    generation: u64,
    shutdown: CancellationToken,
}

#[derive(Debug, Default)]
struct Slot {
    state: ConnectionState,
    generation: u64,
    active: Option<Active>,
}

/// Serializes all transitions of the connection slot.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    runtime: Handle,
    slot: Mutex<Slot>,
    /// Held shared while a frame is with the listener.
    delivery: RwLock<()>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, runtime: Handle) -> Self {
        Self {
            transport,
            runtime,
            slot: Mutex::new(Slot::default()),
            delivery: RwLock::new(()),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.slot().state
    }

    /// Starts opening a connection to `url` unless one is already open or
    /// opening, or the manager is shutting down. Returns immediately;
    /// `handshake` is sent as the first frame once the socket is adopted.
    ///
    /// Returns whether an attempt was started.
    pub fn connect(
        self: &Arc<Self>,
        url: &Url,
        handshake: String,
        listener: Weak<dyn Listener>,
    ) -> bool {
        let Some(attempt) = self.begin() else {
            return false;
        };

        debug!("connecting to {url}");
        let open = self.transport.open(url);
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = open.await;
            this.complete(attempt, result, handshake, listener).await;
        });

        true
    }

    /// Moves the slot to `Connecting`, if it is free.
    fn begin(&self) -> Option<Attempt> {
        let mut slot = self.slot();
        match slot.state {
            ConnectionState::Disconnected if slot.active.is_none() => {
                slot.state = ConnectionState::Connecting;
                Some(Attempt {
                    generation: slot.generation,
                })
            }
            state => {
                trace!("not connecting: {state}");
                None
            }
        }
    }

    /// Resolves an attempt once the transport has answered.
    ///
    /// The connection is adopted only if the attempt is current, nothing
    /// else became active meanwhile, and the listener still wants one.
    /// Otherwise it is closed right away.
    async fn complete(
        self: Arc<Self>,
        attempt: Attempt,
        result: Result<Connection>,
        handshake: String,
        listener: Weak<dyn Listener>,
    ) {
        let enabled = listener
            .upgrade()
            .is_some_and(|listener| listener.is_enabled());

        let mut connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                let current = {
                    let mut slot = self.slot();
                    let current = slot.generation == attempt.generation
                        && slot.state == ConnectionState::Connecting;
                    if current {
                        slot.state = ConnectionState::Disconnected;
                    }
                    current
                };

                if current {
                    if let Some(listener) = listener.upgrade() {
                        listener.on_disconnected(&e);
                    }
                } else {
                    debug!("superseded connection attempt failed: {e}");
                }
                return;
            }
        };

        let adopted = {
            let mut slot = self.slot();
            let current = slot.generation == attempt.generation;
            if current && slot.active.is_none() && enabled {
                let shutdown = CancellationToken::new();
                slot.active = Some(Active {
                    generation: attempt.generation,
                    shutdown: shutdown.clone(),
                });
                slot.state = ConnectionState::Connected;
                Some(shutdown)
            } else {
                if current && slot.state == ConnectionState::Connecting {
                    slot.state = ConnectionState::Disconnected;
                }
                None
            }
        };

        match adopted {
            Some(shutdown) => {
                info!("connected");
                let this = Arc::clone(&self);
                self.runtime.spawn(async move {
                    this.drive(connection, attempt.generation, shutdown, handshake, listener)
                        .await;
                });
            }
            None => {
                debug!("closing connection that is no longer wanted");
                if let Err(e) = connection.sink.send(Message::Close(None)).await {
                    trace!("error closing unwanted connection: {e}");
                }
            }
        }
    }

    /// Runs an adopted connection until it is closed or lost.
    async fn drive(
        self: Arc<Self>,
        mut connection: Connection,
        generation: u64,
        shutdown: CancellationToken,
        handshake: String,
        listener: Weak<dyn Listener>,
    ) {
        match self
            .pump(&mut connection, generation, &shutdown, handshake, &listener)
            .await
        {
            Ok(()) => {
                // Asked to close: say goodbye, but nobody waits for it.
                if let Err(e) = connection.sink.send(Message::Close(None)).await {
                    trace!("error sending close frame: {e}");
                }
                debug!("connection closed");
            }
            Err(e) => {
                if self.release(generation) {
                    if let Some(listener) = listener.upgrade() {
                        listener.on_disconnected(&e);
                    }
                }
            }
        }
    }

    /// Sends the handshake and forwards inbound frames while the connection
    /// is active. Returns `Ok` when asked to stop and `Err` when the
    /// connection is lost.
    async fn pump(
        &self,
        connection: &mut Connection,
        generation: u64,
        shutdown: &CancellationToken,
        handshake: String,
        listener: &Weak<dyn Listener>,
    ) -> Result<()> {
        if !self.is_active(generation) {
            return Ok(());
        }
        trace!("subscribing: {handshake}");
        connection.sink.send(Message::text(handshake)).await?;

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => return Ok(()),

                message = connection.stream.next() => {
                    let message = match message {
                        Some(message) => message?,
                        None => return Err(Error::unavailable("connection ended")),
                    };

                    match message {
                        Message::Text(text) => {
                            let size = text.len();
                            if size > MAX_FRAME_BYTES {
                                warn!("ignoring oversized frame with {size} bytes");
                                continue;
                            }

                            // Upgraded outside the delivery lock: dropping the
                            // last reference may close the manager.
                            let Some(listener) = listener.upgrade() else {
                                return Ok(());
                            };
                            if !self.deliver(generation, listener.as_ref(), text.as_str()) {
                                trace!("dropping frame from superseded connection");
                                return Ok(());
                            }
                        }
                        Message::Close(frame) => {
                            let reason = frame.map_or_else(
                                || String::from("no reason"),
                                |frame| format!("{} ({})", frame.code, frame.reason),
                            );
                            return Err(Error::cancelled(format!("closed by server: {reason}")));
                        }
                        Message::Binary(_) => trace!("ignoring binary message"),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Hands `frame` to `listener` if the connection of `generation` is
    /// still the active one. Returns whether it was delivered.
    fn deliver(&self, generation: u64, listener: &dyn Listener, frame: &str) -> bool {
        let _delivering = self
            .delivery
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.is_active(generation) {
            return false;
        }

        listener.on_frame(frame);
        true
    }

    /// Whether the connection of `generation` is still the active one.
    #[must_use]
    fn is_active(&self, generation: u64) -> bool {
        self.slot()
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    /// Clears the active connection if it is the one of `generation`.
    /// Returns whether it was.
    fn release(&self, generation: u64) -> bool {
        let mut slot = self.slot();
        if slot
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
        {
            slot.active = None;
            if slot.state != ConnectionState::ShuttingDown {
                slot.state = ConnectionState::Disconnected;
            }
            true
        } else {
            false
        }
    }

    /// Closes the active connection and invalidates any attempt in flight.
    ///
    /// Idempotent. The active reference is cleared and any frame already
    /// with the listener has been handled before this returns, so no further
    /// frames are delivered from it; the close frame itself is sent
    /// asynchronously. Returns whether a connection was active.
    ///
    /// Must not be called from [`Listener::on_frame`].
    pub fn close(&self) -> bool {
        let active = {
            let mut slot = self.slot();
            slot.generation = slot.generation.wrapping_add(1);
            if slot.state != ConnectionState::ShuttingDown {
                slot.state = ConnectionState::Disconnected;
            }
            slot.active.take()
        };

        // Wait out a frame that passed the active check before the bump.
        drop(self.delivery.write().unwrap_or_else(PoisonError::into_inner));

        match active {
            Some(active) => {
                active.shutdown.cancel();
                true
            }
            None => false,
        }
    }

    /// Refuses new attempts until [`finish_shutdown`](Self::finish_shutdown).
    pub fn begin_shutdown(&self) {
        self.slot().state = ConnectionState::ShuttingDown;
    }

    pub fn finish_shutdown(&self) {
        let mut slot = self.slot();
        if slot.state == ConnectionState::ShuttingDown {
            slot.state = ConnectionState::Disconnected;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::transport::testing::{closes, pair, texts, ScriptedTransport};

    #[derive(Default)]
    struct Recorder {
        disabled: AtomicBool,
        frames: Mutex<Vec<String>>,
        disconnects: AtomicUsize,
    }

    impl Listener for Recorder {
        fn is_enabled(&self) -> bool {
            !self.disabled.load(Ordering::SeqCst)
        }

        fn on_frame(&self, frame: &str) {
            self.frames.lock().unwrap().push(frame.to_owned());
        }

        fn on_disconnected(&self, _error: &Error) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Holds the first frame inside `on_frame` until released.
    struct Gate {
        entered: Mutex<Option<std::sync::mpsc::Sender<()>>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
        handled: AtomicBool,
    }

    impl Listener for Gate {
        fn is_enabled(&self) -> bool {
            true
        }

        fn on_frame(&self, _frame: &str) {
            if let Some(entered) = self.entered.lock().unwrap().take() {
                entered.send(()).unwrap();
                self.release.lock().unwrap().recv().unwrap();
            }
            self.handled.store(true, Ordering::SeqCst);
        }

        fn on_disconnected(&self, _error: &Error) {}
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn url() -> Url {
        Url::parse("wss://radio.example.net/api/live/nowplaying/websocket").unwrap()
    }

    fn weak(recorder: &Arc<Recorder>) -> Weak<dyn Listener> {
        let listener: Arc<dyn Listener> = recorder.clone();
        Arc::downgrade(&listener)
    }

    #[tokio::test(start_paused = true)]
    async fn adopts_connection_and_sends_handshake_once() {
        let (transport, mut opens) = ScriptedTransport::new();
        let manager = Arc::new(ConnectionManager::new(Arc::new(transport), Handle::current()));
        let recorder = Arc::new(Recorder::default());

        assert!(manager.connect(&url(), "hello".to_owned(), weak(&recorder)));
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(!manager.connect(&url(), "hello".to_owned(), weak(&recorder)));

        let mut peer = opens.recv().await.unwrap().accept();
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(!manager.connect(&url(), "hello".to_owned(), weak(&recorder)));
        assert_eq!(texts(&peer.drain_sent()), vec!["hello"]);

        peer.push("frame");
        settle().await;
        assert_eq!(*recorder.frames.lock().unwrap(), vec!["frame"]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_completion_of_same_attempt_is_closed() {
        let (transport, _opens) = ScriptedTransport::new();
        let manager = Arc::new(ConnectionManager::new(Arc::new(transport), Handle::current()));
        let recorder = Arc::new(Recorder::default());

        let attempt = manager.begin().unwrap();
        let (first, mut first_peer) = pair();
        let (second, mut second_peer) = pair();

        Arc::clone(&manager)
            .complete(attempt, Ok(first), "hello".to_owned(), weak(&recorder))
            .await;
        Arc::clone(&manager)
            .complete(attempt, Ok(second), "hello".to_owned(), weak(&recorder))
            .await;
        settle().await;

        let first_sent = first_peer.drain_sent();
        assert_eq!(texts(&first_sent), vec!["hello"]);
        assert_eq!(closes(&first_sent), 0);

        let second_sent = second_peer.drain_sent();
        assert!(texts(&second_sent).is_empty());
        assert_eq!(closes(&second_sent), 1);

        second_peer.push("late");
        first_peer.push("live");
        settle().await;
        assert_eq!(*recorder.frames.lock().unwrap(), vec!["live"]);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn close_discards_attempt_in_flight() {
        let (transport, mut opens) = ScriptedTransport::new();
        let manager = Arc::new(ConnectionManager::new(Arc::new(transport), Handle::current()));
        let recorder = Arc::new(Recorder::default());

        manager.connect(&url(), "hello".to_owned(), weak(&recorder));
        let pending = opens.recv().await.unwrap();

        assert!(!manager.close());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let mut peer = pending.accept();
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        let sent = peer.drain_sent();
        assert!(texts(&sent).is_empty());
        assert_eq!(closes(&sent), 1);
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_listener_does_not_adopt() {
        let (transport, mut opens) = ScriptedTransport::new();
        let manager = Arc::new(ConnectionManager::new(Arc::new(transport), Handle::current()));
        let recorder = Arc::new(Recorder::default());

        manager.connect(&url(), "hello".to_owned(), weak(&recorder));
        let pending = opens.recv().await.unwrap();
        recorder.disabled.store(true, Ordering::SeqCst);

        let mut peer = pending.accept();
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(closes(&peer.drain_sent()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_and_losses_are_reported() {
        let (transport, mut opens) = ScriptedTransport::new();
        let manager = Arc::new(ConnectionManager::new(Arc::new(transport), Handle::current()));
        let recorder = Arc::new(Recorder::default());

        manager.connect(&url(), "hello".to_owned(), weak(&recorder));
        opens
            .recv()
            .await
            .unwrap()
            .fail(Error::unavailable("connection refused"));
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);

        manager.connect(&url(), "hello".to_owned(), weak(&recorder));
        let mut peer = opens.recv().await.unwrap().accept();
        settle().await;
        peer.hang_up();
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_sends_one_close_frame() {
        let (transport, mut opens) = ScriptedTransport::new();
        let manager = Arc::new(ConnectionManager::new(Arc::new(transport), Handle::current()));
        let recorder = Arc::new(Recorder::default());

        manager.connect(&url(), "hello".to_owned(), weak(&recorder));
        let mut peer = opens.recv().await.unwrap().accept();
        settle().await;

        assert!(manager.close());
        assert!(!manager.close());
        settle().await;

        assert_eq!(closes(&peer.drain_sent()), 1);
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 0);

        peer.push("after close");
        settle().await;
        assert!(recorder.frames.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutting_down_refuses_new_attempts() {
        let (transport, _opens) = ScriptedTransport::new();
        let manager = Arc::new(ConnectionManager::new(Arc::new(transport), Handle::current()));
        let recorder = Arc::new(Recorder::default());

        manager.begin_shutdown();
        assert!(!manager.connect(&url(), "hello".to_owned(), weak(&recorder)));
        manager.finish_shutdown();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.connect(&url(), "hello".to_owned(), weak(&recorder)));
    }

    #[tokio::test(start_paused = true)]
    async fn large_frames_are_delivered_and_oversized_ones_dropped() {
        let (transport, mut opens) = ScriptedTransport::new();
        let manager = Arc::new(ConnectionManager::new(Arc::new(transport), Handle::current()));
        let recorder = Arc::new(Recorder::default());

        assert!(manager.connect(&url(), "hello".to_owned(), weak(&recorder)));
        let peer = opens.recv().await.unwrap().accept();
        settle().await;

        let history = "x".repeat(200 * 1024);
        peer.push(&"y".repeat(MAX_FRAME_BYTES + 1));
        peer.push(&history);
        settle().await;

        assert_eq!(*recorder.frames.lock().unwrap(), vec![history]);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_waits_for_frame_being_handled() {
        let (transport, mut opens) = ScriptedTransport::new();
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(transport),
            Handle::current(),
        ));

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let gate = Arc::new(Gate {
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
            handled: AtomicBool::new(false),
        });
        let listener: Arc<dyn Listener> = gate.clone();

        assert!(manager.connect(&url(), "hello".to_owned(), Arc::downgrade(&listener)));
        let mut peer = opens.recv().await.unwrap().accept();
        assert!(peer.sent.recv().await.is_some());

        peer.push("frame");
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let closing = Arc::clone(&manager);
        let observed = Arc::clone(&gate);
        let close = std::thread::spawn(move || {
            closing.close();
            observed.handled.load(Ordering::SeqCst)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!close.is_finished());

        release_tx.send(()).unwrap();
        let handled_before_close_returned = tokio::task::spawn_blocking(move || close.join())
            .await
            .unwrap()
            .unwrap();
        assert!(handled_before_close_returned);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
