//! Transport between the connection manager and the broadcast service.
//!
//! A [`Transport`] opens one [`Connection`]: a sink for outbound WebSocket
//! messages and a stream of inbound ones. The production implementation is
//! [`WebSocketTransport`]; tests substitute a scripted in-memory one.

use std::{pin::Pin, time::Duration};

use futures_util::{future::BoxFuture, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::{Error, Result};

/// Outbound half of a connection.
pub type MessageSink = Pin<Box<dyn Sink<Message, Error = Error> + Send>>;

/// Inbound half of a connection. Ends when the underlying socket is gone.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message>> + Send>>;

/// An open connection, split into its two halves.
pub struct Connection {
    pub sink: MessageSink,
    pub stream: MessageStream,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens connections to the broadcast service.
pub trait Transport: Send + Sync {
    /// Starts opening a connection to `url`.
    ///
    /// The returned future is independent of `self` so that it can be
    /// driven on a spawned task.
    fn open(&self, url: &Url) -> BoxFuture<'static, Result<Connection>>;
}

/// WebSocket transport over `tokio-tungstenite`, with TLS for `wss` URLs.
#[derive(Clone, Debug)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    /// Time allowed for TCP, TLS and the HTTP upgrade together.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &Url) -> BoxFuture<'static, Result<Connection>> {
        let url = url.to_string();
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            let (ws_stream, response) =
                tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url))
                    .await??;
            trace!("websocket upgrade: {}", response.status());

            let (ws_tx, ws_rx) = ws_stream.split();
            Ok(Connection {
                sink: Box::pin(ws_tx.sink_map_err(Error::from)),
                stream: Box::pin(ws_rx.map(|message| message.map_err(Error::from))),
            })
        })
    }
}
