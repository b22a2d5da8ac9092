//! Duplex WebSocket transport for the mission-control link.
//!
//! # Purpose
//! One `Connection` owns one physical WebSocket and multiplexes everything
//! over it: synchronous calls correlated through the client sequence, and
//! server push fanned out to registered listeners. A single receive-loop task
//! is the only reader; senders share the write half behind an async lock.
//!
//! # Design notes
//! Reply waiters are oneshot senders registered before the request bytes hit
//! the wire, so a reply can never race its own registration. A read error or
//! close frame tears the connection down in place, which drops all pending
//! waiters and fires the disconnect hook exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};

use tycho_wire::{ClientEnvelope, Encoding, ServerEnvelope};

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("connection is not established")]
    NotConnected,
    #[error("failed to dial server: {0}")]
    Dial(tokio_tungstenite::tungstenite::Error),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("failed to write message: {0}")]
    Write(tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Codec(#[from] tycho_wire::Error),
    #[error("timed out waiting for reply")]
    Timeout,
    #[error("connection closed while waiting for reply")]
    Closed,
    #[error("server rejected call: {0}")]
    Remote(String),
}

/// Handle for removing a push listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Outcome of a synchronous call: the server-assigned call id, the delivery
/// sequence of the reply envelope, and its data payload.
#[derive(Debug, Clone)]
pub struct SyncReply {
    pub call: u64,
    pub seq: u64,
    pub data: serde_json::Value,
}

/// Timeouts applied to a connection. Both have conservative defaults.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub handshake_timeout: Duration,
    pub sync_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(10),
        }
    }
}

type Listener = Arc<dyn Fn(&ServerEnvelope) + Send + Sync>;
type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    encoding: Encoding,
    // Serializes connect attempts so concurrent callers share one dial.
    connect_guard: AsyncMutex<()>,
    connected: AtomicBool,
    next_id: AtomicU64,
    next_listener_id: AtomicU64,
    pending: parking_lot::Mutex<HashMap<u64, oneshot::Sender<ServerEnvelope>>>,
    listeners: parking_lot::Mutex<HashMap<ListenerId, Listener>>,
    disconnect: parking_lot::Mutex<Option<DisconnectHandler>>,
    writer: AsyncMutex<Option<WsSink>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// One duplex connection to a mission-control server.
///
/// ```no_run
/// use tycho_transport::{ConnectOptions, Connection};
/// use tycho_wire::Encoding;
///
/// # async fn demo() -> tycho_transport::Result<()> {
/// let conn = Connection::new(
///     "ws://localhost:8090/api/websocket".to_string(),
///     Encoding::Json,
///     ConnectOptions::default(),
/// );
/// conn.connect().await?;
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    url: String,
    options: ConnectOptions,
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(url: String, encoding: Encoding, options: ConnectOptions) -> Self {
        Self {
            url,
            options,
            shared: Arc::new(Shared {
                encoding,
                connect_guard: AsyncMutex::new(()),
                connected: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                next_listener_id: AtomicU64::new(1),
                pending: parking_lot::Mutex::new(HashMap::new()),
                listeners: parking_lot::Mutex::new(HashMap::new()),
                disconnect: parking_lot::Mutex::new(None),
                writer: AsyncMutex::new(None),
                reader: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Establish the WebSocket. A no-op while the connection is already up;
    /// concurrent callers share one dial.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.shared.connect_guard.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(TransportError::Dial)?;
        // The server negotiates the wire form through the subprotocol.
        let subprotocol = match self.shared.encoding {
            Encoding::Binary => HeaderValue::from_static("binary"),
            Encoding::Json => HeaderValue::from_static("json"),
        };
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", subprotocol);

        let (stream, _response) =
            tokio::time::timeout(self.options.handshake_timeout, connect_async(request))
                .await
                .map_err(|_| TransportError::HandshakeTimeout)?
                .map_err(TransportError::Dial)?;
        debug!(url = %self.url, "connected");

        let (sink, source) = stream.split();
        *self.shared.writer.lock().await = Some(sink);
        self.shared.connected.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(receive_loop(source, shared));
        if let Some(previous) = self.shared.reader.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Close the connection with a close frame, then tear down locally.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        {
            let mut writer = self.shared.writer.lock().await;
            if let Some(sink) = writer.as_mut() {
                if let Err(err) = sink.send(Message::Close(None)).await {
                    warn!(error = %err, "close frame failed");
                }
            }
        }
        self.shared.teardown().await;
        Ok(())
    }

    /// Tear down unconditionally without the close handshake.
    pub async fn force_disconnect(&self) {
        self.shared.teardown().await;
    }

    /// Send an envelope without waiting for any reply.
    pub async fn send_async(&self, envelope: &ClientEnvelope) -> Result<()> {
        let bytes = self.shared.encoding.encode_client(envelope)?;
        self.shared.write(bytes).await
    }

    /// Send an envelope and wait for the correlated reply.
    ///
    /// A fresh client sequence is assigned before the bytes hit the wire and
    /// a waiter is registered under it, so the reply resolves exactly this
    /// call no matter how replies interleave. A reply carrying an exception
    /// surfaces as [`TransportError::Remote`].
    pub async fn send_sync(&self, envelope: &ClientEnvelope) -> Result<SyncReply> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mut addressed = envelope.clone();
        addressed.id = id;
        let bytes = self.shared.encoding.encode_client(&addressed)?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        if let Err(err) = self.shared.write(bytes).await {
            self.shared.pending.lock().remove(&id);
            return Err(err);
        }

        let reply_envelope = match tokio::time::timeout(self.options.sync_timeout, rx).await {
            Ok(Ok(envelope)) => envelope,
            // Sender dropped: the connection was torn down under us.
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                return Err(TransportError::Timeout);
            }
        };

        let reply = reply_envelope.reply()?;
        if let Some(exception) = reply.exception {
            return Err(TransportError::Remote(exception));
        }
        Ok(SyncReply {
            call: reply_envelope.call,
            seq: reply_envelope.seq,
            data: reply_envelope.data,
        })
    }

    /// Register a push listener. Every inbound envelope is offered to every
    /// listener, reply envelopes included.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ServerEnvelope) + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.lock().insert(id, Arc::new(listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.shared.listeners.lock().remove(&id);
    }

    /// Install the hook fired on every teardown, forced or orderly.
    pub fn set_disconnect_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.disconnect.lock() = Some(Arc::new(handler));
    }
}

impl Shared {
    async fn write(&self, bytes: bytes::Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(TransportError::NotConnected)?;
        let message = match self.encoding {
            Encoding::Binary => Message::binary(bytes),
            Encoding::Json => Message::text(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| TransportError::Codec(tycho_wire::Error::Incomplete))?,
            ),
        };
        sink.send(message).await.map_err(TransportError::Write)
    }

    async fn teardown(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        *self.writer.lock().await = None;
        // Dropping the senders wakes every in-flight sync call with Closed.
        self.pending.lock().clear();
        let handler = self.disconnect.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }

    fn dispatch(&self, envelope: ServerEnvelope) {
        if envelope.is_reply() {
            match envelope.reply() {
                Ok(reply) => {
                    let waiter = self.pending.lock().remove(&reply.reply_to);
                    match waiter {
                        Some(tx) => {
                            // Listeners still see the reply below; give the
                            // waiter its own copy.
                            let _ = tx.send(envelope.clone());
                        }
                        None => {
                            debug!(reply_to = reply.reply_to, "reply without waiter, dropped")
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "undecodable reply payload");
                    return;
                }
            }
        }

        let listeners: Vec<Listener> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(&envelope);
        }
    }
}

async fn receive_loop(
    mut source: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    shared: Arc<Shared>,
) {
    debug!("receive loop started");
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Close(_)) => {
                debug!("received close frame");
                break;
            }
            Ok(Message::Ping(payload)) => {
                let mut writer = shared.writer.lock().await;
                if let Some(sink) = writer.as_mut() {
                    if let Err(err) = sink.send(Message::Pong(payload)).await {
                        warn!(error = %err, "pong failed");
                        break;
                    }
                }
            }
            Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Ok(message) => {
                let data = message.into_data();
                match shared.encoding.decode_server(data) {
                    Ok(envelope) => shared.dispatch(envelope),
                    // Undecodable frames are logged and skipped; the
                    // connection itself is still healthy.
                    Err(err) => error!(error = %err, "undecodable frame, dropped"),
                }
            }
            Err(err) => {
                error!(error = %err, "read failed");
                break;
            }
        }
    }
    debug!("receive loop stopped");
    shared.teardown().await;
}
