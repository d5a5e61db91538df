//! Client side: dial relays, publish to all of them, and listen.
//!
//! Every connection gets its own read loop. Decoded messages and connection
//! errors from all loops are merged into one queue which [`Client::listen`]
//! drains, handing messages to the registered handler on the bounded handler
//! pool. Nothing is delivered while no one is listening; once the queue is
//! full the read loops wait.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, Mutex},
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::protocol::WebSocketConfig, MaybeTlsStream,
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::{Settings, DEFAULT_MAX_MESSAGE_LENGTH},
    connection::{Connection, ConnectionId, ConnectionRegistry, DEFAULT_OUTBOUND_CAPACITY},
    dispatch::{
        read_loop, report, Context, Dispatcher, ErrorHandler, MessageHandler,
        DEFAULT_MAX_HANDLERS,
    },
    error::{Error, Result},
    message::Message,
};

/// Client construction options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// SOCKS5 proxy (host:port) used for every dial, e.g. a Tor daemon.
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_length: usize,
    pub max_handlers: usize,
    /// Notifications buffered between the read loops and `listen`.
    pub queue_capacity: usize,
    /// Frames queued per relay before a stalled relay is dropped.
    pub outbound_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(10),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            max_handlers: DEFAULT_MAX_HANDLERS,
            queue_capacity: 1024,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl From<&Settings> for ClientOptions {
    fn from(cfg: &Settings) -> Self {
        Self {
            proxy: cfg.tor_socks.clone(),
            max_message_length: cfg.max_message_length,
            max_handlers: cfg.max_handlers,
            ..Default::default()
        }
    }
}

enum Notification {
    Message(Context, Message),
    Error(ConnectionId, Error),
}

/// Client engine. Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    options: ClientOptions,
    registry: Arc<ConnectionRegistry>,
    on_message: RwLock<Option<Arc<dyn MessageHandler>>>,
    on_error: RwLock<Option<ErrorHandler>>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
    tx: mpsc::Sender<Notification>,
    rx: Mutex<mpsc::Receiver<Notification>>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let dispatcher = Dispatcher::new(options.max_handlers);
        Self {
            inner: Arc::new(ClientInner {
                options,
                registry: Arc::new(ConnectionRegistry::new()),
                on_message: RwLock::new(None),
                on_error: RwLock::new(None),
                dispatcher,
                cancel: CancellationToken::new(),
                tx,
                rx: Mutex::new(rx),
            }),
        }
    }

    /// Dial `url`, register the connection and start reading from it.
    ///
    /// Fails once [`Client::close`] has been called.
    pub async fn connect(&self, url: &str) -> Result<ConnectionId> {
        self.ensure_open()?;
        let options = &self.inner.options;
        let ws = tokio::time::timeout(options.connect_timeout, dial(url, options))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {url}")))??;
        self.ensure_open()?;
        let (sink, stream) = ws.split();
        let conn =
            Connection::spawn_with_capacity(sink, url, &self.inner.cancel, options.outbound_capacity);
        let id = conn.id();
        self.inner.registry.add(conn.clone());
        info!(connection = id, url, "connected to relay");

        let registry = self.inner.registry.clone();
        let tx = self.inner.tx.clone();
        let errors: ErrorHandler = {
            let tx = tx.clone();
            Arc::new(move |e: Error| {
                if tx.try_send(Notification::Error(id, e)).is_err() {
                    warn!(connection = id, "notification queue full, dropping error");
                }
            })
        };
        tokio::spawn(async move {
            let origin = conn.clone();
            let cx_registry = registry.clone();
            read_loop(
                conn,
                registry,
                stream,
                move |message| {
                    let tx = tx.clone();
                    let cx = Context::new(origin.clone(), cx_registry.clone());
                    async move {
                        let _ = tx.send(Notification::Message(cx, message)).await;
                    }
                },
                Some(errors),
            )
            .await;
            info!(connection = id, "relay connection closed");
        });
        Ok(id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Transport("client is closed".into()));
        }
        Ok(())
    }

    /// Set the handler for every message received from any relay.
    pub fn on_message(&self, handler: impl MessageHandler) {
        *self
            .inner
            .on_message
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    /// Set the handler for errors that closed a relay connection.
    pub fn on_error(&self, handler: impl Fn(Error) + Send + Sync + 'static) {
        *self.inner.on_error.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    /// Deliver messages and errors to the registered handlers until `cancel`
    /// fires or the client is closed. Connections stay open afterwards.
    pub async fn listen(&self, cancel: CancellationToken) {
        let mut rx = self.inner.rx.lock().await;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.inner.cancel.cancelled() => return,
                next = rx.recv() => next,
            };
            match next {
                Some(Notification::Message(cx, message)) => {
                    let handler = self
                        .inner
                        .on_message
                        .read()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone();
                    match handler {
                        Some(handler) => self.inner.dispatcher.dispatch(handler, cx, message).await,
                        None => debug!(
                            connection = cx.connection_id(),
                            message_type = %message.message_type(),
                            "no message handler"
                        ),
                    }
                }
                Some(Notification::Error(id, err)) => {
                    let handler = self
                        .inner
                        .on_error
                        .read()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone();
                    report(handler.as_ref(), id, err);
                }
                None => return,
            }
        }
    }

    /// Send `message` to every connected relay; returns how many accepted it.
    pub fn publish(&self, message: &Message) -> Result<usize> {
        if self.inner.registry.is_empty() {
            return Err(Error::NotConnected);
        }
        let text = message.to_json()?;
        Ok(self.inner.registry.broadcast(&text))
    }

    /// Send `message` to one relay.
    pub fn send_to(&self, id: ConnectionId, message: &Message) -> Result<()> {
        self.inner.registry.send(id, &message.to_json()?)
    }

    /// Close one relay connection. Returns `false` if it was not open.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.inner.registry.remove(id)
    }

    /// Close every connection and end any running `listen`.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.registry.close_all();
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.inner.registry.ids()
    }
}

type BoxedStream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn dial(
    relay: &str,
    options: &ClientOptions,
) -> Result<WebSocketStream<MaybeTlsStream<BoxedStream>>> {
    let url = Url::parse(relay)?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(Error::Transport(format!(
            "unsupported scheme `{}`",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| Error::Transport("missing host".into()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Transport("missing port".into()))?;
    let stream: BoxedStream = match options.proxy.as_deref() {
        Some(proxy) => Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| Error::Transport(format!("socks proxy {proxy}: {e}")))?,
        ),
        None => Box::new(TcpStream::connect((host, port)).await?),
    };
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(options.max_message_length);
    config.max_frame_size = Some(options.max_message_length);
    let (ws, _) = client_async_tls_with_config(relay, stream, Some(config), None).await?;
    debug!(relay, "websocket handshake complete");
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
