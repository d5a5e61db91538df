//! Relay side: accept WebSocket clients and route their messages.
//!
//! A [`Relay`] owns an axum [`Router`] serving three things on one port:
//!
//! - `GET /` with a WebSocket upgrade: a client connection
//! - `GET /` with `Accept: application/nostr+json`: the NIP-11 document
//! - `GET /.well-known/nostr.json?name=<name>`: NIP-05 lookups
//!
//! Each accepted socket is registered, then read until it closes. Decoded
//! messages go to the handler registered for their type, running on the
//! bounded handler pool. A message whose type has no handler closes the
//! connection.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    net::SocketAddr,
    sync::{Arc, RwLock},
};

use axum::{
    extract::{ws::WebSocket, ConnectInfo, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::{Settings, DEFAULT_MAX_MESSAGE_LENGTH},
    connection::{Connection, ConnectionId, ConnectionRegistry, DEFAULT_OUTBOUND_CAPACITY},
    dispatch::{read_loop, Context, Dispatcher, ErrorHandler, MessageHandler, DEFAULT_MAX_HANDLERS},
    error::{Error, Result},
    info::{IdentifierDocument, InformationDocument, NOSTR_JSON},
    message::{Message, MessageType},
};

/// Relay construction options.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Served as the NIP-11 document.
    pub info: InformationDocument,
    /// NIP-05 directory, name to hex pubkey.
    pub nip05_names: BTreeMap<String, String>,
    /// Relay URLs advertised next to every NIP-05 name.
    pub nip05_relays: Vec<String>,
    pub max_handlers: usize,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_length: usize,
    /// Frames queued per client before a stalled client is dropped.
    pub outbound_capacity: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            info: InformationDocument::for_software(),
            nip05_names: BTreeMap::new(),
            nip05_relays: Vec::new(),
            max_handlers: DEFAULT_MAX_HANDLERS,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl From<&Settings> for RelayOptions {
    fn from(cfg: &Settings) -> Self {
        Self {
            info: cfg.information_document(),
            nip05_names: cfg.nip05_names.clone(),
            nip05_relays: Vec::new(),
            max_handlers: cfg.max_handlers,
            max_message_length: cfg.max_message_length,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// Relay engine. Cloning yields another handle to the same relay.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    options: RelayOptions,
    registry: Arc<ConnectionRegistry>,
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    on_error: RwLock<Option<ErrorHandler>>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
}

impl Relay {
    pub fn new(options: RelayOptions) -> Self {
        let dispatcher = Dispatcher::new(options.max_handlers);
        Self {
            inner: Arc::new(RelayInner {
                options,
                registry: Arc::new(ConnectionRegistry::new()),
                handlers: RwLock::new(HashMap::new()),
                on_error: RwLock::new(None),
                dispatcher,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Route messages of `message_type` to `handler`, replacing any previous
    /// handler for that type.
    ///
    /// A client that sends a type with no handler is disconnected. Register a
    /// no-op handler to accept and ignore a type.
    pub fn handle(&self, message_type: MessageType, handler: impl MessageHandler) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message_type, Arc::new(handler));
    }

    /// Receive errors that closed a client connection.
    pub fn handle_error(&self, handler: impl Fn(Error) + Send + Sync + 'static) {
        *self.inner.on_error.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    /// HTTP routes of the relay, for mounting into a larger app.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(root))
            .route("/.well-known/nostr.json", get(nip05))
            .with_state(self.inner.clone())
    }

    /// Bind `addr` and serve until `shutdown` resolves or [`Relay::shutdown`]
    /// is called.
    pub async fn serve(
        &self,
        addr: SocketAddr,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_listener(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "relay listening");
        }
        let inner = self.inner.clone();
        let stop = async move {
            tokio::select! {
                _ = shutdown => {}
                _ = inner.cancel.cancelled() => {}
            }
            inner.stop();
        };
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(stop)
        .await?;
        Ok(())
    }

    /// Send `message` to every open connection; returns how many accepted it.
    pub fn publish(&self, message: &Message) -> Result<usize> {
        let text = message.to_json()?;
        Ok(self.inner.registry.broadcast(&text))
    }

    /// Send `message` to one connection.
    pub fn send_to(&self, id: ConnectionId, message: &Message) -> Result<()> {
        self.inner.registry.send(id, &message.to_json()?)
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.inner.registry.ids()
    }

    /// Stop accepting, close every connection and end [`Relay::serve`].
    pub fn shutdown(&self) {
        self.inner.stop();
    }
}

impl RelayInner {
    fn stop(&self) {
        self.cancel.cancel();
        self.registry.close_all();
    }

    fn error_handler(&self) -> Option<ErrorHandler> {
        self.on_error
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn accept(self: Arc<Self>, socket: WebSocket, peer: String) {
        let (sink, stream) = socket.split();
        let conn =
            Connection::spawn_with_capacity(sink, peer, &self.cancel, self.options.outbound_capacity);
        let id = conn.id();
        self.registry.add(conn.clone());
        info!(connection = id, peer = conn.peer(), "client connected");

        let on_error = self.error_handler();
        let registry = self.registry.clone();
        let inner = self.clone();
        let origin = conn.clone();
        read_loop(
            conn,
            registry,
            stream,
            move |message| {
                let inner = inner.clone();
                let origin = origin.clone();
                async move { inner.dispatch(origin, message).await }
            },
            on_error,
        )
        .await;
        info!(connection = id, "client disconnected");
    }

    async fn dispatch(&self, conn: Connection, message: Message) {
        let message_type = message.message_type();
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message_type)
            .cloned();
        match handler {
            Some(handler) => {
                let cx = Context::new(conn, self.registry.clone());
                self.dispatcher.dispatch(handler, cx, message).await;
            }
            None => {
                debug!(connection = conn.id(), %message_type, "no handler registered, closing");
                self.registry.remove(conn.id());
            }
        }
    }
}

fn cors() -> [(header::HeaderName, &'static str); 3] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
        (header::ACCESS_CONTROL_ALLOW_METHODS, "GET"),
    ]
}

/// WebSocket upgrade, NIP-11 document, or a short plain-text hint.
async fn root(
    State(inner): State<Arc<RelayInner>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let wants_info = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(NOSTR_JSON));
    if wants_info {
        return (cors(), Json(inner.options.info.clone())).into_response();
    }
    match ws {
        Some(ws) => {
            let peer = connect_info
                .map(|ConnectInfo(addr)| addr.to_string())
                .unwrap_or_else(|| "unknown".into());
            let limit = inner.options.max_message_length;
            ws.max_message_size(limit)
                .max_frame_size(limit)
                .on_upgrade(move |socket| inner.accept(socket, peer))
        }
        None => "Please use a Nostr client to connect.\n".into_response(),
    }
}

#[derive(Deserialize)]
struct Nip05Params {
    name: Option<String>,
}

async fn nip05(
    State(inner): State<Arc<RelayInner>>,
    Query(params): Query<Nip05Params>,
) -> impl IntoResponse {
    let doc = IdentifierDocument::lookup(
        &inner.options.nip05_names,
        &inner.options.nip05_relays,
        params.name.as_deref(),
    );
    (cors(), Json(doc))
}
