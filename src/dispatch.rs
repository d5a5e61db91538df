//! Handler dispatch shared by the relay and client engines.

use std::{future::Future, sync::Arc};

use futures_util::{future::BoxFuture, FutureExt, Stream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    connection::{Connection, ConnectionId, ConnectionRegistry},
    error::{Error, Result},
    message::Message,
    transport::{next_text, WireMessage},
};

/// Default number of handler invocations allowed to run at once.
pub const DEFAULT_MAX_HANDLERS: usize = 64;

/// What a handler knows about the message it was given.
#[derive(Debug, Clone)]
pub struct Context {
    connection: Connection,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
}

impl Context {
    pub(crate) fn new(connection: Connection, registry: Arc<ConnectionRegistry>) -> Self {
        let cancel = connection.token().child_token();
        Self {
            connection,
            registry,
            cancel,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn peer(&self) -> &str {
        self.connection.peer()
    }

    /// Send `message` back on the connection the request arrived on.
    pub fn reply(&self, message: &Message) -> Result<()> {
        self.connection.send(message)
    }

    /// Send `message` to another connection of the same engine.
    pub fn send_to(&self, id: ConnectionId, message: &Message) -> Result<()> {
        self.registry.send(id, &message.to_json()?)
    }

    /// Remove the originating connection and close it.
    pub fn close(&self) {
        self.registry.remove(self.connection.id());
    }

    /// Cancelled when the originating connection closes.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Receives decoded messages.
///
/// Implemented for any `Fn(Context, Message) -> impl Future<Output = ()>`.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, cx: Context, message: Message) -> BoxFuture<'static, ()>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Context, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, cx: Context, message: Message) -> BoxFuture<'static, ()> {
        (self)(cx, message).boxed()
    }
}

/// Receives transport and decode errors that tore down a connection.
pub type ErrorHandler = Arc<dyn Fn(Error) + Send + Sync>;

pub(crate) fn report(handler: Option<&ErrorHandler>, connection: ConnectionId, err: Error) {
    match handler {
        Some(handler) => handler(err),
        None => debug!(connection, error = %err, "dropped connection error"),
    }
}

/// Bounded pool of handler tasks.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(max_handlers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_handlers.max(1))),
        }
    }

    /// Wait for a free slot, then run `handler` on its own task.
    pub async fn dispatch(&self, handler: Arc<dyn MessageHandler>, cx: Context, message: Message) {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("handler pool closed, dropping message");
                return;
            }
        };
        tokio::spawn(async move {
            handler.handle(cx, message).await;
            drop(permit);
        });
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Drive one connection's inbound side until it closes.
///
/// Every decoded message goes to `on_message`. A read failure, a frame that
/// is not text, or a message that does not decode is passed to `on_error`
/// and ends the loop. On exit the connection is removed from `registry`,
/// which closes it.
pub(crate) async fn read_loop<S, M, E, F, Fut>(
    conn: Connection,
    registry: Arc<ConnectionRegistry>,
    mut stream: S,
    mut on_message: F,
    on_error: Option<ErrorHandler>,
) where
    S: Stream<Item = std::result::Result<M, E>> + Unpin,
    M: WireMessage,
    E: Into<Error>,
    F: FnMut(Message) -> Fut,
    Fut: Future<Output = ()>,
{
    let id = conn.id();
    loop {
        let next = tokio::select! {
            _ = conn.cancelled() => break,
            next = next_text(&mut stream) => next,
        };
        let text = match next {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                report(on_error.as_ref(), id, e);
                break;
            }
            None => {
                debug!(connection = id, peer = conn.peer(), "peer closed");
                break;
            }
        };
        match Message::from_json(&text) {
            Ok(message) => {
                tokio::select! {
                    _ = conn.cancelled() => break,
                    _ = on_message(message) => {}
                }
            }
            Err(e) => {
                report(on_error.as_ref(), id, e);
                break;
            }
        }
    }
    registry.remove(id);
}
