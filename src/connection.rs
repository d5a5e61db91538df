//! Open connections and the registry that owns them.
//!
//! Each [`Connection`] is a cheap handle: frames are queued on a bounded
//! channel drained by a writer task that owns the socket's sink, so callers
//! never wait on the network and never touch the socket while holding the
//! registry lock. A peer that stops reading fills its queue and is dropped.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    message::Message,
    transport::WireMessage,
};

pub type ConnectionId = u64;

/// Frames a connection may have waiting before it counts as stalled.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
enum Outbound {
    Text(Arc<str>),
    Close,
}

/// Handle to one open WebSocket.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    peer: Arc<str>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    abort: CancellationToken,
}

impl Connection {
    /// Start the writer task for `sink` with the default queue size.
    pub fn spawn<S, M>(sink: S, peer: impl Into<Arc<str>>, parent: &CancellationToken) -> Self
    where
        S: Sink<M> + Unpin + Send + 'static,
        S::Error: Into<Error>,
        M: WireMessage,
    {
        Self::spawn_with_capacity(sink, peer, parent, DEFAULT_OUTBOUND_CAPACITY)
    }

    /// Start the writer task for `sink` and return a handle to it.
    ///
    /// At most `capacity` frames wait in the queue. The connection is
    /// cancelled together with `parent`.
    pub fn spawn_with_capacity<S, M>(
        sink: S,
        peer: impl Into<Arc<str>>,
        parent: &CancellationToken,
        capacity: usize,
    ) -> Self
    where
        S: Sink<M> + Unpin + Send + 'static,
        S::Error: Into<Error>,
        M: WireMessage,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            outbound: tx,
            cancel: parent.child_token(),
            abort: CancellationToken::new(),
        };
        tokio::spawn(write_loop(
            conn.id,
            sink,
            rx,
            conn.cancel.clone(),
            conn.abort.clone(),
        ));
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address or URL.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a raw text frame.
    ///
    /// Fails without waiting when the queue is full; the connection is then
    /// torn down without flushing.
    pub fn send_text(&self, text: impl Into<Arc<str>>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.closed());
        }
        match self.outbound.try_send(Outbound::Text(text.into())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(connection = self.id, peer = %self.peer, "outbound queue full, dropping connection");
                self.abort.cancel();
                self.cancel.cancel();
                Err(Error::Transport(format!(
                    "connection {} is not keeping up",
                    self.id
                )))
            }
            Err(TrySendError::Closed(_)) => Err(self.closed()),
        }
    }

    /// Queue a protocol message.
    pub fn send(&self, message: &Message) -> Result<()> {
        self.send_text(message.to_json()?)
    }

    /// Flush queued frames, send a normal close and stop the read loop.
    pub fn close(&self) {
        let _ = self.outbound.try_send(Outbound::Close);
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection is closed or its parent is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn closed(&self) -> Error {
        Error::Transport(format!("connection {} is closed", self.id))
    }
}

async fn write_loop<S, M>(
    id: ConnectionId,
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    abort: CancellationToken,
) where
    S: Sink<M> + Unpin,
    S::Error: Into<Error>,
    M: WireMessage,
{
    let drain = async {
        loop {
            let next = tokio::select! {
                biased;
                next = rx.recv() => next,
                _ = cancel.cancelled() => None,
            };
            match next {
                Some(Outbound::Text(text)) => sink
                    .send(M::text(text.to_string()))
                    .await
                    .map_err(Into::<Error>::into)?,
                Some(Outbound::Close) | None => break,
            }
        }
        sink.send(M::close_normal())
            .await
            .map_err(Into::<Error>::into)?;
        sink.close().await.map_err(Into::<Error>::into)
    };
    tokio::select! {
        res = drain => match res {
            Ok(()) => debug!(connection = id, "writer closed"),
            Err(e) => {
                debug!(connection = id, error = %e, "write failed");
                cancel.cancel();
            }
        },
        _ = abort.cancelled() => debug!(connection = id, "writer aborted"),
    }
}

/// Set of open connections keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conns: Mutex<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, conn: Connection) {
        self.lock().insert(conn.id(), conn);
    }

    /// Remove and close a connection. Returns `false` if it was already gone.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut conns = self.lock();
        match conns.remove(&id) {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.lock().get(&id).cloned()
    }

    /// Queue `text` on every open connection and return how many accepted it.
    pub fn broadcast(&self, text: &str) -> usize {
        let text: Arc<str> = Arc::from(text);
        let snapshot: Vec<Connection> = self.lock().values().cloned().collect();
        snapshot
            .iter()
            .filter(|conn| match conn.send_text(text.clone()) {
                Ok(()) => true,
                Err(e) => {
                    debug!(connection = conn.id(), error = %e, "broadcast skipped");
                    false
                }
            })
            .count()
    }

    /// Queue `text` on one connection.
    pub fn send(&self, id: ConnectionId, text: &str) -> Result<()> {
        self.get(id)
            .ok_or(Error::UnknownConnection(id))?
            .send_text(text)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remove and close every connection.
    pub fn close_all(&self) {
        for (_, conn) in self.lock().drain() {
            conn.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures_channel::mpsc as fmpsc;
    use futures_util::StreamExt;
    use std::{
        pin::Pin,
        task::{Context as TaskContext, Poll},
    };
    use tokio_tungstenite::tungstenite::Message as TMsg;

    /// Sink whose peer never reads.
    struct StalledSink;

    impl Sink<TMsg> for StalledSink {
        type Error = Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Result<()>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: TMsg) -> Result<()> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Result<()>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Result<()>> {
            Poll::Pending
        }
    }

    /// Connection whose writer feeds an in-memory channel.
    pub(crate) fn memory_connection(
        parent: &CancellationToken,
    ) -> (Connection, fmpsc::UnboundedReceiver<TMsg>) {
        let (tx, rx) = fmpsc::unbounded::<TMsg>();
        let sink = tx.sink_map_err(|e| Error::Transport(e.to_string()));
        (Connection::spawn(sink, "memory", parent), rx)
    }

    #[tokio::test]
    async fn broadcast_reaches_registered_connections_once() {
        let root = CancellationToken::new();
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = memory_connection(&root);
        let id = conn.id();
        registry.add(conn);

        assert_eq!(registry.broadcast("[\"NOTICE\",\"hi\"]"), 1);
        assert_eq!(
            rx.next().await.unwrap(),
            TMsg::Text("[\"NOTICE\",\"hi\"]".into())
        );

        assert!(registry.remove(id));
        assert_eq!(registry.broadcast("[\"NOTICE\",\"again\"]"), 0);
        match rx.next().await.unwrap() {
            TMsg::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1000),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn stalled_peer_is_dropped_when_queue_fills() {
        let root = CancellationToken::new();
        let registry = ConnectionRegistry::new();
        let conn = Connection::spawn_with_capacity(StalledSink, "stalled", &root, 4);
        registry.add(conn.clone());

        let frame = "x".repeat(1024);
        let accepted: usize = (0..10_000).map(|_| registry.broadcast(&frame)).sum();
        assert!((4..=5).contains(&accepted), "accepted {accepted} frames");
        assert!(conn.is_closed());
        assert!(conn.send_text("late").is_err());
        assert_eq!(registry.broadcast(&frame), 0);
    }

    #[tokio::test]
    async fn double_remove_is_noop() {
        let root = CancellationToken::new();
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = memory_connection(&root);
        let id = conn.id();
        registry.add(conn);
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn send_to_unknown_connection_fails() {
        let registry = ConnectionRegistry::new();
        assert!(matches!(
            registry.send(42_000_000, "x"),
            Err(Error::UnknownConnection(42_000_000))
        ));
    }

    #[tokio::test]
    async fn queued_frames_flush_before_close() {
        let root = CancellationToken::new();
        let (conn, mut rx) = memory_connection(&root);
        conn.send(&Message::notice("bye")).unwrap();
        conn.close();
        assert!(conn.send(&Message::notice("late")).is_err());
        assert_eq!(
            rx.next().await.unwrap(),
            TMsg::Text("[\"NOTICE\",\"bye\"]".into())
        );
        assert!(matches!(rx.next().await.unwrap(), TMsg::Close(_)));
    }

    #[tokio::test]
    async fn close_all_and_parent_cancellation() {
        let root = CancellationToken::new();
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = memory_connection(&root);
        let (b, mut rx_b) = memory_connection(&root);
        let (a_id, b_id) = (a.id(), b.id());
        registry.add(a.clone());
        registry.add(b.clone());
        let mut ids = vec![a_id, b_id];
        ids.sort_unstable();
        assert_eq!(registry.ids(), ids);

        root.cancel();
        assert!(a.is_closed() && b.is_closed());
        assert!(matches!(rx_b.next().await.unwrap(), TMsg::Close(_)));

        registry.close_all();
        assert!(registry.is_empty());
    }
}
