//! Shared handle type returned by both the server- and client-side spawn
//! functions. `spec.md` §5's single-writer-per-control-channel invariant is
//! enforced structurally: the raw WebSocket sink is moved into one writer
//! task and never touched anywhere else. Callers only ever see a clonable
//! [`ControlChannel`] handle backed by an `mpsc::Sender`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

use sellia_proto::Message;

#[derive(Debug, Error)]
#[error("control channel is closed")]
pub struct ChannelClosed;

/// A handle to a control channel's single writer task. Cloning shares the
/// same outbound queue, closed flag, and shutdown signal; the underlying
/// connection is torn down once the writer task exits and every handle (and
/// its receiver) is dropped.
#[derive(Clone)]
pub struct ControlChannel {
    id: String,
    outbound: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl ControlChannel {
    pub(crate) fn new(
        id: String,
        outbound: mpsc::Sender<Message>,
        closed: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            outbound,
            closed,
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue `msg` for the writer task. Returns `Err` once the connection
    /// has gone away; callers should treat this the same as a disconnect.
    pub async fn send(&self, msg: Message) -> Result<(), ChannelClosed> {
        self.outbound.send(msg).await.map_err(|_| ChannelClosed)
    }

    /// Non-blocking variant for call sites that cannot await (e.g. a
    /// `Drop` impl's best-effort close notification).
    pub fn try_send(&self, msg: Message) -> Result<(), ChannelClosed> {
        self.outbound.try_send(msg).map_err(|_| ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Signals the writer and reader tasks to tear down the connection.
    /// Used by the heartbeat sweep to evict a stale connection without
    /// waiting for every clone of this handle to drop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }

    /// Builds a `ControlChannel` backed by a bare `mpsc` pair, with no
    /// writer task and no underlying socket. For tests in downstream
    /// crates that need a handle to hand to a `ConnectionManager` without
    /// dialing or accepting a real WebSocket.
    #[doc(hidden)]
    pub fn for_testing(id: impl Into<String>) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        (
            Self::new(id.into(), tx, Arc::new(AtomicBool::new(false)), Arc::new(Notify::new())),
            rx,
        )
    }
}

pub(crate) const OUTBOUND_QUEUE_DEPTH: usize = 256;
pub(crate) const INBOUND_QUEUE_DEPTH: usize = 256;
