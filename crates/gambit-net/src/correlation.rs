//! Request/acknowledgement correlation.
//!
//! Each outgoing request gets a fresh id and a one-shot waiter. The reader
//! side hands every reply carrying `reply_to` to [`PendingRequests::resolve`].
//! A waiter is removed when it is resolved, when its [`PendingReply`] guard
//! is dropped (timeout or cancellation), or when [`PendingRequests::fail_all`]
//! runs on disconnect. A reply that arrives after its waiter is gone is
//! rejected so a cancelled operation can never be completed late.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::messages::Message;

/// Why a pending reply never arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("request abandoned: connection closed before a reply arrived")]
pub struct Abandoned;

/// Table of requests awaiting a reply.
pub struct PendingRequests {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Allocate a request id and register its waiter.
    pub fn register(self: &Arc<Self>) -> PendingReply {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        PendingReply {
            id,
            rx,
            table: Arc::clone(self),
        }
    }

    /// Deliver a reply. Returns `false` if nobody is waiting for `id`.
    pub fn resolve(&self, id: u64, message: Message) -> bool {
        let waiter = self.lock().remove(&id);
        match waiter {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter; their futures resolve to [`Abandoned`].
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        drained.len()
    }

    /// Number of requests still awaiting a reply.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cancel(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Message>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Future of a single reply. Dropping it deregisters the waiter.
pub struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<Message>,
    table: Arc<PendingRequests>,
}

impl PendingReply {
    /// The request id to put on the outgoing envelope.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Message, Abandoned>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map_err(|_| Abandoned)
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.cancel(self.id);
    }
}
