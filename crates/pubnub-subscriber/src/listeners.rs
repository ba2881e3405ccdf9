//! Listener registry: fan-out of decoded events and status notifications.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::types::{Envelope, EventKind, StatusChange};

/// Receives engine output. All methods have empty defaults; implement the
/// ones you care about.
///
/// Callbacks run on a per-listener worker task in registration order. A
/// callback that panics is caught and logged; it never disturbs other
/// listeners or the engine. Events may be dropped for a listener whose
/// callbacks fall behind, but status notifications never are.
pub trait EventListener: Send + Sync {
    fn on_message(&self, _envelope: &Envelope) {}
    fn on_signal(&self, _envelope: &Envelope) {}
    fn on_presence(&self, _envelope: &Envelope) {}
    fn on_object_update(&self, _envelope: &Envelope) {}
    fn on_message_action(&self, _envelope: &Envelope) {}
    fn on_status(&self, _status: &StatusChange) {}
}

/// Identifies a registered listener for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum QueueItem {
    Event(Arc<Envelope>),
    Status(Arc<StatusChange>),
    Flush(oneshot::Sender<()>),
}

struct Worker {
    tx: mpsc::Sender<QueueItem>,
    handle: JoinHandle<()>,
    dropped: Arc<AtomicU64>,
}

pub(crate) struct ListenerRegistry {
    workers: Mutex<HashMap<ListenerId, Worker>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl ListenerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ListenerId, Worker>> {
        match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.capacity);
        let handle = tokio::spawn(run_worker(id, listener, rx));
        let worker = Worker {
            tx,
            handle,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        self.lock().insert(id, worker);
        id
    }

    /// Remove a listener. The event currently being delivered to it (if
    /// any) completes; nothing further is delivered. Safe to call from
    /// inside the listener's own callback.
    pub fn remove(&self, id: ListenerId) {
        if let Some(worker) = self.lock().remove(&id) {
            // abort() takes effect at the next suspension point, so a sync
            // callback in progress always finishes its current event.
            worker.handle.abort();
        }
    }

    fn senders(&self) -> Vec<(ListenerId, mpsc::Sender<QueueItem>, Arc<AtomicU64>)> {
        self.lock()
            .iter()
            .map(|(id, w)| (*id, w.tx.clone(), w.dropped.clone()))
            .collect()
    }

    /// Queue an event for every listener. Non-blocking: a listener whose
    /// queue is full loses this event (counted and logged); other listeners
    /// and the engine loop are unaffected.
    pub fn dispatch_event(&self, envelope: Envelope) {
        let envelope = Arc::new(envelope);
        for (id, tx, dropped) in self.senders() {
            match tx.try_send(QueueItem::Event(envelope.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        listener = id.0,
                        total_dropped = total,
                        "listener queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Worker already gone; a concurrent remove() wins.
                }
            }
        }
    }

    /// Queue a status notification for every listener. Status must not be
    /// lost, so this waits for queue space instead of dropping.
    pub async fn dispatch_status(&self, status: StatusChange) {
        let status = Arc::new(status);
        for (_, tx, _) in self.senders() {
            let _ = tx.send(QueueItem::Status(status.clone())).await;
        }
    }

    /// Barrier: resolves once everything queued before this call has been
    /// handed to its listener.
    pub async fn flush(&self) {
        let mut acks = Vec::new();
        for (_, tx, _) in self.senders() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(QueueItem::Flush(ack_tx)).await.is_ok() {
                acks.push(ack_rx);
            }
        }
        for ack in acks {
            let _ = ack.await;
        }
    }

    /// Tear down all workers. Queued items are discarded.
    pub fn shutdown(&self) {
        for (_, worker) in self.lock().drain() {
            worker.handle.abort();
        }
    }
}

async fn run_worker(
    id: ListenerId,
    listener: Arc<dyn EventListener>,
    mut rx: mpsc::Receiver<QueueItem>,
) {
    while let Some(item) = rx.recv().await {
        let outcome = match item {
            QueueItem::Event(envelope) => {
                catch_unwind(AssertUnwindSafe(|| deliver(&*listener, &envelope)))
            }
            QueueItem::Status(status) => {
                catch_unwind(AssertUnwindSafe(|| listener.on_status(&status)))
            }
            QueueItem::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
        };
        if outcome.is_err() {
            tracing::warn!(listener = id.0, "listener callback panicked");
        }
    }
}

fn deliver(listener: &dyn EventListener, envelope: &Envelope) {
    match envelope.kind {
        EventKind::Message => listener.on_message(envelope),
        EventKind::Signal => listener.on_signal(envelope),
        EventKind::Presence => listener.on_presence(envelope),
        EventKind::ObjectUpdate => listener.on_object_update(envelope),
        EventKind::MessageAction => listener.on_message_action(envelope),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
