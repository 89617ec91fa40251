use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};

use crate::config::OverflowPolicy;
use crate::error::{Result, VcsError};
use crate::model::Change;

/// Receives every change recorded by a `ChangeTracker`.
///
/// Invocations for one listener are serialized in recording order. A
/// returned error or a panic is logged and does not affect other listeners.
#[async_trait::async_trait]
pub trait ChangeListener: Send + Sync + 'static {
    async fn on_change(&self, change: &Change) -> anyhow::Result<()>;
}

/// Wraps a plain closure as a listener.
pub struct FnListener<F>(pub F);

#[async_trait::async_trait]
impl<F> ChangeListener for FnListener<F>
where
    F: Fn(&Change) + Send + Sync + 'static,
{
    async fn on_change(&self, change: &Change) -> anyhow::Result<()> {
        (self.0)(change);
        Ok(())
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum Outbox {
    /// Bounded ring; a lagging listener loses the oldest entries
    Ring(broadcast::Sender<Change>),
    /// Bounded queue; publishing waits for space
    Queue(mpsc::Sender<Change>),
}

struct Subscriber {
    id: SubscriptionId,
    outbox: Outbox,
}

/// Fan-out of recorded changes to listener workers.
pub struct ListenerHub {
    capacity: usize,
    policy: OverflowPolicy,
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl ListenerHub {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener and start its worker on the current Tokio runtime.
    ///
    /// Fails with `InvalidState` when called outside a runtime.
    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) -> Result<SubscriptionId> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            VcsError::InvalidState("listeners need a Tokio runtime to run on".to_string())
        })?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        // workers exit once their outbox is dropped
        let outbox = match self.policy {
            OverflowPolicy::DropOldest => {
                let (tx, rx) = broadcast::channel(self.capacity);
                runtime.spawn(ring_worker(id, listener, rx));
                Outbox::Ring(tx)
            }
            OverflowPolicy::Block => {
                let (tx, rx) = mpsc::channel(self.capacity);
                runtime.spawn(queue_worker(id, listener, rx));
                Outbox::Queue(tx)
            }
        };
        self.subscribers.write().push(Subscriber { id, outbox });
        log::debug!("Listener {:?} subscribed", id);
        Ok(id)
    }

    /// Remove a listener. Changes already queued for it are still delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|sub| sub.id != id);
        before != subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Hand a change to every listener's outbox.
    pub async fn publish(&self, change: &Change) {
        let mut queues = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for sub in subscribers.iter() {
                match &sub.outbox {
                    // an error means the worker is gone
                    Outbox::Ring(tx) => {
                        let _ = tx.send(change.clone());
                    }
                    Outbox::Queue(tx) => queues.push((sub.id, tx.clone())),
                }
            }
        }

        for (id, tx) in queues {
            if tx.send(change.clone()).await.is_err() {
                log::debug!("Listener {:?} stopped before delivery", id);
            }
        }
    }
}

async fn ring_worker(
    id: SubscriptionId,
    listener: Arc<dyn ChangeListener>,
    mut rx: broadcast::Receiver<Change>,
) {
    loop {
        match rx.recv().await {
            Ok(change) => deliver(id, &listener, change).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Listener {:?} fell behind; dropped {} oldest changes", id, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    log::debug!("Listener {:?} worker stopped", id);
}

async fn queue_worker(id: SubscriptionId, listener: Arc<dyn ChangeListener>, mut rx: mpsc::Receiver<Change>) {
    while let Some(change) = rx.recv().await {
        deliver(id, &listener, change).await;
    }
    log::debug!("Listener {:?} worker stopped", id);
}

/// Run one invocation in its own task so a panic stays contained.
async fn deliver(id: SubscriptionId, listener: &Arc<dyn ChangeListener>, change: Change) {
    let listener = listener.clone();
    let change_id = change.id.clone();
    let outcome = tokio::spawn(async move { listener.on_change(&change).await }).await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Listener {:?} failed on change {}: {:#}", id, change_id, e),
        Err(e) if e.is_panic() => log::error!("Listener {:?} panicked on change {}", id, change_id),
        Err(e) => log::warn!("Listener {:?} task for change {} ended: {}", id, change_id, e),
    }
}
