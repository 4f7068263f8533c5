//! Bounded fire-and-forget channel drained by a background task.
//!
//! Senders never wait: when the channel is full the item is dropped and
//! counted. Used for side effects whose loss must not stall job execution.
//! [`Outbox::flush`] waits until everything sent before it has been handled.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum Envelope<T> {
    Item(T),
    Flush(oneshot::Sender<()>),
}

pub struct Outbox<T> {
    name: &'static str,
    tx: mpsc::Sender<Envelope<T>>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for Outbox<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<T: Send + 'static> Outbox<T> {
    /// Must be called from within a tokio runtime. The drain task ends once
    /// every clone of the outbox is dropped and the backlog is handled.
    pub fn spawn<F, Fut>(name: &'static str, capacity: usize, mut handler: F) -> (Self, JoinHandle<()>)
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match envelope {
                    Envelope::Item(item) => handler(item).await,
                    Envelope::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            log::debug!("Outbox '{}' drained", name);
        });
        (
            Self {
                name,
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    pub fn send(&self, item: T) {
        match self.tx.try_send(Envelope::Item(item)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "Outbox '{}' is full, dropped item ({} dropped so far)",
                    self.name,
                    dropped
                );
            }
            Err(TrySendError::Closed(_)) => {
                log::warn!("Outbox '{}' is closed, dropped item", self.name);
            }
        }
    }

    /// Waits until every item sent before this call has been handled.
    pub async fn flush(&self) {
        let (done, handled) = oneshot::channel();
        if self.tx.send(Envelope::Flush(done)).await.is_err() {
            log::warn!("Outbox '{}' is closed, nothing to flush", self.name);
            return;
        }
        let _ = handled.await;
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
