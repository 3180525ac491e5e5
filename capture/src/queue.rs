//! Bounded handoff between the ingress path and the batching worker.
//!
//! Many concurrent handlers offer without blocking; the single worker
//! drains. The queue owns queued values, and its depth is tracked so the
//! worker can publish the `queue_utilization` gauge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("event queue full")]
    Full,
    #[error("event queue closed")]
    Closed,
}

#[derive(Clone, Debug)]
pub struct QueueSender<T> {
    sender: Sender<T>,
    depth: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct QueueReceiver<T> {
    receiver: Receiver<T>,
    depth: Arc<AtomicUsize>,
}

/// Creates a fixed-capacity queue. `capacity` must be non-zero.
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (
        QueueSender {
            sender: tx,
            depth: Arc::clone(&depth),
        },
        QueueReceiver {
            receiver: rx,
            depth,
        },
    )
}

impl<T> QueueSender<T> {
    /// Non-blocking offer; a full queue is reported, never waited on.
    pub fn try_send(&self, item: T) -> Result<(), QueueError> {
        match self.sender.try_send(item) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(QueueError::Full),
            Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> QueueReceiver<T> {
    /// Blocks until an item arrives; `None` once all senders are gone.
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.receiver.recv().await;
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offers_fail_once_capacity_is_reached() {
        let (tx, mut rx) = bounded::<u32>(2);
        assert_eq!(tx.try_send(1), Ok(()));
        assert_eq!(tx.try_send(2), Ok(()));
        assert_eq!(tx.try_send(3), Err(QueueError::Full));
        assert_eq!(tx.len(), 2);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(tx.try_send(3), Ok(()));
    }

    #[tokio::test]
    async fn depth_tracks_sends_and_receives() {
        let (tx, mut rx) = bounded::<u32>(8);
        for i in 0..5 {
            tx.try_send(i).unwrap();
        }
        assert_eq!(rx.len(), 5);
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(rx.len(), 3);
    }

    #[tokio::test]
    async fn recv_returns_none_when_senders_drop() {
        let (tx, mut rx) = bounded::<u32>(1);
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }
}
