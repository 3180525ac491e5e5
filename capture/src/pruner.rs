//! Retention: on a fixed cadence, deletes events and sessions older than
//! the configured window. Runs beside the worker but never shares its
//! transactions or blocks ingress.

use std::sync::Arc;

use tokio::time::{interval_at, Duration, Instant};
use tracing::{debug, error};

use crate::store::Store;

pub struct Pruner {
    store: Arc<dyn Store>,
    prune_days: u32,
    check_period: Duration,
}

impl Pruner {
    pub fn new(store: Arc<dyn Store>, prune_days: u32, prune_check_hours: u64) -> Self {
        Pruner {
            store,
            prune_days,
            check_period: Duration::from_secs(prune_check_hours * 60 * 60),
        }
    }

    pub async fn run(self) {
        // First tick a full period out; pruning at startup would race the
        // migration-fresh pool for no benefit.
        let mut ticker = interval_at(Instant::now() + self.check_period, self.check_period);
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    /// One pruning pass. Errors are logged and retried at the next tick.
    pub async fn run_once(&self) {
        if self.prune_days == 0 {
            return;
        }
        debug!(days = self.prune_days, "pruning sessions and events");
        match self.store.prune_events(self.prune_days).await {
            Ok(deleted) => debug!(deleted, "pruned events"),
            Err(err) => error!(error = %err, "prune events error"),
        }
        match self.store.prune_sessions(self.prune_days).await {
            Ok(deleted) => debug!(deleted, "pruned sessions"),
            Err(err) => error!(error = %err, "prune sessions error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::store::StoreError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant as StdInstant;

    #[derive(Default)]
    struct CountingStore {
        event_prunes: AtomicU32,
        session_prunes: AtomicU32,
    }

    #[async_trait]
    impl Store for CountingStore {
        async fn save_events(
            &self,
            _events: &[Event],
            _batch_start: StdInstant,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn prune_events(&self, _days: u32) -> Result<u64, StoreError> {
            self.event_prunes.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        }

        async fn prune_sessions(&self, _days: u32) -> Result<u64, StoreError> {
            self.session_prunes.fetch_add(1, Ordering::SeqCst);
            Ok(2)
        }
    }

    #[tokio::test]
    async fn prunes_both_tables_when_enabled() {
        let store = Arc::new(CountingStore::default());
        let pruner = Pruner::new(store.clone(), 90, 24);
        pruner.run_once().await;
        assert_eq!(store.event_prunes.load(Ordering::SeqCst), 1);
        assert_eq!(store.session_prunes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_retention_disables_work() {
        let store = Arc::new(CountingStore::default());
        let pruner = Pruner::new(store.clone(), 0, 24);
        pruner.run_once().await;
        assert_eq!(store.event_prunes.load(Ordering::SeqCst), 0);
        assert_eq!(store.session_prunes.load(Ordering::SeqCst), 0);
    }
}
