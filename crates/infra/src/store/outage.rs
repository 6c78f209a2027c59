//! Test double for store outages: wraps an [`InMemoryStore`] and fails every
//! transaction with [`StoreError::Unavailable`] while switched off.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{Capabilities, InMemoryStore, Store, StoreError, Txn};

#[derive(Debug, Clone)]
pub(crate) struct OutageStore {
    inner: Arc<InMemoryStore>,
    down: Arc<AtomicBool>,
}

impl OutageStore {
    pub(crate) fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

impl Store for OutageStore {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnMut(&mut Txn<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()).into());
        }
        self.inner.transact(f)
    }

    fn wait_for_change(&self, timeout: Duration) {
        self.inner.wait_for_change(timeout);
    }
}
