//! Detached units of work.
//!
//! Handlers hand cluster-bound work to a [`DetachedUnits`] registry instead of
//! spawning fire-and-forget tasks. Each unit gets its own cancellation signal,
//! and its result stays observable through [`DetachedUnits::join`] until it is
//! reaped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

/// Cancellation signal handed to a unit.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// registry entry was dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

struct Unit<T> {
    handle: JoinHandle<T>,
    cancel: watch::Sender<bool>,
}

/// Registry of running units keyed by task id.
pub struct DetachedUnits<T> {
    units: Arc<Mutex<HashMap<String, Unit<T>>>>,
}

impl<T> Clone for DetachedUnits<T> {
    fn clone(&self) -> Self {
        Self {
            units: Arc::clone(&self.units),
        }
    }
}

impl<T> Default for DetachedUnits<T> {
    fn default() -> Self {
        Self {
            units: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Send + 'static> DetachedUnits<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a unit under `key`.
    ///
    /// Returns `false` without spawning if a unit with the same key is still
    /// running. Finished units are reaped first.
    pub fn spawn<F, Fut>(&self, key: impl Into<String>, work: F) -> bool
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let key = key.into();
        let Ok(mut units) = self.units.lock() else {
            warn!(key = %key, "Unit registry lock poisoned");
            return false;
        };
        units.retain(|_, unit| !unit.handle.is_finished());
        if units.contains_key(&key) {
            debug!(key = %key, "Unit already running");
            return false;
        }

        let (cancel, rx) = watch::channel(false);
        let handle = tokio::spawn(work(CancelSignal { rx }));
        units.insert(key, Unit { handle, cancel });
        true
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.units
            .lock()
            .map(|u| u.get(key).is_some_and(|unit| !unit.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Request cancellation. Returns whether a unit was found.
    pub fn cancel(&self, key: &str) -> bool {
        let Ok(units) = self.units.lock() else {
            return false;
        };
        match units.get(key) {
            Some(unit) => unit.cancel.send(true).is_ok(),
            None => false,
        }
    }

    /// Wait for the unit under `key` and take its result.
    pub async fn join(&self, key: &str) -> Option<Result<T, JoinError>> {
        let unit = self.units.lock().ok()?.remove(key)?;
        Some(unit.handle.await)
    }

    /// Number of tracked units, finished or not.
    pub fn len(&self) -> usize {
        self.units.lock().map(|u| u.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
