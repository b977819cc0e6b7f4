//! Per-identity exclusion for mutating passes.
//!
//! At most one mutating pass runs per resource name; passes on different
//! names never wait for each other.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::context::{Interrupt, PassContext};

/// Table of per-name locks, created on demand and pruned when idle.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `name`.
    ///
    /// # Errors
    ///
    /// Returns the [`Interrupt`] if the pass is cancelled or times out while
    /// waiting.
    pub async fn acquire(&self, name: &str, ctx: &PassContext) -> Result<PassGuard, Interrupt> {
        ctx.check()?;
        let lock = Arc::clone(
            self.locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );

        let guard = tokio::select! {
            biased;
            () = ctx.token().cancelled() => return Err(Interrupt::Cancelled),
            () = tokio::time::sleep(ctx.remaining()) => return Err(Interrupt::DeadlineExceeded),
            guard = lock.lock_owned() => guard,
        };
        debug!(name = %name, "Acquired pass lock");

        Ok(PassGuard {
            name: name.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        })
    }

    /// Number of names with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no lock entries exist.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one name; released on drop.
#[derive(Debug)]
pub struct PassGuard {
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl PassGuard {
    /// The locked name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The table and this guard held the only handles: nobody waits.
        self.locks
            .remove_if(&self.name, |_, lock| Arc::strong_count(lock) == 1);
    }
}
