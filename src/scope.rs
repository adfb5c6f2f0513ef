//! Bookkeeping that keeps an arena from being reset while it is in use.
//!
//! Every job submitted against an arena *enters* that arena's scope when it is
//! allocated and *exits* once it has finished and run its completion callback.
//! Graphs enter when created and exit when dropped. Handle lookups enter for
//! the duration of the lookup. A reset waits until no one is inside, then holds
//! the scope closed while it runs, so an arena is never reclaimed underneath a
//! live reference.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_utils::CachePadded;

use crate::error::FrameError;

/// Set in `users` while a reset is running.
const RESETTING: usize = 1 << (usize::BITS - 1);

// -----------------------------------------------------------------------------
// Arena scope

/// Counts the live users of one arena.
pub struct ArenaScope {
    /// Jobs, graphs and lookups currently inside, plus the `RESETTING` bit.
    users: CachePadded<AtomicUsize>,
    /// Graphs currently alive. Each graph is also counted in `users`.
    graphs: AtomicUsize,
}

impl Default for ArenaScope {
    fn default() -> ArenaScope {
        ArenaScope {
            users: CachePadded::new(AtomicUsize::new(0)),
            graphs: AtomicUsize::new(0),
        }
    }
}

impl ArenaScope {
    /// Registers a user, waiting out any reset in progress.
    pub fn enter(&self) {
        loop {
            let previous = self.users.fetch_add(1, Ordering::Acquire);
            if previous & RESETTING == 0 {
                return;
            }
            self.users.fetch_sub(1, Ordering::Relaxed);
            while self.users.load(Ordering::Relaxed) & RESETTING != 0 {
                thread::yield_now();
            }
        }
    }

    /// Unregisters a user.
    pub fn exit(&self) {
        self.users.fetch_sub(1, Ordering::Release);
    }

    /// Enters the scope until the returned guard is dropped.
    pub fn guard(&self) -> ScopeGuard<'_> {
        self.enter();
        ScopeGuard { scope: self }
    }

    /// Registers a live graph.
    pub fn attach_graph(&self) {
        self.enter();
        self.graphs.fetch_add(1, Ordering::Relaxed);
    }

    /// Unregisters a live graph.
    pub fn detach_graph(&self) {
        self.graphs.fetch_sub(1, Ordering::Relaxed);
        self.exit();
    }

    /// Number of live graphs.
    pub fn live_graphs(&self) -> usize {
        self.graphs.load(Ordering::Relaxed)
    }

    /// Waits until the scope is empty, then runs `reset` with the scope held
    /// closed. Refuses immediately if any graph is alive, since graphs only
    /// leave when their owner drops them.
    pub fn reset_with<F>(&self, reset: F) -> Result<(), FrameError>
    where
        F: FnOnce(),
    {
        loop {
            // A graph enters `users` before it is counted in `graphs`, so if
            // the exchange below succeeds no graph can be alive.
            let count = self.live_graphs();
            if count > 0 {
                return Err(FrameError::LiveGraphs { count });
            }
            match self.users.compare_exchange_weak(
                0,
                RESETTING,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(_) => thread::yield_now(),
            }
        }
        reset();
        // Users that bounced off the closed scope may have left transient
        // increments behind, so clear the bit rather than storing zero.
        self.users.fetch_sub(RESETTING, Ordering::Release);
        Ok(())
    }
}

/// Exits an [`ArenaScope`] when dropped.
pub struct ScopeGuard<'a> {
    scope: &'a ArenaScope,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.scope.exit();
    }
}
