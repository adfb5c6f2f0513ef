//! Parking for idle workers.
//!
//! Idle workers sleep on a futex keyed to a *work epoch*. Submitters bump the
//! epoch after publishing work and wake sleepers. A worker takes a ticket (the
//! current epoch) before it searches the queues, and only parks if the epoch
//! still matches its ticket, so a submission that races with the search can
//! never be missed.

use core::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

/// Used to park and unpark idle workers.
pub struct IdleSleep {
    /// Bumped on every notification. Sleepers wait on this word.
    epoch: CachePadded<AtomicU32>,
    /// The number of workers currently parked, or about to park.
    sleepers: CachePadded<AtomicU32>,
}

impl Default for IdleSleep {
    fn default() -> IdleSleep {
        IdleSleep {
            epoch: CachePadded::new(AtomicU32::new(0)),
            sleepers: CachePadded::new(AtomicU32::new(0)),
        }
    }
}

impl IdleSleep {
    /// Reads the work epoch. Call this before looking for work, and pass the
    /// result to [`IdleSleep::sleep`] if none was found.
    #[inline(always)]
    pub fn ticket(&self) -> u32 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Parks the calling thread until the epoch moves past `ticket`. May return
    /// spuriously.
    pub fn sleep(&self, ticket: u32) {
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        atomic_wait::wait(&*self.epoch, ticket);
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Publishes new work and wakes one parked thread.
    #[inline(always)]
    pub fn notify_one(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            atomic_wait::wake_one(&*self.epoch);
        }
    }

    /// Publishes new work and wakes every parked thread.
    pub fn notify_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            atomic_wait::wake_all(&*self.epoch);
        }
    }
}
