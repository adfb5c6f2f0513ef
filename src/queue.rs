//! A fixed-capacity multi-producer multi-consumer queue.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use crossbeam_queue::ArrayQueue;

/// The reason a [`BoundedQueue::try_enqueue`] call failed. Both variants hand
/// the rejected value back.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError<T> {
    /// The queue is at capacity. This is transient.
    Full(T),
    /// The queue was closed and accepts nothing more.
    Closed(T),
}

impl<T> EnqueueError<T> {
    /// Returns the value that could not be enqueued.
    pub fn into_inner(self) -> T {
        match self {
            EnqueueError::Full(value) | EnqueueError::Closed(value) => value,
        }
    }
}

/// A bounded FIFO queue that never blocks.
///
/// Any number of threads may push and pop concurrently. Once closed, pushes
/// are refused but items already queued can still be popped. Closing is
/// linearized with pushes: when [`close`](BoundedQueue::close) returns, every
/// push has either landed in the queue or been refused.
///
/// ```
/// use gantry::{BoundedQueue, EnqueueError};
///
/// let queue = BoundedQueue::new(2);
/// queue.try_enqueue(1).unwrap();
/// queue.try_enqueue(2).unwrap();
/// assert_eq!(queue.try_enqueue(3), Err(EnqueueError::Full(3)));
///
/// queue.close();
/// assert_eq!(queue.try_dequeue(), Some(1));
/// assert_eq!(queue.try_enqueue(4), Err(EnqueueError::Closed(4)));
/// ```
pub struct BoundedQueue<T> {
    items: ArrayQueue<T>,
    closed: AtomicBool,
    /// Pushes that have passed the `closed` check and not yet finished.
    pushing: AtomicUsize,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items. A capacity of zero is
    /// rounded up to one.
    pub fn new(capacity: usize) -> BoundedQueue<T> {
        BoundedQueue {
            items: ArrayQueue::new(capacity.max(1)),
            closed: AtomicBool::new(false),
            pushing: AtomicUsize::new(0),
        }
    }

    /// Pushes `value` onto the back of the queue.
    #[inline]
    pub fn try_enqueue(&self, value: T) -> Result<(), EnqueueError<T>> {
        // Announce the push before checking `closed`. Paired with `close`,
        // which sets `closed` before reading `pushing`, at least one side sees
        // the other.
        self.pushing.fetch_add(1, Ordering::SeqCst);
        let result = if self.closed.load(Ordering::SeqCst) {
            Err(EnqueueError::Closed(value))
        } else {
            self.items.push(value).map_err(EnqueueError::Full)
        };
        self.pushing.fetch_sub(1, Ordering::Release);
        result
    }

    /// Pops from the front of the queue.
    #[inline]
    pub fn try_dequeue(&self) -> Option<T> {
        self.items.pop()
    }

    /// Refuses all further pushes, then waits for pushes already past the
    /// check to land.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        while self.pushing.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of queued items. Only a snapshot under concurrent use.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing is queued. Only a snapshot under concurrent use.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of queued items.
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}
