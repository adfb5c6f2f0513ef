//! Worker threads and the job execution protocol.

use alloc::sync::Arc;
use core::cell::Cell;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::thread_local;

use tracing::{debug, debug_span, error, trace, trace_span};

use crate::arena::Arena;
use crate::job::{Job, JobContext, JobFlags};
use crate::system::Scheduler;
use crate::unwind::{self, AbortOnDrop};

// -----------------------------------------------------------------------------
// Worker thread data

thread_local! {
    static WORKER_PTR: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

/// The state of one worker thread.
///
/// Each worker owns a scratch arena, which is the thread's current arena while
/// a job runs and is reset after each top-level job, and reads from its own
/// local queue before the scheduler's shared queues.
pub struct Worker {
    index: usize,
    scratch: Arena,
    scheduler: Arc<Scheduler>,
    /// How many jobs are currently executing on this thread. Greater than one
    /// while a job waits and helps with other work.
    depth: Cell<u32>,
}

impl Worker {
    /// Calls the provided closure on the thread's worker, if it has one.
    #[inline]
    pub fn map_current<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&Worker) -> R,
    {
        let worker_ptr = WORKER_PTR.with(Cell::get);
        if worker_ptr.is_null() {
            None
        } else {
            // SAFETY: The pointer is only set by `occupy`, to a worker that
            // stays on the stack of this thread until `occupy` returns and
            // resets it. The reference is passed to a closure so it cannot
            // outlive that.
            Some(f(unsafe { &*worker_ptr }))
        }
    }

    /// Registers this worker as the thread's worker while `f` runs.
    fn occupy<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Worker) -> R,
    {
        let outer_ptr = WORKER_PTR.with(|ptr| ptr.replace(self));
        let result = f(self);
        WORKER_PTR.with(|ptr| ptr.set(outer_ptr));
        result
    }

    /// Returns true if this worker runs jobs for `scheduler`.
    pub fn belongs_to(&self, scheduler: &Scheduler) -> bool {
        ptr::eq(&*self.scheduler, scheduler)
    }

    /// Looks for a job: the local queue first, then the scheduler.
    #[inline]
    pub fn find_work(&self) -> Option<Job> {
        self.scheduler
            .local_queue(self.index)
            .and_then(|queue| queue.try_dequeue())
            .or_else(|| self.scheduler.next_job())
    }

    /// Runs one job, if one can be found. Returns true if a job was run.
    pub fn help(&self) -> bool {
        match self.find_work() {
            Some(job) => {
                self.execute(job);
                true
            }
            None => false,
        }
    }

    /// Executes a job to completion on this thread.
    pub fn execute(&self, job: Job) {
        let depth = self.depth.get();
        self.depth.set(depth + 1);
        let keep_scratch = job.flags().contains(JobFlags::SKIP_ARENA_RESET);

        self.scratch
            .enter(|| execute_job(&self.scheduler, &self.scratch, self.index, job));

        self.depth.set(depth);
        if depth == 0 && !keep_scratch {
            // SAFETY: No job is running on this thread, and job contexts
            // borrow the scratch arena only for the duration of the job, so
            // nothing references it.
            unsafe { self.scratch.reset_unchecked() };
        }
    }
}

// -----------------------------------------------------------------------------
// Execution protocol

/// Runs the body, records the terminal state, calls the completion callback,
/// then releases the job's arena scope. Each step happens strictly after the
/// previous one, so anyone who observes the terminal state also observes the
/// job's effects, and the arena outlives the callback.
fn execute_job(scheduler: &Arc<Scheduler>, scratch: &Arena, worker: usize, job: Job) {
    let flags = job.flags();
    let _span = flags
        .contains(JobFlags::DEBUG_TRACE)
        .then(|| debug_span!("job", worker, ?flags).entered());

    // SAFETY: The control block lives in the job's arena, which cannot be
    // reset while the job is in flight.
    let control = job.control().map(|control| unsafe { control.as_ref() });
    let arena = job.memory_class().map(|class| scheduler.arena(class));
    let cx = JobContext::new(scheduler, scratch, arena, control, worker, flags);

    if let Some(control) = control {
        control.mark_running();
    }
    if flags.contains(JobFlags::DEBUG_TRACE) {
        debug!("job started");
    }

    // SAFETY: Jobs are only executed once, by the worker that dequeued them,
    // and their data is kept alive by the arena scope.
    match unwind::halt_unwinding(|| unsafe { job.run_body(&cx) }) {
        Ok(()) => {
            let state = control.map(|control| control.finish());
            if flags.contains(JobFlags::DEBUG_TRACE) {
                debug!(?state, "job finished");
            }
        }
        Err(payload) => {
            error!(
                worker,
                panic = unwind::payload_message(&*payload),
                "job panicked"
            );
            if let Some(control) = control {
                control.finish_panicked();
            }
        }
    }

    if let Some(on_complete) = job.on_complete() {
        let abort_guard = AbortOnDrop;
        // SAFETY: The job's data is still alive, see above.
        unsafe { on_complete(job.data()) };
        mem::forget(abort_guard);
    }

    if let Some(class) = job.scope() {
        scheduler.scope(class).exit();
    }
}

// -----------------------------------------------------------------------------
// Main worker loop

/// This is the main loop for a worker thread. Workers finish their local queue
/// before taking shared work, and yield when there is none. After enough empty
/// polls they park until new work is submitted. On shutdown a worker abandons
/// whatever is left in its local queue before it exits.
pub fn main_loop(index: usize, scheduler: Arc<Scheduler>, scratch: Arena, halt: Arc<AtomicBool>) {
    let span = trace_span!("worker", index);
    let _enter = span.enter();
    trace!("starting worker");

    let worker = Worker {
        index,
        scratch,
        scheduler,
        depth: Cell::new(0),
    };

    worker.occupy(|worker| {
        let sleep = worker.scheduler.sleep();
        let idle_polls = worker.scheduler.idle_polls();
        let mut idle = 0;
        loop {
            let ticket = sleep.ticket();
            if halt.load(Ordering::SeqCst) || worker.scheduler.is_shut_down() {
                // Pinned jobs are only reachable from here. Abandon them so
                // that anyone waiting on one is released.
                if let Some(local) = worker.scheduler.local_queue(worker.index) {
                    let abandoned = worker.scheduler.abandon_queued(local);
                    trace!(abandoned, "abandoned pinned jobs");
                }
                break;
            }

            if let Some(job) = worker.find_work() {
                worker.execute(job);
                idle = 0;
                continue;
            }

            idle += 1;
            if idle < idle_polls {
                thread::yield_now();
                continue;
            }

            trace!("parking idle worker");
            sleep.sleep(ticket);
            idle = 0;
        }
    });

    trace!("exiting worker");
}
