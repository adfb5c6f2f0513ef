//! This module contains the [`JobSystem`], which owns the worker threads, and
//! the [`Scheduler`] they share: queues, arenas, and every operation for
//! submitting, waiting on and cancelling work.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace, warn};

use crate::arena::Arena;
use crate::error::{AllocError, FrameError, GraphError, SystemError};
use crate::graph::JobGraph;
use crate::job::{ArenaJob, Job, JobContext, JobControlBlock, JobFlags, JobHandle, JobState};
use crate::queue::{BoundedQueue, EnqueueError};
use crate::scope::ArenaScope;
use crate::sleep::IdleSleep;
use crate::worker::{self, Worker};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Scratch arenas are carved from the internal arena at this alignment.
const SCRATCH_ALIGN: usize = 16;

/// Identifies schedulers, so handles can't be used with the wrong one.
static NEXT_SYSTEM_ID: AtomicU32 = AtomicU32::new(1);

// -----------------------------------------------------------------------------
// Memory classes

/// The two arenas every job and graph is allocated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// Reclaimed at every [`JobSystem::end_frame`]. For per-frame work.
    Frame,
    /// Reclaimed only by [`JobSystem::reset_long_lived`]. For recurring or
    /// background work.
    LongLived,
}

// -----------------------------------------------------------------------------
// Configuration

/// Sizes and counts used to build a [`JobSystem`].
///
/// ```
/// use gantry::Config;
///
/// let config = Config::default()
///     .with_workers(4)
///     .with_frame_arena_size(4 * 1024 * 1024)
///     .with_graph_capacity(1024);
/// assert_eq!(config.workers, 4);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of worker threads. Zero is allowed: jobs are then only executed
    /// by threads that wait on them from inside a worker, which means never.
    /// Useful for inspecting queue contents in tests.
    pub workers: usize,
    /// Bytes reserved for the frame arena.
    pub frame_arena_size: usize,
    /// Bytes reserved for the long-lived arena.
    pub long_lived_arena_size: usize,
    /// Bytes reserved for each worker's scratch arena.
    pub worker_arena_size: usize,
    /// Capacity of each worker's local queue.
    pub local_queue_capacity: usize,
    /// Capacity of the global queue.
    pub global_queue_capacity: usize,
    /// Capacity of the high-priority queue.
    pub priority_queue_capacity: usize,
    /// Node capacity of graphs made by [`Scheduler::create_graph`].
    pub graph_capacity: usize,
    /// Empty polls (each followed by a yield) before an idle worker parks.
    pub idle_polls: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            workers: thread::available_parallelism().map_or(1, usize::from),
            frame_arena_size: MIB,
            long_lived_arena_size: MIB,
            worker_arena_size: 512 * KIB,
            local_queue_capacity: 256,
            global_queue_capacity: 512,
            priority_queue_capacity: 512,
            graph_capacity: 256,
            idle_polls: 64,
        }
    }
}

impl Config {
    /// Sets the number of worker threads.
    pub fn with_workers(mut self, workers: usize) -> Config {
        self.workers = workers;
        self
    }

    /// Sets the size of the frame arena.
    pub fn with_frame_arena_size(mut self, bytes: usize) -> Config {
        self.frame_arena_size = bytes;
        self
    }

    /// Sets the size of the long-lived arena.
    pub fn with_long_lived_arena_size(mut self, bytes: usize) -> Config {
        self.long_lived_arena_size = bytes;
        self
    }

    /// Sets the size of each worker's scratch arena.
    pub fn with_worker_arena_size(mut self, bytes: usize) -> Config {
        self.worker_arena_size = bytes;
        self
    }

    /// Sets the capacity of the global and high-priority queues.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Config {
        self.global_queue_capacity = capacity;
        self.priority_queue_capacity = capacity;
        self
    }

    /// Sets the capacity of each worker's local queue.
    pub fn with_local_queue_capacity(mut self, capacity: usize) -> Config {
        self.local_queue_capacity = capacity;
        self
    }

    /// Sets the default node capacity of graphs.
    pub fn with_graph_capacity(mut self, capacity: usize) -> Config {
        self.graph_capacity = capacity;
        self
    }

    /// Sets how many empty polls an idle worker makes before parking.
    pub fn with_idle_polls(mut self, polls: u32) -> Config {
        self.idle_polls = polls;
        self
    }
}

// -----------------------------------------------------------------------------
// Scheduler

/// The state shared by a [`JobSystem`], its workers and its graphs.
///
/// A `Scheduler` is reached by dereferencing a `JobSystem`, or from inside a
/// job through [`JobContext::scheduler`].
pub struct Scheduler {
    id: u32,
    frame: Arena,
    long_lived: Arena,
    /// Backs the workers' scratch arenas. Never reset.
    internal: Arena,
    frame_scope: ArenaScope,
    long_lived_scope: ArenaScope,
    global: BoundedQueue<Job>,
    priority: BoundedQueue<Job>,
    locals: Vec<BoundedQueue<Job>>,
    sleep: IdleSleep,
    /// Set once every queue has been closed.
    shut_down: AtomicBool,
    next_job_id: AtomicU32,
    graph_capacity: usize,
    idle_polls: u32,
}

impl Scheduler {
    fn new(config: &Config) -> Result<Scheduler, SystemError> {
        let internal_size = config
            .worker_arena_size
            .checked_next_multiple_of(SCRATCH_ALIGN)
            .and_then(|size| size.checked_mul(config.workers))
            .ok_or(AllocError {
                requested: usize::MAX,
                align: SCRATCH_ALIGN,
                remaining: 0,
                capacity: 0,
            })?;
        Ok(Scheduler {
            id: NEXT_SYSTEM_ID.fetch_add(1, Ordering::Relaxed),
            frame: Arena::try_new(config.frame_arena_size)?,
            long_lived: Arena::try_new(config.long_lived_arena_size)?,
            internal: Arena::try_new(internal_size)?,
            frame_scope: ArenaScope::default(),
            long_lived_scope: ArenaScope::default(),
            global: BoundedQueue::new(config.global_queue_capacity),
            priority: BoundedQueue::new(config.priority_queue_capacity),
            locals: (0..config.workers)
                .map(|_| BoundedQueue::new(config.local_queue_capacity))
                .collect(),
            sleep: IdleSleep::default(),
            shut_down: AtomicBool::new(false),
            next_job_id: AtomicU32::new(1),
            graph_capacity: config.graph_capacity,
            idle_polls: config.idle_polls,
        })
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.locals.len()
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn next_job_id(&self) -> u32 {
        self.next_job_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn arena(&self, class: MemoryClass) -> &Arena {
        match class {
            MemoryClass::Frame => &self.frame,
            MemoryClass::LongLived => &self.long_lived,
        }
    }

    pub(crate) fn scope(&self, class: MemoryClass) -> &ArenaScope {
        match class {
            MemoryClass::Frame => &self.frame_scope,
            MemoryClass::LongLived => &self.long_lived_scope,
        }
    }

    pub(crate) fn local_queue(&self, worker: usize) -> Option<&BoundedQueue<Job>> {
        self.locals.get(worker)
    }

    pub(crate) fn sleep(&self) -> &IdleSleep {
        &self.sleep
    }

    pub(crate) fn idle_polls(&self) -> u32 {
        self.idle_polls
    }
}

// -----------------------------------------------------------------------------
// Submission

impl Scheduler {
    /// Queues a job.
    ///
    /// Jobs with [`JobFlags::WORKER_AFFINITY`] go to that worker's local queue,
    /// jobs with [`JobFlags::HIGH_PRIORITY`] to the high-priority queue, and
    /// everything else to the global queue. When the queue is full this
    /// retries until it is not, helping to drain the queues if called from a
    /// worker and yielding otherwise. Jobs are never silently dropped: after
    /// shutdown they are recorded as cancelled and their completion callbacks
    /// still run.
    pub fn submit(&self, job: Job) {
        let (queue, targeted) = self.route(&job);
        let mut job = job;
        loop {
            match queue.try_enqueue(job) {
                Ok(()) => break,
                Err(EnqueueError::Full(rejected)) => {
                    job = rejected;
                    trace!("queue full; retrying submission");
                    if !self.help() {
                        thread::yield_now();
                    }
                }
                Err(EnqueueError::Closed(rejected)) => {
                    warn!("job system is shut down; abandoning job");
                    self.abandon(rejected);
                    return;
                }
            }
        }

        // A pinned job can only be run by one worker, and `notify_one` might
        // wake a different one.
        if targeted {
            self.sleep.notify_all();
        } else {
            self.sleep.notify_one();
        }
    }

    fn route(&self, job: &Job) -> (&BoundedQueue<Job>, bool) {
        if let Some(worker) = job.affinity() {
            match self.locals.get(worker) {
                Some(queue) => return (queue, true),
                None => trace!(worker, "no such worker; ignoring affinity"),
            }
        }
        if job.flags().contains(JobFlags::HIGH_PRIORITY) {
            (&self.priority, false)
        } else {
            (&self.global, false)
        }
    }

    /// Takes the next job from the shared queues: the high-priority queue
    /// first, then the global queue.
    pub fn next_job(&self) -> Option<Job> {
        self.priority
            .try_dequeue()
            .or_else(|| self.global.try_dequeue())
    }

    /// Returns true once the job system has started shutting down. From then
    /// on every submitted job is abandoned.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Abandons every job left in `queue`. Returns how many there were.
    pub(crate) fn abandon_queued(&self, queue: &BoundedQueue<Job>) -> usize {
        let mut abandoned = 0;
        while let Some(job) = queue.try_dequeue() {
            self.abandon(job);
            abandoned += 1;
        }
        abandoned
    }

    /// Finishes a job that will never run: its data is discarded, it is
    /// recorded as cancelled, and its completion callback runs as usual.
    fn abandon(&self, job: Job) {
        // SAFETY: The job was never executed and is dropped here, so its data
        // is still valid and is never touched by a body.
        unsafe { job.discard() };
        if let Some(control) = job.control() {
            // SAFETY: The control block lives as long as the job.
            let control = unsafe { control.as_ref() };
            control.request_cancel();
            control.finish();
        }
        if let Some(on_complete) = job.on_complete() {
            // SAFETY: The job was never executed, so its data is still valid.
            unsafe { on_complete(job.data()) };
        }
        if let Some(class) = job.scope() {
            self.scope(class).exit();
        }
    }

    /// Moves a closure into the arena for `class` and submits it.
    ///
    /// ```
    /// use gantry::{Config, JobSystem, MemoryClass};
    ///
    /// let system = JobSystem::new(Config::default().with_workers(1)).unwrap();
    /// let handle = system.spawn(MemoryClass::Frame, |cx| {
    ///     let scratch = cx.scratch().alloc([0_u8; 64]);
    ///     scratch[0] = 1;
    /// });
    /// system.wait(handle);
    /// assert!(system.is_complete(handle));
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if the arena is exhausted.
    pub fn spawn<F>(&self, class: MemoryClass, f: F) -> JobHandle
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.spawn_with(class, JobFlags::empty(), f)
    }

    /// Like [`spawn`](Self::spawn), with flags. A [`JobFlags::DETACHED`] job
    /// gets no control block, and the returned handle is invalid.
    pub fn spawn_with<F>(&self, class: MemoryClass, flags: JobFlags, f: F) -> JobHandle
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        let (job, handle) = self.prepare(class, flags, f);
        self.submit(job);
        handle
    }

    /// Like [`spawn_with`](Self::spawn_with), pinned to worker `worker`.
    pub fn spawn_on<F>(&self, class: MemoryClass, worker: usize, flags: JobFlags, f: F) -> JobHandle
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        let (job, handle) = self.prepare(class, flags, f);
        self.submit(job.with_affinity(worker));
        handle
    }

    fn prepare<F>(&self, class: MemoryClass, flags: JobFlags, f: F) -> (Job, JobHandle)
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        // The job exits the scope once it completes. Until then the guard
        // releases it if allocation panics.
        let guard = self.scope(class).guard();
        let arena = self.arena(class);

        let data = NonNull::from(arena.alloc(ArenaJob::new(f)));
        // SAFETY: The arena job lives until the arena is reset, which cannot
        // happen before the job exits the scope. The job is submitted once.
        let mut job = unsafe { ArenaJob::into_job(data) }
            .with_flags(flags)
            .with_class(class)
            .holding_scope(class);

        let mut handle = JobHandle::INVALID;
        if !flags.contains(JobFlags::DETACHED) {
            let control = arena.alloc(JobControlBlock::new());
            handle = JobHandle::new(self.next_job_id(), control, arena.epoch(), class, self.id);
            // SAFETY: The control block lives in the same arena as the job.
            job = unsafe { job.with_control(NonNull::from(control)) };
        }

        core::mem::forget(guard);
        (job, handle)
    }
}

// -----------------------------------------------------------------------------
// Handles

impl Scheduler {
    /// Resolves a handle to its control block while holding the arena scope.
    /// Returns `None` for invalid, foreign and stale handles.
    fn with_control<F, R>(&self, handle: JobHandle, f: F) -> Option<R>
    where
        F: FnOnce(&JobControlBlock) -> R,
    {
        let control = handle.control()?;
        if handle.system() != self.id {
            return None;
        }
        let class = handle.memory_class();
        let _guard = self.scope(class).guard();
        if self.arena(class).epoch() != handle.epoch() {
            return None;
        }
        // SAFETY: The arena has not been reset since the handle was issued,
        // and cannot be while we hold the scope, so the control block is still
        // allocated.
        let control = unsafe { control.as_ref() };
        if control.generation() != handle.generation() {
            return None;
        }
        Some(f(control))
    }

    /// Blocks until the job reaches a terminal state.
    ///
    /// On a worker thread this runs other jobs while it waits. Elsewhere it
    /// yields between checks. Returns immediately for invalid or stale
    /// handles.
    pub fn wait(&self, handle: JobHandle) {
        self.with_control(handle, |control| {
            self.wait_until(|| {
                control.generation() != handle.generation() || control.is_terminal()
            });
        });
    }

    /// Requests cancellation. Returns false if the handle is invalid or stale.
    pub fn cancel(&self, handle: JobHandle) -> bool {
        self.with_control(handle, JobControlBlock::request_cancel)
            .is_some()
    }

    /// The job's current state, or `None` for invalid or stale handles.
    pub fn state(&self, handle: JobHandle) -> Option<JobState> {
        self.with_control(handle, JobControlBlock::state)
    }

    /// Returns true if the job finished without being cancelled.
    pub fn is_complete(&self, handle: JobHandle) -> bool {
        self.state(handle) == Some(JobState::Completed)
    }

    /// Returns true if the job finished after cancellation was requested.
    pub fn is_cancelled(&self, handle: JobHandle) -> bool {
        self.state(handle) == Some(JobState::Cancelled)
    }

    /// Spins until `done` returns true, helping with other jobs when called on
    /// one of this scheduler's workers.
    pub(crate) fn wait_until<F>(&self, mut done: F)
    where
        F: FnMut() -> bool,
    {
        while !done() {
            if !self.help() {
                thread::yield_now();
            }
        }
    }

    /// Runs one queued job if the calling thread is one of our workers.
    fn help(&self) -> bool {
        Worker::map_current(|worker| worker.belongs_to(self) && worker.help()).unwrap_or(false)
    }
}

// -----------------------------------------------------------------------------
// Graphs

impl Scheduler {
    /// Creates an empty graph in the arena for `class`, with the configured
    /// default capacity.
    pub fn create_graph(self: &Arc<Self>, class: MemoryClass) -> Result<JobGraph, GraphError> {
        self.create_graph_with_capacity(class, self.graph_capacity)
    }

    /// Creates an empty graph in the arena for `class` that holds at most
    /// `capacity` nodes.
    pub fn create_graph_with_capacity(
        self: &Arc<Self>,
        class: MemoryClass,
        capacity: usize,
    ) -> Result<JobGraph, GraphError> {
        JobGraph::new(Arc::clone(self), class, capacity)
    }

    /// Submits every node of `graph` that has no unfinished dependencies.
    /// Returns the number of nodes submitted.
    pub fn submit_graph(&self, graph: &mut JobGraph) -> usize {
        debug_assert_eq!(graph.scheduler_id(), self.id, "graph belongs to another job system");
        graph.submit_ready_jobs()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("workers", &self.locals.len())
            .field("global", &self.global)
            .field("priority", &self.priority)
            .field("frame", &self.frame)
            .field("long_lived", &self.long_lived)
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// Job system

/// Owns the worker threads and the frame boundaries.
///
/// Dereferences to the shared [`Scheduler`], which carries every submission
/// and query operation. Dropping the system stops the workers; queued jobs
/// that never ran are recorded as cancelled.
pub struct JobSystem {
    scheduler: Arc<Scheduler>,
    workers: Vec<ThreadControl>,
}

/// Controls a worker thread.
struct ThreadControl {
    /// Tells the worker to stop.
    halt: Arc<AtomicBool>,
    /// Joins the worker.
    handle: JoinHandle<()>,
}

impl JobSystem {
    /// Allocates the arenas and queues and starts the workers. Fails with
    /// [`SystemError::Alloc`] if an arena cannot be reserved.
    pub fn new(config: Config) -> Result<JobSystem, SystemError> {
        debug!(workers = config.workers, "starting job system");

        let mut system = JobSystem {
            scheduler: Arc::new(Scheduler::new(&config)?),
            workers: Vec::with_capacity(config.workers),
        };

        for index in 0..config.workers {
            // SAFETY: The internal arena is never reset, and is only dropped
            // with the scheduler, which the worker keeps alive for as long as
            // it holds the scratch arena.
            let scratch = unsafe { system.scheduler.internal.carve(config.worker_arena_size) }?;
            let halt = Arc::new(AtomicBool::new(false));
            let worker_halt = Arc::clone(&halt);
            let scheduler = Arc::clone(&system.scheduler);
            trace!(index, "spawning worker");
            let handle = thread::Builder::new()
                .name(format!("gantry worker {index}"))
                .spawn(move || worker::main_loop(index, scheduler, scratch, worker_halt))?;
            system.workers.push(ThreadControl { halt, handle });
        }

        Ok(system)
    }

    /// The shared scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The frame arena, for data that jobs in this frame read.
    pub fn frame_arena(&self) -> &Arena {
        &self.scheduler.frame
    }

    /// The long-lived arena.
    pub fn long_lived_arena(&self) -> &Arena {
        &self.scheduler.long_lived
    }

    /// Ends the frame: waits for every in-flight frame job to complete, then
    /// reclaims the frame arena. Handles into the old frame go stale.
    ///
    /// Fails without waiting if any frame graph is still alive. With no worker
    /// threads, queued frame jobs never complete and this never returns.
    pub fn end_frame(&mut self) -> Result<(), FrameError> {
        self.reset_arena(MemoryClass::Frame)
    }

    /// Reclaims the long-lived arena, under the same rules as
    /// [`end_frame`](Self::end_frame).
    pub fn reset_long_lived(&mut self) -> Result<(), FrameError> {
        self.reset_arena(MemoryClass::LongLived)
    }

    fn reset_arena(&mut self, class: MemoryClass) -> Result<(), FrameError> {
        let scheduler = &*self.scheduler;
        let arena = scheduler.arena(class);
        scheduler.scope(class).reset_with(|| {
            // SAFETY: The scope is empty and held closed, so no job, graph or
            // handle lookup references the arena. Borrows handed out by
            // `frame_arena` and `long_lived_arena` ended before `&mut self`.
            unsafe { arena.reset_unchecked() };
        })?;
        debug!(?class, epoch = arena.epoch(), "arena reset");
        Ok(())
    }

    /// Stops the workers and reports whether any of them panicked.
    pub fn shutdown(mut self) -> Result<(), SystemError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), SystemError> {
        if self.workers.is_empty() && self.scheduler.is_shut_down() {
            return Ok(());
        }

        debug!("stopping job system");
        // Close before halting. A worker that sees the halt drains its own
        // local queue, and after `close` nothing more can land there.
        let scheduler = &*self.scheduler;
        scheduler.global.close();
        scheduler.priority.close();
        for queue in &scheduler.locals {
            queue.close();
        }
        scheduler.shut_down.store(true, Ordering::SeqCst);
        for worker in &self.workers {
            worker.halt.store(true, Ordering::SeqCst);
        }
        scheduler.sleep.notify_all();

        let mut panicked = 0;
        for worker in self.workers.drain(..) {
            if worker.handle.join().is_err() {
                panicked += 1;
            }
        }

        let abandoned: usize = scheduler
            .locals
            .iter()
            .chain([&scheduler.priority, &scheduler.global])
            .map(|queue| scheduler.abandon_queued(queue))
            .sum();
        debug!(abandoned, "job system stopped");

        if panicked > 0 {
            Err(SystemError::WorkerPanicked { count: panicked })
        } else {
            Ok(())
        }
    }
}

impl Deref for JobSystem {
    type Target = Arc<Scheduler>;

    fn deref(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(%err, "job system did not shut down cleanly");
        }
    }
}

impl fmt::Debug for JobSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSystem")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
