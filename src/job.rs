//! This module defines an executable unit of work called a [`Job`], the
//! [`JobControlBlock`] through which its progress is observed, and the
//! [`JobHandle`] used to refer to that control block from the outside.
//!
//! A job is a type-erased pointer plus a function that knows how to execute
//! it. Jobs do not own their data: it lives in an arena, and is reclaimed with
//! the arena.
//!
//! When using a job, one must be extremely careful to ensure that:
//! (a) The job's data outlives the job, which usually means the arena it was
//!     allocated from is not reset until the job has completed.
//! (b) Each job is executed at most once.

use alloc::sync::Arc;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;

use bitflags::bitflags;

use crate::arena::Arena;
use crate::platform::*;
use crate::system::{MemoryClass, Scheduler};

// -----------------------------------------------------------------------------
// Flags

bitflags! {
    /// Scheduling policy attached to a [`Job`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct JobFlags: u32 {
        /// Routed to the high-priority queue, which every worker checks before
        /// the global queue.
        const HIGH_PRIORITY = 1 << 0;
        /// Marks a job expected to run for a long time. Informational only.
        const LONG_RUNNING = 1 << 1;
        /// Closure jobs and graph nodes skip their body if cancellation was
        /// requested before they started. The terminal state is still
        /// [`JobState::Cancelled`].
        const CANCELABLE = 1 << 2;
        /// The job's data lives in the frame arena. Set automatically.
        const FRAME_LOCAL = 1 << 3;
        /// Routed to the local queue of the job's affinity worker.
        const WORKER_AFFINITY = 1 << 4;
        /// No control block is allocated, and the returned handle is invalid.
        const DETACHED = 1 << 5;
        /// Execution is wrapped in a `debug` level tracing span.
        const DEBUG_TRACE = 1 << 6;
        /// The worker keeps its scratch arena intact after this job.
        const SKIP_ARENA_RESET = 1 << 7;
    }
}

// -----------------------------------------------------------------------------
// State

/// The lifecycle of a job, as recorded in its control block.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Not yet picked up by a worker.
    Pending = 0,
    /// A worker is executing the body.
    Running = 1,
    /// The body returned without cancellation being requested.
    Completed = 2,
    /// Cancellation was requested before the job finished.
    Cancelled = 3,
    /// The body panicked. The panic was caught and logged.
    Panicked = 4,
}

impl JobState {
    /// Returns true for states a job never leaves.
    #[inline(always)]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Panicked
        )
    }

    #[inline(always)]
    fn from_u8(value: u8) -> JobState {
        match value {
            0 => JobState::Pending,
            1 => JobState::Running,
            2 => JobState::Completed,
            3 => JobState::Cancelled,
            _ => JobState::Panicked,
        }
    }
}

// -----------------------------------------------------------------------------
// Control block

/// Shared state observed by the thread that submitted a job and the worker that
/// executes it.
///
/// The worker records the terminal state with release ordering, and every read
/// uses acquire ordering. A thread that observes a terminal state therefore
/// also observes every effect the job produced.
pub struct JobControlBlock {
    state: AtomicU8,
    cancel_requested: AtomicBool,
    /// Bumped each time the block is re-armed for a new job. Never zero.
    generation: AtomicU32,
}

impl Default for JobControlBlock {
    fn default() -> JobControlBlock {
        JobControlBlock::new()
    }
}

impl JobControlBlock {
    /// Creates a pending control block.
    pub fn new() -> JobControlBlock {
        JobControlBlock {
            state: AtomicU8::new(JobState::Pending as u8),
            cancel_requested: AtomicBool::new(false),
            generation: AtomicU32::new(1),
        }
    }

    /// The current state.
    #[inline(always)]
    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns true once the job has finished, one way or another.
    #[inline(always)]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// The generation this block was last armed with.
    #[inline(always)]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Asks the job to stop. This never interrupts a running body; it only
    /// determines the terminal state and is visible through
    /// [`JobContext::is_cancel_requested`].
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    /// Returns true if cancellation has been requested.
    #[inline(always)]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Records that a worker has started the job.
    ///
    /// Only the worker that dequeued the job writes here, so no ordering is
    /// needed.
    pub fn mark_running(&self) {
        self.state.store(JobState::Running as u8, Ordering::Relaxed);
    }

    /// Records the terminal state once the body has returned: `Cancelled` if
    /// cancellation was requested, `Completed` otherwise.
    pub fn finish(&self) -> JobState {
        let state = if self.is_cancel_requested() {
            JobState::Cancelled
        } else {
            JobState::Completed
        };
        self.state.store(state as u8, Ordering::Release);
        state
    }

    /// Records that the body panicked.
    pub fn finish_panicked(&self) {
        self.state
            .store(JobState::Panicked as u8, Ordering::Release);
    }

    /// Returns the block to `Pending` for a new job and bumps the generation.
    pub(crate) fn rearm(&self) -> u32 {
        let generation = self.generation().wrapping_add(1).max(1);
        self.cancel_requested.store(false, Ordering::Relaxed);
        self.state
            .store(JobState::Pending as u8, Ordering::Relaxed);
        self.generation.store(generation, Ordering::Release);
        generation
    }
}

impl fmt::Debug for JobControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobControlBlock")
            .field("state", &self.state())
            .field("cancel_requested", &self.is_cancel_requested())
            .field("generation", &self.generation())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Handle

/// A copyable reference to a job's control block.
///
/// Handles do not keep anything alive. The control block belongs to the arena
/// the job was allocated from, and once that arena is reset every handle into
/// it goes stale. Stale and invalid handles are inert: waiting on one returns
/// immediately, and every query returns `false` or `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobHandle {
    id: u32,
    generation: u32,
    control: Option<NonNull<JobControlBlock>>,
    epoch: u32,
    class: MemoryClass,
    system: u32,
}

// SAFETY: The control block pointer is only dereferenced by a `Scheduler` after
// the handle has been validated against the arena epoch.
unsafe impl Send for JobHandle {}

// SAFETY: See above.
unsafe impl Sync for JobHandle {}

impl Default for JobHandle {
    fn default() -> JobHandle {
        JobHandle::INVALID
    }
}

impl JobHandle {
    /// A handle that refers to nothing.
    pub const INVALID: JobHandle = JobHandle {
        id: 0,
        generation: 0,
        control: None,
        epoch: 0,
        class: MemoryClass::Frame,
        system: 0,
    };

    pub(crate) fn new(
        id: u32,
        control: &JobControlBlock,
        epoch: u32,
        class: MemoryClass,
        system: u32,
    ) -> JobHandle {
        JobHandle {
            id,
            generation: control.generation(),
            control: Some(NonNull::from(control)),
            epoch,
            class,
            system,
        }
    }

    /// A per-system sequence number.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The control block generation this handle was issued for. Zero for
    /// invalid handles.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns true if the handle was issued for a job. This says nothing
    /// about whether the job's arena has since been reset.
    pub fn is_valid(&self) -> bool {
        self.control.is_some()
    }

    /// The memory class of the job's arena.
    pub fn memory_class(&self) -> MemoryClass {
        self.class
    }

    pub(crate) fn control(&self) -> Option<NonNull<JobControlBlock>> {
        self.control
    }

    pub(crate) fn epoch(&self) -> u32 {
        self.epoch
    }

    pub(crate) fn system(&self) -> u32 {
        self.system
    }
}

// -----------------------------------------------------------------------------
// Job

/// An executable unit of work.
///
/// Jobs are usually built by [`Scheduler::spawn`] or by a
/// [`JobGraph`](crate::JobGraph). [`Job::from_raw`] builds one from a raw data
/// pointer and execute function for callers that manage their own storage.
pub struct Job {
    /// A non-null pointer to some type-erased data which can be executed by
    /// `execute_fn`.
    data: NonNull<()>,
    /// Runs the job stored at `data`.
    execute_fn: unsafe fn(NonNull<()>, &JobContext<'_>),
    /// Called after the terminal state has been recorded.
    on_complete: Option<unsafe fn(NonNull<()>)>,
    /// Drops the data of a job that will never execute.
    discard: Option<unsafe fn(NonNull<()>)>,
    /// Where the terminal state is recorded.
    control: Option<NonNull<JobControlBlock>>,
    /// The arena holding `data`, if it was allocated by the scheduler.
    class: Option<MemoryClass>,
    /// The arena scope this job must exit once it has completed.
    scope: Option<MemoryClass>,
    flags: JobFlags,
    affinity: usize,
}

// SAFETY: !Send for raw pointers is not for safety, just as a lint. The
// constructors require the data to be sendable.
unsafe impl Send for Job {}

impl Job {
    /// Creates a new job from raw parts.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `data` remains valid to pass to
    /// `execute_fn` until the job is executed, and that the data may be
    /// accessed from any thread.
    #[inline(always)]
    pub unsafe fn from_raw(
        data: NonNull<()>,
        execute_fn: unsafe fn(NonNull<()>, &JobContext<'_>),
    ) -> Job {
        Job {
            data,
            execute_fn,
            on_complete: None,
            discard: None,
            control: None,
            class: None,
            scope: None,
            flags: JobFlags::empty(),
            affinity: 0,
        }
    }

    /// Adds `flags` to the job's flags.
    pub fn with_flags(mut self, flags: JobFlags) -> Job {
        self.flags |= flags;
        self
    }

    /// Pins the job to the local queue of worker `worker`. If the system has
    /// no such worker the job falls back to the shared queues.
    pub fn with_affinity(mut self, worker: usize) -> Job {
        self.flags |= JobFlags::WORKER_AFFINITY;
        self.affinity = worker;
        self
    }

    /// Records the job's terminal state in `control`.
    ///
    /// # Safety
    ///
    /// The control block must stay valid until the job has completed.
    pub unsafe fn with_control(mut self, control: NonNull<JobControlBlock>) -> Job {
        self.control = Some(control);
        self
    }

    /// Calls `on_complete` with the job's data after the terminal state has
    /// been recorded.
    ///
    /// # Safety
    ///
    /// `on_complete` must be safe to call with the job's data pointer.
    pub unsafe fn with_on_complete(mut self, on_complete: unsafe fn(NonNull<()>)) -> Job {
        self.on_complete = Some(on_complete);
        self
    }

    /// Calls `discard` with the job's data if the job is abandoned without
    /// executing.
    ///
    /// # Safety
    ///
    /// `discard` must be safe to call with the job's data pointer in place of
    /// executing it.
    pub(crate) unsafe fn with_discard(mut self, discard: unsafe fn(NonNull<()>)) -> Job {
        self.discard = Some(discard);
        self
    }

    pub(crate) fn with_class(mut self, class: MemoryClass) -> Job {
        self.class = Some(class);
        if class == MemoryClass::Frame {
            self.flags |= JobFlags::FRAME_LOCAL;
        }
        self
    }

    /// Makes the job responsible for exiting `class`'s arena scope.
    pub(crate) fn holding_scope(mut self, class: MemoryClass) -> Job {
        self.scope = Some(class);
        self
    }

    /// The job's flags.
    pub fn flags(&self) -> JobFlags {
        self.flags
    }

    /// The worker this job is pinned to, if any.
    pub fn affinity(&self) -> Option<usize> {
        self.flags
            .contains(JobFlags::WORKER_AFFINITY)
            .then_some(self.affinity)
    }

    /// The memory class of the arena holding this job's data.
    pub fn memory_class(&self) -> Option<MemoryClass> {
        self.class
    }

    pub(crate) fn scope(&self) -> Option<MemoryClass> {
        self.scope
    }

    pub(crate) fn control(&self) -> Option<NonNull<JobControlBlock>> {
        self.control
    }

    pub(crate) fn on_complete(&self) -> Option<unsafe fn(NonNull<()>)> {
        self.on_complete
    }

    pub(crate) fn data(&self) -> NonNull<()> {
        self.data
    }

    /// Runs the job's body.
    ///
    /// # Safety
    ///
    /// The job's data must still be valid, and the body must not have run
    /// before.
    #[inline(always)]
    pub(crate) unsafe fn run_body(&self, cx: &JobContext<'_>) {
        // SAFETY: Ensured by the caller, and by the constructor of the job.
        unsafe { (self.execute_fn)(self.data, cx) }
    }

    /// Drops the job's data in place of executing it.
    ///
    /// # Safety
    ///
    /// The job must never be executed, and this must be called at most once.
    pub(crate) unsafe fn discard(&self) {
        if let Some(discard) = self.discard {
            // SAFETY: Ensured by the caller, and by `with_discard`.
            unsafe { discard(self.data) }
        }
    }

    /// Copies the job.
    ///
    /// # Safety
    ///
    /// At most one of the copies may ever be executed.
    pub(crate) unsafe fn duplicate(&self) -> Job {
        Job { ..*self }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("data", &self.data)
            .field("flags", &self.flags)
            .field("class", &self.class)
            .field("affinity", &self.affinity())
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// Context

/// What a job body can see of the system executing it.
pub struct JobContext<'a> {
    scheduler: &'a Arc<Scheduler>,
    scratch: &'a Arena,
    arena: Option<&'a Arena>,
    control: Option<&'a JobControlBlock>,
    worker: usize,
    flags: JobFlags,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(
        scheduler: &'a Arc<Scheduler>,
        scratch: &'a Arena,
        arena: Option<&'a Arena>,
        control: Option<&'a JobControlBlock>,
        worker: usize,
        flags: JobFlags,
    ) -> JobContext<'a> {
        JobContext {
            scheduler,
            scratch,
            arena,
            control,
            worker,
            flags,
        }
    }

    /// The scheduler running this job. Jobs may submit more work through it.
    pub fn scheduler(&self) -> &'a Arc<Scheduler> {
        self.scheduler
    }

    /// The executing worker's scratch arena. It is also the thread's current
    /// arena (see [`Arena::with_current`]) and is reset after the job unless
    /// the job carries [`JobFlags::SKIP_ARENA_RESET`].
    pub fn scratch(&self) -> &'a Arena {
        self.scratch
    }

    /// The arena this job's data was allocated from, for allocations that
    /// should live as long as that arena's scope.
    pub fn arena(&self) -> Option<&'a Arena> {
        self.arena
    }

    /// Returns true if cancellation of this job has been requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.control
            .is_some_and(JobControlBlock::is_cancel_requested)
    }

    /// Index of the worker executing this job.
    pub fn worker_index(&self) -> usize {
        self.worker
    }

    /// The flags the job was submitted with.
    pub fn flags(&self) -> JobFlags {
        self.flags
    }

    /// Returns true if the body should be skipped under
    /// [`JobFlags::CANCELABLE`].
    pub(crate) fn skip_requested(&self) -> bool {
        self.flags.contains(JobFlags::CANCELABLE) && self.is_cancel_requested()
    }
}

// -----------------------------------------------------------------------------
// Arena allocated closures

/// A closure job stored in an arena.
///
/// This is the arena counterpart of a heap job: the closure is moved into arena
/// memory when spawned, and taken out exactly once, either to execute it or to
/// drop it when the job is abandoned at shutdown.
pub(crate) struct ArenaJob<F> {
    f: ManuallyDrop<F>,
}

impl<F> ArenaJob<F>
where
    F: FnOnce(&JobContext<'_>) + Send + 'static,
{
    pub fn new(f: F) -> ArenaJob<F> {
        ArenaJob {
            f: ManuallyDrop::new(f),
        }
    }

    /// Creates a `Job` pointing at this arena job.
    ///
    /// # Safety
    ///
    /// The caller must ensure the `ArenaJob` outlives the returned `Job`, and
    /// that the returned job is executed at most once.
    pub unsafe fn into_job(this: NonNull<ArenaJob<F>>) -> Job {
        // SAFETY: `Self::execute` and `Self::discard` expect a pointer to an
        // `ArenaJob<F>`, which is what we pass. The closure is `Send`, so it
        // may run or drop anywhere. A job is either executed or discarded.
        unsafe { Job::from_raw(this.cast(), Self::execute).with_discard(Self::discard) }
    }

    /// # Safety
    ///
    /// `this` must point to a live `ArenaJob<F>` whose closure has not been
    /// taken.
    unsafe fn discard(this: NonNull<()>) {
        // SAFETY: The caller ensures this points to an `ArenaJob<F>` that no one
        // else is accessing.
        let this = unsafe { this.cast::<ArenaJob<F>>().as_mut() };
        // SAFETY: The closure is still there, and is never touched again.
        unsafe { ManuallyDrop::drop(&mut this.f) };
    }

    /// # Safety
    ///
    /// `this` must point to a live `ArenaJob<F>` whose closure has not been
    /// taken.
    unsafe fn execute(this: NonNull<()>, cx: &JobContext<'_>) {
        // SAFETY: The caller ensures this points to an `ArenaJob<F>` that no one
        // else is accessing.
        let this = unsafe { this.cast::<ArenaJob<F>>().as_mut() };
        // SAFETY: Jobs are executed at most once, so the closure is still
        // there, and is never touched again.
        let f = unsafe { ManuallyDrop::take(&mut this.f) };
        if cx.skip_requested() {
            drop(f);
            return;
        }
        f(cx);
    }
}
