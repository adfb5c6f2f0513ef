//! Dependency graphs of jobs.
//!
//! A [`JobGraph`] is a DAG of nodes stored in one of the scheduler's arenas.
//! Each node counts its unfinished predecessors. When a node's job completes,
//! the worker that ran it decrements the count of every dependent; the worker
//! whose decrement reaches zero submits that dependent. A per-node `scheduled`
//! flag, flipped by compare-and-swap, makes sure each node is submitted exactly
//! once however its predecessors race.
//!
//! Nodes come in two shapes, each its own trait: [`Node`] reads an input, and
//! [`MapNode`] reads an input and writes an output that later nodes can read
//! through an [`OutputRef`].

use alloc::sync::Arc;
use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32 as StdAtomicU32, AtomicUsize, Ordering as StdOrdering};

use crossbeam_utils::CachePadded;
use tracing::{debug, error, trace};

use crate::arena::Arena;
use crate::arena_vec::ArenaVec;
use crate::error::GraphError;
use crate::job::{Job, JobContext, JobControlBlock, JobFlags, JobHandle, JobState};
use crate::platform::{AtomicBool, AtomicU32, Ordering};
use crate::system::{MemoryClass, Scheduler};
use crate::unwind;

/// Initial capacity of each node's dependents list.
const DEPENDENTS_CAPACITY: usize = 2;

/// Identifies graphs, so handles can't be used with the wrong one.
static NEXT_GRAPH_ID: StdAtomicU32 = StdAtomicU32::new(1);

// -----------------------------------------------------------------------------
// Node shapes

/// A graph node that reads an input.
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use gantry::{Node, NodeContext};
///
/// struct Count;
///
/// impl Node for Count {
///     type Input = Arc<AtomicU32>;
///
///     fn run(counter: &Arc<AtomicU32>, _cx: &NodeContext<'_>) {
///         counter.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
pub trait Node: 'static {
    /// The value moved into the graph when the node is added.
    type Input: Send + Sync + 'static;

    /// Runs the node.
    fn run(input: &Self::Input, cx: &NodeContext<'_>);
}

/// A graph node that reads an input and writes an output.
///
/// The output is readable through the [`OutputRef`] returned by
/// [`JobGraph::add_map_node`] once the node has finished.
pub trait MapNode: 'static {
    /// The value moved into the graph when the node is added.
    type Input: Send + Sync + 'static;
    /// The value written by the node. Its initial value is supplied when the
    /// node is added.
    type Output: Send + Sync + 'static;

    /// Runs the node.
    fn run(input: &Self::Input, output: &mut Self::Output, cx: &NodeContext<'_>);
}

// -----------------------------------------------------------------------------
// Handles

/// Identifies a node within one generation of one graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GraphNodeHandle {
    index: u32,
    generation: u32,
    graph: u32,
    job: JobHandle,
}

impl Default for GraphNodeHandle {
    fn default() -> GraphNodeHandle {
        GraphNodeHandle::INVALID
    }
}

impl GraphNodeHandle {
    /// A handle that refers to no node.
    pub const INVALID: GraphNodeHandle = GraphNodeHandle {
        index: 0,
        generation: 0,
        graph: 0,
        job: JobHandle::INVALID,
    };

    /// The node's slot index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The graph generation the node was added in. Zero for invalid handles.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns true unless this is [`GraphNodeHandle::INVALID`].
    pub fn is_valid(&self) -> bool {
        self.generation != 0
    }

    /// The handle of the node's job, for use with
    /// [`Scheduler::wait`](crate::Scheduler::wait) and friends.
    pub fn job(&self) -> JobHandle {
        self.job
    }
}

/// A typed reference to the output of a [`MapNode`].
pub struct OutputRef<T> {
    node: GraphNodeHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> OutputRef<T> {
    /// The node producing the output.
    pub fn node(&self) -> GraphNodeHandle {
        self.node
    }
}

impl<T> Clone for OutputRef<T> {
    fn clone(&self) -> OutputRef<T> {
        *self
    }
}

impl<T> Copy for OutputRef<T> {}

impl<T> PartialEq for OutputRef<T> {
    fn eq(&self, other: &OutputRef<T>) -> bool {
        self.node == other.node
    }
}

impl<T> Eq for OutputRef<T> {}

impl<T> fmt::Debug for OutputRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OutputRef").field(&self.node).finish()
    }
}

// -----------------------------------------------------------------------------
// Dependency counter

/// Tracks when a node becomes ready, and who gets to submit it.
///
/// The in-degree only ever decreases, and reaches zero at most once. The
/// `scheduled` flag flips from false to true at most once, by compare-and-swap,
/// so exactly one caller of [`try_claim_ready`](Self::try_claim_ready) or
/// [`complete_predecessor`](Self::complete_predecessor) is told to submit the
/// node.
pub struct DependencyCounter {
    in_degree: AtomicU32,
    scheduled: AtomicBool,
}

impl DependencyCounter {
    /// Creates a counter waiting on `in_degree` predecessors.
    pub fn new(in_degree: u32) -> DependencyCounter {
        DependencyCounter {
            in_degree: AtomicU32::new(in_degree),
            scheduled: AtomicBool::new(false),
        }
    }

    /// Number of predecessors that have not completed.
    pub fn in_degree(&self) -> u32 {
        self.in_degree.load(Ordering::Acquire)
    }

    /// Returns true once the node has been claimed for submission.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Re-arms the counter. Only sound while nothing else uses it.
    pub fn reset(&self, in_degree: u32) {
        self.in_degree.store(in_degree, Ordering::Relaxed);
        self.scheduled.store(false, Ordering::Relaxed);
    }

    /// Claims the node if it has no remaining predecessors and nobody has
    /// claimed it yet.
    pub fn try_claim_ready(&self) -> bool {
        self.in_degree.load(Ordering::Acquire) == 0 && self.try_claim()
    }

    /// Records that one predecessor completed. Returns true if this call
    /// released the node and claimed it, in which case the caller must submit
    /// it.
    ///
    /// The decrement is acquire-release, so the claiming caller observes
    /// everything every other predecessor did before its own decrement.
    pub fn complete_predecessor(&self) -> bool {
        let previous = self.in_degree.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "more completions than predecessors");
        previous == 1 && self.try_claim()
    }

    fn try_claim(&self) -> bool {
        self.scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for DependencyCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyCounter")
            .field("in_degree", &self.in_degree())
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Node context

/// What a node can see while it runs: everything in [`JobContext`], plus the
/// outputs of other nodes in the same graph.
pub struct NodeContext<'a> {
    job: &'a JobContext<'a>,
    graph: &'a GraphCore,
    index: u32,
}

impl<'a> NodeContext<'a> {
    /// Reads another node's output. Returns `None` if the producer has not
    /// finished (or panicked), or if the reference belongs to another graph or
    /// an earlier generation of this one.
    ///
    /// A node that depends on the producer sees `Some` unless the producer
    /// panicked.
    pub fn output<T>(&self, output: &OutputRef<T>) -> Option<&'a T> {
        self.graph.output(output)
    }

    /// The running node's slot index.
    pub fn node_index(&self) -> u32 {
        self.index
    }
}

impl<'a> Deref for NodeContext<'a> {
    type Target = JobContext<'a>;

    fn deref(&self) -> &JobContext<'a> {
        self.job
    }
}

// -----------------------------------------------------------------------------
// Node job data

/// Shared prefix of every node's job data, read by the completion callback.
#[repr(C)]
struct NodeHeader {
    graph: NonNull<GraphCore>,
    index: u32,
}

#[repr(C)]
struct NodeJob<N: Node> {
    header: NodeHeader,
    input: N::Input,
}

#[repr(C)]
struct MapNodeJob<N: MapNode> {
    header: NodeHeader,
    input: N::Input,
    output: UnsafeCell<N::Output>,
}

/// # Safety
///
/// `data` must point to a live `NodeJob<N>`.
unsafe fn execute_node<N: Node>(data: NonNull<()>, cx: &JobContext<'_>) {
    if cx.skip_requested() {
        return;
    }
    // SAFETY: Ensured by the caller. Node data is only mutated through `&mut
    // JobGraph` while no node is in flight.
    let job = unsafe { data.cast::<NodeJob<N>>().as_ref() };
    // SAFETY: The graph core outlives every node it submits.
    let graph = unsafe { job.header.graph.as_ref() };
    let cx = NodeContext {
        job: cx,
        graph,
        index: job.header.index,
    };
    N::run(&job.input, &cx);
}

/// # Safety
///
/// `data` must point to a live `MapNodeJob<N>`.
unsafe fn execute_map_node<N: MapNode>(data: NonNull<()>, cx: &JobContext<'_>) {
    if cx.skip_requested() {
        return;
    }
    // SAFETY: See `execute_node`.
    let job = unsafe { data.cast::<MapNodeJob<N>>().as_ref() };
    // SAFETY: The graph core outlives every node it submits.
    let graph = unsafe { job.header.graph.as_ref() };
    // SAFETY: Outputs are only read once the node's control block is terminal,
    // and this node is the only writer, so nothing else accesses the output
    // while it runs.
    let output = unsafe { &mut *job.output.get() };
    let cx = NodeContext {
        job: cx,
        graph,
        index: job.header.index,
    };
    N::run(&job.input, output, &cx);
}

/// The completion callback of every node.
///
/// # Safety
///
/// `data` must point to the job data of a node of a live graph.
unsafe fn complete_node(data: NonNull<()>) {
    // SAFETY: Every node's job data starts with a `NodeHeader`.
    let (graph, index) = unsafe {
        let header = data.cast::<NodeHeader>().as_ref();
        (header.graph, header.index)
    };
    // SAFETY: The graph core is alive while this node is in flight.
    unsafe { graph.as_ref().propagate(index) };
    // SAFETY: As above. This is the node's last access to the graph.
    unsafe { GraphCore::release(graph) };
}

/// # Safety
///
/// `data` must point to a live `T` which is never used again.
unsafe fn drop_data<T>(data: NonNull<()>) {
    // SAFETY: Ensured by the caller.
    unsafe { data.cast::<T>().drop_in_place() };
}

// -----------------------------------------------------------------------------
// Graph core

/// One node of the graph.
struct NodeSlot {
    /// The node's job. Copied when submitted.
    job: Job,
    job_id: u32,
    control: NonNull<JobControlBlock>,
    /// Nodes to notify when this one completes.
    dependents: ArenaVec<'static, GraphNodeHandle>,
    counter: DependencyCounter,
    /// The graph generation this slot was last armed in.
    generation: u32,
    dependencies_set: bool,
    /// The job data block, reused across resets when the layout fits.
    storage: NonNull<u8>,
    storage_layout: Layout,
    /// Drops the job data, if it needs dropping.
    drop_data: Option<unsafe fn(NonNull<()>)>,
    /// Points at the `UnsafeCell` holding a map node's output.
    output: Option<NonNull<()>>,
}

impl NodeSlot {
    fn control(&self) -> &JobControlBlock {
        // SAFETY: The control block lives in the graph's arena, as does the
        // slot itself.
        unsafe { self.control.as_ref() }
    }
}

/// A user-supplied graph completion callback, stored in the graph's arena.
struct GraphCallback {
    data: NonNull<()>,
    call: unsafe fn(NonNull<()>, GraphNodeHandle),
    drop: unsafe fn(NonNull<()>),
}

/// # Safety
///
/// `data` must point to a live `F`.
unsafe fn call_graph_callback<F>(data: NonNull<()>, node: GraphNodeHandle)
where
    F: Fn(GraphNodeHandle) + Send + Sync + 'static,
{
    // SAFETY: Ensured by the caller.
    let f = unsafe { data.cast::<F>().as_ref() };
    f(node);
}

/// The arena-resident state of a graph.
///
/// Plain fields are only written through `&mut JobGraph` while no node is in
/// flight. Workers only touch the atomics in the slots and `in_flight`.
struct GraphCore {
    scheduler: &'static Scheduler,
    arena: &'static Arena,
    id: u32,
    class: MemoryClass,
    generation: u32,
    capacity: usize,
    /// Every slot ever armed. Slots past `node_count` are kept for reuse.
    slots: ArenaVec<'static, NodeSlot>,
    node_count: usize,
    submitted: bool,
    /// Nodes submitted but not yet done propagating.
    in_flight: CachePadded<AtomicUsize>,
    terminal: Option<u32>,
    on_complete: Option<GraphCallback>,
}

impl GraphCore {
    fn nodes(&self) -> &[NodeSlot] {
        &self.slots[..self.node_count]
    }

    /// Looks up the slot for a handle issued in the current generation.
    fn slot_index(&self, node: GraphNodeHandle) -> Result<usize, GraphError> {
        let index = node.index as usize;
        if node.graph == self.id && node.generation == self.generation && index < self.node_count {
            Ok(index)
        } else {
            Err(GraphError::StaleHandle)
        }
    }

    fn output<T>(&self, output: &OutputRef<T>) -> Option<&T> {
        let index = self.slot_index(output.node).ok()?;
        let slot = &self.slots[index];
        match slot.control().state() {
            JobState::Completed | JobState::Cancelled => {}
            _ => return None,
        }
        let ptr = slot.output?;
        // SAFETY: `OutputRef<T>`s are only issued by `add_map_node` with the
        // node's output type, and the generation check above ensures the slot
        // still holds that node. The producer has finished, and its terminal
        // state was read with acquire ordering, so the output is fully written
        // and never written again.
        Some(unsafe { &*ptr.cast::<UnsafeCell<T>>().as_ref().get() })
    }

    fn submit(&self, slot: &NodeSlot) {
        self.in_flight.fetch_add(1, StdOrdering::Relaxed);
        // SAFETY: The caller claimed the slot through its dependency counter,
        // so this is the only copy of the job that will ever be submitted.
        self.scheduler.submit(unsafe { slot.job.duplicate() });
    }

    /// Notifies the dependents of a completed node, then runs the completion
    /// callback if the node is the terminal node.
    fn propagate(&self, index: u32) {
        let slot = &self.slots[index as usize];
        for dependent in slot.dependents.iter() {
            let target = &self.slots[dependent.index as usize];
            if target.counter.complete_predecessor() {
                trace!(graph = self.id, node = dependent.index, "node ready");
                self.submit(target);
            }
        }

        if self.terminal == Some(index) {
            if let Some(callback) = &self.on_complete {
                let node = self.handle(index as usize);
                // SAFETY: The callback was stored by `set_on_graph_complete`
                // with matching functions.
                let result =
                    unwind::halt_unwinding(|| unsafe { (callback.call)(callback.data, node) });
                if let Err(payload) = result {
                    error!(
                        graph = self.id,
                        panic = unwind::payload_message(&*payload),
                        "graph completion callback panicked"
                    );
                }
            }
        }
    }

    /// Marks a node as done with the graph.
    ///
    /// # Safety
    ///
    /// `core` must point to a live graph core, and the caller must not touch
    /// it afterwards: once `in_flight` reaches zero the owner may reset or
    /// drop it.
    unsafe fn release(core: NonNull<GraphCore>) {
        // SAFETY: Ensured by the caller. Only the counter is accessed.
        let in_flight = unsafe { &*ptr::addr_of!((*core.as_ptr()).in_flight) };
        in_flight.fetch_sub(1, StdOrdering::Release);
    }

    fn is_idle(&self) -> bool {
        self.in_flight.load(StdOrdering::Acquire) == 0
    }

    fn handle(&self, index: usize) -> GraphNodeHandle {
        let slot = &self.slots[index];
        GraphNodeHandle {
            index: index as u32,
            generation: slot.generation,
            graph: self.id,
            job: JobHandle::new(
                slot.job_id,
                slot.control(),
                self.arena.epoch(),
                self.class,
                self.scheduler.id(),
            ),
        }
    }

    /// Drops the data of every node in the current generation.
    fn drop_nodes(&mut self) {
        let node_count = self.node_count;
        for slot in &mut self.slots[..node_count] {
            if let Some(drop_data) = slot.drop_data.take() {
                // SAFETY: The data was written when the node was added, and no
                // node is in flight.
                unsafe { drop_data(slot.storage.cast()) };
            }
            slot.output = None;
        }
    }

    fn drop_callback(&mut self) {
        if let Some(callback) = self.on_complete.take() {
            // SAFETY: The callback is no longer reachable.
            unsafe { (callback.drop)(callback.data) };
        }
    }
}

// -----------------------------------------------------------------------------
// Job graph

/// A DAG of jobs allocated from one of the scheduler's arenas.
///
/// Build the graph with [`add_node`](Self::add_node),
/// [`add_map_node`](Self::add_map_node) and
/// [`set_dependencies`](Self::set_dependencies), then submit it with
/// [`Scheduler::submit_graph`](crate::Scheduler::submit_graph). Once submitted
/// its structure is frozen until [`reset`](Self::reset).
///
/// A live graph keeps its arena from being reset, so drop frame graphs before
/// calling [`JobSystem::end_frame`](crate::JobSystem::end_frame). Dropping a
/// graph waits for its in-flight nodes.
pub struct JobGraph {
    core: NonNull<GraphCore>,
    scheduler: Arc<Scheduler>,
}

// SAFETY: Node inputs and outputs are `Send + Sync`, and the core is only
// mutated through `&mut self`.
unsafe impl Send for JobGraph {}

// SAFETY: Shared access only reads plain fields and atomics.
unsafe impl Sync for JobGraph {}

impl JobGraph {
    pub(crate) fn new(
        scheduler: Arc<Scheduler>,
        class: MemoryClass,
        capacity: usize,
    ) -> Result<JobGraph, GraphError> {
        // SAFETY: The scheduler is kept alive by the `Arc` in the graph, and
        // its arena cannot be reset while the graph is attached to the scope.
        // Neither reference escapes the graph core, which is dropped before
        // the graph detaches.
        let scheduler_ref: &'static Scheduler = unsafe { &*Arc::as_ptr(&scheduler) };
        let scope = scheduler_ref.scope(class);
        scope.attach_graph();
        let arena = scheduler_ref.arena(class);

        let core = ArenaVec::try_with_capacity(arena, capacity).and_then(|slots| {
            arena.try_alloc(GraphCore {
                scheduler: scheduler_ref,
                arena,
                id: NEXT_GRAPH_ID.fetch_add(1, StdOrdering::Relaxed),
                class,
                generation: 1,
                capacity,
                slots,
                node_count: 0,
                submitted: false,
                in_flight: CachePadded::new(AtomicUsize::new(0)),
                terminal: None,
                on_complete: None,
            })
        });

        match core {
            Ok(core) => {
                debug!(graph = core.id, ?class, capacity, "created graph");
                Ok(JobGraph {
                    core: NonNull::from(core),
                    scheduler,
                })
            }
            Err(err) => {
                scope.detach_graph();
                Err(err.into())
            }
        }
    }

    fn core(&self) -> &GraphCore {
        // SAFETY: The core lives until the graph is dropped.
        unsafe { self.core.as_ref() }
    }

    /// Borrows the core mutably, which is only allowed before submission or
    /// once every node has finished.
    fn core_mut(&mut self) -> Result<&mut GraphCore, GraphError> {
        if self.core().submitted {
            return Err(GraphError::AlreadySubmitted);
        }
        // SAFETY: Nothing is submitted, so no worker holds a reference into
        // the core, and `&mut self` excludes every other reference.
        Ok(unsafe { self.core.as_mut() })
    }

    pub(crate) fn scheduler_id(&self) -> u32 {
        self.scheduler.id()
    }

    /// The arena this graph lives in.
    pub fn arena(&self) -> &Arena {
        self.core().arena
    }

    /// The memory class of the graph's arena.
    pub fn memory_class(&self) -> MemoryClass {
        self.core().class
    }

    /// Number of nodes added since creation or the last reset.
    pub fn node_count(&self) -> usize {
        self.core().node_count
    }

    /// Maximum number of nodes.
    pub fn capacity(&self) -> usize {
        self.core().capacity
    }

    /// Bumped by every reset.
    pub fn generation(&self) -> u32 {
        self.core().generation
    }

    /// Returns true once the graph has been submitted.
    pub fn is_submitted(&self) -> bool {
        self.core().submitted
    }

    // -------------------------------------------------------------------------
    // Construction

    /// Adds a node that reads `input`.
    pub fn add_node<N: Node>(&mut self, input: N::Input) -> Result<GraphNodeHandle, GraphError> {
        let graph = self.core;
        let (handle, _) = self.insert(
            |index| NodeJob::<N> {
                header: NodeHeader { graph, index },
                input,
            },
            execute_node::<N>,
        )?;
        Ok(handle)
    }

    /// Adds a node that reads `input` and writes to `output`.
    ///
    /// ```
    /// use gantry::{Config, JobSystem, MapNode, MemoryClass, NodeContext};
    ///
    /// struct Square;
    ///
    /// impl MapNode for Square {
    ///     type Input = u64;
    ///     type Output = u64;
    ///
    ///     fn run(input: &u64, output: &mut u64, _cx: &NodeContext<'_>) {
    ///         *output = input * input;
    ///     }
    /// }
    ///
    /// let system = JobSystem::new(Config::default().with_workers(1)).unwrap();
    /// let mut graph = system.create_graph(MemoryClass::LongLived).unwrap();
    /// let (node, squared) = graph.add_map_node::<Square>(12, 0).unwrap();
    /// system.submit_graph(&mut graph);
    /// system.wait(node.job());
    /// assert_eq!(graph.output(&squared), Some(&144));
    /// ```
    pub fn add_map_node<N: MapNode>(
        &mut self,
        input: N::Input,
        output: N::Output,
    ) -> Result<(GraphNodeHandle, OutputRef<N::Output>), GraphError> {
        let graph = self.core;
        let (handle, data) = self.insert(
            |index| MapNodeJob::<N> {
                header: NodeHeader { graph, index },
                input,
                output: UnsafeCell::new(output),
            },
            execute_map_node::<N>,
        )?;
        // SAFETY: `data` points at the node data that was just written.
        let output = unsafe { NonNull::from(&(*data.as_ptr()).output) };
        let core = self.core_mut()?;
        core.slots[handle.index as usize].output = Some(output.cast());
        Ok((
            handle,
            OutputRef {
                node: handle,
                _marker: PhantomData,
            },
        ))
    }

    /// Arms the next slot with the data built by `make`.
    fn insert<D, F>(
        &mut self,
        make: F,
        execute: unsafe fn(NonNull<()>, &JobContext<'_>),
    ) -> Result<(GraphNodeHandle, NonNull<D>), GraphError>
    where
        F: FnOnce(u32) -> D,
    {
        let core = self.core_mut()?;
        let index = core.node_count;
        if index >= core.capacity {
            return Err(GraphError::CapacityExceeded {
                capacity: core.capacity,
            });
        }

        let layout = Layout::new::<D>();
        if index == core.slots.len() {
            // First use of this slot.
            let arena = core.arena;
            let control = NonNull::from(arena.try_alloc(JobControlBlock::new())?);
            let dependents = ArenaVec::try_with_capacity(arena, DEPENDENTS_CAPACITY)?;
            let storage = arena.try_alloc_layout(layout)?;
            let slot = NodeSlot {
                // Overwritten below.
                // SAFETY: This placeholder job is never submitted.
                job: unsafe { Job::from_raw(storage.cast(), execute) },
                job_id: 0,
                control,
                dependents,
                counter: DependencyCounter::new(0),
                generation: core.generation,
                dependencies_set: false,
                storage,
                storage_layout: layout,
                drop_data: None,
                output: None,
            };
            if core.slots.try_push_within_capacity(slot).is_err() {
                return Err(GraphError::CapacityExceeded {
                    capacity: core.capacity,
                });
            }
        } else {
            // Reuse a slot left over from before the last reset, which already
            // re-armed it.
            let arena = core.arena;
            let slot = &mut core.slots[index];
            let fits = slot.storage_layout.size() >= layout.size()
                && slot.storage_layout.align() >= layout.align();
            if !fits {
                slot.storage = arena.try_alloc_layout(layout)?;
                slot.storage_layout = layout;
            }
        }

        let generation = core.generation;
        let class = core.class;
        let job_id = core.scheduler.next_job_id();
        let slot = &mut core.slots[index];
        let data = slot.storage.cast::<D>();
        // SAFETY: The storage is sized and aligned for `D`, and the previous
        // occupant (if any) was dropped by `reset`.
        unsafe { data.write(make(index as u32)) };
        slot.drop_data = mem::needs_drop::<D>().then_some(drop_data::<D> as unsafe fn(NonNull<()>));
        slot.generation = generation;
        slot.job_id = job_id;
        // SAFETY: The data and control block live in the graph's arena, which
        // outlives every submission of this node. `complete_node` expects the
        // data to start with a `NodeHeader`, which every node data type does.
        slot.job = unsafe {
            Job::from_raw(data.cast(), execute)
                .with_control(slot.control)
                .with_on_complete(complete_node)
        }
        .with_class(class);

        core.node_count += 1;
        Ok((core.handle(index), data))
    }

    /// Declares that `node` runs only after every node in `dependencies` has
    /// finished. May be called once per node, before submission.
    pub fn set_dependencies(
        &mut self,
        node: GraphNodeHandle,
        dependencies: &[GraphNodeHandle],
    ) -> Result<(), GraphError> {
        let core = self.core_mut()?;
        let index = core.slot_index(node)?;
        if core.slots[index].dependencies_set {
            return Err(GraphError::DependenciesAlreadySet { index: node.index });
        }
        for &dependency in dependencies {
            let dependency_index = core.slot_index(dependency)?;
            if dependency_index == index {
                return Err(GraphError::SelfDependency { index: node.index });
            }
        }

        let in_degree = u32::try_from(dependencies.len()).map_err(|_| GraphError::CapacityExceeded {
            capacity: u32::MAX as usize,
        })?;
        for (pushed, &dependency) in dependencies.iter().enumerate() {
            let dependents = &mut core.slots[dependency.index as usize].dependents;
            if let Err(err) = dependents.try_reserve(1) {
                // Leave the graph as it was.
                for &undo in &dependencies[..pushed] {
                    core.slots[undo.index as usize].dependents.pop();
                }
                return Err(err.into());
            }
            // Cannot fail, capacity was just reserved.
            let _ = dependents.try_push_within_capacity(node);
        }
        let slot = &mut core.slots[index];
        slot.counter.reset(in_degree);
        slot.dependencies_set = true;
        Ok(())
    }

    /// Adds `flags` to a node's job.
    pub fn set_flags(&mut self, node: GraphNodeHandle, flags: JobFlags) -> Result<(), GraphError> {
        let core = self.core_mut()?;
        let index = core.slot_index(node)?;
        let slot = &mut core.slots[index];
        // SAFETY: The job has not been submitted, so this is the only copy.
        let job = unsafe { slot.job.duplicate() };
        slot.job = job.with_flags(flags);
        Ok(())
    }

    /// Pins a node's job to worker `worker`.
    pub fn set_affinity(&mut self, node: GraphNodeHandle, worker: usize) -> Result<(), GraphError> {
        let core = self.core_mut()?;
        let index = core.slot_index(node)?;
        let slot = &mut core.slots[index];
        // SAFETY: As in `set_flags`.
        let job = unsafe { slot.job.duplicate() };
        slot.job = job.with_affinity(worker);
        Ok(())
    }

    /// Designates the node whose completion triggers the graph completion
    /// callback.
    pub fn set_terminal_node(&mut self, node: GraphNodeHandle) -> Result<(), GraphError> {
        let core = self.core_mut()?;
        core.slot_index(node)?;
        core.terminal = Some(node.index);
        Ok(())
    }

    /// Sets the callback run on the worker that finishes the terminal node
    /// (see [`set_terminal_node`](Self::set_terminal_node)). Without a terminal
    /// node it never runs. The callback survives resets.
    pub fn set_on_graph_complete<F>(&mut self, f: F) -> Result<(), GraphError>
    where
        F: Fn(GraphNodeHandle) + Send + Sync + 'static,
    {
        let core = self.core_mut()?;
        let data = NonNull::from(core.arena.try_alloc(f)?).cast();
        core.drop_callback();
        core.on_complete = Some(GraphCallback {
            data,
            call: call_graph_callback::<F>,
            drop: drop_data::<F>,
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Execution

    /// Submits every node with no unfinished dependencies, and freezes the
    /// graph. Returns the number of nodes submitted. Calling this again before
    /// a reset submits nothing new.
    pub fn submit_ready_jobs(&mut self) -> usize {
        if let Ok(core) = self.core_mut() {
            core.submitted = true;
        }
        let core = self.core();
        let mut submitted = 0;
        for slot in core.nodes() {
            if slot.counter.try_claim_ready() {
                core.submit(slot);
                submitted += 1;
            }
        }
        debug!(graph = core.id, submitted, "submitted graph");
        submitted
    }

    /// Returns true if no submitted node is still running or propagating.
    pub fn is_idle(&self) -> bool {
        self.core().is_idle()
    }

    /// Blocks until no submitted node is still running or propagating. Nodes
    /// that were never released, because a predecessor was never submitted,
    /// are not waited for.
    pub fn wait(&self) {
        let core = self.core();
        self.scheduler.wait_until(|| core.is_idle());
    }

    /// Reads a map node's output. Returns `None` until the node has finished,
    /// or if it panicked, or if the reference is from another graph or an
    /// earlier generation.
    pub fn output<T>(&self, output: &OutputRef<T>) -> Option<&T> {
        self.core().output(output)
    }

    /// The state of a node's job, or `None` for stale handles.
    pub fn state(&self, node: GraphNodeHandle) -> Option<JobState> {
        let core = self.core();
        let index = core.slot_index(node).ok()?;
        Some(core.slots[index].control().state())
    }

    /// Waits for in-flight nodes, drops every node, and starts a new
    /// generation. Slot storage, control blocks and dependents lists are kept
    /// and reused by the next nodes added. Handles from before the reset go
    /// stale.
    pub fn reset(&mut self) {
        self.wait();
        // SAFETY: No node is in flight, and `&mut self` excludes every other
        // reference.
        let core = unsafe { self.core.as_mut() };
        core.drop_nodes();
        let node_count = core.node_count;
        for slot in &mut core.slots[..node_count] {
            slot.control().rearm();
            slot.dependents.clear();
            slot.counter.reset(0);
            slot.dependencies_set = false;
        }
        core.node_count = 0;
        core.generation = core.generation.wrapping_add(1).max(1);
        core.submitted = false;
        core.terminal = None;
        trace!(graph = core.id, generation = core.generation, "reset graph");
    }
}

impl Drop for JobGraph {
    fn drop(&mut self) {
        self.wait();
        let class = self.core().class;
        // SAFETY: No node is in flight, so this is the only reference to the
        // core, which is never used again.
        unsafe {
            let core = self.core.as_mut();
            core.drop_nodes();
            core.drop_callback();
            ptr::drop_in_place(self.core.as_ptr());
        }
        self.scheduler.scope(class).detach_graph();
    }
}

impl fmt::Debug for JobGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        f.debug_struct("JobGraph")
            .field("id", &core.id)
            .field("class", &core.class)
            .field("generation", &core.generation)
            .field("nodes", &core.node_count)
            .field("capacity", &core.capacity)
            .field("submitted", &core.submitted)
            .finish()
    }
}
