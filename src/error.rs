//! Error types returned by arenas, graphs and the job system.

use thiserror::Error;

/// An arena could not satisfy an allocation.
///
/// The panicking allocation methods on [`Arena`](crate::Arena) panic with this
/// error's message instead of returning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "arena exhausted: requested {requested} bytes aligned to {align}, \
     {remaining} of {capacity} bytes remaining"
)]
pub struct AllocError {
    /// Size of the rejected request in bytes, or `usize::MAX` if the request
    /// size itself overflowed.
    pub requested: usize,
    /// Alignment of the rejected request.
    pub align: usize,
    /// Bytes left in the arena when the request was made.
    pub remaining: usize,
    /// Total capacity of the arena.
    pub capacity: usize,
}

/// Rejected operations on a [`JobGraph`](crate::JobGraph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The graph already holds as many nodes as it was created for.
    #[error("graph capacity of {capacity} nodes exceeded")]
    CapacityExceeded {
        /// The fixed node capacity of the graph.
        capacity: usize,
    },
    /// The handle was issued by another graph, or before the last reset.
    #[error("node handle does not belong to this graph generation")]
    StaleHandle,
    /// Dependencies may only be set once per node.
    #[error("dependencies of node {index} were already set")]
    DependenciesAlreadySet {
        /// Slot index of the node.
        index: u32,
    },
    /// A node was listed as its own dependency.
    #[error("node {index} cannot depend on itself")]
    SelfDependency {
        /// Slot index of the node.
        index: u32,
    },
    /// The graph is executing; its structure is frozen until
    /// [`JobGraph::reset`](crate::JobGraph::reset).
    #[error("graph was already submitted")]
    AlreadySubmitted,
    /// The graph's arena is exhausted.
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// An arena reset was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Graphs allocated from the arena are still alive. Drop them first.
    #[error("{count} graph(s) still reference the arena")]
    LiveGraphs {
        /// Number of live graphs.
        count: usize,
    },
}

/// Failures starting or stopping a [`JobSystem`](crate::JobSystem).
#[derive(Debug, Error)]
pub enum SystemError {
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread")]
    Spawn(#[from] std::io::Error),
    /// The internal arena was too small to carve out worker scratch arenas.
    #[error("failed to reserve worker scratch memory")]
    Alloc(#[from] AllocError),
    /// One or more worker threads panicked outside of a job.
    #[error("{count} worker thread(s) panicked")]
    WorkerPanicked {
        /// Number of workers that terminated by panicking.
        count: usize,
    },
}
