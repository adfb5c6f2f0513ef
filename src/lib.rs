//! A frame-oriented job system with arena-scoped memory and dependency graphs.
//!
//! Gantry runs short-lived jobs on a fixed pool of worker threads. It is built
//! for real-time loops (games, simulations) where work is scheduled, executed
//! and reclaimed within a frame, and where the hot path should never touch the
//! general-purpose heap.
//!
//! Every job and every graph lives in one of two arenas:
//!
//! + The *frame* arena, reclaimed in bulk by [`JobSystem::end_frame`].
//! + The *long-lived* arena, reclaimed only by
//!   [`JobSystem::reset_long_lived`].
//!
//! Jobs can be submitted on their own with [`Scheduler::spawn`], or arranged
//! into a [`JobGraph`]. A graph is a DAG of nodes; each node becomes ready once
//! all of its predecessors have finished, and the worker that finishes the last
//! predecessor submits it. There is no central scheduling loop beyond the
//! workers themselves.
//!
//! Workers look for work in a fixed order: their own local queue, then the
//! system's high-priority queue, then the global queue. There is no
//! work-stealing.
//!
//! ```
//! use gantry::{Config, JobSystem, MapNode, MemoryClass, NodeContext};
//!
//! struct Double;
//!
//! impl MapNode for Double {
//!     type Input = u32;
//!     type Output = u32;
//!
//!     fn run(input: &u32, output: &mut u32, _cx: &NodeContext<'_>) {
//!         *output = input * 2;
//!     }
//! }
//!
//! let system = JobSystem::new(Config::default().with_workers(2)).unwrap();
//! let mut graph = system.create_graph(MemoryClass::Frame).unwrap();
//! let (_, doubled) = graph.add_map_node::<Double>(21, 0).unwrap();
//! system.submit_graph(&mut graph);
//! graph.wait();
//! assert_eq!(graph.output(&doubled), Some(&42));
//! ```

#![no_std]

// -----------------------------------------------------------------------------
// Boilerplate for building without the standard library

extern crate alloc;
extern crate std;

// -----------------------------------------------------------------------------
// Modules

mod arena;
mod arena_vec;
mod compile_fail;
mod error;
mod graph;
mod job;
mod queue;
mod scope;
mod sleep;
mod system;
mod unwind;
mod worker;

// -----------------------------------------------------------------------------
// Top-level exports

pub use arena::Arena;
pub use arena_vec::ArenaVec;
pub use error::AllocError;
pub use error::FrameError;
pub use error::GraphError;
pub use error::SystemError;
pub use graph::DependencyCounter;
pub use graph::GraphNodeHandle;
pub use graph::JobGraph;
pub use graph::MapNode;
pub use graph::Node;
pub use graph::NodeContext;
pub use graph::OutputRef;
pub use job::Job;
pub use job::JobContext;
pub use job::JobControlBlock;
pub use job::JobFlags;
pub use job::JobHandle;
pub use job::JobState;
pub use queue::BoundedQueue;
pub use queue::EnqueueError;
pub use system::Config;
pub use system::JobSystem;
pub use system::MemoryClass;
pub use system::Scheduler;

// -----------------------------------------------------------------------------
// Platform Support

// The control block and the dependency counter carry the load-bearing memory
// orderings of this crate, and are model-checked with `loom`. Under `cfg(loom)`
// their atomics are swapped for loom's instrumented versions.
//
// Everything else uses `core` atomics directly: loom atomics cannot live in
// statics, and the futex used for idle sleep needs a real `AtomicU32`.

#[cfg(not(loom))]
mod platform {
    pub use core::sync::atomic::AtomicBool;
    pub use core::sync::atomic::AtomicU8;
    pub use core::sync::atomic::AtomicU32;
    pub use core::sync::atomic::Ordering;
}

#[cfg(loom)]
mod platform {
    pub use core::sync::atomic::Ordering;
    pub use loom::sync::atomic::AtomicBool;
    pub use loom::sync::atomic::AtomicU8;
    pub use loom::sync::atomic::AtomicU32;
}
