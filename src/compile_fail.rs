//! Contains a set of compile failure doctests.

// -----------------------------------------------------------------------------
// Ensures only node types can be added to a graph.

/** ```compile_fail,E0277

use gantry::{Config, JobSystem, MemoryClass};

struct NotANode;

let system = JobSystem::new(Config::default().with_workers(1)).unwrap();
let mut graph = system.create_graph(MemoryClass::Frame).unwrap();
graph.add_node::<NotANode>(()); //~ ERROR

``` */
mod unsupported_node_type {}

/** ```compile_fail,E0277

use gantry::{Config, JobSystem, MemoryClass, Node, NodeContext};

struct Log;

impl Node for Log {
    type Input = &'static str;

    fn run(input: &&'static str, _cx: &NodeContext<'_>) {
        println!("{input}");
    }
}

let system = JobSystem::new(Config::default().with_workers(1)).unwrap();
let mut graph = system.create_graph(MemoryClass::Frame).unwrap();
graph.add_map_node::<Log>("hello", ()); //~ ERROR

``` */
mod node_added_as_map_node {}

// -----------------------------------------------------------------------------
// Ensures node inputs can be shared between threads.

/** ```compile_fail,E0277

use std::rc::Rc;
use gantry::{Node, NodeContext};

struct Shared;

impl Node for Shared {
    type Input = Rc<u32>; //~ ERROR

    fn run(_input: &Rc<u32>, _cx: &NodeContext<'_>) {}
}

``` */
mod nonsync_node_input {}

// -----------------------------------------------------------------------------
// Ensures outputs are read with the type the node produces.

/** ```compile_fail,E0308

use gantry::{Config, JobSystem, MapNode, MemoryClass, NodeContext};

struct Length;

impl MapNode for Length {
    type Input = String;
    type Output = usize;

    fn run(input: &String, output: &mut usize, _cx: &NodeContext<'_>) {
        *output = input.len();
    }
}

let system = JobSystem::new(Config::default().with_workers(1)).unwrap();
let mut graph = system.create_graph(MemoryClass::Frame).unwrap();
let (_, length) = graph.add_map_node::<Length>("gantry".into(), 0).unwrap();
system.submit_graph(&mut graph);
graph.wait();
let length: Option<&String> = graph.output(&length); //~ ERROR

``` */
mod output_type_mismatch {}

// -----------------------------------------------------------------------------
// Ensures non-send data cannot be moved into a job.

/** ```compile_fail,E0277

use std::rc::Rc;
use gantry::{Config, JobSystem, MemoryClass};

let system = JobSystem::new(Config::default().with_workers(1)).unwrap();
let r = Rc::new(22);
system.spawn(MemoryClass::Frame, move |_| drop(r)); //~ ERROR

``` */
mod nonsend_spawn {}

// -----------------------------------------------------------------------------
// Ensures jobs cannot borrow from the stack of the thread that spawned them.

/** ```compile_fail,E0373

use gantry::{Config, JobSystem, MemoryClass};

let system = JobSystem::new(Config::default().with_workers(1)).unwrap();
let mut total = 0;
system.spawn(MemoryClass::Frame, |_| total += 1); //~ ERROR

``` */
mod borrowing_spawn {}
