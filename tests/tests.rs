//! Integration tests for the job system, its graphs and its arenas.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use gantry::*;

// -----------------------------------------------------------------------------
// Helpers

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn system(workers: usize) -> JobSystem {
    init_tracing();
    JobSystem::new(Config::default().with_workers(workers)).unwrap()
}

/// Occupies one worker until the returned flag is set.
fn block_worker(system: &JobSystem) -> (JobHandle, Arc<AtomicBool>) {
    let open = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    let handle = system.spawn(MemoryClass::LongLived, {
        let open = Arc::clone(&open);
        let started = Arc::clone(&started);
        move |_| {
            started.store(true, Ordering::Release);
            while !open.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
        }
    });
    while !started.load(Ordering::Acquire) {
        thread::yield_now();
    }
    (handle, open)
}

/// Copies its input to its output.
struct Source;

impl MapNode for Source {
    type Input = u64;
    type Output = u64;

    fn run(input: &u64, output: &mut u64, _cx: &NodeContext<'_>) {
        *output = *input;
    }
}

/// Multiplies another node's output by a factor.
struct Scale;

impl MapNode for Scale {
    type Input = (OutputRef<u64>, u64);
    type Output = u64;

    fn run((source, factor): &(OutputRef<u64>, u64), output: &mut u64, cx: &NodeContext<'_>) {
        let value = cx.output(source).expect("predecessor has finished");
        *output = value * factor;
    }
}

/// Adds two other nodes' outputs.
struct Sum;

impl MapNode for Sum {
    type Input = [OutputRef<u64>; 2];
    type Output = u64;

    fn run(inputs: &[OutputRef<u64>; 2], output: &mut u64, cx: &NodeContext<'_>) {
        *output = inputs
            .iter()
            .map(|input| cx.output(input).expect("predecessor has finished"))
            .sum();
    }
}

/// Bumps a shared counter.
struct Count;

impl Node for Count {
    type Input = Arc<AtomicUsize>;

    fn run(counter: &Arc<AtomicUsize>, _cx: &NodeContext<'_>) {
        counter.fetch_add(1, Ordering::AcqRel);
    }
}

/// Always panics.
struct Explode;

impl Node for Explode {
    type Input = ();

    fn run(_: &(), _cx: &NodeContext<'_>) {
        panic!("node exploded");
    }
}

/// Builds `source -> (left, right) -> sum` and returns the sum's handle and
/// output.
fn diamond(graph: &mut JobGraph, value: u64) -> (GraphNodeHandle, OutputRef<u64>) {
    let (source, source_out) = graph.add_map_node::<Source>(value, 0).unwrap();
    let (left, left_out) = graph.add_map_node::<Scale>((source_out, 2), 0).unwrap();
    let (right, right_out) = graph.add_map_node::<Scale>((source_out, 3), 0).unwrap();
    let (sum, sum_out) = graph.add_map_node::<Sum>([left_out, right_out], 0).unwrap();
    graph.set_dependencies(left, &[source]).unwrap();
    graph.set_dependencies(right, &[source]).unwrap();
    graph.set_dependencies(sum, &[left, right]).unwrap();
    (sum, sum_out)
}

// -----------------------------------------------------------------------------
// Graphs

#[test]
fn diamond_graph_runs_in_dependency_order() {
    let system = system(4);
    let mut graph = system.create_graph(MemoryClass::Frame).unwrap();
    let (sum, sum_out) = diamond(&mut graph, 5);

    assert_eq!(system.submit_graph(&mut graph), 1);
    graph.wait();

    assert_eq!(graph.output(&sum_out), Some(&25));
    assert_eq!(graph.state(sum), Some(JobState::Completed));
    assert!(system.is_complete(sum.job()));
    assert!(graph.is_idle());
}

#[test]
fn waiting_on_a_node_observes_its_output() {
    let system = system(2);
    let mut graph = system.create_graph(MemoryClass::LongLived).unwrap();
    let (sum, sum_out) = diamond(&mut graph, 1);
    system.submit_graph(&mut graph);

    system.wait(sum.job());
    assert_eq!(graph.output(&sum_out), Some(&5));
}

#[test]
fn graph_capacity_is_enforced() {
    let system = system(1);
    let mut graph = system
        .create_graph_with_capacity(MemoryClass::Frame, 2)
        .unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    graph.add_node::<Count>(Arc::clone(&counter)).unwrap();
    graph.add_node::<Count>(Arc::clone(&counter)).unwrap();
    assert_eq!(
        graph.add_node::<Count>(Arc::clone(&counter)),
        Err(GraphError::CapacityExceeded { capacity: 2 })
    );
    assert_eq!(graph.node_count(), 2);

    system.submit_graph(&mut graph);
    graph.wait();
    assert_eq!(counter.load(Ordering::Acquire), 2);
}

#[test]
fn dependencies_are_validated() {
    let system = system(1);
    let mut graph = system.create_graph(MemoryClass::Frame).unwrap();
    let mut other = system.create_graph(MemoryClass::Frame).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let a = graph.add_node::<Count>(Arc::clone(&counter)).unwrap();
    let b = graph.add_node::<Count>(Arc::clone(&counter)).unwrap();
    let foreign = other.add_node::<Count>(Arc::clone(&counter)).unwrap();

    assert_eq!(
        graph.set_dependencies(a, &[a]),
        Err(GraphError::SelfDependency { index: a.index() })
    );
    assert_eq!(
        graph.set_dependencies(a, &[foreign]),
        Err(GraphError::StaleHandle)
    );
    assert_eq!(
        graph.set_dependencies(GraphNodeHandle::INVALID, &[a]),
        Err(GraphError::StaleHandle)
    );

    graph.set_dependencies(b, &[a]).unwrap();
    assert_eq!(
        graph.set_dependencies(b, &[a]),
        Err(GraphError::DependenciesAlreadySet { index: b.index() })
    );

    assert_eq!(system.submit_graph(&mut graph), 1);
    assert_eq!(
        graph.add_node::<Count>(Arc::clone(&counter)),
        Err(GraphError::AlreadySubmitted)
    );
    assert_eq!(
        graph.set_dependencies(a, &[]),
        Err(GraphError::AlreadySubmitted)
    );

    graph.wait();
    assert_eq!(counter.load(Ordering::Acquire), 2);
}

#[test]
fn resubmitting_submits_nothing() {
    let system = system(2);
    let mut graph = system.create_graph(MemoryClass::Frame).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        graph.add_node::<Count>(Arc::clone(&counter)).unwrap();
    }

    assert_eq!(graph.submit_ready_jobs(), 4);
    assert_eq!(graph.submit_ready_jobs(), 0);
    graph.wait();
    assert_eq!(counter.load(Ordering::Acquire), 4);
}

#[test]
fn wide_fan_in_runs_the_sink_exactly_once() {
    const ROOTS: usize = 64;
    const ROUNDS: usize = 50;

    let system = system(4);
    let mut graph = system
        .create_graph_with_capacity(MemoryClass::LongLived, ROOTS + 1)
        .unwrap();
    let roots_run = Arc::new(AtomicUsize::new(0));
    let sink_run = Arc::new(AtomicUsize::new(0));

    for round in 1..=ROUNDS {
        let roots: Vec<_> = (0..ROOTS)
            .map(|_| graph.add_node::<Count>(Arc::clone(&roots_run)).unwrap())
            .collect();
        let sink = graph.add_node::<Count>(Arc::clone(&sink_run)).unwrap();
        graph.set_dependencies(sink, &roots).unwrap();

        assert_eq!(system.submit_graph(&mut graph), ROOTS);
        graph.wait();

        assert_eq!(roots_run.load(Ordering::Acquire), ROOTS * round);
        assert_eq!(sink_run.load(Ordering::Acquire), round);
        graph.reset();
    }
}

#[test]
fn reset_reuses_the_graph() {
    let system = system(2);
    let mut graph = system.create_graph(MemoryClass::Frame).unwrap();

    let (first, first_out) = diamond(&mut graph, 2);
    system.submit_graph(&mut graph);
    graph.wait();
    assert_eq!(graph.output(&first_out), Some(&10));

    let generation = graph.generation();
    let used = graph.arena().used();
    graph.reset();
    assert_eq!(graph.node_count(), 0);
    assert_eq!(graph.generation(), generation + 1);
    assert!(!graph.is_submitted());

    // Handles from the previous generation are stale.
    assert_eq!(graph.output(&first_out), None);
    assert_eq!(graph.state(first), None);
    assert_eq!(system.state(first.job()), None);
    assert!(!system.cancel(first.job()));

    let (second, second_out) = diamond(&mut graph, 2);
    assert_ne!(first, second);
    system.submit_graph(&mut graph);
    graph.wait();
    assert_eq!(graph.output(&second_out), Some(&10));

    // The same shape fits in the slots left by the first generation.
    assert_eq!(graph.arena().used(), used);
}

#[test]
fn reset_of_an_unsubmitted_graph_drops_its_nodes() {
    let system = system(1);
    let mut graph = system.create_graph(MemoryClass::Frame).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    graph.add_node::<Count>(Arc::clone(&counter)).unwrap();
    assert_eq!(Arc::strong_count(&counter), 2);

    graph.reset();
    graph.reset();
    assert_eq!(Arc::strong_count(&counter), 1);
    assert_eq!(counter.load(Ordering::Acquire), 0);
}

#[test]
fn panicking_node_still_releases_dependents() {
    let system = system(2);
    let mut graph = system.create_graph(MemoryClass::Frame).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let explode = graph.add_node::<Explode>(()).unwrap();
    let after = graph.add_node::<Count>(Arc::clone(&counter)).unwrap();
    graph.set_dependencies(after, &[explode]).unwrap();
    system.submit_graph(&mut graph);
    graph.wait();

    assert_eq!(graph.state(explode), Some(JobState::Panicked));
    assert_eq!(graph.state(after), Some(JobState::Completed));
    assert_eq!(counter.load(Ordering::Acquire), 1);
}

#[test]
fn terminal_node_triggers_completion_callback() {
    let system = system(2);
    let mut graph = system.create_graph(MemoryClass::Frame).unwrap();
    let completed = Arc::new(AtomicU32::new(0));

    let (sum, sum_out) = diamond(&mut graph, 3);
    graph.set_terminal_node(sum).unwrap();
    graph
        .set_on_graph_complete({
            let completed = Arc::clone(&completed);
            move |node| {
                completed.store(node.index() + 1, Ordering::Release);
            }
        })
        .unwrap();

    system.submit_graph(&mut graph);
    graph.wait();
    assert_eq!(graph.output(&sum_out), Some(&15));
    assert_eq!(completed.load(Ordering::Acquire), sum.index() + 1);

    // The callback survives a reset, but the terminal node does not.
    completed.store(0, Ordering::Release);
    graph.reset();
    diamond(&mut graph, 3);
    system.submit_graph(&mut graph);
    graph.wait();
    assert_eq!(completed.load(Ordering::Acquire), 0);
}

#[test]
fn cancelable_graph_node_skips_its_body() {
    let system = system(1);
    let (gate, open) = block_worker(&system);

    let mut graph = system.create_graph(MemoryClass::Frame).unwrap();
    let skipped = Arc::new(AtomicUsize::new(0));
    let after = Arc::new(AtomicUsize::new(0));
    let node = graph.add_node::<Count>(Arc::clone(&skipped)).unwrap();
    let next = graph.add_node::<Count>(Arc::clone(&after)).unwrap();
    graph.set_flags(node, JobFlags::CANCELABLE).unwrap();
    graph.set_dependencies(next, &[node]).unwrap();
    system.submit_graph(&mut graph);

    assert!(system.cancel(node.job()));
    open.store(true, Ordering::Release);
    graph.wait();
    system.wait(gate);

    assert_eq!(graph.state(node), Some(JobState::Cancelled));
    assert_eq!(skipped.load(Ordering::Acquire), 0);
    assert_eq!(graph.state(next), Some(JobState::Completed));
    assert_eq!(after.load(Ordering::Acquire), 1);
}

#[test]
fn live_graphs_block_the_frame_reset() {
    let mut system = system(1);
    let graph = system.create_graph(MemoryClass::Frame).unwrap();

    assert_eq!(system.end_frame(), Err(FrameError::LiveGraphs { count: 1 }));
    // Long-lived memory is unaffected by frame graphs.
    assert_eq!(system.reset_long_lived(), Ok(()));

    drop(graph);
    assert_eq!(system.end_frame(), Ok(()));
}

// -----------------------------------------------------------------------------
// Jobs

#[test]
fn independent_jobs_both_finish() {
    let system = system(2);
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = ["first", "second"]
        .into_iter()
        .map(|name| {
            let order = Arc::clone(&order);
            system.spawn(MemoryClass::Frame, move |_| {
                order.lock().unwrap().push(name);
            })
        })
        .collect();

    for &handle in &handles {
        system.wait(handle);
        assert!(system.state(handle).unwrap().is_terminal());
        assert!(system.is_complete(handle));
    }

    let mut order = order.lock().unwrap().clone();
    order.sort_unstable();
    assert_eq!(order, ["first", "second"]);
}

#[test]
fn cancelled_job_does_not_affect_its_neighbours() {
    let system = system(1);
    let (gate, open) = block_worker(&system);

    let ran = Arc::new(AtomicUsize::new(0));
    let spawn_counting = |flags| {
        let ran = Arc::clone(&ran);
        system.spawn_with(MemoryClass::Frame, flags, move |_| {
            ran.fetch_add(1, Ordering::AcqRel);
        })
    };
    let b = spawn_counting(JobFlags::empty());
    let c = spawn_counting(JobFlags::empty());
    assert_eq!(system.state(b), Some(JobState::Pending));

    assert!(system.cancel(b));
    open.store(true, Ordering::Release);
    system.wait(gate);
    system.wait(b);
    system.wait(c);

    assert!(system.is_cancelled(b));
    assert!(!system.is_complete(b));
    assert!(system.is_complete(c));
    assert!(!system.is_cancelled(c));
    // Without `CANCELABLE` the body still runs.
    assert_eq!(ran.load(Ordering::Acquire), 2);
}

#[test]
fn cancelable_job_skips_its_body() {
    let system = system(1);
    let (gate, open) = block_worker(&system);

    let ran = Arc::new(AtomicBool::new(false));
    let job = system.spawn_with(MemoryClass::Frame, JobFlags::CANCELABLE, {
        let ran = Arc::clone(&ran);
        move |_| ran.store(true, Ordering::Release)
    });

    system.cancel(job);
    open.store(true, Ordering::Release);
    system.wait(gate);
    system.wait(job);

    assert!(system.is_cancelled(job));
    assert!(!ran.load(Ordering::Acquire));
}

#[test]
fn high_priority_jobs_run_first() {
    let system = system(1);
    let (gate, open) = block_worker(&system);
    let order = Arc::new(Mutex::new(Vec::new()));

    let record = |name: &'static str| {
        let order = Arc::clone(&order);
        move |_: &JobContext<'_>| order.lock().unwrap().push(name)
    };
    let normal = system.spawn(MemoryClass::Frame, record("normal"));
    let urgent = system.spawn_with(
        MemoryClass::Frame,
        JobFlags::HIGH_PRIORITY,
        record("urgent"),
    );

    open.store(true, Ordering::Release);
    system.wait(gate);
    system.wait(normal);
    system.wait(urgent);

    assert_eq!(*order.lock().unwrap(), ["urgent", "normal"]);
}

#[test]
fn affinity_pins_jobs_to_a_worker() {
    let system = system(3);
    let (tx, rx) = mpsc::channel();

    for _ in 0..8 {
        let tx = tx.clone();
        system.spawn_on(MemoryClass::Frame, 2, JobFlags::empty(), move |cx| {
            tx.send(cx.worker_index()).unwrap();
        });
    }

    for _ in 0..8 {
        let worker = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(worker, 2);
    }
}

#[test]
fn detached_jobs_have_no_handle() {
    let system = system(1);
    let (tx, rx) = mpsc::channel();

    let handle = system.spawn_with(MemoryClass::Frame, JobFlags::DETACHED, move |_| {
        tx.send(7).unwrap();
    });

    assert!(!handle.is_valid());
    assert_eq!(handle, JobHandle::INVALID);
    system.wait(handle);
    assert_eq!(system.state(handle), None);
    assert!(!system.cancel(handle));
    assert!(!system.is_complete(handle));
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 7);
}

#[test]
fn invalid_handles_are_inert() {
    let system = system(1);
    let handle = JobHandle::default();

    system.wait(handle);
    assert!(!handle.is_valid());
    assert_eq!(handle.generation(), 0);
    assert!(!system.cancel(handle));
    assert!(!system.is_complete(handle));
    assert!(!system.is_cancelled(handle));

    let node = GraphNodeHandle::default();
    assert!(!node.is_valid());
    assert!(!node.job().is_valid());
}

#[test]
fn handles_go_stale_at_the_end_of_the_frame() {
    let mut system = system(2);
    let handle = system.spawn(MemoryClass::Frame, |_| {});
    system.wait(handle);
    assert!(system.is_complete(handle));

    system.end_frame().unwrap();

    assert_eq!(system.state(handle), None);
    assert!(!system.is_complete(handle));
    assert!(!system.cancel(handle));
    system.wait(handle);
    assert_eq!(system.frame_arena().used(), 0);
}

#[test]
fn handles_from_another_system_are_ignored() {
    let first = system(1);
    let second = system(1);
    let handle = first.spawn(MemoryClass::LongLived, |_| {});
    first.wait(handle);

    assert!(first.is_complete(handle));
    assert_eq!(second.state(handle), None);
}

#[test]
fn nested_wait_helps_instead_of_deadlocking() {
    let system = system(1);
    let (tx, rx) = mpsc::channel();

    let outer = system.spawn(MemoryClass::LongLived, move |cx| {
        let scheduler = cx.scheduler();
        let inner = scheduler.spawn(MemoryClass::LongLived, |_| {});
        scheduler.wait(inner);
        tx.send(scheduler.is_complete(inner)).unwrap();
    });

    system.wait(outer);
    assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
}

#[test]
fn panicking_job_is_recorded() {
    let system = system(1);
    let handle = system.spawn(MemoryClass::Frame, |_| panic!("job exploded"));
    system.wait(handle);
    assert_eq!(system.state(handle), Some(JobState::Panicked));

    // The worker survives.
    let after = system.spawn(MemoryClass::Frame, |_| {});
    system.wait(after);
    assert!(system.is_complete(after));
}

#[test]
fn full_queues_block_submission_until_drained() {
    init_tracing();
    let system = JobSystem::new(Config::default().with_workers(2).with_queue_capacity(2)).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let counter = Arc::clone(&counter);
            system.spawn(MemoryClass::LongLived, move |_| {
                counter.fetch_add(1, Ordering::AcqRel);
            })
        })
        .collect();

    for handle in handles {
        system.wait(handle);
    }
    assert_eq!(counter.load(Ordering::Acquire), 64);
}

#[test]
fn scratch_arena_is_reset_between_jobs() {
    let system = system(1);
    let (tx, rx) = mpsc::channel();

    let spawn_probe = |flags| {
        let tx = tx.clone();
        let handle = system.spawn_with(MemoryClass::Frame, flags, move |cx| {
            let scratch = cx.scratch();
            tx.send(scratch.used()).unwrap();
            scratch.alloc([0_u8; 64]);
            Arena::with_current(|current| {
                assert!(current.is_some_and(|current| std::ptr::eq(current, scratch)));
            });
        });
        system.wait(handle);
        rx.recv_timeout(Duration::from_secs(10)).unwrap()
    };

    assert_eq!(spawn_probe(JobFlags::empty()), 0);
    assert_eq!(spawn_probe(JobFlags::SKIP_ARENA_RESET), 0);
    assert!(spawn_probe(JobFlags::empty()) >= 64);
    assert_eq!(spawn_probe(JobFlags::empty()), 0);
}

#[test]
fn shutdown_cancels_queued_jobs() {
    let system = system(0);
    let scheduler = Arc::clone(system.scheduler());
    let queued = scheduler.spawn(MemoryClass::LongLived, |_| {});
    assert_eq!(scheduler.state(queued), Some(JobState::Pending));

    system.shutdown().unwrap();
    assert_eq!(scheduler.state(queued), Some(JobState::Cancelled));

    let late = scheduler.spawn(MemoryClass::LongLived, |_| {});
    assert_eq!(scheduler.state(late), Some(JobState::Cancelled));
}

/// Spins until its flag is set.
struct Gate;

impl Node for Gate {
    type Input = Arc<AtomicBool>;

    fn run(open: &Arc<AtomicBool>, _cx: &NodeContext<'_>) {
        while !open.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }
}

/// Shuts `system` down on another thread, opens `open` once shutdown has begun,
/// and returns the result.
fn shutdown_then_open(system: JobSystem, open: &AtomicBool) -> Result<(), SystemError> {
    let scheduler = Arc::clone(system.scheduler());
    let (sender, receiver) = mpsc::channel();
    let stopper = thread::spawn(move || sender.send(system.shutdown()).unwrap());
    while !scheduler.is_shut_down() {
        thread::yield_now();
    }
    open.store(true, Ordering::Release);
    let result = receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("shutdown did not return");
    stopper.join().unwrap();
    result
}

#[test]
fn shutdown_releases_waits_on_pinned_jobs() {
    let system = system(2);
    let scheduler = Arc::clone(system.scheduler());

    // Hold worker 1 so the next job pinned to it stays queued.
    let open = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    let gate = scheduler.spawn_on(MemoryClass::LongLived, 1, JobFlags::empty(), {
        let open = Arc::clone(&open);
        let started = Arc::clone(&started);
        move |_| {
            started.store(true, Ordering::Release);
            while !open.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
        }
    });
    while !started.load(Ordering::Acquire) {
        thread::yield_now();
    }

    let (sender, receiver) = mpsc::channel::<()>();
    let pinned = scheduler.spawn_on(MemoryClass::LongLived, 1, JobFlags::empty(), move |_| {
        let _ = sender.send(());
    });

    let waiting = Arc::new(AtomicBool::new(false));
    let waiter = scheduler.spawn_on(MemoryClass::LongLived, 0, JobFlags::empty(), {
        let waiting = Arc::clone(&waiting);
        move |cx| {
            waiting.store(true, Ordering::Release);
            cx.scheduler().wait(pinned);
        }
    });
    while !waiting.load(Ordering::Acquire) {
        thread::yield_now();
    }

    assert!(shutdown_then_open(system, &open).is_ok());

    assert_eq!(scheduler.state(gate), Some(JobState::Completed));
    assert_eq!(scheduler.state(pinned), Some(JobState::Cancelled));
    assert_eq!(scheduler.state(waiter), Some(JobState::Completed));
    // The abandoned closure was dropped along with its sender.
    assert_eq!(receiver.try_recv(), Err(mpsc::TryRecvError::Disconnected));
}

#[test]
fn shutdown_abandons_the_rest_of_a_running_graph() {
    let system = system(2);
    let scheduler = Arc::clone(system.scheduler());
    let open = Arc::new(AtomicBool::new(false));
    let ran = Arc::new(AtomicUsize::new(0));

    let mut graph = scheduler.create_graph(MemoryClass::LongLived).unwrap();
    let gate = graph.add_node::<Gate>(Arc::clone(&open)).unwrap();
    let mut chain = Vec::new();
    let mut previous = gate;
    for _ in 0..4 {
        let node = graph.add_node::<Count>(Arc::clone(&ran)).unwrap();
        graph.set_dependencies(node, &[previous]).unwrap();
        chain.push(node);
        previous = node;
    }
    scheduler.submit_graph(&mut graph);
    while graph.state(gate) != Some(JobState::Running) {
        thread::yield_now();
    }

    assert!(shutdown_then_open(system, &open).is_ok());

    graph.wait();
    assert_eq!(graph.state(gate), Some(JobState::Completed));
    for node in chain {
        assert_eq!(graph.state(node), Some(JobState::Cancelled));
    }
    assert_eq!(ran.load(Ordering::Acquire), 0);
    drop(graph);
}

#[test]
fn closed_queue_refuses_racing_pushes() {
    let queue = Arc::new(BoundedQueue::new(1 << 20));
    let pushers: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut landed = 0;
                while queue.try_enqueue(()).is_ok() {
                    landed += 1;
                }
                landed
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(5));
    queue.close();
    let queued = queue.len();

    let landed: usize = pushers.into_iter().map(|pusher| pusher.join().unwrap()).sum();
    // Every push that succeeded finished before `close` returned.
    assert_eq!(queued, landed);
}

#[test]
fn oversized_config_is_an_error() {
    init_tracing();
    let config = Config::default()
        .with_workers(2)
        .with_worker_arena_size(usize::MAX / 2);
    assert!(matches!(JobSystem::new(config), Err(SystemError::Alloc(_))));

    let config = Config::default()
        .with_workers(1)
        .with_frame_arena_size(usize::MAX);
    assert!(matches!(JobSystem::new(config), Err(SystemError::Alloc(_))));

    assert!(Arena::try_new(usize::MAX).is_err());
}

#[test]
fn raw_jobs_run_with_their_control_block() {
    fn bump(data: std::ptr::NonNull<()>, _cx: &JobContext<'_>) {
        // SAFETY: The test passes a pointer to a live `AtomicUsize`.
        let counter = unsafe { data.cast::<AtomicUsize>().as_ref() };
        counter.fetch_add(1, Ordering::AcqRel);
    }

    let system = system(1);
    let counter: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
    let control: &'static JobControlBlock = Box::leak(Box::new(JobControlBlock::new()));

    // SAFETY: Both the counter and the control block are leaked, so they
    // outlive the job.
    let job = unsafe {
        Job::from_raw(std::ptr::NonNull::from(counter).cast(), bump)
            .with_control(std::ptr::NonNull::from(control))
    }
    .with_flags(JobFlags::LONG_RUNNING);
    assert_eq!(job.memory_class(), None);
    system.submit(job);

    while !control.is_terminal() {
        thread::yield_now();
    }
    assert_eq!(control.state(), JobState::Completed);
    assert_eq!(counter.load(Ordering::Acquire), 1);
}

// -----------------------------------------------------------------------------
// Building blocks

#[test]
fn control_block_transitions() {
    let control = JobControlBlock::new();
    assert_eq!(control.state(), JobState::Pending);
    assert_eq!(control.generation(), 1);

    control.mark_running();
    assert_eq!(control.state(), JobState::Running);
    assert!(!control.is_terminal());
    assert_eq!(control.finish(), JobState::Completed);
    assert!(control.is_terminal());

    let cancelled = JobControlBlock::new();
    cancelled.request_cancel();
    assert!(cancelled.is_cancel_requested());
    assert_eq!(cancelled.finish(), JobState::Cancelled);
}

#[test]
fn dependency_counter_releases_once() {
    let counter = DependencyCounter::new(2);
    assert!(!counter.try_claim_ready());
    assert!(!counter.complete_predecessor());
    assert!(counter.complete_predecessor());
    assert!(counter.is_scheduled());
    assert!(!counter.try_claim_ready());

    counter.reset(0);
    assert!(counter.try_claim_ready());
    assert!(!counter.try_claim_ready());
}

#[test]
fn dependency_counter_under_contention() {
    const PREDECESSORS: u32 = 16;

    for _ in 0..100 {
        let counter = Arc::new(DependencyCounter::new(PREDECESSORS));
        let claims = Arc::new(AtomicU32::new(0));
        let threads: Vec<_> = (0..PREDECESSORS)
            .map(|_| {
                let counter = Arc::clone(&counter);
                let claims = Arc::clone(&claims);
                thread::spawn(move || {
                    if counter.complete_predecessor() {
                        claims.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(claims.load(Ordering::Relaxed), 1);
        assert_eq!(counter.in_degree(), 0);
    }
}

#[test]
fn arena_reports_exhaustion() {
    let mut arena = Arena::new(64);
    arena.alloc([0_u8; 48]);
    let err = arena.try_alloc([0_u8; 32]).unwrap_err();
    assert_eq!(err.requested, 32);
    assert_eq!(err.remaining, 16);
    assert_eq!(err.capacity, 64);

    let epoch = arena.epoch();
    arena.reset();
    assert_eq!(arena.epoch(), epoch + 1);
    assert!(arena.try_alloc([0_u8; 32]).is_ok());
}

#[test]
fn arena_allocations_are_aligned_and_zeroed() {
    let arena = Arena::new(256);
    arena.alloc(1_u8);
    let wide: *const u64 = arena.alloc(0_u64);
    assert_eq!(wide.addr() % align_of::<u64>(), 0);
    assert!(arena.contains(wide));

    let slice = arena.alloc_slice_default::<u32>(8);
    assert_eq!(slice, &[0; 8]);
}

#[test]
fn arena_vec_grows_and_drops_its_elements() {
    let arena = Arena::new(4096);
    let tracker = Arc::new(());

    let mut values = ArenaVec::new(&arena);
    assert!(values.is_empty());
    for _ in 0..10 {
        values.push(Arc::clone(&tracker));
    }
    assert_eq!(values.len(), 10);
    assert!(values.capacity() >= 10);
    assert_eq!(Arc::strong_count(&tracker), 11);

    drop(values.pop());
    assert_eq!(Arc::strong_count(&tracker), 10);
    drop(values);
    assert_eq!(Arc::strong_count(&tracker), 1);
}

#[test]
fn arena_vec_reports_exhaustion() {
    let arena = Arena::new(32);
    let mut values = ArenaVec::<u64>::with_capacity(&arena, 4);
    for i in 0..4 {
        values.try_push_within_capacity(i).unwrap();
    }
    assert_eq!(values.try_push_within_capacity(4), Err(4));
    assert!(values.try_reserve(1).is_err());
    assert_eq!(&values[..], &[0, 1, 2, 3]);
}

#[test]
fn bounded_queue_rejects_when_full_or_closed() {
    let queue = BoundedQueue::new(2);
    queue.try_enqueue(1).unwrap();
    queue.try_enqueue(2).unwrap();
    assert_eq!(queue.try_enqueue(3), Err(EnqueueError::Full(3)));
    assert_eq!(queue.len(), 2);

    assert_eq!(queue.try_dequeue(), Some(1));
    queue.close();
    assert_eq!(queue.try_enqueue(4).map_err(EnqueueError::into_inner), Err(4));
    assert_eq!(queue.try_dequeue(), Some(2));
    assert_eq!(queue.try_dequeue(), None);
}
