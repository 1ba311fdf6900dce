//! Scheduler integration tests: request walks, failure isolation, shadow
//! forking, and async offload round-trips.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::equeue::{Equeue, Event, OffloadTicket};
use crate::graph::{PipeDescriptor, ServiceBuilder, ServiceGraph};
use crate::pipe::{InMemoryTransport, PipeHandle, PipeParams, PipeTransport};
use crate::runtime::{
    AsyncCompanion, NodeId, ScopeToken, Servlet, ServletError, ServletRegistry, SlotDef, SlotId,
    SlotKind, TaskContext, TaskDelegate, TaskFlags, TaskOutcome,
};

use super::{
    AsyncPool, AsyncPoolConfig, IdlePolicy, RequestState, Scheduler, SchedulerConfig, Step,
    TaskError,
};

type ExecutionLog = Arc<Mutex<Vec<NodeId>>>;

/// Opt-in log output for debugging: `RUST_LOG=trace cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Marker in the request scope that tells a `RecordingServlet` to fail.
struct FailMarker;

/// Scope payload that raises a flag when the scheduler releases it.
struct ScopeFlag {
    released: Arc<AtomicBool>,
}

impl Drop for ScopeFlag {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

struct RecordingServlet {
    slots: Vec<SlotDef>,
    log: ExecutionLog,
}

struct RecordingDelegate {
    log: ExecutionLog,
}

impl TaskDelegate for RecordingDelegate {
    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<TaskOutcome, ServletError> {
        if ctx.scope().get::<FailMarker>().is_some() {
            return Err(ServletError::Execution("poisoned request".to_string()));
        }
        self.log.lock().unwrap().push(ctx.node());
        Ok(TaskOutcome::Complete)
    }
}

impl Servlet for RecordingServlet {
    fn slots(&self) -> &[SlotDef] {
        &self.slots
    }

    fn create_delegate(
        &self,
        _flags: TaskFlags,
    ) -> Result<Box<dyn TaskDelegate>, ServletError> {
        Ok(Box::new(RecordingDelegate {
            log: Arc::clone(&self.log),
        }))
    }
}

fn recording(log: &ExecutionLog, slots: Vec<SlotDef>) -> Arc<RecordingServlet> {
    Arc::new(RecordingServlet {
        slots,
        log: Arc::clone(log),
    })
}

fn in_slot() -> SlotDef {
    SlotDef::new("in", SlotKind::Input)
}

fn out_slot() -> SlotDef {
    SlotDef::new("out", SlotKind::Output)
}

/// read -> mid -> write
fn linear_graph(log: &ExecutionLog) -> (Arc<ServiceGraph>, [NodeId; 3]) {
    linear_graph_with_mid(log, recording(log, vec![in_slot(), out_slot()]), TaskFlags::NONE)
}

fn linear_graph_with_mid(
    log: &ExecutionLog,
    mid_servlet: Arc<dyn Servlet>,
    mid_flags: TaskFlags,
) -> (Arc<ServiceGraph>, [NodeId; 3]) {
    let registry = Arc::new(ServletRegistry::new());
    let mut builder = ServiceBuilder::new(Arc::clone(&registry));
    let read = builder
        .add_node(registry.load(recording(log, vec![in_slot(), out_slot()]), vec![]))
        .unwrap();
    let mid = builder
        .add_node_with_flags(registry.load(mid_servlet, vec![]), mid_flags)
        .unwrap();
    let write = builder
        .add_node(registry.load(recording(log, vec![in_slot(), out_slot()]), vec![]))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(read, SlotId(1), mid, SlotId(0)))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(mid, SlotId(1), write, SlotId(0)))
        .unwrap();
    builder.set_input(read, SlotId(0)).unwrap();
    builder.set_output(write, SlotId(1)).unwrap();
    (Arc::new(builder.freeze().unwrap()), [read, mid, write])
}

/// read -> split -> {left, right} -> join
fn diamond_graph(log: &ExecutionLog) -> (Arc<ServiceGraph>, [NodeId; 5]) {
    let registry = Arc::new(ServletRegistry::new());
    let mut builder = ServiceBuilder::new(Arc::clone(&registry));
    let read = builder
        .add_node(registry.load(recording(log, vec![in_slot(), out_slot()]), vec![]))
        .unwrap();
    let split = builder
        .add_node(registry.load(
            recording(
                log,
                vec![
                    in_slot(),
                    SlotDef::new("left", SlotKind::Output),
                    SlotDef::new("right", SlotKind::Output),
                ],
            ),
            vec![],
        ))
        .unwrap();
    let left = builder
        .add_node(registry.load(recording(log, vec![in_slot(), out_slot()]), vec![]))
        .unwrap();
    let right = builder
        .add_node(registry.load(recording(log, vec![in_slot(), out_slot()]), vec![]))
        .unwrap();
    let join = builder
        .add_node(registry.load(
            recording(
                log,
                vec![
                    SlotDef::new("a", SlotKind::Input),
                    SlotDef::new("b", SlotKind::Input),
                    SlotDef::new("response", SlotKind::Output),
                ],
            ),
            vec![],
        ))
        .unwrap();

    builder
        .add_pipe(PipeDescriptor::new(read, SlotId(1), split, SlotId(0)))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(split, SlotId(1), left, SlotId(0)))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(split, SlotId(2), right, SlotId(0)))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(left, SlotId(1), join, SlotId(0)))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(right, SlotId(1), join, SlotId(1)))
        .unwrap();
    builder.set_input(read, SlotId(0)).unwrap();
    builder.set_output(join, SlotId(2)).unwrap();
    (Arc::new(builder.freeze().unwrap()), [read, split, left, right, join])
}

/// Allocates an external (request input, response output) pipe pair and
/// keeps the far ends alive for the caller.
fn request_pipes(transport: &InMemoryTransport) -> (PipeHandle, PipeHandle, PipeHandle, PipeHandle) {
    let (client_in, input) = transport.allocate(&PipeParams::default()).unwrap();
    let (output, client_out) = transport.allocate(&PipeParams::default()).unwrap();
    (input, output, client_in, client_out)
}

fn run_until_idle(sched: &mut Scheduler) -> usize {
    let mut steps = 0;
    while sched.step() == Step::Ran {
        steps += 1;
        assert!(steps < 1000, "scheduler did not drain");
    }
    steps
}

fn position(log: &[NodeId], node: NodeId) -> usize {
    log.iter().position(|&n| n == node).expect("node never ran")
}

#[test]
fn diamond_runs_each_node_once_in_topological_order() {
    init_tracing();
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let (graph, [read, split, left, right, join]) = diamond_graph(&log);
    let transport = Arc::new(InMemoryTransport::new());
    let mut sched = Scheduler::new(
        graph,
        Arc::clone(&transport) as Arc<dyn PipeTransport>,
        None,
        SchedulerConfig::default(),
    );

    let (input, output, _client_in, _client_out) = request_pipes(&transport);
    let id = sched.begin_request(input, output, ScopeToken::empty());
    run_until_idle(&mut sched);

    assert_eq!(sched.request_state(id), Some(RequestState::Completed));
    assert_eq!(sched.completed_tasks(id), Some(5));

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 5);
    assert!(position(&log, read) < position(&log, split));
    assert!(position(&log, split) < position(&log, left));
    assert!(position(&log, split) < position(&log, right));
    assert!(position(&log, left) < position(&log, join));
    assert!(position(&log, right) < position(&log, join));
}

#[test]
fn every_edge_gets_its_own_pipe_instance_per_request() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let (graph, _) = diamond_graph(&log);
    let transport = Arc::new(InMemoryTransport::new());
    let mut sched = Scheduler::new(
        Arc::clone(&graph),
        Arc::clone(&transport) as Arc<dyn PipeTransport>,
        None,
        SchedulerConfig::default(),
    );

    const REQUESTS: usize = 4;
    let mut held = Vec::new();
    for _ in 0..REQUESTS {
        let (input, output, client_in, client_out) = request_pipes(&transport);
        let id = sched.begin_request(input, output, ScopeToken::empty());
        held.push((id, client_in, client_out));
    }
    run_until_idle(&mut sched);

    for (id, _, _) in &held {
        assert_eq!(sched.request_state(*id), Some(RequestState::Completed));
    }
    // Each request allocated one pair per graph edge, plus the two
    // external pairs the test allocated itself.
    assert_eq!(
        transport.allocated_pairs(),
        REQUESTS * (graph.pipe_count() + 2)
    );

    // Only the ends the test still holds are alive.
    assert_eq!(transport.live_ends(), REQUESTS * 2);
    held.clear();
    assert_eq!(transport.live_ends(), 0);
}

#[test]
fn shadow_slot_forks_after_its_target_is_allocated() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let registry = Arc::new(ServletRegistry::new());
    let mut builder = ServiceBuilder::new(Arc::clone(&registry));
    let read = builder
        .add_node(registry.load(recording(&log, vec![in_slot(), out_slot()]), vec![]))
        .unwrap();
    let tee = builder
        .add_node(registry.load(
            recording(
                &log,
                vec![
                    in_slot(),
                    SlotDef::new("out", SlotKind::Output),
                    SlotDef::new("tee", SlotKind::Shadow(SlotId(1))),
                ],
            ),
            vec![],
        ))
        .unwrap();
    let main = builder
        .add_node(registry.load(recording(&log, vec![in_slot(), out_slot()]), vec![]))
        .unwrap();
    let side = builder
        .add_node(registry.load(recording(&log, vec![in_slot(), out_slot()]), vec![]))
        .unwrap();
    let join = builder
        .add_node(registry.load(
            recording(
                &log,
                vec![
                    SlotDef::new("a", SlotKind::Input),
                    SlotDef::new("b", SlotKind::Input),
                    SlotDef::new("response", SlotKind::Output),
                ],
            ),
            vec![],
        ))
        .unwrap();

    builder
        .add_pipe(PipeDescriptor::new(read, SlotId(1), tee, SlotId(0)))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(tee, SlotId(1), main, SlotId(0)))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(tee, SlotId(2), side, SlotId(0)))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(main, SlotId(1), join, SlotId(0)))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(side, SlotId(1), join, SlotId(1)))
        .unwrap();
    builder.set_input(read, SlotId(0)).unwrap();
    builder.set_output(join, SlotId(2)).unwrap();
    let graph = Arc::new(builder.freeze().unwrap());

    let transport = Arc::new(InMemoryTransport::new());
    let mut sched = Scheduler::new(
        graph,
        Arc::clone(&transport) as Arc<dyn PipeTransport>,
        None,
        SchedulerConfig::default(),
    );
    let (input, output, _client_in, _client_out) = request_pipes(&transport);
    let id = sched.begin_request(input, output, ScopeToken::empty());
    run_until_idle(&mut sched);

    assert_eq!(sched.request_state(id), Some(RequestState::Completed));
    assert_eq!(transport.forks(), 1);
    // The shadow edge never allocated a fresh pair of its own: 2 external
    // pairs + 4 real edges.
    assert_eq!(transport.allocated_pairs(), 6);
    assert_eq!(log.lock().unwrap().len(), 5);
}

#[test]
fn a_failing_task_tears_down_only_its_own_request() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let (graph, _) = diamond_graph(&log);
    let transport = Arc::new(InMemoryTransport::new());
    let mut sched = Scheduler::new(
        graph,
        Arc::clone(&transport) as Arc<dyn PipeTransport>,
        None,
        SchedulerConfig::default(),
    );

    let (input_a, output_a, client_in_a, client_out_a) = request_pipes(&transport);
    let poisoned = sched.begin_request(input_a, output_a, ScopeToken::new(FailMarker));
    let (input_b, output_b, client_in_b, client_out_b) = request_pipes(&transport);
    let healthy = sched.begin_request(input_b, output_b, ScopeToken::empty());

    run_until_idle(&mut sched);

    assert_eq!(sched.request_state(poisoned), Some(RequestState::Failed));
    assert!(matches!(
        sched.take_error(poisoned),
        Some(TaskError::Delegate { .. })
    ));
    assert!(sched.take_error(poisoned).is_none(), "one error per failure");

    assert_eq!(sched.request_state(healthy), Some(RequestState::Completed));
    assert_eq!(sched.completed_tasks(healthy), Some(5));

    // Teardown released every end except the four the test holds.
    assert_eq!(transport.live_ends(), 4);
    drop((client_in_a, client_out_a, client_in_b, client_out_b));
    assert_eq!(transport.live_ends(), 0);
}

// ---- Offload ----

#[derive(Default)]
struct Probe {
    setup: AtomicUsize,
    execute: AtomicUsize,
    cleanup: AtomicUsize,
}

struct OffloadServlet {
    slots: Vec<SlotDef>,
    probe: Arc<Probe>,
    fail_setup: bool,
    fail_execute: bool,
    execute_delay: Duration,
}

impl OffloadServlet {
    fn new(probe: &Arc<Probe>) -> Self {
        Self {
            slots: vec![in_slot(), out_slot()],
            probe: Arc::clone(probe),
            fail_setup: false,
            fail_execute: false,
            execute_delay: Duration::ZERO,
        }
    }
}

struct OffloadDelegate {
    probe: Arc<Probe>,
    fail_setup: bool,
    fail_execute: bool,
    execute_delay: Duration,
}

impl TaskDelegate for OffloadDelegate {
    fn run(&mut self, _ctx: &mut TaskContext<'_>) -> Result<TaskOutcome, ServletError> {
        Ok(TaskOutcome::Offload(Box::new(ProbeCompanion {
            probe: Arc::clone(&self.probe),
            fail_setup: self.fail_setup,
            fail_execute: self.fail_execute,
            execute_delay: self.execute_delay,
        })))
    }
}

struct ProbeCompanion {
    probe: Arc<Probe>,
    fail_setup: bool,
    fail_execute: bool,
    execute_delay: Duration,
}

impl AsyncCompanion for ProbeCompanion {
    fn setup(&mut self, _ctx: &mut TaskContext<'_>) -> Result<(), ServletError> {
        self.probe.setup.fetch_add(1, Ordering::SeqCst);
        if self.fail_setup {
            return Err(ServletError::Execution("setup rejected".to_string()));
        }
        Ok(())
    }

    fn execute(&mut self) -> Result<(), ServletError> {
        if !self.execute_delay.is_zero() {
            thread::sleep(self.execute_delay);
        }
        self.probe.execute.fetch_add(1, Ordering::SeqCst);
        if self.fail_execute {
            return Err(ServletError::Execution("execute failed".to_string()));
        }
        Ok(())
    }

    fn cleanup(self: Box<Self>, _ctx: &mut TaskContext<'_>) -> Result<(), ServletError> {
        self.probe.cleanup.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Servlet for OffloadServlet {
    fn slots(&self) -> &[SlotDef] {
        &self.slots
    }

    fn create_delegate(
        &self,
        _flags: TaskFlags,
    ) -> Result<Box<dyn TaskDelegate>, ServletError> {
        Ok(Box::new(OffloadDelegate {
            probe: Arc::clone(&self.probe),
            fail_setup: self.fail_setup,
            fail_execute: self.fail_execute,
            execute_delay: self.execute_delay,
        }))
    }
}

#[test]
fn offloaded_task_resumes_exactly_once() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let probe = Arc::new(Probe::default());
    let (graph, _) = linear_graph_with_mid(
        &log,
        Arc::new(OffloadServlet::new(&probe)),
        TaskFlags::ASYNC,
    );

    let equeue = Arc::new(Equeue::new());
    let pool = AsyncPool::start(AsyncPoolConfig::default(), Arc::clone(&equeue)).unwrap();
    let mut token = equeue.scheduler_token().unwrap();

    let transport = Arc::new(InMemoryTransport::new());
    let mut sched = Scheduler::new(
        graph,
        Arc::clone(&transport) as Arc<dyn PipeTransport>,
        Some(Arc::clone(&pool)),
        SchedulerConfig::default(),
    );

    let (input, output, _client_in, _client_out) = request_pipes(&transport);
    let released = Arc::new(AtomicBool::new(false));
    let id = sched.begin_request(
        input,
        output,
        ScopeToken::new(ScopeFlag {
            released: Arc::clone(&released),
        }),
    );
    run_until_idle(&mut sched);

    // The middle task is suspended on the pool; downstream already ran
    // since its input end was delivered when the outputs were wired.
    assert!(sched.has_work());
    assert_eq!(sched.completed_tasks(id), Some(2));
    assert_eq!(probe.setup.load(Ordering::SeqCst), 1);
    assert_eq!(probe.cleanup.load(Ordering::SeqCst), 0);

    // Scope stays alive for the cleanup phase; the record cannot be
    // retired mid-drain.
    assert!(!released.load(Ordering::SeqCst));
    assert_eq!(sched.retire(id), None);

    // Block on the completion event, resume, and run the cleanup phase.
    let event = equeue.take(&mut token).unwrap();
    assert!(matches!(event, Event::Task(_)));
    sched.dispatch(event);
    run_until_idle(&mut sched);

    assert_eq!(sched.request_state(id), Some(RequestState::Completed));
    assert_eq!(sched.completed_tasks(id), Some(3));
    assert!(!sched.has_work());
    assert_eq!(probe.setup.load(Ordering::SeqCst), 1);
    assert_eq!(probe.execute.load(Ordering::SeqCst), 1);
    assert_eq!(probe.cleanup.load(Ordering::SeqCst), 1);
    assert_eq!(pool.pending_completions(), 0);

    // Fully drained now: scope released, record retirable.
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(sched.retire(id), Some(RequestState::Completed));
    assert_eq!(sched.request_state(id), None);

    pool.shutdown();
}

#[test]
fn offload_setup_failure_is_a_single_task_error() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let probe = Arc::new(Probe::default());
    let mut servlet = OffloadServlet::new(&probe);
    servlet.fail_setup = true;
    let (graph, _) = linear_graph_with_mid(&log, Arc::new(servlet), TaskFlags::ASYNC);

    let equeue = Arc::new(Equeue::new());
    let pool = AsyncPool::start(AsyncPoolConfig::default(), Arc::clone(&equeue)).unwrap();

    let transport = Arc::new(InMemoryTransport::new());
    let mut sched = Scheduler::new(
        graph,
        Arc::clone(&transport) as Arc<dyn PipeTransport>,
        Some(Arc::clone(&pool)),
        SchedulerConfig::default(),
    );

    let (input, output, client_in, client_out) = request_pipes(&transport);
    let id = sched.begin_request(input, output, ScopeToken::empty());
    run_until_idle(&mut sched);

    assert_eq!(sched.request_state(id), Some(RequestState::Failed));
    assert!(matches!(
        sched.take_error(id),
        Some(TaskError::Delegate { .. })
    ));
    assert!(sched.take_error(id).is_none());
    assert_eq!(probe.setup.load(Ordering::SeqCst), 1);
    assert_eq!(probe.execute.load(Ordering::SeqCst), 0);
    assert_eq!(pool.pending_completions(), 0);

    drop((client_in, client_out));
    assert_eq!(transport.live_ends(), 0, "no end released twice or leaked");

    pool.shutdown();
}

struct AlwaysFailServlet {
    slots: Vec<SlotDef>,
}

struct AlwaysFailDelegate;

impl TaskDelegate for AlwaysFailDelegate {
    fn run(&mut self, _ctx: &mut TaskContext<'_>) -> Result<TaskOutcome, ServletError> {
        Err(ServletError::Execution("broken servlet".to_string()))
    }
}

impl Servlet for AlwaysFailServlet {
    fn slots(&self) -> &[SlotDef] {
        &self.slots
    }

    fn create_delegate(
        &self,
        _flags: TaskFlags,
    ) -> Result<Box<dyn TaskDelegate>, ServletError> {
        Ok(Box::new(AlwaysFailDelegate))
    }
}

#[test]
fn completion_for_a_torn_down_request_is_dropped() {
    init_tracing();
    // split feeds a slow offload branch and a branch that always fails:
    // the failure tears the request down while the fragment is still
    // executing, so its completion arrives for a dead ticket.
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let probe = Arc::new(Probe::default());
    let mut offload_servlet = OffloadServlet::new(&probe);
    offload_servlet.execute_delay = Duration::from_millis(150);

    let registry = Arc::new(ServletRegistry::new());
    let mut builder = ServiceBuilder::new(Arc::clone(&registry));
    let read = builder
        .add_node(registry.load(recording(&log, vec![in_slot(), out_slot()]), vec![]))
        .unwrap();
    let split = builder
        .add_node(registry.load(
            recording(
                &log,
                vec![
                    in_slot(),
                    SlotDef::new("slow", SlotKind::Output),
                    SlotDef::new("broken", SlotKind::Output),
                ],
            ),
            vec![],
        ))
        .unwrap();
    let slow = builder
        .add_node_with_flags(registry.load(Arc::new(offload_servlet), vec![]), TaskFlags::ASYNC)
        .unwrap();
    let broken = builder
        .add_node(registry.load(
            Arc::new(AlwaysFailServlet {
                slots: vec![in_slot(), out_slot()],
            }),
            vec![],
        ))
        .unwrap();
    let join = builder
        .add_node(registry.load(
            recording(
                &log,
                vec![
                    SlotDef::new("a", SlotKind::Input),
                    SlotDef::new("b", SlotKind::Input),
                    SlotDef::new("response", SlotKind::Output),
                ],
            ),
            vec![],
        ))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(read, SlotId(1), split, SlotId(0)))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(split, SlotId(1), slow, SlotId(0)))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(split, SlotId(2), broken, SlotId(0)))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(slow, SlotId(1), join, SlotId(0)))
        .unwrap();
    builder
        .add_pipe(PipeDescriptor::new(broken, SlotId(1), join, SlotId(1)))
        .unwrap();
    builder.set_input(read, SlotId(0)).unwrap();
    builder.set_output(join, SlotId(2)).unwrap();
    let graph = Arc::new(builder.freeze().unwrap());

    let equeue = Arc::new(Equeue::new());
    let pool = AsyncPool::start(AsyncPoolConfig::default(), Arc::clone(&equeue)).unwrap();
    let mut token = equeue.scheduler_token().unwrap();

    let transport = Arc::new(InMemoryTransport::new());
    let mut sched = Scheduler::new(
        graph,
        Arc::clone(&transport) as Arc<dyn PipeTransport>,
        Some(Arc::clone(&pool)),
        SchedulerConfig::default(),
    );

    let (input, output, client_in, client_out) = request_pipes(&transport);
    let id = sched.begin_request(input, output, ScopeToken::empty());
    run_until_idle(&mut sched);

    // The broken branch already failed the request; the suspended task
    // was purged with it.
    assert_eq!(sched.request_state(id), Some(RequestState::Failed));
    assert!(!sched.has_work());
    assert_eq!(probe.setup.load(Ordering::SeqCst), 1);

    // The fragment finishes anyway; its ticket resolves to nothing.
    let event = equeue.take(&mut token).unwrap();
    assert!(matches!(event, Event::Task(_)));
    sched.dispatch(event);
    assert_eq!(pool.pending_completions(), 0, "stale completion dropped");
    assert_eq!(probe.cleanup.load(Ordering::SeqCst), 0);
    assert!(matches!(
        sched.take_error(id),
        Some(TaskError::Delegate { .. })
    ));

    drop((client_in, client_out));
    assert_eq!(transport.live_ends(), 0);

    pool.shutdown();
}

#[test]
fn saturated_pool_rejects_submissions() {
    let equeue = Arc::new(Equeue::new());
    let pool = AsyncPool::start(
        AsyncPoolConfig {
            workers: 1,
            queue_capacity: 1,
        },
        Arc::clone(&equeue),
    )
    .unwrap();

    let probe = Arc::new(Probe::default());
    let slow = || {
        Box::new(ProbeCompanion {
            probe: Arc::clone(&probe),
            fail_setup: false,
            fail_execute: false,
            execute_delay: Duration::from_millis(200),
        })
    };

    // First job occupies the worker, second fills the queue.
    pool.submit(slow()).unwrap();
    thread::sleep(Duration::from_millis(50));
    pool.submit(slow()).unwrap();
    assert!(matches!(
        pool.submit(slow()),
        Err(super::OffloadError::Saturated)
    ));

    pool.shutdown();
}

#[test]
fn shutdown_pool_rejects_submissions() {
    let equeue = Arc::new(Equeue::new());
    let pool = AsyncPool::start(AsyncPoolConfig::default(), Arc::clone(&equeue)).unwrap();
    pool.shutdown();

    let probe = Arc::new(Probe::default());
    assert!(matches!(
        pool.submit(Box::new(ProbeCompanion {
            probe,
            fail_setup: false,
            fail_execute: false,
            execute_delay: Duration::ZERO,
        })),
        Err(super::OffloadError::Terminated)
    ));
}

#[test]
fn empty_scheduler_is_idle() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let (graph, _) = linear_graph(&log);
    let transport = Arc::new(InMemoryTransport::new());
    let mut sched = Scheduler::new(
        graph,
        transport as Arc<dyn PipeTransport>,
        None,
        SchedulerConfig::default(),
    );
    assert_eq!(sched.step(), Step::Idle);
    assert!(!sched.has_work());
}

#[test]
fn terminal_requests_release_scope_and_are_retirable() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let (graph, _) = linear_graph(&log);
    let transport = Arc::new(InMemoryTransport::new());
    let mut sched = Scheduler::new(
        graph,
        Arc::clone(&transport) as Arc<dyn PipeTransport>,
        None,
        SchedulerConfig::default(),
    );

    let released = Arc::new(AtomicBool::new(false));
    let (input, output, _client_in, _client_out) = request_pipes(&transport);
    let id = sched.begin_request(
        input,
        output,
        ScopeToken::new(ScopeFlag {
            released: Arc::clone(&released),
        }),
    );
    assert_eq!(sched.retire(id), None, "in-flight requests cannot retire");
    run_until_idle(&mut sched);

    // The scope payload is released the moment the request drains, even
    // though the outcome record is still queryable.
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(sched.request_state(id), Some(RequestState::Completed));

    assert_eq!(sched.retire(id), Some(RequestState::Completed));
    assert_eq!(sched.request_state(id), None);
    assert_eq!(sched.retire(id), None);
}

#[test]
fn io_admitted_requests_are_retired_when_done() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let (graph, _) = linear_graph(&log);
    let transport = Arc::new(InMemoryTransport::new());
    let mut sched = Scheduler::new(
        graph,
        Arc::clone(&transport) as Arc<dyn PipeTransport>,
        None,
        SchedulerConfig::default(),
    );

    let (input, output, _client_in, _client_out) = request_pipes(&transport);
    let id = sched
        .dispatch(Event::Io { input, output })
        .expect("io events admit a request");
    assert_eq!(sched.request_state(id), Some(RequestState::InFlight));
    run_until_idle(&mut sched);

    // Nobody holds dispatcher-admitted ids, so the record goes with the
    // request instead of accumulating across the loop's lifetime.
    assert_eq!(sched.request_state(id), None);
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[test]
fn dispatcher_admits_requests_from_io_events() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let (graph, _) = linear_graph(&log);
    let transport = Arc::new(InMemoryTransport::new());
    let equeue = Arc::new(Equeue::new());
    let mut producer = equeue.module_token(8).unwrap();
    let mut token = equeue.scheduler_token().unwrap();

    let mut sched = Scheduler::new(
        graph,
        Arc::clone(&transport) as Arc<dyn PipeTransport>,
        None,
        SchedulerConfig::default(),
    );

    let (input, output, _client_in, _client_out) = request_pipes(&transport);
    equeue.put(&mut producer, Event::Io { input, output }).unwrap();
    // Unknown tickets interleaved with admissions are ignored.
    equeue
        .put(&mut producer, Event::Task(OffloadTicket(42)))
        .unwrap();

    assert_eq!(sched.pump(&equeue, &mut token), 2);
    run_until_idle(&mut sched);
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[test]
fn run_loop_drives_requests_until_killed() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let (graph, _) = linear_graph(&log);
    let transport = Arc::new(InMemoryTransport::new());
    let equeue = Arc::new(Equeue::new());
    let mut producer = equeue.module_token(8).unwrap();
    let mut token = equeue.scheduler_token().unwrap();
    let killed = Arc::new(AtomicBool::new(false));

    let dispatcher = {
        let graph = Arc::clone(&graph);
        let transport = Arc::clone(&transport);
        let equeue = Arc::clone(&equeue);
        let killed = Arc::clone(&killed);
        thread::spawn(move || {
            let mut sched = Scheduler::new(
                graph,
                transport as Arc<dyn PipeTransport>,
                None,
                SchedulerConfig {
                    idle_policy: IdlePolicy::Wait,
                },
            );
            sched.run(&equeue, &mut token, &killed);
            sched
        })
    };

    let (input, output, _client_in, _client_out) = request_pipes(&transport);
    equeue.put(&mut producer, Event::Io { input, output }).unwrap();

    // Wait for the walk to finish, then stop the loop.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while log.lock().unwrap().len() < 3 {
        assert!(std::time::Instant::now() < deadline, "request never completed");
        thread::sleep(Duration::from_millis(5));
    }
    killed.store(true, Ordering::SeqCst);
    equeue.kill();
    let sched = dispatcher.join().unwrap();
    assert!(!sched.has_work());
}
