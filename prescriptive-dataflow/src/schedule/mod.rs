//! The step scheduler: a pool of worker threads over per-worker queues and a shared
//! global queue.
//!
//! A worker looks for work in its own queues first, then in the global queue, then by
//! stealing from the other workers in a rotated order; with nothing in reach it parks on a
//! monitor and is woken by the next submission. The environment thread joins in as worker
//! zero for the duration of [`Context::wait`](crate::Context::wait), which returns once
//! the context's outstanding-work counter reaches zero — or fails when work remains but
//! nothing anywhere is runnable.
//!
//! Four variants share this engine: the default task pool (LIFO local deques, stealing),
//! FIFO with stealing, FIFO with a single shared queue, and FIFO with affinity routing.
//! Priority mode swaps the deques for priority queues ordered by the instances' priority,
//! ties broken by submission order.

pub(crate) mod pin;

use std::cell::RefCell;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex};

use crate::context::ContextInner;
use crate::error::{Fatal, StepError};
use crate::logging::{ScheduleEvent, ScheduleEventKind, StatCounters, StepEvent, StepEventKind};
use crate::runtime::Settings;
use crate::step::{StepId, StepInstance, StepState};
use crate::suspend::{park_or_requeue, DependencyConsumer, MissState};

/// An entry in a priority queue: smallest priority first, ties by submission order.
#[derive(Debug, PartialEq, Eq)]
struct PrioEntry {
    priority: i64,
    seq: u64,
    step: StepId,
}

impl Ord for PrioEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: `BinaryHeap` is a max-heap and we pop smallest first.
        other.priority.cmp(&self.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PrioEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The run queues; the variant is fixed by the settings at construction.
enum RunQueues {
    /// Insertion-ordered queues: a global injector, one deque per worker, and one mailbox
    /// per worker for cross-thread affinity routing.
    Fifo {
        injector: Injector<StepId>,
        stealers: Box<[Stealer<StepId>]>,
        mailboxes: Box<[Injector<StepId>]>,
    },
    /// Priority-ordered queues, all mutex-guarded heaps.
    Priority {
        global: Mutex<BinaryHeap<PrioEntry>>,
        locals: Box<[Mutex<BinaryHeap<PrioEntry>>]>,
        seq: AtomicU64,
    },
}

/// The monitor workers park on; an epoch counter closes the window between observing
/// empty queues and falling asleep.
struct Monitor {
    state: Mutex<MonitorState>,
    cv: Condvar,
}

struct MonitorState {
    epoch: u64,
    parked: usize,
}

impl Monitor {
    fn new() -> Self {
        Monitor { state: Mutex::new(MonitorState { epoch: 0, parked: 0 }), cv: Condvar::new() }
    }

    fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    fn notify_one(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        if state.parked > 0 {
            self.cv.notify_one();
        }
    }

    fn notify_all(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        self.cv.notify_all();
    }

    /// Sleep unless the epoch moved past `seen` since the caller last scanned the queues.
    /// The timeout bounds the cost of any wake-up the epoch protocol cannot see.
    fn park(&self, seen: u64, timeout: Duration) {
        let mut state = self.state.lock();
        if state.epoch != seen {
            return;
        }
        state.parked += 1;
        self.cv.wait_for(&mut state, timeout);
        state.parked -= 1;
    }
}

/// Scheduler state shared by the workers and the environment thread.
pub(crate) struct SchedulerShared {
    nworkers: usize,
    steal: bool,
    affinity_aware: bool,
    pin_stride: usize,
    queues: RunQueues,
    monitor: Monitor,
    shutdown: AtomicBool,
    /// Instances referenced by some queue.
    pub(crate) queued: AtomicUsize,
    /// Workers currently claiming or executing an instance.
    pub(crate) executing: AtomicUsize,
}

/// The per-worker identity registered in thread-local storage while a thread acts as a
/// worker; `local` is the thread's own deque, absent in single-queue and priority modes.
#[derive(Clone)]
struct WorkerHandle {
    shared: Arc<SchedulerShared>,
    index: usize,
    local: Option<Rc<Worker<StepId>>>,
}

/// The step instance a thread is currently executing, together with its context.
#[derive(Clone)]
pub(crate) struct CurrentStep {
    pub(crate) ctx: Arc<ContextInner>,
    pub(crate) instance: Arc<StepInstance>,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<WorkerHandle>> = const { RefCell::new(None) };
    static CURRENT_STEP: RefCell<Option<CurrentStep>> = const { RefCell::new(None) };
}

/// The step instance executing on this thread, if it belongs to `ctx`.
pub(crate) fn current_step_for(ctx: &Arc<ContextInner>) -> Option<Arc<StepInstance>> {
    CURRENT_STEP.with(|current| {
        current
            .borrow()
            .as_ref()
            .filter(|c| Arc::ptr_eq(&c.ctx, ctx))
            .map(|c| c.instance.clone())
    })
}

/// Declare a batch of `try_get`s complete.
///
/// If any of them missed, the calling step unwinds and re-executes from the top; the
/// error is meant to be propagated with `?`. Misses still unsatisfied park the step on
/// their slots; misses whose items arrived between the `try_get` and the flush register
/// nothing and instead mark the step for immediate re-queueing, since the abandoned
/// attempt never saw the values. A missed item that was meanwhile reclaimed is reported
/// as [`StepError::Gone`]. Outside a step this is a no-op.
pub fn flush_gets() -> Result<(), StepError> {
    let Some(current) = CURRENT_STEP.with(|c| c.borrow().clone()) else {
        return Ok(());
    };
    let misses = current.instance.take_misses();
    if misses.is_empty() {
        return Ok(());
    }
    let mut gone = None;
    let mut parked = false;
    for probe in misses {
        match probe(&current.instance) {
            MissState::Registered => parked = true,
            MissState::NowPresent => {}
            MissState::Gone(what) => gone = Some(what),
        }
    }
    if let Some(what) = gone {
        return Err(StepError::Gone(what));
    }
    if !parked {
        // Every missed item was produced before the flush; nothing will wake the step,
        // so the epilogue must re-queue it itself.
        current.instance.note_retry();
    }
    Err(StepError::NotReady)
}

/// The scheduler owned by one context: shared queue state plus the worker threads.
pub(crate) struct Scheduler {
    pub(crate) shared: Arc<SchedulerShared>,
    /// Deques waiting to be adopted; slot zero belongs to the environment thread.
    pending: Mutex<Vec<Option<Worker<StepId>>>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new(settings: &Settings) -> Self {
        let nworkers = settings.threads.max(1);
        let kind = settings.scheduler;
        let mut use_priority = settings.use_priority;
        if use_priority && kind.lifo() {
            log::warn!("priority ordering is unsupported for the TASK_POOL scheduler");
            use_priority = false;
        }

        let mut pending = Vec::new();
        let queues = if use_priority {
            let locals: Box<[Mutex<BinaryHeap<PrioEntry>>]> = if kind.steals() {
                (0..nworkers).map(|_| Mutex::new(BinaryHeap::new())).collect()
            } else {
                Box::from([])
            };
            RunQueues::Priority {
                global: Mutex::new(BinaryHeap::new()),
                locals,
                seq: AtomicU64::new(0),
            }
        } else {
            let mut stealers = Vec::new();
            if kind.steals() {
                for _ in 0..nworkers {
                    let worker = if kind.lifo() { Worker::new_lifo() } else { Worker::new_fifo() };
                    stealers.push(worker.stealer());
                    pending.push(Some(worker));
                }
            }
            let mailboxes: Box<[Injector<StepId>]> = if kind.affinity_aware() {
                (0..nworkers).map(|_| Injector::new()).collect()
            } else {
                Box::from([])
            };
            RunQueues::Fifo {
                injector: Injector::new(),
                stealers: stealers.into_boxed_slice(),
                mailboxes,
            }
        };

        Scheduler {
            shared: Arc::new(SchedulerShared {
                nworkers,
                steal: kind.steals(),
                affinity_aware: kind.affinity_aware(),
                pin_stride: settings.pin_stride,
                queues,
                monitor: Monitor::new(),
                shutdown: AtomicBool::new(false),
                queued: AtomicUsize::new(0),
                executing: AtomicUsize::new(0),
            }),
            pending: Mutex::new(pending),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the background workers. Worker zero is the environment thread and is not
    /// spawned; it participates through [`wait`].
    pub(crate) fn start(&self, ctx: &Arc<ContextInner>) {
        if self.shared.pin_stride > 0 {
            pin::pin_worker(0, self.shared.pin_stride);
        }
        let mut threads = self.threads.lock();
        for index in 1..self.shared.nworkers {
            let local = self.pending.lock().get_mut(index).and_then(Option::take);
            let ctx = ctx.clone();
            let shared = self.shared.clone();
            let thread = std::thread::Builder::new()
                .name(format!("pd-worker-{}", index))
                .spawn(move || worker_loop(ctx, shared, index, local))
                .unwrap_or_else(|e| panic!("failed to spawn worker {}: {}", index, e));
            threads.push(thread);
        }
    }

    /// Queue an instance for execution, routing by affinity hint and submitter locality.
    pub(crate) fn submit(&self, instance: &Arc<StepInstance>) {
        let shared = &self.shared;
        shared.queued.fetch_add(1, Ordering::SeqCst);
        let target = if shared.affinity_aware {
            match instance.affinity {
                crate::tuner::Affinity::Worker(k) => Some(k % shared.nworkers),
                crate::tuner::Affinity::Anywhere => None,
            }
        } else {
            None
        };
        match &shared.queues {
            RunQueues::Fifo { injector, mailboxes, .. } => match target {
                Some(k) if !mailboxes.is_empty() => mailboxes[k].push(instance.id),
                _ => {
                    let pushed_local = CURRENT_WORKER.with(|w| {
                        match w.borrow().as_ref() {
                            Some(h) if Arc::ptr_eq(&h.shared, shared) => match &h.local {
                                Some(local) => {
                                    local.push(instance.id);
                                    true
                                }
                                None => false,
                            },
                            _ => false,
                        }
                    });
                    if !pushed_local {
                        injector.push(instance.id);
                    }
                }
            },
            RunQueues::Priority { global, locals, seq } => {
                let entry = PrioEntry {
                    priority: instance.priority,
                    seq: seq.fetch_add(1, Ordering::Relaxed),
                    step: instance.id,
                };
                let index = target.or_else(|| {
                    CURRENT_WORKER.with(|w| match w.borrow().as_ref() {
                        Some(h) if Arc::ptr_eq(&h.shared, shared) => Some(h.index),
                        _ => None,
                    })
                });
                match index {
                    Some(k) if !locals.is_empty() => locals[k].lock().push(entry),
                    _ => global.lock().push(entry),
                }
            }
        }
        shared.monitor.notify_one();
    }

    /// Wake every parked worker and the environment waiter, typically because the work
    /// counter hit zero or a fatal error was recorded.
    pub(crate) fn notify_all(&self) {
        self.shared.monitor.notify_all();
    }

    pub(crate) fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.monitor.notify_all();
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            let _ = thread.join();
        }
    }

    fn take_env_worker(&self) -> Option<Worker<StepId>> {
        self.pending.lock().get_mut(0).and_then(Option::take)
    }

    fn return_env_worker(&self, worker: Option<Worker<StepId>>) {
        if let Some(worker) = worker {
            if let Some(slot) = self.pending.lock().get_mut(0) {
                *slot = Some(worker);
            }
        }
    }
}

/// Pop one unit of work for this worker: own mailbox, own queue, global queue, then the
/// other workers in a rotated order. A successful pop claims the unit: `executing` is
/// raised before `queued` drops, so the pair never reads zero while work is in flight.
fn find_work(ctx: &ContextInner, handle: &WorkerHandle) -> Option<StepId> {
    let shared = &handle.shared;
    let found = match &shared.queues {
        RunQueues::Fifo { injector, stealers, mailboxes } => {
            find_fifo(ctx, handle, injector, stealers, mailboxes)
        }
        RunQueues::Priority { global, locals, .. } => find_priority(ctx, handle, global, locals),
    };
    if found.is_some() {
        shared.executing.fetch_add(1, Ordering::SeqCst);
        shared.queued.fetch_sub(1, Ordering::SeqCst);
    }
    found
}

fn find_fifo(
    ctx: &ContextInner,
    handle: &WorkerHandle,
    injector: &Injector<StepId>,
    stealers: &[Stealer<StepId>],
    mailboxes: &[Injector<StepId>],
) -> Option<StepId> {
    let shared = &handle.shared;
    if !mailboxes.is_empty() {
        if let Some(id) = drain_injector(&mailboxes[handle.index], None) {
            return Some(id);
        }
    }
    if let Some(local) = &handle.local {
        if let Some(id) = local.pop() {
            return Some(id);
        }
    }
    if let Some(id) = drain_injector(injector, handle.local.as_deref()) {
        return Some(id);
    }
    if shared.steal {
        for offset in 1..shared.nworkers {
            let victim = (handle.index + offset) % shared.nworkers;
            if let Some(id) = steal_one(&stealers[victim]) {
                note_steal(ctx, handle.index, victim);
                return Some(id);
            }
            if !mailboxes.is_empty() {
                if let Some(id) = drain_injector(&mailboxes[victim], None) {
                    note_steal(ctx, handle.index, victim);
                    return Some(id);
                }
            }
        }
    }
    None
}

fn find_priority(
    ctx: &ContextInner,
    handle: &WorkerHandle,
    global: &Mutex<BinaryHeap<PrioEntry>>,
    locals: &[Mutex<BinaryHeap<PrioEntry>>],
) -> Option<StepId> {
    let shared = &handle.shared;
    if !locals.is_empty() {
        if let Some(entry) = locals[handle.index].lock().pop() {
            return Some(entry.step);
        }
    }
    if let Some(entry) = global.lock().pop() {
        return Some(entry.step);
    }
    if shared.steal && !locals.is_empty() {
        for offset in 1..shared.nworkers {
            let victim = (handle.index + offset) % shared.nworkers;
            if let Some(entry) = locals[victim].lock().pop() {
                note_steal(ctx, handle.index, victim);
                return Some(entry.step);
            }
        }
    }
    None
}

fn drain_injector(injector: &Injector<StepId>, local: Option<&Worker<StepId>>) -> Option<StepId> {
    loop {
        let steal = match local {
            Some(worker) => injector.steal_batch_and_pop(worker),
            None => injector.steal(),
        };
        match steal {
            Steal::Success(id) => return Some(id),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}

fn steal_one(stealer: &Stealer<StepId>) -> Option<StepId> {
    loop {
        match stealer.steal() {
            Steal::Success(id) => return Some(id),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}

fn note_steal(ctx: &ContextInner, thief: usize, victim: usize) {
    StatCounters::bump(&ctx.stats.steals);
    ctx.logger.log(ScheduleEvent { worker: thief, kind: ScheduleEventKind::Stole { from: victim } });
}

/// Execute one claimed instance and release the claim.
fn run_claimed(ctx: &Arc<ContextInner>, shared: &SchedulerShared, id: StepId, worker: usize) {
    if let Some(instance) = ctx.steps.get(id) {
        execute_instance(ctx, &instance, worker);
    }
    shared.executing.fetch_sub(1, Ordering::SeqCst);
}

/// The body of a worker thread.
fn worker_loop(
    ctx: Arc<ContextInner>,
    shared: Arc<SchedulerShared>,
    index: usize,
    local: Option<Worker<StepId>>,
) {
    pin::pin_worker(index, shared.pin_stride);
    let handle = WorkerHandle { shared: shared.clone(), index, local: local.map(Rc::new) };
    CURRENT_WORKER.with(|w| *w.borrow_mut() = Some(handle.clone()));
    ctx.logger.log(ScheduleEvent { worker: index, kind: ScheduleEventKind::Started });
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let epoch = shared.monitor.epoch();
        if let Some(id) = find_work(&ctx, &handle) {
            run_claimed(&ctx, &shared, id, index);
            continue;
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        ctx.logger.log(ScheduleEvent { worker: index, kind: ScheduleEventKind::Parked });
        shared.monitor.park(epoch, Duration::from_millis(50));
    }
    ctx.logger.log(ScheduleEvent { worker: index, kind: ScheduleEventKind::Stopped });
    CURRENT_WORKER.with(|w| *w.borrow_mut() = None);
}

/// Run work until the context's outstanding-work counter reaches zero.
///
/// The calling thread adopts the worker-zero role for the duration. Returns the context's
/// fatal error if one is recorded, and detects the quiescent-but-pending state: work
/// outstanding, nothing queued, nothing executing, no put in flight — which means some
/// suspended step waits on an item no producer will ever put.
pub(crate) fn wait(ctx: &Arc<ContextInner>) -> Result<(), Fatal> {
    let scheduler = &ctx.scheduler;
    let shared = scheduler.shared.clone();
    let local = scheduler.take_env_worker();
    let handle = WorkerHandle { shared: shared.clone(), index: 0, local: local.map(Rc::new) };
    let previous = CURRENT_WORKER.with(|w| w.borrow_mut().replace(handle.clone()));

    let result = loop {
        if let Some(fatal) = ctx.current_fatal() {
            break Err(fatal);
        }
        // The epoch is read before the queue scan so a submission racing with the scan
        // turns the park into a no-op.
        let epoch = shared.monitor.epoch();
        if let Some(id) = find_work(ctx, &handle) {
            run_claimed(ctx, &shared, id, 0);
            continue;
        }
        if ctx.outstanding() == 0 {
            break Ok(());
        }
        if shared.queued.load(Ordering::SeqCst) == 0
            && shared.executing.load(Ordering::SeqCst) == 0
            && ctx.operations_in_flight() == 0
            && ctx.outstanding() > 0
        {
            let pending = ctx.steps.suspended_descriptions();
            if !pending.is_empty() {
                let fatal = Fatal::QuiescentButPending { pending };
                ctx.fail(fatal.clone());
                break Err(fatal);
            }
        }
        shared.monitor.park(epoch, Duration::from_millis(10));
    };

    CURRENT_WORKER.with(|w| *w.borrow_mut() = previous);
    scheduler.return_env_worker(handle.local.and_then(Rc::into_inner));
    result
}

/// Execute one attempt of an instance: optional pre-execution dependency pass, then the
/// body, then the commit/suspend/abort epilogue.
fn execute_instance(ctx: &Arc<ContextInner>, instance: &Arc<StepInstance>, _worker: usize) {
    if ctx.has_failed() {
        cancel_instance(ctx, instance);
        return;
    }
    if !instance.transition(StepState::Queued, StepState::Running)
        && !instance.transition(StepState::Created, StepState::Running)
    {
        log::debug!("skipping step {:?} in state {:?}", instance.id, instance.state());
        return;
    }
    ctx.logger.log(StepEvent { step: instance.id.0, kind: StepEventKind::Started });
    instance.begin_attempt();

    let previous = CURRENT_STEP.with(|c| {
        c.borrow_mut().replace(CurrentStep { ctx: ctx.clone(), instance: instance.clone() })
    });

    // Pre-execution pass: park on every missing declared item at once, before the body
    // ever runs.
    if instance.task.wants_preschedule() {
        let mut consumer = DependencyConsumer { instance };
        instance.task.declare(&mut consumer);
        if instance.registered_any() {
            CURRENT_STEP.with(|c| *c.borrow_mut() = previous);
            park_or_requeue(ctx, instance);
            return;
        }
    }

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| instance.task.run()))
        .unwrap_or_else(|payload| Err(StepError::Failed(panic_reason(payload))));

    CURRENT_STEP.with(|c| *c.borrow_mut() = previous);

    match result {
        Ok(()) => {
            instance.commit_accesses();
            instance.set_state(StepState::Finished);
            ctx.steps.remove(instance.id);
            StatCounters::bump(&ctx.stats.steps_finished);
            ctx.logger.log(StepEvent { step: instance.id.0, kind: StepEventKind::Finished });
            ctx.finish_work();
        }
        Err(StepError::NotReady) => {
            instance.discard_accesses();
            if instance.registered_any() || instance.wants_retry() {
                // With no registration the dependency counter holds only the self-count,
                // so this parks and immediately re-queues: the retry case.
                park_or_requeue(ctx, instance);
            } else {
                // A not-ready signal with no pending read and no retry mark cannot
                // resume; re-queueing it would spin forever.
                abort_instance(
                    ctx,
                    instance,
                    Fatal::StepFailed {
                        step: instance.describe(),
                        reason: "not-ready signalled with no pending reads".to_owned(),
                    },
                );
            }
        }
        Err(StepError::Gone(item)) => {
            instance.discard_accesses();
            let fatal = Fatal::ItemGone { step: instance.describe(), item };
            abort_instance(ctx, instance, fatal);
        }
        Err(StepError::ItemAlreadyPresent(item)) => {
            instance.discard_accesses();
            let fatal = Fatal::ItemAlreadyPresent { step: instance.describe(), item };
            abort_instance(ctx, instance, fatal);
        }
        Err(StepError::Failed(reason)) => {
            instance.discard_accesses();
            let fatal = Fatal::StepFailed { step: instance.describe(), reason };
            abort_instance(ctx, instance, fatal);
        }
    }
}

/// Retire an instance on a context that has already failed.
fn cancel_instance(ctx: &Arc<ContextInner>, instance: &Arc<StepInstance>) {
    instance.set_state(StepState::Cancelled);
    ctx.steps.remove(instance.id);
    StatCounters::bump(&ctx.stats.steps_cancelled);
    ctx.logger.log(StepEvent { step: instance.id.0, kind: StepEventKind::Cancelled });
    ctx.finish_work();
}

/// Record a fatal error and retire the offending instance.
fn abort_instance(ctx: &Arc<ContextInner>, instance: &Arc<StepInstance>, fatal: Fatal) {
    log::error!("{}", fatal);
    ctx.fail(fatal);
    instance.set_state(StepState::Cancelled);
    ctx.steps.remove(instance.id);
    StatCounters::bump(&ctx.stats.steps_cancelled);
    ctx.logger.log(StepEvent { step: instance.id.0, kind: StepEventKind::Failed });
    ctx.finish_work();
}

fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        format!("step panicked: {}", text)
    } else if let Some(text) = payload.downcast_ref::<String>() {
        format!("step panicked: {}", text)
    } else {
        "step panicked".to_owned()
    }
}
