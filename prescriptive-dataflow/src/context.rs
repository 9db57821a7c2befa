//! Contexts: the owner of a program's collections, scheduler, and work accounting.
//!
//! Every tag put, item put, and step instance contributes a unit to the context's
//! outstanding-work counter; [`Context::wait`] returns exactly when the counter reaches
//! zero with every worker idle. Mutating operations additionally register themselves for
//! their duration, which lets the wait barrier distinguish "between two waves of work"
//! from the failure state where suspended steps wait on items nobody will produce.

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::dist;
use crate::error::{Fatal, StepError};
use crate::logging::{CollectionEvent, CollectionKind, Logger, StatCounters, Statistics, StepEvent, StepEventKind};
use crate::runtime::Runtime;
use crate::schedule::{self, Scheduler};
use crate::step::{StepInstance, StepRegistry};

/// The type-erased interface a context keeps to each of its collections, enough for
/// reset and for dispatching messages arriving from other processes.
pub(crate) trait CollectionBase: Send + Sync {
    /// The user-visible name.
    fn name(&self) -> &str;
    /// Drop all content; the context has already checked the safe state.
    fn reset_unchecked(&self);
    /// Apply a payload produced by a sibling collection on another process.
    fn deliver(self: Arc<Self>, payload: &[u8]);
}

/// The shared state behind a [`Context`] handle.
pub(crate) struct ContextInner {
    pub(crate) runtime: Runtime,
    pub(crate) logger: Logger,
    pub(crate) scheduler: Scheduler,
    pub(crate) steps: StepRegistry,
    pub(crate) stats: StatCounters,
    /// Live step instances plus one unit per operation in flight.
    work: AtomicIsize,
    /// Mutating operations (puts, prescriptions) currently between begin and end.
    operations: AtomicUsize,
    failed: AtomicBool,
    fatal: Mutex<Option<Fatal>>,
    collections: Mutex<FnvHashMap<usize, Weak<dyn CollectionBase>>>,
    next_collection: AtomicUsize,
}

impl ContextInner {
    /// Allocate a collection identifier and announce the name binding to the logger.
    pub(crate) fn register_collection_name(&self, name: &str, kind: CollectionKind) -> usize {
        let id = self.next_collection.fetch_add(1, Ordering::Relaxed);
        self.logger.log(CollectionEvent { collection: id, name: name.to_owned(), kind });
        id
    }

    /// Keep a back reference for reset and message dispatch; weak, so the context never
    /// extends a collection's lifetime.
    pub(crate) fn register_resettable(&self, id: usize, collection: &Arc<dyn CollectionBase>) {
        self.collections.lock().insert(id, Arc::downgrade(collection));
    }

    fn collection_by_id(&self, id: usize) -> Option<Arc<dyn CollectionBase>> {
        self.collections.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Enter a mutating operation: holds one work unit and one operation registration
    /// until [`ContextInner::end_operation`], so wait cannot observe a half-done put.
    pub(crate) fn begin_operation(&self) {
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.work.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_operation(&self) {
        self.operations.fetch_sub(1, Ordering::SeqCst);
        self.note_work_done();
    }

    /// Retire one unit of work; the transition to zero releases the wait barrier.
    pub(crate) fn finish_work(&self) {
        self.note_work_done();
    }

    fn note_work_done(&self) {
        if self.work.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.scheduler.notify_all();
        }
    }

    pub(crate) fn outstanding(&self) -> isize {
        self.work.load(Ordering::SeqCst)
    }

    pub(crate) fn operations_in_flight(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    /// Register a freshly created instance and hand it to the scheduler.
    pub(crate) fn spawn(&self, instance: Arc<StepInstance>) {
        self.begin_operation();
        self.work.fetch_add(1, Ordering::SeqCst);
        StatCounters::bump(&self.stats.steps_created);
        self.logger.log(StepEvent {
            step: instance.id.0,
            kind: StepEventKind::Prescribed { collection: instance.task.collection() },
        });
        self.steps.insert(instance.clone());
        instance.set_state(crate::step::StepState::Queued);
        self.scheduler.submit(&instance);
        self.end_operation();
    }

    /// Account for a tag dropped by a cancellation predicate.
    pub(crate) fn note_cancelled_prescription(&self) {
        StatCounters::bump(&self.stats.steps_cancelled);
    }

    /// Record a fatal error; the first one wins, later work drains without executing.
    pub(crate) fn fail(&self, fatal: Fatal) {
        self.failed.store(true, Ordering::SeqCst);
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some(fatal);
        }
        self.scheduler.notify_all();
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub(crate) fn current_fatal(&self) -> Option<Fatal> {
        if self.has_failed() {
            self.fatal.lock().clone()
        } else {
            None
        }
    }

    /// Check the safe state: no outstanding work and no recorded failure.
    pub(crate) fn require_quiescent(&self) -> Result<(), Fatal> {
        if self.has_failed() || self.outstanding() != 0 || self.operations_in_flight() != 0 {
            return Err(Fatal::InvalidSafeState);
        }
        Ok(())
    }

    /// Dispatch a message from a sibling process to the addressed collection.
    pub(crate) fn deliver(&self, collection: usize, payload: &[u8]) {
        match self.collection_by_id(collection) {
            Some(target) => {
                log::trace!("delivering {} bytes to '{}'", payload.len(), target.name());
                target.deliver(payload);
            }
            None => log::warn!("message for unknown collection {} dropped", collection),
        }
    }
}

/// The root object of a program: owns the collections, the worker pool, and the
/// outstanding-work counter behind [`Context::wait`].
///
/// Collections keep the shared state alive, but workers stop when the `Context` value is
/// dropped; keep it in scope for as long as steps should run.
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// A context executing with the given runtime's settings.
    pub fn new(runtime: &Runtime) -> Self {
        runtime.announce();
        let inner = Arc::new(ContextInner {
            runtime: runtime.clone(),
            logger: runtime.logger(),
            scheduler: Scheduler::new(runtime.settings()),
            steps: StepRegistry::new(),
            stats: StatCounters::default(),
            work: AtomicIsize::new(0),
            operations: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            fatal: Mutex::new(None),
            collections: Mutex::new(FnvHashMap::default()),
            next_collection: AtomicUsize::new(0),
        });
        inner.scheduler.start(&inner);
        if runtime.distributed() {
            dist::register_receiver(&inner);
        }
        Context { inner }
    }

    /// A context with a runtime configured from the environment.
    pub fn from_env() -> Self {
        Context::new(&Runtime::from_env())
    }

    /// Block until all transitively implied work has completed.
    ///
    /// The calling thread helps execute steps while it waits. Returns the context's
    /// fatal error if any step failed, and [`Fatal::QuiescentButPending`] if suspended
    /// steps wait on items no producer will ever put.
    pub fn wait(&self) -> Result<(), Fatal> {
        schedule::wait(&self.inner)
    }

    /// Declare a batch of `try_get`s complete; see [`flush_gets`](crate::flush_gets).
    pub fn flush_gets(&self) -> Result<(), StepError> {
        schedule::flush_gets()
    }

    /// Return the context to its as-new state, clearing every collection.
    ///
    /// Legal only in the safe state: after `wait` returned successfully and before any
    /// new put.
    pub fn reset(&self) -> Result<(), Fatal> {
        self.inner.require_quiescent()?;
        let collections: Vec<_> = {
            let mut registered = self.inner.collections.lock();
            registered.retain(|_, weak| weak.strong_count() > 0);
            registered.values().filter_map(Weak::upgrade).collect()
        };
        for collection in collections {
            collection.reset_unchecked();
        }
        self.inner.steps.clear();
        Ok(())
    }

    /// A snapshot of the context's activity counters.
    pub fn statistics(&self) -> Statistics {
        self.inner.stats.snapshot()
    }

    /// The runtime this context executes with.
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub(crate) fn inner(&self) -> Arc<ContextInner> {
        self.inner.clone()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.inner.scheduler.stop();
        self.inner.steps.clear();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("outstanding", &self.inner.outstanding())
            .field("failed", &self.inner.has_failed())
            .finish()
    }
}
