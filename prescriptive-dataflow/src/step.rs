//! Step-collections and step instances.
//!
//! A step-collection owns one immutable copy of the user's step body; putting a tag into a
//! controlling tag-collection creates a *step instance* binding the body to that tag. The
//! instance cycles through `Queued`, `Running`, and possibly `Suspended` any number of
//! times before reaching `Finished` or `Cancelled`.
//!
//! Instances are owned by a per-context registry keyed by an opaque [`StepId`]; run queues
//! and item-slot waiter lists hold ids, never owning pointers. An id is invalidated when
//! the instance finishes, and stale ids are ignored at dereference time.

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};

use crate::context::ContextInner;
use crate::item::ItemCollection;
use crate::logging::CollectionKind;
use crate::suspend::{DependencyConsumer, MissProbe};
use crate::tag::TagCollection;
use crate::tuner::{Affinity, ComputeOn, StepTuner};
use crate::{Data, StepResult, Tag};

/// An opaque identifier for one step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(pub(crate) u64);

/// The lifecycle states of a step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum StepState {
    Created = 0,
    Queued = 1,
    Running = 2,
    Suspended = 3,
    Finished = 4,
    Cancelled = 5,
}

impl StepState {
    fn from_u8(value: u8) -> StepState {
        match value {
            0 => StepState::Created,
            1 => StepState::Queued,
            2 => StepState::Running,
            3 => StepState::Suspended,
            4 => StepState::Finished,
            _ => StepState::Cancelled,
        }
    }
}

/// The executable payload of a step instance.
///
/// Implemented by prescribed user steps and by the runtime's internal tasks (range puts,
/// parallel-for leaves). The scheduler only sees this trait.
pub(crate) trait StepTask: Send + Sync {
    /// Execute the body once. A `NotReady` error suspends the instance.
    fn run(&self) -> StepResult;
    /// True if the pre-execution dependency pass should run before the body.
    fn wants_preschedule(&self) -> bool {
        false
    }
    /// Declare this instance's item reads to the pre-execution pass.
    fn declare(&self, _deps: &mut DependencyConsumer<'_>) {}
    /// The step-collection identifier this instance belongs to, for logging.
    fn collection(&self) -> usize;
    /// A human-readable description, used in fatal reports.
    fn describe(&self) -> String;
}

/// One execution attempt's worth of bookkeeping plus the identity of a step instance.
pub(crate) struct StepInstance {
    pub(crate) id: StepId,
    pub(crate) priority: i64,
    pub(crate) affinity: Affinity,
    state: AtomicU8,
    /// Unsatisfied dependencies plus one self-count held by the executing worker; the
    /// party whose decrement reaches zero re-queues the instance.
    pub(crate) deps: AtomicIsize,
    /// Bumped at the start of every attempt; waiter entries from older attempts are stale.
    pub(crate) generation: AtomicU64,
    /// Whether any waiter registration happened during the current attempt.
    registered: AtomicBool,
    /// Whether the current attempt must re-execute even though nothing is parked: its
    /// missed reads were all produced before `flush_gets` could register waiters.
    retry: AtomicBool,
    /// Deferred get-count decrements, applied when the attempt commits.
    accesses: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    /// Reads that missed under `try_get`, re-examined by `flush_gets`.
    misses: Mutex<Vec<MissProbe>>,
    pub(crate) task: Box<dyn StepTask>,
}

impl StepInstance {
    pub(crate) fn new(id: StepId, priority: i64, affinity: Affinity, task: Box<dyn StepTask>) -> Arc<Self> {
        Arc::new(StepInstance {
            id,
            priority,
            affinity,
            state: AtomicU8::new(StepState::Created as u8),
            deps: AtomicIsize::new(0),
            generation: AtomicU64::new(0),
            registered: AtomicBool::new(false),
            retry: AtomicBool::new(false),
            accesses: Mutex::new(Vec::new()),
            misses: Mutex::new(Vec::new()),
            task,
        })
    }

    pub(crate) fn state(&self) -> StepState {
        StepState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: StepState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn transition(&self, from: StepState, to: StepState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Reset per-attempt state. Called by the scheduler before the dependency pass and
    /// body run; the generation bump invalidates waiter entries of earlier attempts.
    pub(crate) fn begin_attempt(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.deps.store(1, Ordering::SeqCst);
        self.registered.store(false, Ordering::SeqCst);
        self.retry.store(false, Ordering::SeqCst);
        self.accesses.lock().clear();
        self.misses.lock().clear();
    }

    /// Account for one waiter registration on a missing item.
    pub(crate) fn note_registration(&self) {
        self.deps.fetch_add(1, Ordering::SeqCst);
        self.registered.store(true, Ordering::SeqCst);
    }

    /// Whether the current attempt registered any waiter.
    pub(crate) fn registered_any(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Mark the current attempt for re-execution without parking.
    pub(crate) fn note_retry(&self) {
        self.retry.store(true, Ordering::SeqCst);
    }

    /// Whether the current attempt asked to be re-executed without parking.
    pub(crate) fn wants_retry(&self) -> bool {
        self.retry.load(Ordering::SeqCst)
    }

    pub(crate) fn record_access(&self, commit: Box<dyn FnOnce() + Send>) {
        self.accesses.lock().push(commit);
    }

    pub(crate) fn record_miss(&self, probe: MissProbe) {
        self.misses.lock().push(probe);
    }

    pub(crate) fn take_misses(&self) -> Vec<MissProbe> {
        std::mem::take(&mut *self.misses.lock())
    }

    /// Apply the deferred get-count decrements of a committing attempt.
    pub(crate) fn commit_accesses(&self) {
        let accesses = std::mem::take(&mut *self.accesses.lock());
        for commit in accesses {
            commit();
        }
    }

    /// Drop the deferred decrements of a suspending or failing attempt.
    pub(crate) fn discard_accesses(&self) {
        self.accesses.lock().clear();
        self.misses.lock().clear();
    }

    pub(crate) fn describe(&self) -> String {
        self.task.describe()
    }
}

const REGISTRY_SHARDS: usize = 16;

/// The per-context owner of live step instances.
///
/// Queues and waiter lists refer to instances through this registry; removal on finish is
/// what invalidates their ids.
pub(crate) struct StepRegistry {
    next_id: AtomicU64,
    shards: Box<[RwLock<FnvHashMap<u64, Arc<StepInstance>>>]>,
}

impl StepRegistry {
    pub(crate) fn new() -> Self {
        let shards = (0..REGISTRY_SHARDS).map(|_| RwLock::new(FnvHashMap::default())).collect();
        StepRegistry { next_id: AtomicU64::new(1), shards }
    }

    pub(crate) fn allocate_id(&self) -> StepId {
        StepId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn shard(&self, id: StepId) -> &RwLock<FnvHashMap<u64, Arc<StepInstance>>> {
        &self.shards[(id.0 as usize) % REGISTRY_SHARDS]
    }

    pub(crate) fn insert(&self, instance: Arc<StepInstance>) {
        self.shard(instance.id).write().insert(instance.id.0, instance);
    }

    /// Dereference an id; `None` for ids already invalidated.
    pub(crate) fn get(&self, id: StepId) -> Option<Arc<StepInstance>> {
        self.shard(id).read().get(&id.0).cloned()
    }

    pub(crate) fn remove(&self, id: StepId) {
        self.shard(id).write().remove(&id.0);
    }

    pub(crate) fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }

    /// Descriptions of every suspended instance, for the quiescent-but-pending report.
    pub(crate) fn suspended_descriptions(&self) -> Vec<String> {
        let mut pending = Vec::new();
        for shard in self.shards.iter() {
            for instance in shard.read().values() {
                if instance.state() == StepState::Suspended {
                    pending.push(instance.describe());
                }
            }
        }
        pending.sort();
        pending
    }
}

/// The shared half of a step-collection.
pub(crate) struct StepCollectionImpl<T> {
    pub(crate) ctx: Arc<ContextInner>,
    pub(crate) id: usize,
    pub(crate) name: String,
    body: Box<dyn Fn(&T) -> StepResult + Send + Sync>,
    pub(crate) tuner: StepTuner<T>,
    relations: Mutex<Relations>,
}

/// Declared producer/consumer/controller relationships, kept for diagnostics.
#[derive(Default)]
struct Relations {
    consumes: Vec<String>,
    produces: Vec<String>,
    controls: Vec<String>,
}

impl<T: Tag> StepCollectionImpl<T> {
    /// Create an instance for `tag` and hand it to the scheduler.
    ///
    /// Applies the cancellation predicate first: a cancelled tag never creates an
    /// instance. Distribution hints are resolved by the caller (the tag-collection).
    pub(crate) fn prescribe(this: &Arc<Self>, tag: &T) {
        if let Some(cancel) = &this.tuner.cancel {
            if cancel(tag) {
                this.ctx.note_cancelled_prescription();
                return;
            }
        }
        let priority = this.tuner.priority.as_ref().map_or(0, |f| f(tag));
        let affinity = this.tuner.affinity.as_ref().map_or(Affinity::Anywhere, |f| f(tag));
        let id = this.ctx.steps.allocate_id();
        let task = PrescribedTask { collection: this.clone(), tag: tag.clone() };
        let instance = StepInstance::new(id, priority, affinity, Box::new(task));
        this.ctx.spawn(instance);
    }

    /// The rank this tag's instance should execute on, if the tuner has an opinion.
    pub(crate) fn compute_rank(&self, tag: &T) -> ComputeOn {
        self.tuner.compute_on.as_ref().map_or(ComputeOn::Local, |f| f(tag))
    }
}

/// The instance payload for a prescribed user step.
struct PrescribedTask<T> {
    collection: Arc<StepCollectionImpl<T>>,
    tag: T,
}

impl<T: Tag> StepTask for PrescribedTask<T> {
    fn run(&self) -> StepResult {
        (self.collection.body)(&self.tag)
    }

    fn wants_preschedule(&self) -> bool {
        self.collection.tuner.wants_preschedule()
    }

    fn declare(&self, deps: &mut DependencyConsumer<'_>) {
        if let Some(depends) = &self.collection.tuner.depends {
            depends(&self.tag, deps);
        }
    }

    fn collection(&self) -> usize {
        self.collection.id
    }

    fn describe(&self) -> String {
        format!("{}({:?})", self.collection.name, self.tag)
    }
}

/// A logical set of step instances sharing one body template.
///
/// A step-collection must be prescribed by a tag-collection to receive work, and may
/// declare consumer/producer/controller relationships with other collections. Handles are
/// cheap to clone and refer to the same collection.
pub struct StepCollection<T> {
    pub(crate) inner: Arc<StepCollectionImpl<T>>,
}

impl<T> Clone for StepCollection<T> {
    fn clone(&self) -> Self {
        StepCollection { inner: self.inner.clone() }
    }
}

impl<T: Tag> StepCollection<T> {
    /// A step-collection with the given body and no tuning hints.
    pub fn new(
        ctx: &crate::Context,
        name: &str,
        body: impl Fn(&T) -> StepResult + Send + Sync + 'static,
    ) -> Self {
        Self::with_tuner(ctx, name, StepTuner::new(), body)
    }

    /// A step-collection with tuning hints.
    pub fn with_tuner(
        ctx: &crate::Context,
        name: &str,
        tuner: StepTuner<T>,
        body: impl Fn(&T) -> StepResult + Send + Sync + 'static,
    ) -> Self {
        let ctx = ctx.inner();
        let id = ctx.register_collection_name(name, CollectionKind::Step);
        StepCollection {
            inner: Arc::new(StepCollectionImpl {
                ctx,
                id,
                name: name.to_owned(),
                body: Box::new(body),
                tuner,
                relations: Mutex::new(Relations::default()),
            }),
        }
    }

    /// The name given at construction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Declare this step-collection as a consumer of the given item-collection.
    pub fn consumes<T2: Tag, V: Data>(&self, items: &ItemCollection<T2, V>) -> &Self {
        self.inner.relations.lock().consumes.push(items.name().to_owned());
        self
    }

    /// Declare this step-collection as a producer for the given item-collection.
    pub fn produces<T2: Tag, V: Data>(&self, items: &ItemCollection<T2, V>) -> &Self {
        self.inner.relations.lock().produces.push(items.name().to_owned());
        self
    }

    /// Declare this step-collection as a controller of the given tag-collection.
    pub fn controls<T2: Tag>(&self, tags: &TagCollection<T2>) -> &Self {
        self.inner.relations.lock().controls.push(tags.name().to_owned());
        self
    }
}

impl<T> std::fmt::Debug for StepCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let relations = self.inner.relations.lock();
        f.debug_struct("StepCollection")
            .field("name", &self.inner.name)
            .field("consumes", &relations.consumes)
            .field("produces", &relations.produces)
            .field("controls", &relations.controls)
            .finish()
    }
}
