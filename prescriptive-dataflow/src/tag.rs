//! Tag-collections: the control edges of a program.
//!
//! Putting a tag prescribes one step instance per controlled step-collection. Tags carry
//! no runtime state; by default they are not even stored. A memoizing collection stores
//! tags and prescribes each distinct tag exactly once, which also makes the collection
//! iterable.

use std::sync::Arc;

use fnv::FnvHashSet;
use parking_lot::Mutex;

use crate::context::{CollectionBase, ContextInner};
use crate::error::Fatal;
use crate::logging::{CollectionKind, StatCounters, TagEvent};
use crate::range::{BlockedRange, RangeIndex};
use crate::step::{StepCollection, StepCollectionImpl, StepInstance, StepTask};
use crate::tuner::{Affinity, ComputeOn, TagTuner};
use crate::{dist, StepResult, Tag};

/// The type-erased prescription edge from a tag-collection to a step-collection.
pub(crate) trait Prescriber<T>: Send + Sync {
    fn prescribe(&self, tag: &T);
    fn compute_rank(&self, tag: &T) -> ComputeOn;
}

impl<T: Tag> Prescriber<T> for Arc<StepCollectionImpl<T>> {
    fn prescribe(&self, tag: &T) {
        StepCollectionImpl::prescribe(self, tag);
    }

    fn compute_rank(&self, tag: &T) -> ComputeOn {
        StepCollectionImpl::compute_rank(self, tag)
    }
}

type TagCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub(crate) struct TagCollectionImpl<T> {
    ctx: Arc<ContextInner>,
    id: usize,
    name: String,
    tuner: TagTuner<T>,
    prescribed: Mutex<Vec<Arc<dyn Prescriber<T>>>>,
    /// Present only when memoizing; doubles as the iteration storage.
    memo: Option<Mutex<FnvHashSet<T>>>,
    callbacks: Mutex<Vec<TagCallback<T>>>,
}

impl<T: Tag> TagCollectionImpl<T> {
    pub(crate) fn put(&self, tag: T) {
        self.ctx.begin_operation();
        self.put_inner(&tag);
        self.ctx.end_operation();
    }

    fn put_inner(&self, tag: &T) {
        StatCounters::bump(&self.ctx.stats.tags_put);
        if let Some(memo) = &self.memo {
            if !memo.lock().insert(tag.clone()) {
                self.ctx.logger.log(TagEvent { collection: self.id, prescribed: 0 });
                return;
            }
        }
        let distributed = self.ctx.runtime.distributed();
        let mine = if distributed { self.ctx.runtime.communicator().rank() } else { 0 };
        let mut prescribed = 0;
        let prescribers: Vec<Arc<dyn Prescriber<T>>> = self.prescribed.lock().clone();
        for prescriber in &prescribers {
            match prescriber.compute_rank(tag) {
                ComputeOn::Rank(rank) if distributed && rank != mine => {
                    dist::send_tag(&self.ctx, self.id, &self.tuner.codec, tag, rank);
                }
                _ => {
                    prescriber.prescribe(tag);
                    prescribed += 1;
                }
            }
        }
        self.ctx.logger.log(TagEvent { collection: self.id, prescribed });
        let callbacks: Vec<TagCallback<T>> = self.callbacks.lock().clone();
        for callback in &callbacks {
            callback(tag);
        }
    }
}

impl<T: Tag> CollectionBase for TagCollectionImpl<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset_unchecked(&self) {
        if let Some(memo) = &self.memo {
            memo.lock().clear();
        }
    }

    fn deliver(self: Arc<Self>, payload: &[u8]) {
        let Some(codec) = &self.tuner.codec else {
            log::warn!("tag message for '{}' dropped: no codec", self.name);
            return;
        };
        match (codec.decode)(payload) {
            Some(tag) => self.put(tag),
            None => log::warn!("undecodable tag message for '{}'", self.name),
        }
    }
}

/// The internal task that distributes a range put across the worker pool: divisible
/// pieces split and respawn, leaves put their tags.
struct RangePutTask<T> {
    collection: Arc<TagCollectionImpl<T>>,
    range: BlockedRange<T>,
}

impl<T: Tag + RangeIndex> StepTask for RangePutTask<T> {
    fn run(&self) -> StepResult {
        if self.range.is_divisible() {
            let (low, high) = self.range.split();
            spawn_range_put(&self.collection, low);
            spawn_range_put(&self.collection, high);
        } else {
            for tag in self.range.iter() {
                self.collection.put(tag);
            }
        }
        Ok(())
    }

    fn collection(&self) -> usize {
        self.collection.id
    }

    fn describe(&self) -> String {
        format!("{}.put_range({:?})", self.collection.name, self.range)
    }
}

fn spawn_range_put<T: Tag + RangeIndex>(
    collection: &Arc<TagCollectionImpl<T>>,
    range: BlockedRange<T>,
) {
    let id = collection.ctx.steps.allocate_id();
    let task = RangePutTask { collection: collection.clone(), range };
    let instance = StepInstance::new(id, 0, Affinity::Anywhere, Box::new(task));
    collection.ctx.spawn(instance);
}

/// A set of control tags prescribing step-collections.
///
/// Handles are cheap to clone and refer to the same collection.
pub struct TagCollection<T> {
    inner: Arc<TagCollectionImpl<T>>,
}

impl<T> Clone for TagCollection<T> {
    fn clone(&self) -> Self {
        TagCollection { inner: self.inner.clone() }
    }
}

impl<T: Tag> TagCollection<T> {
    /// A tag-collection with no tuning hints: tags are not stored.
    pub fn new(ctx: &crate::Context, name: &str) -> Self {
        Self::with_tuner(ctx, name, TagTuner::new())
    }

    /// A tag-collection with tuning hints.
    pub fn with_tuner(ctx: &crate::Context, name: &str, tuner: TagTuner<T>) -> Self {
        let ctx = ctx.inner();
        let id = ctx.register_collection_name(name, CollectionKind::Tag);
        let memo = tuner.memoize.then(|| Mutex::new(FnvHashSet::default()));
        let inner = Arc::new(TagCollectionImpl {
            ctx: ctx.clone(),
            id,
            name: name.to_owned(),
            tuner,
            prescribed: Mutex::new(Vec::new()),
            memo,
            callbacks: Mutex::new(Vec::new()),
        });
        ctx.register_resettable(id, &(inner.clone() as Arc<dyn CollectionBase>));
        TagCollection { inner }
    }

    /// The name given at construction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Declare that every tag put here prescribes one instance in `steps`.
    ///
    /// Intended for the wiring phase, before any tag is put.
    pub fn prescribes(&self, steps: &StepCollection<T>) {
        self.inner.prescribed.lock().push(Arc::new(steps.inner.clone()));
    }

    /// Put one tag, prescribing each controlled step-collection.
    ///
    /// On a memoizing collection a duplicate tag is a no-op.
    pub fn put(&self, tag: T) {
        self.inner.put(tag);
    }

    /// Put every tag of `range`, splitting the work across the pool.
    pub fn put_range(&self, range: BlockedRange<T>)
    where
        T: RangeIndex,
    {
        if range.is_empty() {
            return;
        }
        let range = match self.inner.tuner.grain {
            Some(grain) => range.with_grain(grain),
            None => {
                let threads = self.inner.ctx.runtime.settings().threads.max(1);
                range.with_grain((range.len() / (4 * threads)).max(1))
            }
        };
        spawn_range_put(&self.inner, range);
    }

    /// Clone out the stored tags. Requires a quiescent context; empty unless memoizing.
    pub fn iterate(&self) -> Result<Vec<T>, Fatal> {
        self.inner.ctx.require_quiescent()?;
        Ok(match &self.inner.memo {
            Some(memo) => memo.lock().iter().cloned().collect(),
            None => Vec::new(),
        })
    }

    /// The number of stored tags; zero unless memoizing.
    pub fn size(&self) -> usize {
        self.inner.memo.as_ref().map_or(0, |memo| memo.lock().len())
    }

    /// True if no tag is stored.
    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    /// Register a blocking callback invoked after every non-memoized put.
    pub fn on_put(&self, callback: impl Fn(&T) + Send + Sync + 'static) {
        self.inner.callbacks.lock().push(Arc::new(callback));
    }

    /// Remove every stored tag. Requires a quiescent context.
    pub fn unsafe_reset(&self) -> Result<(), Fatal> {
        self.inner.ctx.require_quiescent()?;
        self.inner.reset_unchecked();
        Ok(())
    }
}
