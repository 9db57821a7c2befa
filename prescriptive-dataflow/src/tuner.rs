//! Tuners: optional, per-collection hints that shape execution without changing semantics.
//!
//! A tuner is a struct of optional closures; the runtime checks for presence and falls
//! back to a default when a hint is absent. Hints never affect the values a program
//! computes, only how (and where) the computation runs and when item memory is reclaimed.
//!
//! Unlike the distilled interface sketch, closures here close over whatever context they
//! need instead of receiving an explicit context argument.

use std::sync::Arc;

use crate::dist::{ItemCodec, TagCodec};
use crate::suspend::DependencyConsumer;

/// The number of reads an item slot serves before reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetCount {
    /// Reclamation disabled; the slot lives until the collection is reset or dropped.
    Unlimited,
    /// Exactly this many reads, after which the slot is erased.
    Finite(usize),
}

impl GetCount {
    /// The internal signed representation; negative means unlimited.
    pub(crate) fn remaining(self) -> isize {
        match self {
            GetCount::Unlimited => -1,
            GetCount::Finite(n) => n as isize,
        }
    }
}

/// A dispatch hint naming the worker a step instance should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// No preference; the instance goes to the submitter's queue.
    Anywhere,
    /// Prefer the worker with this index, taken modulo the worker count.
    Worker(usize),
}

/// A distribution hint naming the process a step instance should execute on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeOn {
    /// Execute on the putting process.
    Local,
    /// Execute on the process with this rank.
    Rank(usize),
}

/// A distribution hint naming the processes that will read an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumedOn {
    /// Only the producing process.
    Local,
    /// Every process.
    All,
    /// Exactly these ranks.
    Ranks(Vec<usize>),
}

/// Conversion between tags and dense indices, for the vector-backed item store.
///
/// Tags of a dense collection must map to small non-negative integers bounded by the
/// maximum declared via `set_max`.
pub trait DenseTag: Sized {
    /// The index this tag denotes.
    fn dense_index(&self) -> usize;
    /// The tag denoting `index`; inverse of [`DenseTag::dense_index`].
    fn from_dense_index(index: usize) -> Self;
}

macro_rules! implement_dense_tag_unsigned {
    ($($index_type:ty)*) => {$(
        impl DenseTag for $index_type {
            fn dense_index(&self) -> usize { *self as usize }
            fn from_dense_index(index: usize) -> Self { index as $index_type }
        }
    )*};
}

macro_rules! implement_dense_tag_signed {
    ($($index_type:ty)*) => {$(
        impl DenseTag for $index_type {
            fn dense_index(&self) -> usize {
                assert!(*self >= 0, "dense tags must be non-negative");
                *self as usize
            }
            fn from_dense_index(index: usize) -> Self { index as $index_type }
        }
    )*};
}

implement_dense_tag_unsigned! { u8 u16 u32 u64 usize }
implement_dense_tag_signed! { i8 i16 i32 i64 isize }

/// The tag/index conversion captured from a [`DenseTag`] implementation.
pub(crate) struct DenseMapper<T> {
    pub(crate) to_index: Arc<dyn Fn(&T) -> usize + Send + Sync>,
    pub(crate) from_index: Arc<dyn Fn(usize) -> T + Send + Sync>,
    pub(crate) max: usize,
}

impl<T> Clone for DenseMapper<T> {
    fn clone(&self) -> Self {
        DenseMapper {
            to_index: self.to_index.clone(),
            from_index: self.from_index.clone(),
            max: self.max,
        }
    }
}

/// Tuning hints for an item-collection.
pub struct ItemTuner<T, V> {
    pub(crate) get_count: Option<Arc<dyn Fn(&T) -> GetCount + Send + Sync>>,
    pub(crate) equal: Option<Arc<dyn Fn(&V, &V) -> bool + Send + Sync>>,
    pub(crate) dense: Option<DenseMapper<T>>,
    pub(crate) consumed_on: Option<Arc<dyn Fn(&T) -> ConsumedOn + Send + Sync>>,
    pub(crate) codec: Option<ItemCodec<T, V>>,
}

impl<T, V> Default for ItemTuner<T, V> {
    fn default() -> Self {
        ItemTuner { get_count: None, equal: None, dense: None, consumed_on: None, codec: None }
    }
}

impl<T, V> Clone for ItemTuner<T, V> {
    fn clone(&self) -> Self {
        ItemTuner {
            get_count: self.get_count.clone(),
            equal: self.equal.clone(),
            dense: self.dense.clone(),
            consumed_on: self.consumed_on.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<T, V> ItemTuner<T, V> {
    /// A tuner with no hints: hash-backed store, unlimited get-counts, no redefinition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provide the initial get-count per tag. Without this hint every slot is
    /// [`GetCount::Unlimited`] and never reclaimed.
    pub fn get_count(mut self, f: impl Fn(&T) -> GetCount + Send + Sync + 'static) -> Self {
        self.get_count = Some(Arc::new(f));
        self
    }

    /// Opt in to value-level memoization: a re-put whose value `f` judges equal to the
    /// stored one succeeds as a no-op instead of failing.
    pub fn equal(mut self, f: impl Fn(&V, &V) -> bool + Send + Sync + 'static) -> Self {
        self.equal = Some(Arc::new(f));
        self
    }

    /// Back the collection with the dense direct-indexed store, sized for tags whose
    /// index is below `max`. Requires tags convertible to dense indices.
    pub fn dense_store(mut self, max: usize) -> Self
    where
        T: DenseTag + 'static,
    {
        self.dense = Some(DenseMapper {
            to_index: Arc::new(|tag: &T| tag.dense_index()),
            from_index: Arc::new(T::from_dense_index),
            max,
        });
        self
    }

    /// Provide the set of processes that will read each item; consulted by the transport
    /// hooks on put. Without the hint items stay local.
    pub fn consumed_on(mut self, f: impl Fn(&T) -> ConsumedOn + Send + Sync + 'static) -> Self {
        self.consumed_on = Some(Arc::new(f));
        self
    }

    /// Provide the serialization used when items of this collection cross processes.
    pub fn codec(mut self, codec: ItemCodec<T, V>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub(crate) fn initial_count(&self, tag: &T) -> GetCount {
        match &self.get_count {
            Some(f) => f(tag),
            None => GetCount::Unlimited,
        }
    }
}

/// Tuning hints for a step-collection.
pub struct StepTuner<T> {
    pub(crate) priority: Option<Arc<dyn Fn(&T) -> i64 + Send + Sync>>,
    pub(crate) affinity: Option<Arc<dyn Fn(&T) -> Affinity + Send + Sync>>,
    pub(crate) depends: Option<Arc<dyn Fn(&T, &mut DependencyConsumer<'_>) + Send + Sync>>,
    pub(crate) preschedule: bool,
    pub(crate) cancel: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    pub(crate) compute_on: Option<Arc<dyn Fn(&T) -> ComputeOn + Send + Sync>>,
}

impl<T> Default for StepTuner<T> {
    fn default() -> Self {
        StepTuner {
            priority: None,
            affinity: None,
            depends: None,
            preschedule: false,
            cancel: None,
            compute_on: None,
        }
    }
}

impl<T> Clone for StepTuner<T> {
    fn clone(&self) -> Self {
        StepTuner {
            priority: self.priority.clone(),
            affinity: self.affinity.clone(),
            depends: self.depends.clone(),
            preschedule: self.preschedule,
            cancel: self.cancel.clone(),
            compute_on: self.compute_on.clone(),
        }
    }
}

impl<T> StepTuner<T> {
    /// A tuner with no hints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provide a priority per tag; smaller runs earlier when the scheduler orders by
    /// priority. Ties break by insertion order.
    pub fn priority(mut self, f: impl Fn(&T) -> i64 + Send + Sync + 'static) -> Self {
        self.priority = Some(Arc::new(f));
        self
    }

    /// Provide a worker affinity hint per tag; honored by the affinity-aware scheduler.
    pub fn affinity(mut self, f: impl Fn(&T) -> Affinity + Send + Sync + 'static) -> Self {
        self.affinity = Some(Arc::new(f));
        self
    }

    /// Declare the item reads of each instance up front, enabling the pre-execution
    /// dependency pass: the instance parks on every missing declared item at once and its
    /// body only runs when all of them are available.
    pub fn depends(
        mut self,
        f: impl Fn(&T, &mut DependencyConsumer<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.depends = Some(Arc::new(f));
        self.preschedule = true;
        self
    }

    /// Enable or disable the pre-execution pass; implied by [`StepTuner::depends`].
    pub fn preschedule(mut self, on: bool) -> Self {
        self.preschedule = on;
        self
    }

    /// Drop tags at put time: a tag for which `f` returns true prescribes nothing.
    pub fn cancel(mut self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.cancel = Some(Arc::new(f));
        self
    }

    /// Provide the process each instance should execute on; consulted by the transport
    /// hooks at prescription time.
    pub fn compute_on(mut self, f: impl Fn(&T) -> ComputeOn + Send + Sync + 'static) -> Self {
        self.compute_on = Some(Arc::new(f));
        self
    }

    pub(crate) fn wants_preschedule(&self) -> bool {
        self.preschedule && self.depends.is_some()
    }
}

/// Tuning hints for a tag-collection.
pub struct TagTuner<T> {
    pub(crate) memoize: bool,
    pub(crate) grain: Option<usize>,
    pub(crate) codec: Option<TagCodec<T>>,
}

impl<T> Default for TagTuner<T> {
    fn default() -> Self {
        TagTuner { memoize: false, grain: None, codec: None }
    }
}

impl<T> Clone for TagTuner<T> {
    fn clone(&self) -> Self {
        TagTuner { memoize: self.memoize, grain: self.grain, codec: self.codec.clone() }
    }
}

impl<T> TagTuner<T> {
    /// A tuner with no hints: tags are not stored, duplicates prescribe again.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store tags and deduplicate: putting an equal tag twice prescribes exactly once.
    /// Also enables iteration over the collection.
    pub fn memoize(mut self, on: bool) -> Self {
        self.memoize = on;
        self
    }

    /// The smallest sub-range `put_range` hands to one internal task; ranges above this
    /// size are split and distributed in parallel.
    pub fn range_grain(mut self, grain: usize) -> Self {
        self.grain = Some(grain.max(1));
        self
    }

    /// Provide the serialization used when tags of this collection cross processes.
    pub fn codec(mut self, codec: TagCodec<T>) -> Self {
        self.codec = Some(codec);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_count_representation() {
        assert_eq!(GetCount::Unlimited.remaining(), -1);
        assert_eq!(GetCount::Finite(2).remaining(), 2);
        assert_eq!(GetCount::Finite(0).remaining(), 0);
    }

    #[test]
    fn dense_tags_round_trip() {
        assert_eq!(7u32.dense_index(), 7);
        assert_eq!(i64::from_dense_index(9), 9);
        assert_eq!(usize::from_dense_index(0).dense_index(), 0);
    }

    #[test]
    fn depends_implies_preschedule() {
        let tuner = StepTuner::new().depends(|_tag: &u32, _deps| {});
        assert!(tuner.wants_preschedule());
        let tuner = tuner.preschedule(false);
        assert!(!tuner.wants_preschedule());
    }
}
