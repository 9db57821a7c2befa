//! Item-collections: tag-addressed, write-once value stores with reclamation by get-count.
//!
//! An item slot moves `Empty → Present → Erased` and never back. A put is the sole writer
//! of the first transition and hands any parked readers to the resume path; reads decrement
//! the slot's remaining read budget, and the read that spends the last unit performs the
//! second transition, reclaiming the value. Reads issued from inside a step are charged
//! when the step commits, so a step that suspends midway and re-executes does not spend its
//! budget twice.

pub(crate) mod table;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{CollectionBase, ContextInner};
use crate::dist;
use crate::error::{Fatal, GetError, PutError};
use crate::logging::{CollectionKind, ItemEvent, ItemEventKind, StatCounters};
use crate::schedule;
use crate::step::StepInstance;
use crate::suspend::{MissState, Waiter};
use crate::tuner::ItemTuner;
use crate::{Data, Tag};

use self::table::{ItemTable, SlotState};

/// What a put did to the slot.
enum PutOutcome {
    Stored(crate::suspend::WaiterList),
    Duplicate,
    Collision,
}

/// What a read found in the slot.
enum ReadOutcome<V> {
    Hit(V),
    HitErased(V),
    Miss,
    Gone,
}

type ItemCallback<T, V> = Arc<dyn Fn(&T, &V) + Send + Sync>;

pub(crate) struct ItemCollectionImpl<T, V> {
    ctx: Arc<ContextInner>,
    id: usize,
    name: String,
    tuner: ItemTuner<T, V>,
    table: ItemTable<T, V>,
    present: AtomicUsize,
    callbacks: Mutex<Vec<ItemCallback<T, V>>>,
}

impl<T: Tag, V: Data> ItemCollectionImpl<T, V> {
    fn describe_item(&self, tag: &T) -> String {
        format!("{}({:?})", self.name, tag)
    }

    fn put(&self, tag: T, value: V) -> Result<(), PutError> {
        self.ctx.begin_operation();
        let result = self.put_inner(tag, value);
        self.ctx.end_operation();
        result
    }

    fn put_inner(&self, tag: T, value: V) -> Result<(), PutError> {
        let remaining = self.tuner.initial_count(&tag).remaining();
        let callbacks: Vec<ItemCallback<T, V>> = self.callbacks.lock().clone();
        let remote = dist::remote_ranks(
            &self.ctx,
            self.tuner.consumed_on.as_ref().map(|f| f(&tag)),
        );
        // The value moves into the slot; clone it up front only if someone else needs it.
        let copy = if callbacks.is_empty() && remote.is_none() { None } else { Some(value.clone()) };

        let equal = self.tuner.equal.clone();
        let outcome = self.table.with_slot(&tag, move |slot| match slot {
            SlotState::Empty { waiters } => {
                let waiters = std::mem::take(waiters);
                *slot = SlotState::Present { value, remaining };
                PutOutcome::Stored(waiters)
            }
            SlotState::Present { value: existing, .. } => {
                match &equal {
                    Some(equal) if equal(existing, &value) => PutOutcome::Duplicate,
                    _ => PutOutcome::Collision,
                }
            }
            SlotState::Erased => PutOutcome::Collision,
        });

        let waiters = match outcome {
            PutOutcome::Collision => {
                return Err(PutError::AlreadyPresent(self.describe_item(&tag)))
            }
            PutOutcome::Duplicate => return Ok(()),
            PutOutcome::Stored(waiters) => waiters,
        };

        self.present.fetch_add(1, Ordering::Relaxed);
        StatCounters::bump(&self.ctx.stats.items_put);
        self.ctx.logger.log(ItemEvent {
            collection: self.id,
            kind: ItemEventKind::Put { resumed: waiters.len() },
        });

        // A zero read budget means the value can never be read; reclaim it right away.
        // Parked readers are still woken and will observe the erased slot.
        if remaining == 0 {
            self.erase(&tag);
        }

        for waiter in waiters {
            crate::suspend::resume_waiter(&self.ctx, waiter);
        }

        if let Some(copy) = &copy {
            for callback in &callbacks {
                callback(&tag, copy);
            }
            if let Some(ranks) = remote {
                dist::send_item(&self.ctx, self.id, &self.tuner.codec, &tag, copy, &ranks);
            }
        }
        Ok(())
    }

    fn get(this: &Arc<Self>, tag: &T) -> Result<V, GetError> {
        let current = schedule::current_step_for(&this.ctx);
        let env_read = current.is_none();
        let outcome = this.table.with_slot(tag, |slot| match slot {
            SlotState::Present { value, remaining } => {
                let value = value.clone();
                if env_read && *remaining > 0 {
                    *remaining -= 1;
                    if *remaining == 0 {
                        *slot = SlotState::Erased;
                        return ReadOutcome::HitErased(value);
                    }
                }
                ReadOutcome::Hit(value)
            }
            SlotState::Empty { waiters } => {
                if let Some(instance) = &current {
                    waiters.push(Waiter {
                        step: instance.id,
                        generation: instance.generation.load(Ordering::SeqCst),
                    });
                    instance.note_registration();
                }
                ReadOutcome::Miss
            }
            SlotState::Erased => ReadOutcome::Gone,
        });
        Self::conclude_read(this, tag, current, outcome)
    }

    fn try_get(this: &Arc<Self>, tag: &T) -> Option<V> {
        let current = schedule::current_step_for(&this.ctx);
        let env_read = current.is_none();
        let outcome = this.table.probe(tag, |slot| match slot {
            Some(state) => match state {
                SlotState::Present { value, remaining } => {
                    let value = value.clone();
                    if env_read && *remaining > 0 {
                        *remaining -= 1;
                        if *remaining == 0 {
                            *state = SlotState::Erased;
                            return ReadOutcome::HitErased(value);
                        }
                    }
                    ReadOutcome::Hit(value)
                }
                SlotState::Erased => ReadOutcome::Gone,
                SlotState::Empty { .. } => ReadOutcome::Miss,
            },
            None => ReadOutcome::Miss,
        });
        match outcome {
            ReadOutcome::HitErased(value) => {
                StatCounters::bump(&this.ctx.stats.items_got);
                this.ctx.logger.log(ItemEvent { collection: this.id, kind: ItemEventKind::Got });
                this.note_erased();
                Some(value)
            }
            ReadOutcome::Hit(value) => {
                StatCounters::bump(&this.ctx.stats.items_got);
                this.ctx.logger.log(ItemEvent { collection: this.id, kind: ItemEventKind::Got });
                if let Some(instance) = &current {
                    Self::defer_commit(this, instance, tag);
                }
                Some(value)
            }
            ReadOutcome::Miss => {
                if let Some(instance) = &current {
                    let target = this.clone();
                    let tag = tag.clone();
                    instance
                        .record_miss(Box::new(move |instance| target.resolve_miss(&tag, instance)));
                }
                None
            }
            ReadOutcome::Gone => {
                if let Some(instance) = &current {
                    let what = this.describe_item(tag);
                    instance.record_miss(Box::new(move |_| MissState::Gone(what)));
                }
                None
            }
        }
    }

    fn conclude_read(
        this: &Arc<Self>,
        tag: &T,
        current: Option<Arc<StepInstance>>,
        outcome: ReadOutcome<V>,
    ) -> Result<V, GetError> {
        match outcome {
            ReadOutcome::Hit(value) => {
                StatCounters::bump(&this.ctx.stats.items_got);
                this.ctx.logger.log(ItemEvent { collection: this.id, kind: ItemEventKind::Got });
                if let Some(instance) = &current {
                    Self::defer_commit(this, instance, tag);
                }
                Ok(value)
            }
            ReadOutcome::HitErased(value) => {
                StatCounters::bump(&this.ctx.stats.items_got);
                this.ctx.logger.log(ItemEvent { collection: this.id, kind: ItemEventKind::Got });
                this.note_erased();
                Ok(value)
            }
            ReadOutcome::Miss => Err(GetError::NotReady),
            ReadOutcome::Gone => Err(GetError::Gone(this.describe_item(tag))),
        }
    }

    /// Charge this read to the instance's commit, not to the read itself.
    fn defer_commit(this: &Arc<Self>, instance: &Arc<StepInstance>, tag: &T) {
        let target = this.clone();
        let tag = tag.clone();
        instance.record_access(Box::new(move || target.commit_get(&tag)));
    }

    /// Spend one unit of the slot's read budget; the last unit erases the slot.
    fn commit_get(&self, tag: &T) {
        let erased = self.table.probe(tag, |slot| {
            if let Some(state) = slot {
                if let SlotState::Present { remaining, .. } = state {
                    if *remaining > 0 {
                        *remaining -= 1;
                        if *remaining == 0 {
                            *state = SlotState::Erased;
                            return true;
                        }
                    }
                }
            }
            false
        });
        if erased {
            self.note_erased();
        }
    }

    fn erase(&self, tag: &T) {
        let erased = self.table.probe(tag, |slot| {
            if let Some(state) = slot {
                if matches!(state, SlotState::Present { .. }) {
                    *state = SlotState::Erased;
                    return true;
                }
            }
            false
        });
        if erased {
            self.note_erased();
        }
    }

    fn note_erased(&self) {
        self.present.fetch_sub(1, Ordering::Relaxed);
        StatCounters::bump(&self.ctx.stats.items_erased);
        self.ctx.logger.log(ItemEvent { collection: self.id, kind: ItemEventKind::Erased });
    }

    /// Park `instance` on `tag` if the item is not yet available. Used by the
    /// pre-execution dependency pass; does not spend read budget.
    fn register_dependency(&self, instance: &Arc<StepInstance>, tag: &T) {
        self.table.with_slot(tag, |slot| match slot {
            SlotState::Empty { waiters } => {
                waiters.push(Waiter {
                    step: instance.id,
                    generation: instance.generation.load(Ordering::SeqCst),
                });
                instance.note_registration();
            }
            // An erased dependency is a user bug; the body's read will report it.
            SlotState::Present { .. } | SlotState::Erased => {}
        });
    }

    /// Re-examine a read that missed under `try_get`; called by `flush_gets`.
    fn resolve_miss(&self, tag: &T, instance: &Arc<StepInstance>) -> MissState {
        self.table.with_slot(tag, |slot| match slot {
            SlotState::Present { .. } => MissState::NowPresent,
            SlotState::Empty { waiters } => {
                waiters.push(Waiter {
                    step: instance.id,
                    generation: instance.generation.load(Ordering::SeqCst),
                });
                instance.note_registration();
                MissState::Registered
            }
            SlotState::Erased => MissState::Gone(self.describe_item(tag)),
        })
    }
}

impl<T: Tag, V: Data> CollectionBase for ItemCollectionImpl<T, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset_unchecked(&self) {
        self.table.clear();
        self.present.store(0, Ordering::Relaxed);
    }

    fn deliver(self: Arc<Self>, payload: &[u8]) {
        let Some(codec) = &self.tuner.codec else {
            log::warn!("item message for '{}' dropped: no codec", self.name);
            return;
        };
        match (codec.decode)(payload) {
            Some((tag, value)) => {
                if let Err(error) = self.put(tag, value) {
                    log::warn!("remote put into '{}' failed: {}", self.name, error);
                }
            }
            None => log::warn!("undecodable item message for '{}'", self.name),
        }
    }
}

/// A mapping from tags to items, shared by producers and consumers.
///
/// Handles are cheap to clone and refer to the same collection. The runtime copies values
/// out on `get`; a stored value is immutable until reclaimed.
pub struct ItemCollection<T, V> {
    inner: Arc<ItemCollectionImpl<T, V>>,
}

impl<T, V> Clone for ItemCollection<T, V> {
    fn clone(&self) -> Self {
        ItemCollection { inner: self.inner.clone() }
    }
}

impl<T: Tag, V: Data> ItemCollection<T, V> {
    /// An item-collection with the hash-backed store and no tuning hints.
    pub fn new(ctx: &crate::Context, name: &str) -> Self {
        Self::with_tuner(ctx, name, ItemTuner::new())
    }

    /// An item-collection with tuning hints; the tuner also selects the store backend.
    pub fn with_tuner(ctx: &crate::Context, name: &str, tuner: ItemTuner<T, V>) -> Self {
        let ctx = ctx.inner();
        let id = ctx.register_collection_name(name, CollectionKind::Item);
        let table = match &tuner.dense {
            Some(mapper) => ItemTable::dense(mapper.clone()),
            None => ItemTable::hashed(),
        };
        let inner = Arc::new(ItemCollectionImpl {
            ctx: ctx.clone(),
            id,
            name: name.to_owned(),
            tuner,
            table,
            present: AtomicUsize::new(0),
            callbacks: Mutex::new(Vec::new()),
        });
        ctx.register_resettable(id, &(inner.clone() as Arc<dyn CollectionBase>));
        ItemCollection { inner }
    }

    /// The name given at construction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Store `value` under `tag` and wake every step parked on the slot.
    ///
    /// Fails with [`PutError::AlreadyPresent`] if the slot already holds a value, unless
    /// the tuner's equality predicate judges the values equal, in which case the put is a
    /// no-op.
    pub fn put(&self, tag: T, value: V) -> Result<(), PutError> {
        self.inner.put(tag, value)
    }

    /// Read the item stored under `tag`.
    ///
    /// Inside a step, a missing item registers the step on the slot and returns
    /// [`GetError::NotReady`], which the body is expected to propagate so the scheduler
    /// can suspend it. Outside any step the error is simply returned.
    pub fn get(&self, tag: &T) -> Result<V, GetError> {
        ItemCollectionImpl::get(&self.inner, tag)
    }

    /// Read the item stored under `tag` without ever parking the caller.
    ///
    /// Inside a step, misses are remembered: a later [`flush_gets`](crate::flush_gets)
    /// suspends the step until every missed item has been produced. Reading a value and
    /// then branching on a miss can make results schedule-dependent; batch `try_get`s and
    /// `flush_gets` before acting on the values.
    pub fn try_get(&self, tag: &T) -> Option<V> {
        ItemCollectionImpl::try_get(&self.inner, tag)
    }

    /// Clone out every stored item. Requires a quiescent context.
    pub fn iterate(&self) -> Result<Vec<(T, V)>, Fatal> {
        self.inner.ctx.require_quiescent()?;
        Ok(self.inner.table.snapshot())
    }

    /// The number of items currently stored.
    pub fn size(&self) -> usize {
        self.inner.present.load(Ordering::Relaxed)
    }

    /// True if no item is currently stored.
    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    /// Register a blocking callback invoked after every successful put.
    pub fn on_put(&self, callback: impl Fn(&T, &V) + Send + Sync + 'static) {
        self.inner.callbacks.lock().push(Arc::new(callback));
    }

    /// Declare the largest dense index in use. Only meaningful for the dense store.
    pub fn set_max(&self, max: usize) {
        self.inner.table.set_max(max);
    }

    /// Remove every stored item. Requires a quiescent context.
    pub fn unsafe_reset(&self) -> Result<(), Fatal> {
        self.inner.ctx.require_quiescent()?;
        self.inner.reset_unchecked();
        Ok(())
    }

    pub(crate) fn register_dependency(&self, instance: &Arc<StepInstance>, tag: &T) {
        self.inner.register_dependency(instance, tag);
    }
}
