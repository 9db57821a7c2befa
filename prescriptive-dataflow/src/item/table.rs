//! The two interchangeable slot stores backing an item-collection.
//!
//! Both stores map tags to slots; they differ in how the map is laid out. The hash store
//! shards a hash map by tag hash and works for any tag. The dense store indexes a vector
//! directly and requires tags convertible to small non-negative integers, with the bound
//! declared up front via `set_max`.

use std::hash::Hasher;

use fnv::FnvHasher;
use parking_lot::{Mutex, RwLock};

use crate::suspend::WaiterList;
use crate::tuner::DenseMapper;
use crate::Tag;

/// The state machine of one item slot.
///
/// `Empty` may hold parked readers; `Present` holds the value and the remaining read
/// budget (negative for unlimited); `Erased` is terminal.
pub(crate) enum SlotState<V> {
    Empty { waiters: WaiterList },
    Present { value: V, remaining: isize },
    Erased,
}

impl<V> SlotState<V> {
    pub(crate) fn new_empty() -> Self {
        SlotState::Empty { waiters: WaiterList::new() }
    }
}

const HASH_SHARDS: usize = 64;

/// A store sharded by tag hash.
pub(crate) struct HashItemTable<T, V> {
    shards: Box<[Mutex<fnv::FnvHashMap<T, SlotState<V>>>]>,
}

impl<T: Tag, V> HashItemTable<T, V> {
    fn new() -> Self {
        let shards = (0..HASH_SHARDS).map(|_| Mutex::new(fnv::FnvHashMap::default())).collect();
        HashItemTable { shards }
    }

    fn shard(&self, tag: &T) -> &Mutex<fnv::FnvHashMap<T, SlotState<V>>> {
        let mut hasher = FnvHasher::default();
        tag.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (HASH_SHARDS - 1)]
    }
}

/// A store indexing a vector by the tag's dense index.
pub(crate) struct VecItemTable<T, V> {
    mapper: DenseMapper<T>,
    slots: RwLock<Vec<Mutex<SlotState<V>>>>,
}

impl<T: Tag, V> VecItemTable<T, V> {
    fn new(mapper: DenseMapper<T>) -> Self {
        let max = mapper.max;
        let table = VecItemTable { mapper, slots: RwLock::new(Vec::new()) };
        table.ensure(max);
        table
    }

    /// Grow the vector so indices below `len` are addressable.
    fn ensure(&self, len: usize) {
        let mut slots = self.slots.write();
        if slots.len() < len {
            slots.resize_with(len, || Mutex::new(SlotState::new_empty()));
        }
    }
}

/// An item-collection's slot store; the variant is fixed at construction by the tuner.
pub(crate) enum ItemTable<T, V> {
    Hash(HashItemTable<T, V>),
    Dense(VecItemTable<T, V>),
}

impl<T: Tag, V> ItemTable<T, V> {
    pub(crate) fn hashed() -> Self {
        ItemTable::Hash(HashItemTable::new())
    }

    pub(crate) fn dense(mapper: DenseMapper<T>) -> Self {
        ItemTable::Dense(VecItemTable::new(mapper))
    }

    /// Run `f` on the slot for `tag`, creating it in `Empty` if absent. Slot creation on
    /// the read path is deliberate: a reader may park on a slot no producer has touched.
    pub(crate) fn with_slot<R>(&self, tag: &T, f: impl FnOnce(&mut SlotState<V>) -> R) -> R {
        match self {
            ItemTable::Hash(table) => {
                let mut shard = table.shard(tag).lock();
                let slot = shard.entry(tag.clone()).or_insert_with(SlotState::new_empty);
                f(slot)
            }
            ItemTable::Dense(table) => {
                let index = (table.mapper.to_index)(tag);
                {
                    let slots = table.slots.read();
                    if index < slots.len() {
                        return f(&mut *slots[index].lock());
                    }
                }
                table.ensure(index + 1);
                let slots = table.slots.read();
                let mut guard = slots[index].lock();
                f(&mut *guard)
            }
        }
    }

    /// Run `f` on the slot for `tag` without creating one.
    pub(crate) fn probe<R>(&self, tag: &T, f: impl FnOnce(Option<&mut SlotState<V>>) -> R) -> R {
        match self {
            ItemTable::Hash(table) => {
                let mut shard = table.shard(tag).lock();
                f(shard.get_mut(tag))
            }
            ItemTable::Dense(table) => {
                let slots = table.slots.read();
                match slots.get(index_of(table, tag)) {
                    Some(slot) => f(Some(&mut *slot.lock())),
                    None => f(None),
                }
            }
        }
    }

    /// Clone out every present entry. Only meaningful in a quiescent context; the caller
    /// enforces that through the wait barrier.
    pub(crate) fn snapshot(&self) -> Vec<(T, V)>
    where
        V: Clone,
    {
        let mut out = Vec::new();
        match self {
            ItemTable::Hash(table) => {
                for shard in table.shards.iter() {
                    for (tag, slot) in shard.lock().iter() {
                        if let SlotState::Present { value, .. } = slot {
                            out.push((tag.clone(), value.clone()));
                        }
                    }
                }
            }
            ItemTable::Dense(table) => {
                for (index, slot) in table.slots.read().iter().enumerate() {
                    if let SlotState::Present { value, .. } = &*slot.lock() {
                        out.push(((table.mapper.from_index)(index), value.clone()));
                    }
                }
            }
        }
        out
    }

    /// Drop every slot, waiters included. Only legal in a quiescent context.
    pub(crate) fn clear(&self) {
        match self {
            ItemTable::Hash(table) => {
                for shard in table.shards.iter() {
                    shard.lock().clear();
                }
            }
            ItemTable::Dense(table) => {
                for slot in table.slots.read().iter() {
                    *slot.lock() = SlotState::new_empty();
                }
            }
        }
    }

    /// Declare the largest dense index in use; ignored (with a note) by the hash store.
    pub(crate) fn set_max(&self, max: usize) {
        match self {
            ItemTable::Hash(_) => log::warn!("set_max is only meaningful for dense stores"),
            ItemTable::Dense(table) => table.ensure(max),
        }
    }
}

fn index_of<T: Tag, V>(table: &VecItemTable<T, V>, tag: &T) -> usize {
    (table.mapper.to_index)(tag)
}
