//! Prescriptive dataflow is a coordination runtime for programs expressed as a graph of
//! step-, item-, and tag-collections.
//!
//! A step-collection is a template for a unit of user computation. Putting a tag into a
//! tag-collection *prescribes* one step instance per step-collection the tag-collection
//! controls; instances are scheduled onto a pool of worker threads without any user-specified
//! ordering. A running step reads items by tag from item-collections with `get`, and produces
//! items with `put` or further tags with a tag put. A `get` whose item has not yet been
//! produced suspends the step; the step is parked on the item slot and automatically
//! rescheduled once a producer puts the item. Item slots carry a get-count and are reclaimed
//! after their last read. A call to [`Context::wait`] returns exactly when all transitively
//! implied work has completed.
//!
//! Because steps only communicate through collections, the values computed by a program are
//! deterministic even though the schedule is not: any interleaving of ready steps produces
//! the same items.
//!
//! # Examples
//!
//! Computing Fibonacci numbers, with one step instance per index and reclamation after the
//! two downstream reads:
//!
//! ```
//! use prescriptive_dataflow::{Context, GetCount, ItemCollection, ItemTuner, Runtime};
//! use prescriptive_dataflow::{StepCollection, StepResult, TagCollection};
//!
//! let runtime = Runtime::fixed(2);
//! let ctx = Context::new(&runtime);
//!
//! let tuner = ItemTuner::new()
//!     .get_count(|&tag: &u64| if tag > 0 { GetCount::Finite(2) } else { GetCount::Finite(1) });
//! let fibs: ItemCollection<u64, u64> = ItemCollection::with_tuner(&ctx, "fibs", tuner);
//! let tags: TagCollection<u64> = TagCollection::new(&ctx, "tags");
//!
//! let steps = {
//!     let fibs = fibs.clone();
//!     StepCollection::new(&ctx, "fib_step", move |&tag: &u64| -> StepResult {
//!         match tag {
//!             0 => fibs.put(0, 0)?,
//!             1 => fibs.put(1, 1)?,
//!             _ => {
//!                 let f1 = fibs.get(&(tag - 1))?;
//!                 let f2 = fibs.get(&(tag - 2))?;
//!                 fibs.put(tag, f1 + f2)?;
//!             }
//!         }
//!         Ok(())
//!     })
//! };
//! tags.prescribes(&steps);
//!
//! for i in 0..=10 { tags.put(i); }
//! ctx.wait().unwrap();
//! assert_eq!(fibs.try_get(&10), Some(55));
//! ```
//!
//! The runtime makes no guarantee about scheduling order; priorities, affinities, and the
//! scheduler variant itself are tuning hints (see [`StepTuner`] and [`Settings`]), never
//! correctness requirements.

#![forbid(missing_docs)]

use std::fmt::Debug;
use std::hash::Hash;

pub mod context;
pub mod dist;
pub mod error;
pub mod item;
pub mod logging;
pub mod parallel_for;
pub mod range;
pub mod runtime;
pub mod schedule;
pub mod step;
pub mod suspend;
pub mod tag;
pub mod tuner;

pub use context::Context;
pub use error::{Fatal, GetError, PutError, StepError};
pub use item::ItemCollection;
pub use logging::Statistics;
pub use parallel_for::{parallel_for, parallel_for_in, PforTuner};
pub use range::{BlockedRange, RangeIndex};
pub use runtime::{Runtime, SchedulerKind, Settings};
pub use schedule::flush_gets;
pub use step::{StepCollection, StepId};
pub use suspend::DependencyConsumer;
pub use tag::TagCollection;
pub use tuner::{Affinity, ComputeOn, ConsumedOn, DenseTag, GetCount, ItemTuner, StepTuner, TagTuner};

/// The result a step body reports back to the scheduler.
///
/// `Ok(())` commits the step; [`StepError::NotReady`] suspends it; any other error aborts
/// the surrounding context. Step bodies normally produce this type implicitly, by
/// propagating `get` and `put` results with the `?` operator.
pub type StepResult = Result<(), StepError>;

/// A composite trait for types usable as tags.
///
/// Tags identify step instances and items. They must be hashable, comparable, cheap to
/// clone, and safe to move between worker threads. The trait is implemented automatically
/// for every type with the required bounds; it exists only to keep signatures short.
pub trait Tag: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> Tag for T {}

/// A composite trait for types usable as item values.
///
/// The runtime treats values as opaque: it clones them into consumers on `get` and drops
/// them on reclamation, but never inspects or mutates them after publication.
pub trait Data: Clone + Send + Sync + 'static {}
impl<V: Clone + Send + Sync + 'static> Data for V {}
