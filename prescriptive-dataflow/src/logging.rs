//! Loggers and logging events for the runtime.
//!
//! Events are typed and cheap to construct; a [`Logger`] either forwards them to a sink
//! registered on the [`Runtime`](crate::Runtime) or drops them without allocation. Events
//! reference collections and step instances by numeric identifier; a
//! [`CollectionEvent`] announces the identifier-to-name binding when a collection is
//! registered, so a sink can resolve names without every event carrying a string.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The sink signature accepted by [`Logger::new`].
pub type LogSink = dyn Fn(&RuntimeEvent) + Send + Sync;

/// A cheaply cloneable handle that forwards runtime events to a registered sink.
#[derive(Clone, Default)]
pub struct Logger {
    sink: Option<Arc<LogSink>>,
}

impl Logger {
    /// A logger forwarding to `sink`.
    pub fn new(sink: Arc<LogSink>) -> Self {
        Logger { sink: Some(sink) }
    }

    /// A logger that drops every event.
    pub fn disabled() -> Self {
        Logger { sink: None }
    }

    /// True if a sink is attached; callers may use this to skip building expensive events.
    pub fn enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Forward one event to the sink, if any.
    pub fn log<E: Into<RuntimeEvent>>(&self, event: E) {
        if let Some(sink) = &self.sink {
            sink(&event.into());
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").field("enabled", &self.enabled()).finish()
    }
}

/// Possible different runtime events.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    /// A collection was registered with a context.
    Collection(CollectionEvent),
    /// A step instance changed state.
    Step(StepEvent),
    /// An item slot changed state.
    Item(ItemEvent),
    /// A tag was put.
    Tag(TagEvent),
    /// A scheduler worker changed state.
    Schedule(ScheduleEvent),
}

/// Announces the binding of a collection identifier to its user-visible name.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct CollectionEvent {
    /// Collection identifier, unique within the context.
    pub collection: usize,
    /// The name given at construction.
    pub name: String,
    /// What kind of collection was registered.
    pub kind: CollectionKind,
}

/// The kinds of collection a context can own.
#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub enum CollectionKind {
    /// A step-collection.
    Step,
    /// An item-collection.
    Item,
    /// A tag-collection.
    Tag,
}

impl From<CollectionEvent> for RuntimeEvent {
    fn from(e: CollectionEvent) -> Self { RuntimeEvent::Collection(e) }
}

/// A state change in the lifecycle of one step instance.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    /// Step instance identifier.
    pub step: u64,
    /// Which transition occurred.
    pub kind: StepEventKind,
}

/// The step instance transitions worth observing.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub enum StepEventKind {
    /// Instance created by a tag put; carries the owning step-collection.
    Prescribed {
        /// The step-collection the instance belongs to.
        collection: usize,
    },
    /// Instance popped by a worker and about to execute.
    Started,
    /// Instance parked on missing items; carries the number of unsatisfied reads.
    Suspended {
        /// Unsatisfied dependency count at the time of parking.
        pending: usize,
    },
    /// Instance re-queued after its last missing item arrived.
    Resumed,
    /// Instance committed.
    Finished,
    /// Instance dropped by a cancellation predicate or a failing context.
    Cancelled,
    /// Instance aborted the context.
    Failed,
}

impl From<StepEvent> for RuntimeEvent {
    fn from(e: StepEvent) -> Self { RuntimeEvent::Step(e) }
}

/// A state change on an item slot.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct ItemEvent {
    /// Owning item-collection identifier.
    pub collection: usize,
    /// Which transition occurred.
    pub kind: ItemEventKind,
}

/// The item slot transitions worth observing.
#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub enum ItemEventKind {
    /// A value was stored; carries the number of waiters handed to the resume path.
    Put {
        /// Waiters transferred by the empty-to-present transition.
        resumed: usize,
    },
    /// A value was read successfully.
    Got,
    /// A slot was reclaimed after its last read.
    Erased,
}

impl From<ItemEvent> for RuntimeEvent {
    fn from(e: ItemEvent) -> Self { RuntimeEvent::Item(e) }
}

/// A tag put, with the prescription fan-out it triggered.
#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct TagEvent {
    /// Owning tag-collection identifier.
    pub collection: usize,
    /// Step instances created by this put; zero for a memoized duplicate.
    pub prescribed: usize,
}

impl From<TagEvent> for RuntimeEvent {
    fn from(e: TagEvent) -> Self { RuntimeEvent::Tag(e) }
}

/// A scheduler worker transition.
#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEvent {
    /// Worker index; the environment thread reports as worker zero.
    pub worker: usize,
    /// Which transition occurred.
    pub kind: ScheduleEventKind,
}

/// The scheduler transitions worth observing.
#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub enum ScheduleEventKind {
    /// Worker thread started.
    Started,
    /// Worker went to sleep with no work in reach.
    Parked,
    /// Worker took work from another worker's queue.
    Stole {
        /// The victim's worker index.
        from: usize,
    },
    /// Worker thread exited.
    Stopped,
}

impl From<ScheduleEvent> for RuntimeEvent {
    fn from(e: ScheduleEvent) -> Self { RuntimeEvent::Schedule(e) }
}

/// A point-in-time snapshot of a context's activity counters.
///
/// Mirrors what the schedulers accumulate while running; useful for demos and for
/// regression checks on scheduling behavior (counts, never ordering).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// Step instances created by prescription (including internal range and loop tasks).
    pub steps_created: u64,
    /// Step instances that committed.
    pub steps_finished: u64,
    /// Step instances dropped by cancellation.
    pub steps_cancelled: u64,
    /// Times any instance was parked on missing items.
    pub suspends: u64,
    /// Times any instance was re-queued by an arriving item.
    pub resumes: u64,
    /// Items put.
    pub items_put: u64,
    /// Successful item reads.
    pub items_got: u64,
    /// Item slots reclaimed.
    pub items_erased: u64,
    /// Tags put (memoized duplicates included).
    pub tags_put: u64,
    /// Work taken from another worker's queue.
    pub steals: u64,
}

impl std::fmt::Display for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "steps: {} created, {} finished, {} cancelled; {} suspends, {} resumes; \
             items: {} put, {} got, {} erased; tags: {}; steals: {}",
            self.steps_created,
            self.steps_finished,
            self.steps_cancelled,
            self.suspends,
            self.resumes,
            self.items_put,
            self.items_got,
            self.items_erased,
            self.tags_put,
            self.steals,
        )
    }
}

/// The live counters behind [`Statistics`].
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub steps_created: AtomicU64,
    pub steps_finished: AtomicU64,
    pub steps_cancelled: AtomicU64,
    pub suspends: AtomicU64,
    pub resumes: AtomicU64,
    pub items_put: AtomicU64,
    pub items_got: AtomicU64,
    pub items_erased: AtomicU64,
    pub tags_put: AtomicU64,
    pub steals: AtomicU64,
}

impl StatCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Statistics {
        Statistics {
            steps_created: self.steps_created.load(Ordering::Relaxed),
            steps_finished: self.steps_finished.load(Ordering::Relaxed),
            steps_cancelled: self.steps_cancelled.load(Ordering::Relaxed),
            suspends: self.suspends.load(Ordering::Relaxed),
            resumes: self.resumes.load(Ordering::Relaxed),
            items_put: self.items_put.load(Ordering::Relaxed),
            items_got: self.items_got.load(Ordering::Relaxed),
            items_erased: self.items_erased.load(Ordering::Relaxed),
            tags_put: self.tags_put.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn disabled_logger_drops_events() {
        let logger = Logger::disabled();
        assert!(!logger.enabled());
        logger.log(TagEvent { collection: 0, prescribed: 1 });
    }

    #[test]
    fn sink_observes_events_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let logger = Logger::new(Arc::new(move |e: &RuntimeEvent| {
            sink.lock().unwrap().push(e.clone());
        }));
        logger.log(StepEvent { step: 1, kind: StepEventKind::Started });
        logger.log(StepEvent { step: 1, kind: StepEventKind::Finished });
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                RuntimeEvent::Step(StepEvent { step: 1, kind: StepEventKind::Started }),
                RuntimeEvent::Step(StepEvent { step: 1, kind: StepEventKind::Finished }),
            ]
        );
    }
}
