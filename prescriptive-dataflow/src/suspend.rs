//! The suspend/resume machinery.
//!
//! A step that reads a missing item does not block its worker. The read registers the
//! step on the item slot's waiter list, increments the step's dependency counter, and the
//! body unwinds with a `NotReady` signal. The scheduler's catch point then *parks* the
//! instance: it is in no run queue and is referenced only by the waiter lists of the slots
//! it needs. Each arriving item drains its waiter list and decrements the counters of the
//! parked steps; the party whose decrement brings a counter to zero re-queues that step.
//!
//! The counter carries one extra self-count on behalf of the executing worker, so a put
//! that lands while the body is still unwinding cannot re-queue the instance early: zero
//! is only reachable after the worker has parked the instance. Each attempt also bumps a
//! generation; waiter entries tagged with an older generation are ignored, which lets item
//! stores be permissive about duplicate notifications.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::context::ContextInner;
use crate::item::ItemCollection;
use crate::logging::{StatCounters, StepEvent, StepEventKind};
use crate::step::{StepId, StepInstance, StepState};
use crate::{Data, Tag};

/// One parked read: the instance to wake and the attempt it belongs to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Waiter {
    pub(crate) step: StepId,
    pub(crate) generation: u64,
}

/// The waiter list of an empty item slot. Two inline entries cover the common case of a
/// value read by a couple of successor steps.
pub(crate) type WaiterList = SmallVec<[Waiter; 2]>;

/// What `flush_gets` finds when it re-examines a read that missed under `try_get`.
pub(crate) enum MissState {
    /// The item arrived in the meantime; nothing to wait for.
    NowPresent,
    /// Still missing; a waiter was registered and the instance must suspend.
    Registered,
    /// The slot was reclaimed; the read can never succeed.
    Gone(String),
}

/// A deferred re-examination of a missed `try_get`, run by `flush_gets`.
pub(crate) type MissProbe = Box<dyn FnOnce(&Arc<StepInstance>) -> MissState + Send>;

/// The handle through which a `depends` tuner declares the item reads of one instance.
///
/// Every declared read that is not yet available parks the instance on that slot, so the
/// step body only runs once all declared reads can succeed.
pub struct DependencyConsumer<'a> {
    pub(crate) instance: &'a Arc<StepInstance>,
}

impl DependencyConsumer<'_> {
    /// Declare that the instance will read `tag` from `collection`.
    pub fn depends<T: Tag, V: Data>(&mut self, collection: &ItemCollection<T, V>, tag: T) {
        collection.register_dependency(self.instance, &tag);
    }
}

/// Park an instance whose attempt observed missing items, or re-queue it immediately if
/// every missing item arrived while the body was unwinding.
///
/// Runs on the executing worker as the final act of an attempt; dropping the self-count
/// here is what makes the counter reachable for zero.
pub(crate) fn park_or_requeue(ctx: &Arc<ContextInner>, instance: &Arc<StepInstance>) {
    instance.set_state(StepState::Suspended);
    StatCounters::bump(&ctx.stats.suspends);
    if ctx.logger.enabled() {
        let pending = (instance.deps.load(Ordering::SeqCst) - 1).max(0) as usize;
        ctx.logger.log(StepEvent {
            step: instance.id.0,
            kind: StepEventKind::Suspended { pending },
        });
    }
    let remaining = instance.deps.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining == 0 {
        requeue(ctx, instance);
    }
}

/// Decrement the dependency counter of a parked instance on behalf of an arriving item.
///
/// Stale ids (the instance already finished) and stale generations (the entry belongs to
/// an earlier attempt) are ignored.
pub(crate) fn resume_waiter(ctx: &Arc<ContextInner>, waiter: Waiter) {
    let Some(instance) = ctx.steps.get(waiter.step) else {
        return;
    };
    if instance.generation.load(Ordering::SeqCst) != waiter.generation {
        return;
    }
    let remaining = instance.deps.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining == 0 {
        requeue(ctx, &instance);
    }
}

/// Move a fully satisfied instance back into the run queues.
fn requeue(ctx: &Arc<ContextInner>, instance: &Arc<StepInstance>) {
    // The transition can only fail for duplicate zero observations, which the self-count
    // protocol excludes; checked rather than assumed.
    if instance.transition(StepState::Suspended, StepState::Queued) {
        StatCounters::bump(&ctx.stats.resumes);
        ctx.logger.log(StepEvent { step: instance.id.0, kind: StepEventKind::Resumed });
        ctx.scheduler.submit(instance);
    } else {
        log::debug!("discarded duplicate resume for step {:?}", instance.id);
    }
}
