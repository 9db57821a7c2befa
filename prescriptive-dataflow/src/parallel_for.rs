//! A parallel-for driver built directly on the scheduler.
//!
//! The index range is halved until pieces reach a grain; each leaf becomes one internal
//! step instance applying the body to its indices. Instances bypass any tag-collection
//! and share the driver's private context for the completion barrier. Execution is purely
//! local; ranges are never distributed to other processes.

use std::sync::Arc;

use crate::context::{Context, ContextInner};
use crate::error::Fatal;
use crate::logging::CollectionKind;
use crate::range::{BlockedRange, RangeIndex};
use crate::runtime::Runtime;
use crate::step::{StepInstance, StepTask};
use crate::tuner::Affinity;
use crate::StepResult;

/// Tuning for a parallel-for invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PforTuner {
    grain: Option<usize>,
}

impl PforTuner {
    /// A tuner with no hints: the grain is derived from the range and worker count.
    pub fn new() -> Self {
        PforTuner::default()
    }

    /// The smallest sub-range one instance should handle.
    pub fn grain(mut self, grain: usize) -> Self {
        self.grain = Some(grain.max(1));
        self
    }
}

struct PforTask<I, F> {
    ctx: Arc<ContextInner>,
    collection: usize,
    body: Arc<F>,
    range: BlockedRange<I>,
}

impl<I, F> StepTask for PforTask<I, F>
where
    I: RangeIndex,
    F: Fn(I) + Send + Sync + 'static,
{
    fn run(&self) -> StepResult {
        if self.range.is_divisible() {
            let (low, high) = self.range.split();
            spawn_piece(&self.ctx, self.collection, &self.body, low);
            spawn_piece(&self.ctx, self.collection, &self.body, high);
        } else {
            for index in self.range.iter() {
                (self.body)(index);
            }
        }
        Ok(())
    }

    fn collection(&self) -> usize {
        self.collection
    }

    fn describe(&self) -> String {
        format!("parallel_for({:?})", self.range)
    }
}

fn spawn_piece<I, F>(ctx: &Arc<ContextInner>, collection: usize, body: &Arc<F>, range: BlockedRange<I>)
where
    I: RangeIndex,
    F: Fn(I) + Send + Sync + 'static,
{
    let id = ctx.steps.allocate_id();
    let task = PforTask { ctx: ctx.clone(), collection, body: body.clone(), range };
    let instance = StepInstance::new(id, 0, Affinity::Anywhere, Box::new(task));
    ctx.spawn(instance);
}

/// Execute `body(i)` for every `i` in `{first <= i = first + incr * k < last}`, with the
/// iterations distributed over a worker pool configured from the environment.
///
/// Distinct iterations may run in parallel; returns once every iteration has run.
pub fn parallel_for<I, F>(first: I, last: I, incr: I, body: F) -> Result<(), Fatal>
where
    I: RangeIndex,
    F: Fn(I) + Send + Sync + 'static,
{
    parallel_for_in(&Runtime::from_env(), first, last, incr, body, PforTuner::new())
}

/// [`parallel_for`] against an explicit runtime and tuner.
pub fn parallel_for_in<I, F>(
    runtime: &Runtime,
    first: I,
    last: I,
    incr: I,
    body: F,
    tuner: PforTuner,
) -> Result<(), Fatal>
where
    I: RangeIndex,
    F: Fn(I) + Send + Sync + 'static,
{
    let range = BlockedRange::new(first, last, incr);
    if range.is_empty() {
        return Ok(());
    }
    let ctx = Context::new(runtime);
    let inner = ctx.inner();
    let collection = inner.register_collection_name("parallel_for", CollectionKind::Step);
    let grain = tuner.grain.unwrap_or_else(|| {
        let threads = runtime.settings().threads.max(1);
        (range.len() / (4 * threads)).max(1)
    });
    spawn_piece(&inner, collection, &Arc::new(body), range.with_grain(grain));
    ctx.wait()
}
