use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use prescriptive_dataflow::{
    BlockedRange, Context, Runtime, StepCollection, StepResult, StepTuner, TagCollection,
    TagTuner,
};

fn counting_steps(ctx: &Context, executions: &Arc<AtomicUsize>) -> StepCollection<u32> {
    let executions = executions.clone();
    StepCollection::new(ctx, "count", move |_: &u32| -> StepResult {
        executions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

/// Putting the same tag twice into a memoizing collection prescribes exactly once.
#[test]
fn memoized_tags_prescribe_once() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);
    let executions = Arc::new(AtomicUsize::new(0));
    let steps = counting_steps(&ctx, &executions);
    let tags: TagCollection<u32> =
        TagCollection::with_tuner(&ctx, "tags", TagTuner::new().memoize(true));
    tags.prescribes(&steps);

    tags.put(5);
    tags.put(5);
    tags.put(5);
    ctx.wait().unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(tags.size(), 1);
    assert_eq!(tags.iterate().unwrap(), vec![5]);
}

/// Without memoization every put prescribes again, and nothing is stored.
#[test]
fn unmemoized_tags_prescribe_each_time() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);
    let executions = Arc::new(AtomicUsize::new(0));
    let steps = counting_steps(&ctx, &executions);
    let tags: TagCollection<u32> = TagCollection::new(&ctx, "tags");
    tags.prescribes(&steps);

    tags.put(5);
    tags.put(5);
    ctx.wait().unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 2);
    assert!(tags.empty());
}

/// A cancellation predicate drops tags at put time; cancelled tags never execute.
#[test]
fn cancelled_tags_never_run() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);
    let executions = Arc::new(AtomicUsize::new(0));
    let steps = {
        let executions = executions.clone();
        StepCollection::with_tuner(
            &ctx,
            "count",
            StepTuner::new().cancel(|&tag: &u32| tag % 2 == 1),
            move |_: &u32| -> StepResult {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
    };
    let tags: TagCollection<u32> = TagCollection::new(&ctx, "tags");
    tags.prescribes(&steps);

    for tag in 0..10 {
        tags.put(tag);
    }
    ctx.wait().unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 5);
    assert_eq!(ctx.statistics().steps_cancelled, 5);
}

/// put_range distributes the puts but covers exactly the range.
#[test]
fn put_range_covers_the_range() {
    let runtime = Runtime::fixed(4);
    let ctx = Context::new(&runtime);
    let executions = Arc::new(AtomicUsize::new(0));
    let steps = counting_steps(&ctx, &executions);
    let tags: TagCollection<u32> =
        TagCollection::with_tuner(&ctx, "tags", TagTuner::new().memoize(true));
    tags.prescribes(&steps);

    tags.put_range(BlockedRange::new(0, 300, 3));
    ctx.wait().unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 100);
    assert_eq!(tags.size(), 100);
}

/// Blocking on-put callbacks observe every effective put.
#[test]
fn on_put_callbacks_fire() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);
    let executions = Arc::new(AtomicUsize::new(0));
    let steps = counting_steps(&ctx, &executions);
    let tags: TagCollection<u32> =
        TagCollection::with_tuner(&ctx, "tags", TagTuner::new().memoize(true));
    tags.prescribes(&steps);

    let seen = Arc::new(AtomicUsize::new(0));
    {
        let seen = seen.clone();
        tags.on_put(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
    }

    tags.put(1);
    tags.put(1);
    tags.put(2);
    ctx.wait().unwrap();

    // The duplicate put is memoized away before the callback.
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}
