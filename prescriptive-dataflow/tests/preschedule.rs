use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prescriptive_dataflow::{
    flush_gets, Context, ItemCollection, Runtime, StepCollection, StepResult, StepTuner,
    TagCollection,
};

/// With declared dependencies the consumer parks on both missing items at once and its
/// body runs exactly once, with both reads succeeding immediately.
#[test]
fn preschedule_batches_missing_dependencies() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);

    let xs: ItemCollection<u32, i64> = ItemCollection::new(&ctx, "xs");
    let ys: ItemCollection<u32, i64> = ItemCollection::new(&ctx, "ys");
    let sums: ItemCollection<u32, i64> = ItemCollection::new(&ctx, "sums");
    let attempts = Arc::new(AtomicUsize::new(0));

    let tuner = {
        let xs = xs.clone();
        let ys = ys.clone();
        StepTuner::new().depends(move |&tag: &u32, deps| {
            deps.depends(&xs, tag);
            deps.depends(&ys, tag);
        })
    };
    let consumer = {
        let xs = xs.clone();
        let ys = ys.clone();
        let sums = sums.clone();
        let attempts = attempts.clone();
        StepCollection::with_tuner(&ctx, "combine", tuner, move |&tag: &u32| -> StepResult {
            attempts.fetch_add(1, Ordering::SeqCst);
            let x = xs.get(&tag)?;
            let y = ys.get(&tag)?;
            sums.put(tag, x + y)?;
            Ok(())
        })
    };
    let tags: TagCollection<u32> = TagCollection::new(&ctx, "tags");
    tags.prescribes(&consumer);

    tags.put(7);
    std::thread::sleep(Duration::from_millis(20));
    xs.put(7, 1).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    ys.put(7, 2).unwrap();

    ctx.wait().unwrap();

    assert_eq!(sums.try_get(&7), Some(3));
    assert_eq!(attempts.load(Ordering::SeqCst), 1, "body must run exactly once");
}

/// The try_get/flush_gets protocol: reads never unwind mid-body, the flush point decides
/// whether the step suspends, and the re-executed body finds every item.
#[test]
fn flush_gets_suspends_on_batched_misses() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);

    let xs: ItemCollection<u32, i64> = ItemCollection::new(&ctx, "xs");
    let ys: ItemCollection<u32, i64> = ItemCollection::new(&ctx, "ys");
    let sums: ItemCollection<u32, i64> = ItemCollection::new(&ctx, "sums");
    let committed_attempts = Arc::new(AtomicUsize::new(0));

    let consumer = {
        let xs = xs.clone();
        let ys = ys.clone();
        let sums = sums.clone();
        let committed_attempts = committed_attempts.clone();
        StepCollection::new(&ctx, "combine", move |&tag: &u32| -> StepResult {
            let x = xs.try_get(&tag);
            let y = ys.try_get(&tag);
            flush_gets()?;
            committed_attempts.fetch_add(1, Ordering::SeqCst);
            let sum = x.expect("flushed") + y.expect("flushed");
            sums.put(tag, sum)?;
            Ok(())
        })
    };
    let tags: TagCollection<u32> = TagCollection::new(&ctx, "tags");
    tags.prescribes(&consumer);

    tags.put(3);
    std::thread::sleep(Duration::from_millis(20));
    xs.put(3, 40).unwrap();
    ys.put(3, 2).unwrap();

    ctx.wait().unwrap();

    assert_eq!(sums.try_get(&3), Some(42));
    assert_eq!(committed_attempts.load(Ordering::SeqCst), 1);
}

/// A miss whose item is produced before the flush registers no waiter, so nothing would
/// ever wake the step; the flush must re-queue it for another attempt, not fail it.
#[test]
fn flush_gets_retries_when_misses_resolve_before_flush() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);

    let items: ItemCollection<u32, i64> = ItemCollection::new(&ctx, "items");
    let outs: ItemCollection<u32, i64> = ItemCollection::new(&ctx, "outs");
    let attempts = Arc::new(AtomicUsize::new(0));

    let steps = {
        let items = items.clone();
        let outs = outs.clone();
        let attempts = attempts.clone();
        StepCollection::new(&ctx, "self_feed", move |&tag: &u32| -> StepResult {
            attempts.fetch_add(1, Ordering::SeqCst);
            let seen = items.try_get(&tag);
            if seen.is_none() {
                // The item lands after the miss was recorded but before the flush.
                items.put(tag, 7)?;
            }
            flush_gets()?;
            outs.put(tag, seen.expect("flushed") + 1)?;
            Ok(())
        })
    };
    let tags: TagCollection<u32> = TagCollection::new(&ctx, "tags");
    tags.prescribes(&steps);

    tags.put(4);
    ctx.wait().unwrap();

    assert_eq!(outs.try_get(&4), Some(8));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
