use prescriptive_dataflow::{
    Context, Fatal, GetCount, GetError, ItemCollection, ItemTuner, PutError, Runtime,
    StepCollection, StepResult, TagCollection,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn dense_store_round_trips() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);
    let items: ItemCollection<u32, String> =
        ItemCollection::with_tuner(&ctx, "dense", ItemTuner::new().dense_store(8));
    items.set_max(16);

    items.put(3, "three".to_owned()).unwrap();
    items.put(12, "twelve".to_owned()).unwrap();
    assert_eq!(items.size(), 2);
    assert_eq!(items.try_get(&3).as_deref(), Some("three"));
    assert_eq!(items.try_get(&7), None);

    let mut contents = items.iterate().unwrap();
    contents.sort();
    assert_eq!(contents, vec![(3, "three".to_owned()), (12, "twelve".to_owned())]);
}

#[test]
fn redefinition_fails() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);
    let items: ItemCollection<u32, u32> = ItemCollection::new(&ctx, "items");
    items.put(1, 10).unwrap();
    assert!(matches!(items.put(1, 11), Err(PutError::AlreadyPresent(_))));
}

#[test]
fn equal_predicate_permits_idempotent_puts() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);
    let items: ItemCollection<u32, u32> =
        ItemCollection::with_tuner(&ctx, "items", ItemTuner::new().equal(|a, b| a == b));
    items.put(1, 10).unwrap();
    items.put(1, 10).unwrap();
    assert!(matches!(items.put(1, 11), Err(PutError::AlreadyPresent(_))));
    assert_eq!(items.size(), 1);
}

#[test]
fn get_count_reclaims_after_last_read() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);
    let items: ItemCollection<u32, u32> = ItemCollection::with_tuner(
        &ctx,
        "items",
        ItemTuner::new().get_count(|_| GetCount::Finite(2)),
    );
    items.put(1, 10).unwrap();
    assert_eq!(items.get(&1).unwrap(), 10);
    assert_eq!(items.get(&1).unwrap(), 10);
    assert!(matches!(items.get(&1), Err(GetError::Gone(_))));
    assert_eq!(items.try_get(&1), None);
    assert!(items.empty());
}

#[test]
fn unlimited_items_survive_many_reads() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);
    let items: ItemCollection<u32, u32> = ItemCollection::new(&ctx, "items");
    items.put(1, 10).unwrap();
    for _ in 0..100 {
        assert_eq!(items.get(&1).unwrap(), 10);
    }
    assert_eq!(items.size(), 1);
}

/// A step reading a slot after its last permitted read aborts the context.
#[test]
fn gone_read_inside_a_step_is_fatal() {
    let runtime = Runtime::fixed(1);
    let ctx = Context::new(&runtime);
    let items: ItemCollection<u32, u32> = ItemCollection::with_tuner(
        &ctx,
        "items",
        ItemTuner::new().get_count(|_| GetCount::Finite(1)),
    );
    let readers = {
        let items = items.clone();
        StepCollection::new(&ctx, "read", move |&_: &u32| -> StepResult {
            let _ = items.get(&1)?;
            Ok(())
        })
    };
    let tags: TagCollection<u32> = TagCollection::new(&ctx, "tags");
    tags.prescribes(&readers);

    items.put(1, 10).unwrap();
    tags.put(0);
    tags.put(1);

    match ctx.wait() {
        Err(Fatal::ItemGone { item, .. }) => assert!(item.contains("items")),
        other => panic!("expected ItemGone, got {:?}", other),
    }
}

/// Reads are charged when a step commits: a step that suspends halfway through its reads
/// does not spend the slot's budget on the abandoned attempt.
#[test]
fn suspended_attempts_do_not_spend_read_budget() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);
    let items: ItemCollection<u32, u32> = ItemCollection::with_tuner(
        &ctx,
        "items",
        ItemTuner::new().get_count(|_| GetCount::Finite(1)),
    );
    let sums: ItemCollection<u32, u32> = ItemCollection::new(&ctx, "sums");
    let attempts = Arc::new(AtomicUsize::new(0));
    let steps = {
        let items = items.clone();
        let sums = sums.clone();
        let attempts = attempts.clone();
        StepCollection::new(&ctx, "sum", move |&tag: &u32| -> StepResult {
            attempts.fetch_add(1, Ordering::SeqCst);
            // First read present from the start, second arrives later: the first
            // attempt reads slot 1 and then suspends on slot 2.
            let first = items.get(&1)?;
            let second = items.get(&2)?;
            sums.put(tag, first + second)?;
            Ok(())
        })
    };
    let tags: TagCollection<u32> = TagCollection::new(&ctx, "tags");
    tags.prescribes(&steps);

    items.put(1, 10).unwrap();
    tags.put(0);
    // Wait until the first attempt has actually parked before releasing it.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while ctx.statistics().suspends == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert!(ctx.statistics().suspends >= 1, "first attempt never suspended");
    items.put(2, 5).unwrap();

    ctx.wait().unwrap();
    assert_eq!(sums.try_get(&0), Some(15));
    assert!(attempts.load(Ordering::SeqCst) >= 2, "step should have re-executed");
    // Slot 1 was read once by the committed attempt, so it is exactly spent.
    assert_eq!(items.try_get(&1), None);
}

#[test]
fn iterate_requires_quiescence() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);
    let items: ItemCollection<u32, u32> = ItemCollection::new(&ctx, "items");
    let consumers = {
        let items = items.clone();
        StepCollection::new(&ctx, "consume", move |&key: &u32| -> StepResult {
            let _ = items.get(&key)?;
            Ok(())
        })
    };
    let tags: TagCollection<u32> = TagCollection::new(&ctx, "tags");
    tags.prescribes(&consumers);
    tags.put(9);

    // The consumer is suspended on a missing item, so work is outstanding.
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert!(matches!(items.iterate(), Err(Fatal::InvalidSafeState)));

    items.put(9, 1).unwrap();
    ctx.wait().unwrap();
    assert!(items.iterate().is_ok());
}
