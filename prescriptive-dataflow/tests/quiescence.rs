use prescriptive_dataflow::{
    Context, Fatal, ItemCollection, Runtime, StepCollection, StepResult, TagCollection,
};

/// A consumer waits on an item no producer will ever put: wait must fail with the
/// quiescent-but-pending report naming the suspended instance.
#[test]
fn missing_producer_is_reported() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);

    let items: ItemCollection<u32, u32> = ItemCollection::new(&ctx, "orphans");
    let consumer = {
        let items = items.clone();
        StepCollection::new(&ctx, "consume", move |&key: &u32| -> StepResult {
            let _ = items.get(&key)?;
            Ok(())
        })
    };
    let tags: TagCollection<u32> = TagCollection::new(&ctx, "tags");
    tags.prescribes(&consumer);
    tags.put(42);

    match ctx.wait() {
        Err(Fatal::QuiescentButPending { pending }) => {
            assert_eq!(pending.len(), 1);
            assert!(pending[0].contains("42"), "report should name the tag: {:?}", pending);
        }
        other => panic!("expected QuiescentButPending, got {:?}", other),
    }

    // The context stays failed: later waits report the same error, and safe-state
    // operations are rejected.
    assert!(matches!(ctx.wait(), Err(Fatal::QuiescentButPending { .. })));
    assert!(matches!(ctx.reset(), Err(Fatal::InvalidSafeState)));
    assert!(matches!(items.iterate(), Err(Fatal::InvalidSafeState)));
}

/// An empty context is quiescent from the start.
#[test]
fn wait_on_empty_context_returns_immediately() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);
    ctx.wait().unwrap();
    ctx.wait().unwrap();
}

/// Waves of work separated by waits: the barrier releases after each wave and the
/// context remains usable.
#[test]
fn wait_releases_between_waves() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);

    let items: ItemCollection<u32, u32> = ItemCollection::new(&ctx, "waves");
    let steps = {
        let items = items.clone();
        StepCollection::new(&ctx, "double", move |&key: &u32| -> StepResult {
            items.put(key, key * 2)?;
            Ok(())
        })
    };
    let tags: TagCollection<u32> = TagCollection::new(&ctx, "tags");
    tags.prescribes(&steps);

    tags.put(1);
    ctx.wait().unwrap();
    assert_eq!(items.try_get(&1), Some(2));

    tags.put(2);
    ctx.wait().unwrap();
    assert_eq!(items.try_get(&2), Some(4));
}
