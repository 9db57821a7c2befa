use std::sync::{Arc, Mutex};
use std::time::Duration;

use prescriptive_dataflow::{
    Context, ItemCollection, Runtime, StepCollection, StepResult, TagCollection,
};

/// The consumer reads before the producer writes: it must suspend, park on the slot,
/// and observe the value once the delayed put arrives.
#[test]
fn consumer_suspends_until_put() {
    let runtime = Runtime::fixed(2);
    let ctx = Context::new(&runtime);

    let items: ItemCollection<u32, String> = ItemCollection::new(&ctx, "items");
    let observed = Arc::new(Mutex::new(None));

    let consumer = {
        let items = items.clone();
        let observed = observed.clone();
        StepCollection::new(&ctx, "consume", move |&key: &u32| -> StepResult {
            let value = items.get(&key)?;
            *observed.lock().unwrap() = Some(value);
            Ok(())
        })
    };
    let producer = {
        let items = items.clone();
        StepCollection::new(&ctx, "produce", move |&key: &u32| -> StepResult {
            items.put(key, format!("value-{}", key))?;
            Ok(())
        })
    };

    let consumer_tags: TagCollection<u32> = TagCollection::new(&ctx, "consumer_tags");
    let producer_tags: TagCollection<u32> = TagCollection::new(&ctx, "producer_tags");
    consumer_tags.prescribes(&consumer);
    producer_tags.prescribes(&producer);

    // Let the consumer reach its read and park before the producer even exists.
    consumer_tags.put(7);
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while ctx.statistics().suspends == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(ctx.statistics().suspends >= 1, "consumer never suspended");
    producer_tags.put(7);

    ctx.wait().unwrap();

    assert_eq!(observed.lock().unwrap().as_deref(), Some("value-7"));
    let stats = ctx.statistics();
    assert!(stats.suspends >= 1, "consumer should have suspended: {}", stats);
    assert!(stats.resumes >= 1, "consumer should have been resumed: {}", stats);
}

/// A chain of steps, each waiting on its predecessor's item, released in reverse order:
/// every waiter parked on a slot must be re-queued by the corresponding put.
#[test]
fn no_lost_waiters_on_a_long_chain() {
    const LEN: u64 = 200;
    let runtime = Runtime::fixed(4);
    let ctx = Context::new(&runtime);

    let items: ItemCollection<u64, u64> = ItemCollection::new(&ctx, "chain");
    let steps = {
        let items = items.clone();
        StepCollection::new(&ctx, "link", move |&i: &u64| -> StepResult {
            let prev = items.get(&(i - 1))?;
            items.put(i, prev + 1)?;
            Ok(())
        })
    };
    let tags: TagCollection<u64> = TagCollection::new(&ctx, "links");
    tags.prescribes(&steps);

    // Prescribe the whole chain before its base exists; everything suspends.
    for i in (1..=LEN).rev() {
        tags.put(i);
    }
    items.put(0, 0).unwrap();

    ctx.wait().unwrap();
    assert_eq!(items.try_get(&LEN), Some(LEN));
}
