//! Memoized Fibonacci: one step instance per index, reclamation after two reads.
//!
//! Demonstrates the get-count tuner, pre-declared dependencies, and memoized tags.
//! Usage: `fib [n]`.

use prescriptive_dataflow::{
    Context, GetCount, ItemCollection, ItemTuner, Runtime, StepCollection, StepResult,
    StepTuner, TagCollection, TagTuner,
};

type FibType = u64;

fn main() {
    env_logger::init();

    let n: u64 = std::env::args().nth(1).and_then(|x| x.parse().ok()).unwrap_or(42);

    let runtime = Runtime::from_env();
    let ctx = Context::new(&runtime);

    // Each intermediate result is read by the next two computations, then reclaimed.
    let item_tuner = ItemTuner::new()
        .get_count(|&tag: &u64| if tag > 0 { GetCount::Finite(2) } else { GetCount::Finite(1) });
    let fibs: ItemCollection<u64, FibType> = ItemCollection::with_tuner(&ctx, "fibs", item_tuner);

    let tags: TagCollection<u64> =
        TagCollection::with_tuner(&ctx, "tags", TagTuner::new().memoize(true));

    let step_tuner = {
        let fibs = fibs.clone();
        StepTuner::new().depends(move |&tag: &u64, deps| {
            if tag > 1 {
                deps.depends(&fibs, tag - 1);
                deps.depends(&fibs, tag - 2);
            }
        })
    };
    let steps = {
        let fibs = fibs.clone();
        StepCollection::with_tuner(&ctx, "fib_step", step_tuner, move |&tag: &u64| -> StepResult {
            match tag {
                0 => fibs.put(0, 0)?,
                1 => fibs.put(1, 1)?,
                _ => {
                    let f1 = fibs.get(&(tag - 1))?;
                    let f2 = fibs.get(&(tag - 2))?;
                    fibs.put(tag, f1 + f2)?;
                }
            }
            Ok(())
        })
    };
    steps.consumes(&fibs);
    steps.produces(&fibs);
    tags.prescribes(&steps);

    for i in 0..=n {
        tags.put(i);
    }

    ctx.wait().expect("fib computation failed");

    let result = fibs.try_get(&n).expect("result should be present");
    println!("fib ({}): {}", n, result);
    println!("{}", ctx.statistics());
}
