//! Prime finding by trial division: one step instance per odd candidate.
//!
//! Usage: `primes [n]`.

use prescriptive_dataflow::{Context, ItemCollection, Runtime, StepCollection, StepResult, TagCollection};

fn main() {
    env_logger::init();

    let n: u32 = std::env::args().nth(1).and_then(|x| x.parse().ok()).unwrap_or(10_000);

    let runtime = Runtime::from_env();
    let ctx = Context::new(&runtime);

    let primes: ItemCollection<u32, u32> = ItemCollection::new(&ctx, "primes");
    let odds: TagCollection<u32> = TagCollection::new(&ctx, "odds");

    let steps = {
        let primes = primes.clone();
        StepCollection::new(&ctx, "find_primes", move |&candidate: &u32| -> StepResult {
            let mut factor = 3;
            while factor * factor <= candidate && candidate % factor != 0 {
                factor += 2;
            }
            if factor * factor > candidate {
                primes.put(candidate, candidate)?;
            }
            Ok(())
        })
    };
    steps.produces(&primes);
    odds.prescribes(&steps);

    for candidate in (3..n).step_by(2) {
        odds.put(candidate);
    }

    ctx.wait().expect("prime search failed");

    // +1 for 2, which is prime but never tested.
    println!("found {} primes below {}", primes.size() + 1, n);
}
