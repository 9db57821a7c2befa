//! Squares via the parallel-for driver.
//!
//! Usage: `parallel_squares [n]`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use prescriptive_dataflow::{parallel_for_in, PforTuner, Runtime};

fn main() {
    env_logger::init();

    let n: usize = std::env::args().nth(1).and_then(|x| x.parse().ok()).unwrap_or(1 << 20);

    let squares: Arc<Vec<AtomicU64>> =
        Arc::new((0..n).map(|_| AtomicU64::new(0)).collect());

    let runtime = Runtime::from_env();
    let target = squares.clone();
    parallel_for_in(
        &runtime,
        0usize,
        n,
        1usize,
        move |i| {
            target[i].store((i as u64) * (i as u64), Ordering::Relaxed);
        },
        PforTuner::new(),
    )
    .expect("parallel_for failed");

    let spot = n / 2;
    println!("squares[{}] = {}", spot, squares[spot].load(Ordering::Relaxed));
}
