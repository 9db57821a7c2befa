use prescriptive_dataflow::{
    Affinity, Context, ItemCollection, Runtime, SchedulerKind, Settings, StepCollection,
    StepResult, StepTuner, TagCollection,
};

/// Fib without pre-declared dependencies: steps discover missing reads at get time, so
/// every scheduler variant is exercised through heavy suspend/resume traffic.
fn run_fib(settings: Settings, tuner: StepTuner<u64>, n: u64) -> u64 {
    let runtime = Runtime::new(settings);
    let ctx = Context::new(&runtime);
    let fibs: ItemCollection<u64, u64> = ItemCollection::new(&ctx, "fibs");
    let steps = {
        let fibs = fibs.clone();
        StepCollection::with_tuner(&ctx, "fib_step", tuner, move |&tag: &u64| -> StepResult {
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
    let tags: TagCollection<u64> = TagCollection::new(&ctx, "tags");
    tags.prescribes(&steps);
    for i in 0..=n {
        tags.put(i);
    }
    ctx.wait().unwrap();
    fibs.try_get(&n).expect("result must be present")
}

fn settings(kind: SchedulerKind, threads: usize, priority: bool) -> Settings {
    Settings {
        threads,
        scheduler: kind,
        use_priority: priority,
        pin_stride: 0,
        dist_mode: None,
    }
}

#[test]
fn task_pool_scheduler() {
    assert_eq!(run_fib(settings(SchedulerKind::TaskPool, 4, false), StepTuner::new(), 15), 610);
}

#[test]
fn fifo_steal_scheduler() {
    assert_eq!(run_fib(settings(SchedulerKind::FifoSteal, 4, false), StepTuner::new(), 15), 610);
}

#[test]
fn fifo_single_scheduler() {
    assert_eq!(run_fib(settings(SchedulerKind::FifoSingle, 3, false), StepTuner::new(), 15), 610);
}

#[test]
fn fifo_affinity_scheduler() {
    let tuner = StepTuner::new().affinity(|&tag: &u64| Affinity::Worker(tag as usize));
    assert_eq!(run_fib(settings(SchedulerKind::FifoAffinity, 4, false), tuner, 15), 610);
}

#[test]
fn prioritized_fifo_scheduler() {
    let tuner = StepTuner::new().priority(|&tag: &u64| -(tag as i64));
    assert_eq!(run_fib(settings(SchedulerKind::FifoSteal, 4, true), tuner, 15), 610);
}

#[test]
fn prioritized_single_scheduler() {
    let tuner = StepTuner::new().priority(|&tag: &u64| tag as i64);
    assert_eq!(run_fib(settings(SchedulerKind::FifoSingle, 2, true), tuner, 15), 610);
}

#[test]
fn single_worker_still_completes() {
    assert_eq!(run_fib(settings(SchedulerKind::TaskPool, 1, false), StepTuner::new(), 12), 144);
}

/// Scheduling order varies; stored values do not.
#[test]
fn values_are_deterministic_across_runs_and_variants() {
    let reference = run_fib(settings(SchedulerKind::TaskPool, 4, false), StepTuner::new(), 18);
    for kind in [SchedulerKind::FifoSteal, SchedulerKind::FifoSingle, SchedulerKind::FifoAffinity] {
        for _ in 0..3 {
            assert_eq!(run_fib(settings(kind, 4, false), StepTuner::new(), 18), reference);
        }
    }
}
