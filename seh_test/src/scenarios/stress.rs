use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use msvcrt_seh::{
    DispatchPhase, ExceptionPointers, FilterResult, ScopeEntry, ScopeTable, TRYLEVEL_TOP,
    chain_depth, dispatch_phase, longjmp, protect, raise_exception, setjmp,
};

use crate::test_ctx::env_usize;

static FILTER_HITS: AtomicUsize = AtomicUsize::new(0);
static FINALLY_HITS: AtomicUsize = AtomicUsize::new(0);
static EXCEPT_HITS: AtomicUsize = AtomicUsize::new(0);

fn count_filter(pointers: &ExceptionPointers<'_>, data: usize) -> FilterResult {
    FILTER_HITS.fetch_add(1, Ordering::Relaxed);
    assert_eq!(pointers.record.params(), &[data]);
    FilterResult::ExecuteHandler
}

fn count_except(_data: usize) {
    EXCEPT_HITS.fetch_add(1, Ordering::Relaxed);
}

fn count_finally(_data: usize) {
    FINALLY_HITS.fetch_add(1, Ordering::Relaxed);
}

static EXCEPT: [ScopeEntry; 1] = [ScopeEntry::except(TRYLEVEL_TOP, count_filter, count_except)];
static EXCEPT_TABLE: ScopeTable = ScopeTable::new(&EXCEPT);
static FINALLY: [ScopeEntry; 1] = [ScopeEntry::finally(TRYLEVEL_TOP, count_finally)];
static FINALLY_TABLE: ScopeTable = ScopeTable::new(&FINALLY);

fn one_round(worker: usize) {
    let result = protect(&EXCEPT_TABLE, worker, |outer| {
        outer.enter(0);
        protect(&FINALLY_TABLE, worker, |inner| {
            inner.enter(0);
            raise_exception(0xE000_2000, 0, &[worker]);
        });
    });
    assert!(result.handled().is_some());

    let jumped = setjmp(|buf| {
        protect(&FINALLY_TABLE, worker, |frame| {
            frame.enter(0);
            longjmp(buf, worker as i32 + 1);
        });
    });
    assert_eq!(jumped.resumed(), Some(worker as i32 + 1));
    assert_eq!(chain_depth(), 0);
    assert_eq!(dispatch_phase(), DispatchPhase::Idle);
}

fn run_workers(workers: usize, rounds: usize) {
    FILTER_HITS.store(0, Ordering::Relaxed);
    FINALLY_HITS.store(0, Ordering::Relaxed);
    EXCEPT_HITS.store(0, Ordering::Relaxed);
    let started = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let started = Arc::clone(&started);
            thread::spawn(move || {
                started.fetch_add(1, Ordering::Relaxed);
                for _ in 0..rounds {
                    one_round(worker);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let total = workers * rounds;
    assert_eq!(started.load(Ordering::Relaxed), workers);
    assert_eq!(FILTER_HITS.load(Ordering::Relaxed), total);
    assert_eq!(EXCEPT_HITS.load(Ordering::Relaxed), total);
    assert_eq!(FINALLY_HITS.load(Ordering::Relaxed), total * 2);
}

// 各线程帧链互不可见
pub fn scenario_thread_isolation() {
    protect(&FINALLY_TABLE, 0, |_frame| {
        let other_depth = thread::spawn(chain_depth).join().expect("probe panicked");
        assert_eq!(other_depth, 0);
        assert_eq!(chain_depth(), 1);
    });
    run_workers(4, 16);
}

pub fn scenario_concurrent_stress() {
    let workers = env_usize("SEH_TEST_WORKERS", 8);
    let rounds = env_usize("SEH_TEST_ROUNDS", 2000);
    let start = std::time::Instant::now();
    run_workers(workers, rounds);
    println!(
        "concurrent-stress workers={workers} rounds={rounds} elapsed={:?}",
        start.elapsed()
    );
}
