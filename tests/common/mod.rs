//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::Duration;
use tranquil::{IsolationLevel, Stm, TransactionExecutor};
use tranquil_engine::NoBackoff;

static TRACING: Once = Once::new();

/// Route engine logs to the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Fresh runtime with logging enabled
pub fn new_stm() -> Stm {
    init_tracing();
    Stm::new()
}

/// Non-speculative executor at the given isolation level without backoff
pub fn executor_at(stm: &Stm, level: IsolationLevel) -> TransactionExecutor {
    stm.transaction_factory_builder()
        .set_isolation_level(level)
        .set_speculative_configuration_enabled(false)
        .set_backoff_policy(Arc::new(NoBackoff))
        .build_executor()
        .expect("valid configuration")
}

/// Run `work` on `threads` threads released together, collecting the results
pub fn run_concurrently<R, F>(threads: usize, work: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(usize) -> R + Send + Sync + 'static,
{
    let barrier = Arc::new(Barrier::new(threads));
    let work = Arc::new(work);
    let handles: Vec<_> = (0..threads)
        .map(|index| {
            let barrier = Arc::clone(&barrier);
            let work = Arc::clone(&work);
            thread::spawn(move || {
                barrier.wait();
                work(index)
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().expect("worker panicked"))
        .collect()
}

/// Give a spawned thread time to block
pub fn pause() {
    thread::sleep(Duration::from_millis(50));
}
