use super::{Execution, Runner};
use std::{thread, time::Duration};


/// Runner which runs executions on the calling thread
///
/// Delayed executions put the calling thread to sleep for the delay first. Never deadlocks, since
/// it owns no threads.
#[derive(Debug, Copy, Clone, Default)]
pub struct SyncRunner;

impl Runner for SyncRunner {
    fn run(&self, execution: Execution, delay: Duration) {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        execution.run();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{atomic::{AtomicUsize, Ordering}, Arc},
        time::Instant,
    };

    #[test]
    fn runs_inline_after_delay() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let start = Instant::now();
        SyncRunner.run(
            Execution::new(move || { count2.fetch_add(1, Ordering::SeqCst); }),
            Duration::from_millis(20),
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(!SyncRunner.would_deadlock(std::thread::current().id()));
    }
}
