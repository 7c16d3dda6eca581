use super::{Execution, Interrupt, Runner};
use crate::error::InvocationError;
use dashmap::DashMap;
use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, VecDeque},
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};


/// Runner with a fixed set of worker threads
///
/// Ready executions run in FIFO order. Delayed executions wait in a deadline heap until due, ties
/// broken by submission order. A panicking execution is logged and does not take its worker down.
///
/// Dropping the runner shuts it down and joins the workers, unless the drop happens on one of the
/// workers itself, in which case they are left to exit on their own.
pub struct ThreadPoolRunner {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

// state shared with worker threads.
struct PoolShared {
    state: Mutex<PoolState>,
    // notified when work is submitted or the pool is stopping.
    cond: Condvar,
    // registry of worker threads and their interrupts.
    workers: DashMap<ThreadId, Interrupt>,
    threads: usize,
}

struct PoolState {
    ready: VecDeque<Execution>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    // tie-breaker for equal deadlines.
    next_seq: u64,
    // number of workers running an execution.
    busy: usize,
    stopping: bool,
}

struct Delayed {
    deadline: Instant,
    seq: u64,
    execution: Execution,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ThreadPoolRunner {
    /// Construct with the given number of worker threads
    ///
    /// Panics if `threads` is zero or a thread can not be spawned.
    pub fn new(threads: usize) -> Self {
        match Self::try_new(threads) {
            Ok(runner) => runner,
            Err(e) => panic!("failed to spawn worker thread: {}", e),
        }
    }

    /// Construct with the given number of worker threads, failing if one can not be spawned
    ///
    /// Panics if `threads` is zero.
    pub fn try_new(threads: usize) -> io::Result<Self> {
        assert!(threads > 0, "thread pool needs at least one thread");
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                ready: VecDeque::new(),
                delayed: BinaryHeap::new(),
                next_seq: 0,
                busy: 0,
                stopping: false,
            }),
            cond: Condvar::new(),
            workers: DashMap::new(),
            threads,
        });
        let runner = ThreadPoolRunner { shared, handles: Mutex::new(Vec::with_capacity(threads)) };
        for i in 0..threads {
            let shared = Arc::clone(&runner.shared);
            let handle = thread::Builder::new()
                .name(format!("sluice-worker-{}", i))
                .spawn(move || work(shared))?;
            runner.handles.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
        }
        debug!(threads, "thread pool runner started");
        Ok(runner)
    }

    /// Number of worker threads
    pub fn threads(&self) -> usize {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Shut the runner down
    ///
    /// Pending executions, delayed or not, are dropped without running, and executions submitted
    /// afterwards are dropped right away. Blocking channel waits on the workers are interrupted.
    /// Executions already running are not stopped. Idempotent.
    pub fn shutdown(&self) {
        let (ready, delayed) = {
            let mut state = self.shared.lock();
            if state.stopping {
                return;
            }
            state.stopping = true;
            (std::mem::take(&mut state.ready), std::mem::take(&mut state.delayed))
        };
        self.shared.cond.notify_all();
        for entry in self.shared.workers.iter() {
            entry.value().trigger();
        }
        debug!(dropped = ready.len() + delayed.len(), "thread pool runner shutting down");
        // dropped outside the lock, since dropping executions may submit more work
        drop(ready);
        drop(delayed);
    }
}

impl Runner for ThreadPoolRunner {
    fn run(&self, execution: Execution, delay: Duration) {
        let mut state = self.shared.lock();
        if state.stopping {
            drop(state);
            trace!("execution submitted to stopped thread pool, dropping");
            drop(execution);
            return;
        }
        if delay.is_zero() {
            state.ready.push_back(execution);
        } else {
            let seq = state.next_seq;
            state.next_seq += 1;
            let deadline = Instant::now().checked_add(delay)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(60 * 60 * 24 * 365));
            state.delayed.push(Reverse(Delayed { deadline, seq, execution }));
        }
        drop(state);
        self.shared.cond.notify_one();
    }

    fn is_managed_thread(&self, thread: ThreadId) -> bool {
        self.shared.workers.contains_key(&thread)
    }

    fn has_capacity(&self) -> bool {
        // workers still starting up count as free
        let state = self.shared.lock();
        self.shared.threads.saturating_sub(state.busy) > state.ready.len()
    }

    fn interrupt_of(&self, thread: ThreadId) -> Option<Interrupt> {
        self.shared.workers.get(&thread).map(|entry| entry.value().clone())
    }
}

impl Drop for ThreadPoolRunner {
    fn drop(&mut self) {
        self.shutdown();
        let handles = std::mem::take(self.handles.get_mut().unwrap_or_else(PoisonError::into_inner));
        if self.is_managed_thread(thread::current().id()) {
            // can't join ourselves
            return;
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("thread pool worker exited by panic");
            }
        }
    }
}

// worker thread body.
fn work(shared: Arc<PoolShared>) {
    let me = thread::current().id();
    shared.workers.insert(me, Interrupt::new());

    let mut state = shared.lock();
    loop {
        if state.stopping {
            break;
        }

        // promote delayed executions which are due
        let now = Instant::now();
        while state.delayed.peek().is_some_and(|next| next.0.deadline <= now) {
            if let Some(Reverse(due)) = state.delayed.pop() {
                state.ready.push_back(due.execution);
            }
        }

        if let Some(execution) = state.ready.pop_front() {
            state.busy += 1;
            drop(state);
            run_isolated(execution);
            state = shared.lock();
            state.busy -= 1;
            continue;
        }

        // wait for work, or until the next delayed execution is due
        state = match state.delayed.peek().map(|next| next.0.deadline) {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(now);
                shared.cond.wait_timeout(state, timeout).unwrap_or_else(PoisonError::into_inner).0
            }
            None => shared.cond.wait(state).unwrap_or_else(PoisonError::into_inner),
        };
    }
    drop(state);
    shared.workers.remove(&me);
}

// run the execution, containing any panic.
fn run_isolated(execution: Execution) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| execution.run())) {
        let e = InvocationError::panicked(payload);
        warn!(%e, "execution panicked on thread pool worker");
    }
}
