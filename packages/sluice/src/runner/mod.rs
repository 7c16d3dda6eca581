//! Runners, which decide on which thread and when executions happen.
//!
//! Routines hand each step of an invocation to a [`Runner`], and channels hand it the landing of
//! delayed values. Three runners are provided:
//!
//! - [`SyncRunner`] runs executions on the calling thread.
//! - [`ThreadPoolRunner`] runs them on a fixed set of worker threads.
//! - [`TokioRunner`] runs them on the blocking pool of a tokio runtime.
//!
//! A runner which owns threads also answers whether blocking one of its threads could deadlock,
//! see [`Runner::would_deadlock`].

use std::{
    fmt::{self, Debug, Formatter},
    hash::{Hash, Hasher},
    num::NonZeroUsize,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        OnceLock,
        PoisonError,
    },
    task::Waker,
    thread::{self, ThreadId},
    time::Duration,
};

mod sync;
mod pool;
mod runtime;

pub use self::{
    sync::SyncRunner,
    pool::ThreadPoolRunner,
    runtime::TokioRunner,
};


/// Unit of work handed to a [`Runner`]
///
/// Dropping an execution without running it is how a runner discards work. Executions clean up
/// after themselves when dropped, for example by aborting the channel a delayed value was headed
/// for.
pub struct Execution(Box<dyn FnOnce() + Send>);

impl Execution {
    /// Wrap a closure
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Execution(Box::new(f))
    }

    /// Run the execution on the current thread
    pub fn run(self) {
        (self.0)()
    }
}

impl Debug for Execution {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("Execution(..)")
    }
}


/// Something which runs executions
pub trait Runner: Send + Sync + 'static {
    /// Run the execution after the given delay
    ///
    /// A zero delay means as soon as possible. Must not panic; work the runner can not accept is
    /// dropped.
    fn run(&self, execution: Execution, delay: Duration);

    /// Whether the given thread is one of this runner's own threads
    fn is_managed_thread(&self, thread: ThreadId) -> bool {
        let _ = thread;
        false
    }

    /// Whether this runner has a thread free to start new executions right away
    fn has_capacity(&self) -> bool {
        true
    }

    /// The interrupt signal of the given thread, if it is one of this runner's own threads
    fn interrupt_of(&self, thread: ThreadId) -> Option<Interrupt> {
        let _ = thread;
        None
    }

    /// Whether blocking the given thread to wait for work this runner has yet to run could
    /// deadlock
    fn would_deadlock(&self, thread: ThreadId) -> bool {
        self.is_managed_thread(thread) && !self.has_capacity()
    }
}


/// Shared handle to a [`Runner`]
///
/// Compares and hashes by identity, so that configurations holding a runner can be compared.
#[derive(Clone)]
pub struct RunnerRef(Arc<dyn Runner>);

impl RunnerRef {
    /// Wrap a runner
    pub fn new<R: Runner>(runner: R) -> Self {
        RunnerRef(Arc::new(runner))
    }

    /// Wrap an already shared runner
    pub fn from_arc(runner: Arc<dyn Runner>) -> Self {
        RunnerRef(runner)
    }

    // thin pointer, for identity.
    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl Deref for RunnerRef {
    type Target = dyn Runner;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl<R: Runner> From<R> for RunnerRef {
    fn from(runner: R) -> Self {
        RunnerRef::new(runner)
    }
}

impl PartialEq for RunnerRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for RunnerRef {}

impl Hash for RunnerRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl Debug for RunnerRef {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "RunnerRef({:p})", self.addr())
    }
}


// process-wide synchronous runner. stateless, so one instance serves every sync invocation.
pub(crate) fn sync_runner() -> RunnerRef {
    static SYNC: OnceLock<RunnerRef> = OnceLock::new();
    SYNC.get_or_init(|| RunnerRef::new(SyncRunner)).clone()
}

// process-wide pool for channels and routines configured without a runner. one thread per
// available core, and never fewer than two.
pub(crate) fn default_runner() -> RunnerRef {
    static DEFAULT: OnceLock<RunnerRef> = OnceLock::new();
    DEFAULT
        .get_or_init(|| {
            let threads = thread::available_parallelism().map_or(2, NonZeroUsize::get).max(2);
            debug!(%threads, "starting default runner");
            RunnerRef::new(ThreadPoolRunner::new(threads))
        })
        .clone()
}


/// Interrupt signal of a runner thread
///
/// Triggering an interrupt makes the current or next blocking channel wait on that thread fail
/// with [`InterruptedError`](crate::error::InterruptedError). Detecting the interrupt clears it.
#[derive(Clone, Default)]
pub struct Interrupt(Arc<InterruptInner>);

#[derive(Default)]
struct InterruptInner {
    triggered: AtomicBool,
    // waker of the blocking wait in progress on the thread, if any.
    waker: Mutex<Option<Waker>>,
}

impl Interrupt {
    /// Construct untriggered
    pub fn new() -> Self {
        Interrupt::default()
    }

    /// Trigger the interrupt, waking a blocking wait in progress
    pub fn trigger(&self) {
        self.0.triggered.store(true, Ordering::SeqCst);
        let waker = self.0.waker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Whether the interrupt is triggered
    pub fn is_triggered(&self) -> bool {
        self.0.triggered.load(Ordering::SeqCst)
    }

    /// Clear the interrupt, returning whether it was triggered
    pub fn clear(&self) -> bool {
        self.0.triggered.swap(false, Ordering::SeqCst)
    }

    // register the waker of a blocking wait about to start.
    pub(crate) fn register(&self, waker: &Waker) {
        *self.0.waker.lock().unwrap_or_else(PoisonError::into_inner) = Some(waker.clone());
    }

    // unregister after the blocking wait ends.
    pub(crate) fn unregister(&self) {
        self.0.waker.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl Debug for Interrupt {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Interrupt").field("triggered", &self.is_triggered()).finish()
    }
}
