// blocking layer over the channel's futures.
//
// design based on pollster crate: the future is polled with a waker which signals a mutex +
// condvar, and the thread blocks on the condvar between polls. on top of that, waits can have a
// deadline or be non-blocking, and can be cut short by a runner thread's interrupt.

use crate::runner::Interrupt;
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Wake, Waker},
    time::Instant,
};


// timeout for blocking on a future.
#[derive(Debug, Copy, Clone)]
pub(crate) enum Timeout {
    // never time out.
    Never,
    // time out at the given deadline.
    At(Instant),
    // time out if the future cannot be resolved without blocking.
    NonBlocking,
}

impl Timeout {
    // deadline, or non-blocking if the deadline is already in the past.
    pub(crate) fn at(deadline: Instant) -> Self {
        if deadline <= Instant::now() {
            Timeout::NonBlocking
        } else {
            Timeout::At(deadline)
        }
    }
}

// how a blocking wait ended.
#[derive(Debug)]
pub(crate) enum Blocked<T> {
    Ready(T),
    TimedOut,
    // the interrupt was triggered. it has been cleared.
    Interrupted(Interrupt),
}

// poll the future until it resolves, the timeout is reached, or the interrupt is triggered.
//
// the future is left unresolved in the latter two cases. it is up to the future to unregister
// the waker it was polled with when dropped.
pub(crate) fn block<F>(fut: &mut F, timeout: Timeout, interrupt: Option<&Interrupt>) -> Blocked<F::Output>
where
    F: Future + Unpin,
{
    let signal = Arc::new(Signal {
        state: Mutex::new(State::Empty),
        cond: Condvar::new(),
    });
    let waker = Waker::from(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);

    if let Some(interrupt) = interrupt {
        interrupt.register(&waker);
    }
    let blocked = block_inner(fut, &signal, &mut cx, timeout, interrupt);
    if let Some(interrupt) = interrupt {
        interrupt.unregister();
    }
    blocked
}

fn block_inner<F>(
    fut: &mut F,
    signal: &Signal,
    cx: &mut Context,
    timeout: Timeout,
    interrupt: Option<&Interrupt>,
) -> Blocked<F::Output>
where
    F: Future + Unpin,
{
    loop {
        // return if ready
        if let Poll::Ready(output) = Pin::new(&mut *fut).poll(cx) {
            return Blocked::Ready(output);
        }

        // return if interrupted. the interrupt wakes the signal, so this can't be missed.
        if let Some(interrupt) = interrupt {
            if interrupt.clear() {
                return Blocked::Interrupted(interrupt.clone());
            }
        }

        // otherwise, block until notification or timeout
        let mut lock = signal.lock();

        // if a notification is already present, skip to the next loop iteration so as to release
        // the lock and try polling again without blocking.
        if let State::Notified = *lock {
            *lock = State::Empty;
            continue;
        }

        debug_assert!(matches!(*lock, State::Empty));
        *lock = State::Waiting;
        match timeout {
            // block on mutex + condvar indefinitely
            Timeout::Never =>
                while let State::Waiting = *lock {
                    lock = signal.cond.wait(lock).unwrap_or_else(PoisonError::into_inner);
                },

            // block on mutex + condvar until deadline, at which point time out
            Timeout::At(deadline) =>
                while let State::Waiting = *lock {
                    let Some(duration) = deadline.checked_duration_since(Instant::now())
                        else { return Blocked::TimedOut };
                    let (lock2, wait_result) = signal.cond.wait_timeout(lock, duration)
                        .unwrap_or_else(PoisonError::into_inner);
                    lock = lock2;
                    if wait_result.timed_out() && matches!(*lock, State::Waiting) {
                        return Blocked::TimedOut;
                    }
                },

            // dont block on mutex + condvar, time out instead
            Timeout::NonBlocking => return Blocked::TimedOut,
        }
        *lock = State::Empty;
    }
}

// synchronization signal state
enum State {
    Empty,
    Waiting,
    Notified,
}

// synchronization signal
struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}

impl Signal {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut lock = self.lock();
        match *lock {
            State::Notified => (),
            State::Empty => {
                *lock = State::Notified;
            }
            State::Waiting => {
                *lock = State::Empty;
                self.cond.notify_one();
            }
        }
    }
}
