// core of the channel: the shared state and the operations on it. the exposed API in the api
// module is a convenience wrapper around this.
//
// all state lives behind one mutex. anything which can run foreign code or lock another channel
// (consumers, ready hooks, abort propagation to peers) is collected into a Notice while locked and
// carried out by `notify` after the lock is released, so a thread never holds two channel locks.

use super::{
    api::Consumer,
    polling::{self, Blocked, Timeout},
    waiters::Waiters,
};
use crate::{
    backoff::Backoff,
    config::{ChannelConfig, OrderType},
    error::*,
    queue::{NestedQueue, QueueId},
    runner::{default_runner, Execution, RunnerRef},
};
use smallvec::SmallVec;
use std::{
    future::Future,
    mem::take,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    task::{Context, Poll},
    thread,
    time::{Duration, Instant},
};


// callback run whenever the channel changes in a way its reader could observe.
pub(crate) type Hook = Arc<dyn Fn() + Send + Sync>;

// type-erased channel, for abort propagation between channels of different element types.
pub(crate) trait Abortable: Send + Sync {
    // abort with the given cause. returns false if already aborted or completed.
    fn abort_with(&self, cause: &AbortError) -> bool;
}

type Peers = SmallVec<[Weak<dyn Abortable>; 2]>;

// channel shared state.
pub(crate) struct Shared<T> {
    // mutex around lockable state.
    lockable: Mutex<Lockable<T>>,

    // immutable configuration.
    pub(crate) order: OrderType,
    pub(crate) max_size: Option<usize>,
    pub(crate) backoff: Backoff,
    pub(crate) runner: RunnerRef,
}

// channel lockable state.
struct Lockable<T> {
    // storage for elements. the root queue is never closed; the channel state governs passing.
    queue: NestedQueue<T>,
    state: State,
    // delay applied to values passed from now on.
    delay: Duration,
    // number of values reserved but not yet in the queue: delayed values which have not landed,
    // plus one per channel feeding into this one.
    in_flight: usize,
    binding: Binding<T>,
    // queue of pending read futures.
    readers: Waiters,
    // queue of writers waiting out the backoff.
    writers: Waiters,
    hook: Option<Hook>,
    // channels to abort along with this one.
    peers: Peers,
    // number of live input handles.
    inputs: usize,
}

// lifecycle state. completion is derived: closed, nothing in flight and nothing queued.
enum State {
    Open,
    Closed,
    Aborted(AbortError),
}

enum Binding<T> {
    Unbound,
    // the consumer is taken out while a drainer is delivering to it, and dropped for good once
    // it was told the channel terminated.
    Bound {
        consumer: Option<Box<dyn Consumer<T>>>,
        done: bool,
    },
}

// result of trying to take the next element.
pub(crate) enum Take<T> {
    Value(T),
    // nothing available yet.
    Empty,
    Complete,
    Aborted(AbortError),
}

// side effects to carry out after releasing the lock.
#[must_use]
#[derive(Default)]
struct Notice {
    drain: bool,
    hook: Option<Hook>,
    peers: Peers,
    abort: Option<AbortError>,
}

impl<T> Lockable<T> {
    // values queued or reserved.
    fn pending(&self) -> usize {
        self.queue.len() + self.in_flight
    }

    fn is_complete(&self) -> bool {
        matches!(self.state, State::Closed) && self.in_flight == 0 && self.queue.is_empty()
    }

    fn is_bound(&self) -> bool {
        matches!(self.binding, Binding::Bound { .. })
    }

    fn abort_reason(&self) -> Option<&AbortError> {
        match &self.state {
            State::Aborted(abort) => Some(abort),
            _ => None,
        }
    }

    // error if passing is not possible.
    fn check_open(&self) -> Result<(), ChannelError> {
        match &self.state {
            State::Open => Ok(()),
            State::Closed => Err(ChannelError::Closed),
            State::Aborted(abort) => Err(abort.clone().into()),
        }
    }

    fn take(&mut self) -> Take<T> {
        if let Some(abort) = self.abort_reason() {
            return Take::Aborted(abort.clone());
        }
        if let Some(elem) = self.queue.remove_first() {
            // consumption may release writers waiting out the backoff
            self.writers.wake_all();
            Take::Value(elem)
        } else if self.is_complete() {
            Take::Complete
        } else {
            Take::Empty
        }
    }

    // add landed values, either to a reserved slot or the tail. the slot is closed if requested.
    fn fill<I>(&mut self, slot: Option<QueueId>, values: I, close: bool)
    where
        I: IntoIterator<Item = T>,
    {
        // slots only disappear when an abort clears the queue, in which case the values are
        // dropped along with everything else
        match slot {
            Some(id) => {
                if let Ok(mut nested) = self.queue.nested(id) {
                    let _ = nested.add_all(values);
                    if close {
                        nested.close();
                    }
                }
            }
            None => {
                let _ = self.queue.add_all(values);
            }
        }
    }

    // wake readers and collect what to notify after a change readers could observe.
    fn notice(&mut self) -> Notice {
        if self.is_complete() || self.abort_reason().is_some() {
            self.readers.wake_all();
        } else if self.queue.has_available() {
            self.readers.wake_front();
        }
        Notice { drain: self.is_bound(), hook: self.hook.clone(), ..Notice::default() }
    }
}

impl<T: Send + 'static> Shared<T> {
    // construct open channel with one input handle.
    pub(crate) fn new(config: &ChannelConfig) -> Arc<Self> {
        Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                queue: NestedQueue::new(),
                state: State::Open,
                delay: Duration::ZERO,
                in_flight: 0,
                binding: Binding::Unbound,
                readers: Waiters::new(),
                writers: Waiters::new(),
                hook: None,
                peers: Peers::new(),
                inputs: 1,
            }),
            order: config.order,
            max_size: config.max_size,
            backoff: config.backoff.clone(),
            runner: config.runner.clone().unwrap_or_else(default_runner),
        })
    }

    // lock the channel. callbacks never run under the lock, so poisoning can't leave the state
    // half-updated.
    fn lock(&self) -> MutexGuard<'_, Lockable<T>> {
        self.lockable.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // carry out a notice. must be called without the lock held.
    fn notify(&self, notice: Notice) {
        if notice.drain {
            self.drain();
        }
        if let Some(hook) = notice.hook {
            hook();
        }
        if let Some(abort) = notice.abort {
            for peer in notice.peers {
                if let Some(peer) = peer.upgrade() {
                    peer.abort_with(&abort);
                }
            }
        }
    }


    // ==== state ====


    pub(crate) fn is_open(&self) -> bool {
        matches!(self.lock().state, State::Open)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.lock().is_complete()
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.lock().is_bound()
    }

    pub(crate) fn abort_reason(&self) -> Option<AbortError> {
        self.lock().abort_reason().cloned()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.lock().pending()
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    // install or remove the ready hook. a newly installed hook is called once right away, so it
    // can't miss changes which happened before.
    pub(crate) fn set_hook(&self, hook: Option<Hook>) {
        let call = {
            let mut lock = self.lock();
            lock.hook = hook.clone();
            hook
        };
        if let Some(hook) = call {
            hook();
        }
    }

    pub(crate) fn add_input(&self) {
        self.lock().inputs += 1;
    }

    // an input handle was dropped. if it was the last one and the channel is still open, abort
    // or close it.
    pub(crate) fn drop_input(&self, abort_on_drop: bool) {
        let last_open = {
            let mut lock = self.lock();
            lock.inputs -= 1;
            lock.inputs == 0 && matches!(lock.state, State::Open)
        };
        if last_open {
            if abort_on_drop {
                trace!("last input handle dropped without closing, aborting");
                self.abort(AbortError::new(DroppedError));
            } else {
                self.close();
            }
        }
    }


    // ==== writing ====


    // pass values, honoring the backoff, maximum size, current delay and order.
    pub(crate) fn pass<I>(self: &Arc<Self>, values: I) -> Result<(), ChannelError>
    where
        I: IntoIterator<Item = T>,
    {
        let values = values.into_iter().collect::<SmallVec<[T; 1]>>();
        if values.is_empty() {
            return self.lock().check_open();
        }

        self.wait_backoff()?;

        let mut lock = self.lock();
        lock.check_open()?;
        let pending = lock.pending();
        if let Some(max_size) = self.max_size {
            if pending + values.len() > max_size {
                return Err(DeadlockError::BufferFull { pending, max_size }.into());
            }
        }

        let delay = lock.delay;
        if delay.is_zero() {
            trace!(count = values.len(), "passing values");
            lock.fill(None, values, false);
            let notice = lock.notice();
            drop(lock);
            self.notify(notice);
            return Ok(());
        }

        // delayed. reserve the position now if delivery is by call order, and land later.
        let slot = match self.order {
            OrderType::ByCall => Some(lock.queue.add_nested().map_err(|_| ChannelError::Closed)?),
            OrderType::ByDelay | OrderType::ByChance => None,
        };
        lock.in_flight += values.len();
        drop(lock);
        trace!(count = values.len(), ?delay, "passing values with delay");
        let landing = Landing { shared: Arc::clone(self), slot, values: Some(values) };
        self.runner.run(Execution::new(move || landing.land()), delay);
        Ok(())
    }

    // block while the backoff asks writers to wait, for at most the delay it gives.
    fn wait_backoff(&self) -> Result<(), ChannelError> {
        if self.backoff.is_no_delay() {
            return Ok(());
        }
        let pending = saturate(self.lock().pending());
        let Some(wait) = self.backoff.delay(pending) else { return Ok(()) };

        let timeout = Instant::now().checked_add(wait).map_or(Timeout::Never, Timeout::at);
        let interrupt = self.runner.interrupt_of(thread::current().id());
        let mut fut = BackoffWait { shared: self, key: None };
        match polling::block(&mut fut, timeout, interrupt.as_ref()) {
            Blocked::Interrupted(interrupt) => Err(InterruptedError::new(interrupt).into()),
            Blocked::Ready(()) | Blocked::TimedOut => Ok(()),
        }
    }

    // feed upstream's output into this channel.
    pub(crate) fn pass_from(self: &Arc<Self>, upstream: &Arc<Shared<T>>) -> Result<(), ChannelError> {
        assert!(!Arc::ptr_eq(self, upstream), "channel can not be fed from itself");
        let slot = {
            let mut lock = self.lock();
            lock.check_open()?;
            let slot = match self.order {
                OrderType::ByCall => Some(lock.queue.add_nested().map_err(|_| ChannelError::Closed)?),
                OrderType::ByDelay | OrderType::ByChance => None,
            };
            lock.in_flight += 1;
            slot
        };
        trace!("feeding channel from another channel");
        // on failure, the feed is dropped unfinished, which releases the reservation
        upstream.bind(Box::new(Feed { target: Arc::clone(self), slot, finished: false }))?;
        link(self, upstream);
        Ok(())
    }

    pub(crate) fn close(&self) {
        let mut lock = self.lock();
        if !matches!(lock.state, State::Open) {
            return;
        }
        trace!("channel closed");
        lock.state = State::Closed;
        lock.writers.wake_all();
        let notice = lock.notice();
        drop(lock);
        self.notify(notice);
    }

    // abort the channel and its peers. returns false if already aborted or completed.
    pub(crate) fn abort(&self, cause: AbortError) -> bool {
        let mut lock = self.lock();
        if lock.abort_reason().is_some() || lock.is_complete() {
            return false;
        }
        trace!(%cause, "channel aborted");
        lock.state = State::Aborted(cause.clone());
        lock.queue.clear();
        lock.in_flight = 0;
        lock.writers.wake_all();
        let mut notice = lock.notice();
        notice.peers = take(&mut lock.peers);
        notice.abort = Some(cause);
        drop(lock);
        self.notify(notice);
        true
    }

    // register a channel to abort along with this one. if this one is already aborted, the peer
    // is aborted right away.
    fn add_peer(&self, peer: Weak<dyn Abortable>) {
        let mut lock = self.lock();
        if let Some(abort) = lock.abort_reason().cloned() {
            drop(lock);
            if let Some(peer) = peer.upgrade() {
                peer.abort_with(&abort);
            }
            return;
        }
        lock.peers.retain(|peer| peer.strong_count() > 0);
        lock.peers.push(peer);
    }


    // ==== feeding and landing ====


    // add a value fed from an upstream channel.
    fn feed(&self, slot: Option<QueueId>, value: T) {
        let mut lock = self.lock();
        if lock.abort_reason().is_some() {
            return;
        }
        lock.fill(slot, Some(value), false);
        let notice = lock.notice();
        drop(lock);
        self.notify(notice);
    }

    // an upstream channel finished feeding.
    fn feed_done(&self, slot: Option<QueueId>) {
        let mut lock = self.lock();
        if lock.abort_reason().is_some() {
            return;
        }
        lock.fill(slot, None::<T>, true);
        lock.in_flight -= 1;
        let notice = lock.notice();
        drop(lock);
        self.notify(notice);
    }


    // ==== reading ====


    // take the next value without blocking, bypassing reader fairness.
    pub(crate) fn take(&self) -> Take<T> {
        self.lock().take()
    }

    // poll for the next value on behalf of the read future with the given waiter key.
    pub(crate) fn poll_next(
        &self,
        key: &mut Option<u64>,
        cx: &mut Context,
    ) -> Poll<Result<Option<T>, ChannelError>> {
        let mut lock = self.lock();
        let result = if lock.is_bound() {
            Err(ChannelError::Bound)
        } else if let Some(abort) = lock.abort_reason() {
            Err(abort.clone().into())
        } else if lock.is_complete() {
            Ok(None)
        } else {
            let me = *key.get_or_insert_with(|| lock.readers.push());
            if !lock.readers.is_front(me) {
                lock.readers.set_waker(me, cx.waker());
                return Poll::Pending;
            }
            match lock.take() {
                Take::Value(elem) => Ok(Some(elem)),
                Take::Complete => Ok(None),
                Take::Aborted(abort) => Err(abort.into()),
                Take::Empty => {
                    lock.readers.set_waker(me, cx.waker());
                    return Poll::Pending;
                }
            }
        };
        if let Some(me) = key.take() {
            lock.readers.remove(me);
            if lock.queue.has_available() {
                lock.readers.wake_front();
            }
        }
        Poll::Ready(result)
    }

    // a read future was dropped unresolved.
    pub(crate) fn cancel_next(&self, key: u64) {
        let mut lock = self.lock();
        if lock.readers.remove(key) && lock.queue.has_available() {
            lock.readers.wake_front();
        }
    }

    // bind the consumer, replaying whatever is buffered.
    pub(crate) fn bind(&self, consumer: Box<dyn Consumer<T>>) -> Result<(), ChannelError> {
        let mut lock = self.lock();
        if lock.is_bound() {
            return Err(ChannelError::AlreadyBound);
        }
        trace!("channel output bound");
        lock.binding = Binding::Bound { consumer: Some(consumer), done: false };
        // pending read futures resolve to Bound
        lock.readers.wake_all();
        drop(lock);
        self.drain();
        Ok(())
    }

    // deliver available values to the bound consumer.
    //
    // only one thread drains at a time: it takes the consumer out of the binding, and puts it
    // back under the lock once nothing more is available. a thread finding the consumer taken
    // can leave, since the drainer will see whatever it added before giving the consumer back.
    fn drain(&self) {
        let mut lock = self.lock();
        let mut consumer = match &mut lock.binding {
            Binding::Bound { consumer, done: false } => match consumer.take() {
                Some(consumer) => consumer,
                None => return,
            },
            _ => return,
        };
        loop {
            let take = lock.take();
            if let Take::Empty = take {
                if let Binding::Bound { consumer: slot, .. } = &mut lock.binding {
                    *slot = Some(consumer);
                }
                return;
            }
            let terminal = !matches!(take, Take::Value(_));
            if terminal {
                lock.binding = Binding::Bound { consumer: None, done: true };
            }
            drop(lock);

            let result = match take {
                Take::Value(elem) => guarded(|| consumer.on_output(elem)),
                Take::Complete => guarded(|| consumer.on_complete()),
                Take::Aborted(abort) => guarded(|| {
                    consumer.on_error(&abort);
                    Ok(())
                }),
                Take::Empty => unreachable!(),
            };
            match result {
                Err(e) if terminal => {
                    warn!(%e, "channel consumer failed after the channel terminated");
                }
                // aborting drains again, finding the consumer taken. the loop below delivers
                // the abort instead.
                Err(e) => {
                    self.abort(AbortError::new(e));
                }
                Ok(()) => (),
            }
            if terminal {
                return;
            }
            lock = self.lock();
        }
    }
}

impl<T: Send + 'static> Abortable for Shared<T> {
    fn abort_with(&self, cause: &AbortError) -> bool {
        self.abort(cause.clone())
    }
}

// link two channels so aborting either aborts the other.
pub(crate) fn link<A, B>(a: &Arc<Shared<A>>, b: &Arc<Shared<B>>)
where
    A: Send + 'static,
    B: Send + 'static,
{
    let peer_a: Arc<dyn Abortable> = a.clone();
    let peer_b: Arc<dyn Abortable> = b.clone();
    a.add_peer(Arc::downgrade(&peer_b));
    b.add_peer(Arc::downgrade(&peer_a));
}

// run a consumer callback, turning errors and panics into an invocation error.
fn guarded<F>(f: F) -> Result<(), InvocationError>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result.map_err(InvocationError::new),
        Err(payload) => {
            let e = InvocationError::panicked(payload);
            warn!(%e, "channel consumer panicked");
            Err(e)
        }
    }
}

fn saturate(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}


// ==== delayed values ====


// delayed values on their way to the channel. if dropped before landing, which happens when the
// runner discards the execution, the channel is aborted.
struct Landing<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    slot: Option<QueueId>,
    values: Option<SmallVec<[T; 1]>>,
}

impl<T: Send + 'static> Landing<T> {
    fn land(mut self) {
        let Some(values) = self.values.take() else { return };
        let mut lock = self.shared.lock();
        if lock.abort_reason().is_some() {
            return;
        }
        trace!(count = values.len(), "delayed values landed");
        lock.in_flight -= values.len();
        lock.fill(self.slot, values, true);
        let notice = lock.notice();
        drop(lock);
        self.shared.notify(notice);
    }
}

impl<T: Send + 'static> Drop for Landing<T> {
    fn drop(&mut self) {
        if self.values.is_some() {
            debug!("delayed values discarded by runner, aborting channel");
            self.shared.abort(AbortError::new(RunnerError::Shutdown));
        }
    }
}


// ==== feeding ====


// consumer feeding one channel's output into another channel.
struct Feed<T: Send + 'static> {
    target: Arc<Shared<T>>,
    slot: Option<QueueId>,
    finished: bool,
}

impl<T: Send + 'static> Consumer<T> for Feed<T> {
    fn on_output(&mut self, value: T) -> anyhow::Result<()> {
        self.target.feed(self.slot, value);
        Ok(())
    }

    fn on_complete(&mut self) -> anyhow::Result<()> {
        self.finished = true;
        self.target.feed_done(self.slot);
        Ok(())
    }

    fn on_error(&mut self, abort: &AbortError) {
        self.finished = true;
        self.target.abort(abort.clone());
    }
}

impl<T: Send + 'static> Drop for Feed<T> {
    fn drop(&mut self) {
        if !self.finished {
            self.target.feed_done(self.slot);
        }
    }
}


// ==== backoff wait ====


// future resolving once the backoff no longer asks writers to wait, or the channel can no longer
// be passed into.
struct BackoffWait<'a, T> {
    shared: &'a Shared<T>,
    key: Option<u64>,
}

impl<'a, T: Send + 'static> Future for BackoffWait<'a, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let this = self.get_mut();
        let mut lock = this.shared.lock();
        let released = !matches!(lock.state, State::Open)
            || this.shared.backoff.delay(saturate(lock.pending())).is_none();
        if released {
            if let Some(key) = this.key.take() {
                lock.writers.remove(key);
            }
            return Poll::Ready(());
        }
        let key = *this.key.get_or_insert_with(|| lock.writers.push());
        lock.writers.set_waker(key, cx.waker());
        Poll::Pending
    }
}

impl<'a, T> Drop for BackoffWait<'a, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.shared.lockable.lock().unwrap_or_else(PoisonError::into_inner).writers.remove(key);
        }
    }
}
