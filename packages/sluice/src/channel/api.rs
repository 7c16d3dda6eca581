// exposed API of channels

use self::future::*;
use super::{
    core::{self, Shared},
    polling::Timeout,
};
use crate::{
    config::{ChannelConfig, TimeoutAction},
    error::*,
};
use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
    time::{Duration, Instant},
};


/// Create a channel
///
/// The channel is open, unbound, and lands delayed values on the configured runner.
pub fn channel<T>(config: ChannelConfig) -> (InputChannel<T>, OutputChannel<T>)
where
    T: Send + 'static,
{
    let shared = Shared::new(&config);
    let input = InputChannel { shared: Arc::clone(&shared), abort_on_drop: true };
    let output = OutputChannel::new(shared, &config);
    (input, output)
}


/// Receiver of a channel's output, see [`OutputChannel::bind`]
///
/// Callbacks run on whichever thread makes output available, never concurrently, and never with
/// the channel locked. An error returned from a callback, or a panic escaping it, aborts the
/// channel with an [`InvocationError`].
pub trait Consumer<T>: Send + 'static {
    /// Called with each output value, in delivery order
    fn on_output(&mut self, value: T) -> anyhow::Result<()>;

    /// Called once after the last value, when the channel completes
    fn on_complete(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once if the channel is aborted
    fn on_error(&mut self, abort: &AbortError) {
        let _ = abort;
    }
}


/// Input side of a channel
///
/// Cloning an input handle gives another handle to the same channel. Once the last input handle
/// is dropped, an open channel is aborted with [`DroppedError`], unless
/// [`abort_on_drop`](Self::set_abort_on_drop) was disabled, in which case it is closed.
pub struct InputChannel<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    abort_on_drop: bool,
}

impl<T: Send + 'static> InputChannel<T> {
    /// Pass a value into the channel
    ///
    /// The value is delayed by the channel's current delay, see [`after`](Self::after). If the
    /// channel's backoff asks writers to wait at the current number of pending values, this blocks
    /// for up to the backoff delay or until enough values are consumed. Passing a value beyond the
    /// channel's maximum size then fails with [`DeadlockError::BufferFull`].
    pub fn pass(&self, value: T) -> Result<&Self, ChannelError> {
        self.shared.pass(Some(value))?;
        Ok(self)
    }

    /// Pass all values of an iterator into the channel, as one
    pub fn pass_all<I>(&self, values: I) -> Result<&Self, ChannelError>
    where
        I: IntoIterator<Item = T>,
    {
        self.shared.pass(values)?;
        Ok(self)
    }

    /// Feed another channel's output into this channel
    ///
    /// Binds `output`, so it fails with [`ChannelError::AlreadyBound`] if `output` is already
    /// bound. Under [`OrderType::ByCall`](crate::OrderType::ByCall), the fed values take the
    /// position of this call. This channel does not complete before `output` does, and aborting
    /// either channel aborts the other. Not subject to the delay.
    pub fn pass_from(&self, output: &OutputChannel<T>) -> Result<&Self, ChannelError> {
        self.shared.pass_from(&output.shared)?;
        Ok(self)
    }

    /// Delay values passed from now on
    ///
    /// The delay is a property of the channel, shared by all input handles.
    pub fn after(&self, delay: Duration) -> &Self {
        self.shared.set_delay(delay);
        self
    }

    /// Stop delaying values passed from now on
    pub fn now(&self) -> &Self {
        self.after(Duration::ZERO)
    }

    /// Close the channel to further input
    ///
    /// Values already passed, delayed or fed are still delivered. Idempotent, and does nothing to
    /// an aborted channel.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Abort the channel with the given cause
    ///
    /// Pending values are discarded, and readers, writers and linked channels fail with the
    /// abort. Returns false if the channel had already been aborted or completed.
    pub fn abort<E>(&self, cause: E) -> bool
    where
        E: Into<anyhow::Error>,
    {
        self.shared.abort(AbortError::new(cause))
    }

    /// Abort the channel with [`CancelledError`]
    pub fn cancel(&self) -> bool {
        self.abort(CancelledError)
    }

    /// Whether values can still be passed
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// If the channel was aborted, the abort
    pub fn abort_reason(&self) -> Option<AbortError> {
        self.shared.abort_reason()
    }

    /// Number of values queued or on their way
    pub fn pending_len(&self) -> usize {
        self.shared.pending_len()
    }

    /// Set whether dropping this handle, if it is the last, aborts an open channel
    ///
    /// Defaults to true. If set to false, the channel is closed instead. Clones inherit the
    /// setting, but it is a property of individual handles.
    pub fn set_abort_on_drop(&mut self, abort_on_drop: bool) -> &mut Self {
        self.abort_on_drop = abort_on_drop;
        self
    }

    /// Ownership-chaining version of [`set_abort_on_drop`](Self::set_abort_on_drop)
    pub fn with_abort_on_drop(mut self, abort_on_drop: bool) -> Self {
        self.abort_on_drop = abort_on_drop;
        self
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<T>> {
        &self.shared
    }
}

impl<T: Send + 'static> Clone for InputChannel<T> {
    fn clone(&self) -> Self {
        self.shared.add_input();
        InputChannel { shared: Arc::clone(&self.shared), abort_on_drop: self.abort_on_drop }
    }
}

impl<T: Send + 'static> Drop for InputChannel<T> {
    fn drop(&mut self) {
        self.shared.drop_input(self.abort_on_drop);
    }
}

impl<T: Send + 'static> Debug for InputChannel<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("InputChannel")
            .field("open", &self.is_open())
            .field("pending", &self.pending_len())
            .finish()
    }
}


/// Output side of a channel
///
/// Output is either read from this handle, or delivered to a consumer it was bound to, but not
/// both. Blocking reads wait for at most the read timeout, after which the timeout action
/// applies. A blocking read on a thread of the channel's runner, while that runner has no spare
/// capacity, fails right away with [`DeadlockError::Runner`] unless output is already available.
pub struct OutputChannel<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    read_timeout: Duration,
    timeout_action: TimeoutAction,
    #[cfg(feature = "futures")]
    stream: stream::StreamState<T>,
}

impl<T: Send + 'static> OutputChannel<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>, config: &ChannelConfig) -> Self {
        OutputChannel {
            shared,
            read_timeout: config.read_timeout,
            timeout_action: config.timeout_action,
            #[cfg(feature = "futures")]
            stream: Default::default(),
        }
    }

    /// Read the next value
    ///
    /// Returns `Ok(None)` once the channel completed, or if the read timed out with
    /// [`TimeoutAction::Exit`].
    pub fn next(&self) -> Result<Option<T>, ChannelError> {
        match self.recv().block_with(self.timeout()) {
            Err(ChannelError::WouldBlock) => self.timed_out().map(|()| None),
            result => result,
        }
    }

    /// Read all values until the channel completes
    ///
    /// The read timeout applies to the whole read. With [`TimeoutAction::Exit`], a timed out read
    /// returns the values read so far.
    pub fn all(&self) -> Result<Vec<T>, ChannelError> {
        let mut values = Vec::new();
        self.all_into(&mut values)?;
        Ok(values)
    }

    /// Read all values until the channel completes, into the given collection
    ///
    /// Values read before a failure stay in the collection.
    pub fn all_into<C>(&self, into: &mut C) -> Result<&Self, ChannelError>
    where
        C: Extend<T>,
    {
        let timeout = self.timeout();
        loop {
            match self.recv().block_with(timeout) {
                Ok(Some(value)) => into.extend(Some(value)),
                Ok(None) => return Ok(self),
                Err(ChannelError::WouldBlock) => {
                    self.timed_out()?;
                    return Ok(self);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Iterate over values as [`next`](Self::next) reads them
    ///
    /// The iterator ends when the channel completes, or after yielding the first error.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { output: self, done: false }
    }

    /// Read and discard up to `count` values, returning how many were skipped
    pub fn skip_next(&self, count: usize) -> Result<usize, ChannelError> {
        for skipped in 0..count {
            if self.next()?.is_none() {
                return Ok(skipped);
            }
        }
        Ok(count)
    }

    /// Create a future to read the next value
    ///
    /// See the API of [`NextFut`], as it is not only a future, but also provides additional
    /// methods, including the API for blocking with an explicit timeout or reading immediately.
    pub fn recv(&self) -> NextFut<T> {
        NextFut::new(Arc::clone(&self.shared))
    }

    /// Bind the output to a consumer
    ///
    /// Values already buffered are delivered right away, on the calling thread. Fails with
    /// [`ChannelError::AlreadyBound`] if already bound. Reading from this handle fails with
    /// [`ChannelError::Bound`] afterwards.
    pub fn bind<C>(&self, consumer: C) -> Result<&Self, ChannelError>
    where
        C: Consumer<T>,
    {
        self.shared.bind(Box::new(consumer))?;
        Ok(self)
    }

    /// Bind the output to another channel's input, see [`InputChannel::pass_from`]
    pub fn pipe_to(&self, input: &InputChannel<T>) -> Result<&Self, ChannelError> {
        input.pass_from(self)?;
        Ok(self)
    }

    /// Abort the channel with the given cause, see [`InputChannel::abort`]
    pub fn abort<E>(&self, cause: E) -> bool
    where
        E: Into<anyhow::Error>,
    {
        self.shared.abort(AbortError::new(cause))
    }

    /// Whether the channel was closed and all its values were delivered
    pub fn is_complete(&self) -> bool {
        self.shared.is_complete()
    }

    /// Whether the output was bound to a consumer
    pub fn is_bound(&self) -> bool {
        self.shared.is_bound()
    }

    /// If the channel was aborted, the abort
    pub fn abort_reason(&self) -> Option<AbortError> {
        self.shared.abort_reason()
    }

    /// Number of values queued or on their way
    pub fn pending_len(&self) -> usize {
        self.shared.pending_len()
    }

    /// Set how long blocking reads on this handle wait for output
    pub fn set_read_timeout(&mut self, read_timeout: Duration) -> &mut Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Ownership-chaining version of [`set_read_timeout`](Self::set_read_timeout)
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Set what blocking reads on this handle do when the read timeout elapses
    pub fn set_timeout_action(&mut self, timeout_action: TimeoutAction) -> &mut Self {
        self.timeout_action = timeout_action;
        self
    }

    /// Ownership-chaining version of [`set_timeout_action`](Self::set_timeout_action)
    pub fn with_timeout_action(mut self, timeout_action: TimeoutAction) -> Self {
        self.timeout_action = timeout_action;
        self
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<T>> {
        &self.shared
    }

    // take the next value without blocking, for invocation executions.
    pub(crate) fn take(&self) -> core::Take<T> {
        self.shared.take()
    }

    // timeout for a read starting now.
    fn timeout(&self) -> Timeout {
        if self.read_timeout.is_zero() {
            Timeout::NonBlocking
        } else {
            Instant::now().checked_add(self.read_timeout).map_or(Timeout::Never, Timeout::at)
        }
    }

    // apply the timeout action.
    fn timed_out(&self) -> Result<(), ChannelError> {
        let cause = DeadlockError::ReadTimeout { timeout: self.read_timeout };
        match self.timeout_action {
            TimeoutAction::Exit => Ok(()),
            TimeoutAction::Abort => {
                debug!(timeout = ?self.read_timeout, "read timed out, aborting channel");
                let abort = AbortError::new(cause);
                self.shared.abort(abort.clone());
                Err(self.shared.abort_reason().unwrap_or(abort).into())
            }
            TimeoutAction::Deadlock => Err(cause.into()),
        }
    }
}

impl<T: Send + 'static> Debug for OutputChannel<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("OutputChannel")
            .field("complete", &self.is_complete())
            .field("bound", &self.is_bound())
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl<'a, T: Send + 'static> IntoIterator for &'a OutputChannel<T> {
    type Item = Result<T, ChannelError>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}


/// Iterator over an [`OutputChannel`], see [`OutputChannel::iter`]
pub struct Iter<'a, T: Send + 'static> {
    output: &'a OutputChannel<T>,
    done: bool,
}

impl<'a, T: Send + 'static> Iterator for Iter<'a, T> {
    type Item = Result<T, ChannelError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.output.next() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}


// future types for channels.
pub(crate) mod future {
    use super::*;
    use crate::channel::polling::{block, Blocked};
    use std::{
        future::Future,
        pin::Pin,
        task::{Context, Poll},
        thread,
    };

    /// Future for reading from an [`OutputChannel`]
    ///
    /// Resolves to `Ok(None)` once the channel completed. A value is not taken from the channel
    /// until this future resolves. Read futures take values in the order they were first polled,
    /// so a future which is polled and then held for an extended period blocks the ones after it.
    pub struct NextFut<T: Send + 'static> {
        shared: Arc<Shared<T>>,
        // key in the channel's reader queue, once polled.
        key: Option<u64>,
        terminated: bool,
    }

    impl<T: Send + 'static> NextFut<T> {
        pub(crate) fn new(shared: Arc<Shared<T>>) -> Self {
            NextFut { shared, key: None, terminated: false }
        }

        /// Try to resolve this future immediately without blocking
        ///
        /// Calling this method counts as polling this future, and if this method returns anything
        /// other than [`ChannelError::WouldBlock`], that counts as this future resolving. This
        /// method will panic if this future has already resolved.
        pub fn try_now(&mut self) -> Result<Option<T>, ChannelError> {
            assert!(!self.is_terminated(), "NextFut.try_now called after terminated");
            self.block_with(Timeout::NonBlocking)
        }

        /// Block until this future resolves
        ///
        /// Fails with [`ChannelError::Interrupted`] if the runner owning this thread interrupts
        /// it, and with [`DeadlockError::Runner`] if blocking could deadlock. This method will
        /// panic if this future has already resolved.
        pub fn block(&mut self) -> Result<Option<T>, ChannelError> {
            assert!(!self.is_terminated(), "NextFut.block called after terminated");
            self.block_with(Timeout::Never)
        }

        /// Block until this future resolves or a timeout elapses
        ///
        /// Returns [`ChannelError::WouldBlock`] if the timeout elapses first. This method will
        /// panic if this future has already resolved.
        pub fn block_timeout(&mut self, timeout: Duration) -> Result<Option<T>, ChannelError> {
            assert!(!self.is_terminated(), "NextFut.block_timeout called after terminated");
            let timeout = Instant::now().checked_add(timeout).map_or(Timeout::Never, Timeout::at);
            self.block_with(timeout)
        }

        /// Block until this future resolves or the deadline is reached
        ///
        /// Returns [`ChannelError::WouldBlock`] if the deadline is reached first. This method
        /// will panic if this future has already resolved.
        pub fn block_deadline(&mut self, deadline: Instant) -> Result<Option<T>, ChannelError> {
            assert!(!self.is_terminated(), "NextFut.block_deadline called after terminated");
            self.block_with(Timeout::at(deadline))
        }

        /// Whether this future has already resolved
        pub fn is_terminated(&self) -> bool {
            self.terminated
        }

        pub(crate) fn block_with(&mut self, timeout: Timeout) -> Result<Option<T>, ChannelError> {
            // resolve without blocking if possible, and without consuming an interrupt
            let first = match timeout {
                Timeout::NonBlocking => timeout,
                Timeout::Never | Timeout::At(_) => Timeout::NonBlocking,
            };
            if let Blocked::Ready(result) = block(self, first, None) {
                return result;
            }
            if let Timeout::NonBlocking = timeout {
                return Err(ChannelError::WouldBlock);
            }

            let me = thread::current().id();
            if self.shared.runner.would_deadlock(me) {
                self.resolve();
                return Err(DeadlockError::Runner.into());
            }
            let interrupt = self.shared.runner.interrupt_of(me);
            match block(self, timeout, interrupt.as_ref()) {
                Blocked::Ready(result) => result,
                Blocked::TimedOut => Err(ChannelError::WouldBlock),
                Blocked::Interrupted(interrupt) => {
                    self.resolve();
                    Err(InterruptedError::new(interrupt).into())
                }
            }
        }

        // terminate without a value, leaving the reader queue.
        fn resolve(&mut self) {
            self.terminated = true;
            if let Some(key) = self.key.take() {
                self.shared.cancel_next(key);
            }
        }
    }

    impl<T: Send + 'static> Future for NextFut<T> {
        type Output = Result<Option<T>, ChannelError>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            // for implementation of FusedFuture
            if this.terminated {
                return Poll::Pending;
            }
            let poll = this.shared.poll_next(&mut this.key, cx);
            if poll.is_ready() {
                this.terminated = true;
            }
            poll
        }
    }

    #[cfg(feature = "futures")]
    impl<T: Send + 'static> futures::future::FusedFuture for NextFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }

    impl<T: Send + 'static> Drop for NextFut<T> {
        fn drop(&mut self) {
            if let Some(key) = self.key.take() {
                self.shared.cancel_next(key);
            }
        }
    }
}


// stream adapter for output channels.
#[cfg(feature = "futures")]
mod stream {
    use super::*;
    use std::{
        future::Future,
        pin::Pin,
        task::{Context, Poll},
    };

    // read future carried between polls, so the reader keeps its place in the queue.
    pub(super) struct StreamState<T: Send + 'static> {
        next: Option<NextFut<T>>,
        ended: bool,
    }

    impl<T: Send + 'static> Default for StreamState<T> {
        fn default() -> Self {
            StreamState { next: None, ended: false }
        }
    }

    impl<T: Send + 'static> futures::Stream for OutputChannel<T> {
        type Item = Result<T, ChannelError>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
            let this = self.get_mut();
            if this.stream.ended {
                return Poll::Ready(None);
            }
            let shared = &this.shared;
            let next = this.stream.next.get_or_insert_with(|| NextFut::new(Arc::clone(shared)));
            let Poll::Ready(result) = Pin::new(next).poll(cx) else { return Poll::Pending };
            this.stream.next = None;
            Poll::Ready(match result {
                Ok(Some(value)) => Some(Ok(value)),
                Ok(None) => {
                    this.stream.ended = true;
                    None
                }
                Err(e) => {
                    this.stream.ended = true;
                    Some(Err(e))
                }
            })
        }
    }

    impl<T: Send + 'static> futures::stream::FusedStream for OutputChannel<T> {
        fn is_terminated(&self) -> bool {
            self.stream.ended
        }
    }
}


// ==== tests ====


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backoff::Backoff,
        config::OrderType,
        runner::{Execution, RunnerRef, ThreadPoolRunner},
    };
    use std::{sync::mpsc, thread};

    fn config() -> ChannelConfig {
        ChannelConfig::default().with_read_timeout(Duration::from_secs(5))
    }

    // consumer forwarding everything to a std channel.
    struct Forward(mpsc::Sender<Result<Option<i32>, String>>);

    impl Consumer<i32> for Forward {
        fn on_output(&mut self, value: i32) -> anyhow::Result<()> {
            self.0.send(Ok(Some(value)))?;
            Ok(())
        }

        fn on_complete(&mut self) -> anyhow::Result<()> {
            self.0.send(Ok(None))?;
            Ok(())
        }

        fn on_error(&mut self, abort: &AbortError) {
            let _ = self.0.send(Err(abort.cause().to_string()));
        }
    }

    #[test]
    fn basic_1000_test() {
        let (input, output) = channel(config());
        let join = thread::spawn(move || {
            for i in 1..=1000 {
                input.pass(i).unwrap();
                if i < 1000 && i % 100 == 0 {
                    thread::sleep(Duration::from_millis(10));
                }
            }
            input.close();
        });
        for i in 1..=1000 {
            assert_eq!(output.next().unwrap(), Some(i));
        }
        assert_eq!(output.next().unwrap(), None);
        assert!(output.is_complete());
        join.join().unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let (input, output) = channel(config());
        input.pass_all(vec![1, 2]).unwrap().pass(3).unwrap();
        input.close();
        input.close();
        assert!(!input.is_open());
        assert!(matches!(input.pass(4), Err(ChannelError::Closed)));
        assert_eq!(output.all().unwrap(), [1, 2, 3]);
        assert!(!input.abort(anyhow::anyhow!("too late")));
    }

    #[test]
    fn abort_fails_reads_with_cause() {
        let (input, output) = channel::<i32>(config());
        input.pass(1).unwrap();
        assert!(input.abort(anyhow::anyhow!("test")));
        assert!(!input.cancel());
        let err = output.next().unwrap_err();
        assert_eq!(err.abort().unwrap().cause().to_string(), "test");
        assert_eq!(output.pending_len(), 0);
        assert!(matches!(input.pass(2), Err(ChannelError::Aborted(_))));
        assert_eq!(input.abort_reason().unwrap().cause().to_string(), "test");
    }

    #[test]
    fn abort_wakes_blocked_reader() {
        let (input, output) = channel::<i32>(config());
        let join = thread::spawn(move || output.next());
        thread::sleep(Duration::from_millis(20));
        input.cancel();
        let err = join.join().unwrap().unwrap_err();
        assert!(err.abort().unwrap().is_cancelled());
    }

    #[test]
    fn timeout_actions() {
        let (_input, output) = channel::<i32>(ChannelConfig::default()
            .with_read_timeout(Duration::from_millis(10))
            .with_timeout_action(TimeoutAction::Exit));
        assert_eq!(output.next().unwrap(), None);
        assert!(output.all().unwrap().is_empty());

        let (_input, output) = channel::<i32>(ChannelConfig::default()
            .with_read_timeout(Duration::from_millis(10)));
        assert!(matches!(
            output.next(),
            Err(ChannelError::Deadlock(DeadlockError::ReadTimeout { .. })),
        ));

        let (input, output) = channel::<i32>(ChannelConfig::default()
            .with_timeout_action(TimeoutAction::Abort));
        let err = output.all().unwrap_err();
        let abort = err.abort().unwrap();
        assert!(abort.cause().downcast_ref::<DeadlockError>().is_some());
        assert!(input.abort_reason().is_some());
    }

    #[test]
    fn exit_keeps_partial_result() {
        let (input, output) = channel(ChannelConfig::default()
            .with_read_timeout(Duration::from_millis(20))
            .with_timeout_action(TimeoutAction::Exit));
        input.pass_all(vec![1, 2]).unwrap();
        assert_eq!(output.all().unwrap(), [1, 2]);
        let mut into = vec![0];
        input.pass(3).unwrap();
        output.all_into(&mut into).unwrap();
        assert_eq!(into, [0, 3]);
    }

    #[test]
    fn delayed_by_call_keeps_call_order() {
        let (input, output) = channel(config().with_order(OrderType::ByCall));
        input.after(Duration::from_millis(60)).pass(1).unwrap();
        input.after(Duration::from_millis(20)).pass(2).unwrap();
        input.now().pass(3).unwrap();
        assert_eq!(input.pending_len(), 3);
        input.close();
        assert_eq!(output.all().unwrap(), [1, 2, 3]);
    }

    #[test]
    fn delayed_by_chance_gives_landing_order() {
        let (input, output) = channel(config());
        input.after(Duration::from_millis(60)).pass(1).unwrap();
        input.after(Duration::from_millis(20)).pass(2).unwrap();
        input.now().pass(3).unwrap();
        input.close();
        assert_eq!(output.all().unwrap(), [3, 2, 1]);
    }

    #[test]
    fn delayed_by_delay_gives_deadline_order() {
        let (input, output) = channel(config().with_order(OrderType::ByDelay));
        input.after(Duration::from_millis(90)).pass(1).unwrap();
        input.after(Duration::from_millis(30)).pass(2).unwrap();
        input.after(Duration::from_millis(60)).pass(3).unwrap();
        input.now().pass(4).unwrap();
        input.close();
        assert_eq!(output.all().unwrap(), [4, 2, 3, 1]);
    }

    #[test]
    fn buffer_full() {
        let (input, output) = channel(config().with_max_size(2));
        input.pass(1).unwrap().pass(2).unwrap();
        let err = input.pass(3).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Deadlock(DeadlockError::BufferFull { pending: 2, max_size: 2 }),
        ));
        assert!(matches!(input.pass_all(vec![3, 4]), Err(ChannelError::Deadlock(_))));
        assert_eq!(output.next().unwrap(), Some(1));
        input.pass(3).unwrap();
    }

    #[test]
    fn backoff_waits_for_consumption() {
        let (input, output) = channel(config()
            .with_max_size(2)
            .with_backoff(Backoff::after_count(1).constant_delay(Duration::from_secs(5))));
        input.pass(1).unwrap().pass(2).unwrap();
        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            assert_eq!(output.next().unwrap(), Some(1));
            output
        });
        // blocks until the reader consumes, then fits
        let start = Instant::now();
        input.pass(3).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        let output = join.join().unwrap();
        input.close();
        assert_eq!(output.all().unwrap(), [2, 3]);
    }

    #[test]
    fn backoff_then_buffer_full() {
        let (input, _output) = channel(config()
            .with_max_size(1)
            .with_backoff(Backoff::constant(Duration::from_millis(20))));
        input.pass(1).unwrap();
        let start = Instant::now();
        assert!(matches!(input.pass(2), Err(ChannelError::Deadlock(DeadlockError::BufferFull { .. }))));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn bind_replays_buffered() {
        let (input, output) = channel(config());
        input.pass_all(vec![1, 2]).unwrap();
        input.close();
        let (send, recv) = mpsc::channel();
        output.bind(Forward(send.clone())).unwrap();
        assert_eq!(recv.try_iter().collect::<Vec<_>>(), [Ok(Some(1)), Ok(Some(2)), Ok(None)]);
        assert!(matches!(output.bind(Forward(send)), Err(ChannelError::AlreadyBound)));
        assert!(matches!(output.next(), Err(ChannelError::Bound)));
        assert!(output.is_bound());
    }

    #[test]
    fn bound_consumer_sees_abort() {
        let (input, output) = channel(config());
        let (send, recv) = mpsc::channel();
        output.bind(Forward(send)).unwrap();
        input.pass(1).unwrap();
        input.abort(anyhow::anyhow!("test"));
        assert_eq!(recv.try_iter().collect::<Vec<_>>(), [Ok(Some(1)), Err("test".to_owned())]);
    }

    #[test]
    fn failing_consumer_aborts() {
        struct Failing;
        impl Consumer<i32> for Failing {
            fn on_output(&mut self, _: i32) -> anyhow::Result<()> {
                anyhow::bail!("refused")
            }
        }

        let (input, output) = channel(config());
        output.bind(Failing).unwrap();
        input.pass(1).unwrap();
        let abort = input.abort_reason().unwrap();
        assert_eq!(abort.invocation_error().unwrap().inner().to_string(), "refused");
        assert!(matches!(input.pass(2), Err(ChannelError::Aborted(_))));
    }

    #[test]
    fn pass_from_by_call_keeps_position() {
        let (input, output) = channel(config().with_order(OrderType::ByCall));
        let (up_input, up_output) = channel(config());
        input.pass(1).unwrap();
        input.pass_from(&up_output).unwrap();
        input.pass(4).unwrap();
        input.close();
        assert_eq!(output.next().unwrap(), Some(1));
        up_input.pass_all(vec![2, 3]).unwrap();
        up_input.close();
        assert_eq!(output.all().unwrap(), [2, 3, 4]);
        assert!(matches!(input.pass_from(&up_output), Err(ChannelError::Closed)));
    }

    #[test]
    fn pass_from_propagates_abort_both_ways() {
        let (input, output) = channel::<i32>(config());
        let (up_input, up_output) = channel(config());
        up_output.pipe_to(&input).unwrap();
        up_input.abort(anyhow::anyhow!("upstream"));
        assert_eq!(output.next().unwrap_err().abort().unwrap().cause().to_string(), "upstream");

        let (input, _output) = channel::<i32>(config());
        let (up_input, up_output) = channel(config());
        input.pass_from(&up_output).unwrap();
        input.abort(anyhow::anyhow!("downstream"));
        assert_eq!(up_input.abort_reason().unwrap().cause().to_string(), "downstream");
    }

    #[test]
    fn pass_from_bound_output_fails() {
        let (input, output) = channel::<i32>(config());
        let (_up_input, up_output) = channel(config());
        let (send, _recv) = mpsc::channel();
        up_output.bind(Forward(send)).unwrap();
        assert!(matches!(input.pass_from(&up_output), Err(ChannelError::AlreadyBound)));
        // the failed feed doesn't hold the channel open
        input.close();
        assert_eq!(output.next().unwrap(), None);
    }

    #[test]
    fn drop_aborts_or_closes() {
        let (input, output) = channel::<i32>(config());
        let input2 = input.clone();
        drop(input);
        assert!(input2.is_open());
        drop(input2);
        let err = output.next().unwrap_err();
        assert!(err.abort().unwrap().cause().downcast_ref::<DroppedError>().is_some());

        let (input, output) = channel(config());
        input.pass(1).unwrap();
        drop(input.with_abort_on_drop(false));
        assert_eq!(output.all().unwrap(), [1]);
    }

    #[test]
    fn runner_deadlock_fails_fast() {
        let runner = RunnerRef::new(ThreadPoolRunner::new(1));
        let (input, output) = channel::<i32>(config().with_runner(runner.clone()));
        let (send, recv) = mpsc::channel();
        runner.run(Execution::new(move || {
            send.send(output.next()).unwrap();
        }), Duration::ZERO);
        let result = recv.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(ChannelError::Deadlock(DeadlockError::Runner))));
        drop(input);
    }

    #[test]
    fn shutdown_interrupts_blocked_reader() {
        let runner = Arc::new(ThreadPoolRunner::new(2));
        let runner_ref = RunnerRef::from_arc(runner.clone());
        let (_input, output) = channel::<i32>(config().with_runner(runner_ref.clone()));
        let (send, recv) = mpsc::channel();
        runner_ref.run(Execution::new(move || {
            send.send(output.recv().block()).unwrap();
        }), Duration::ZERO);
        thread::sleep(Duration::from_millis(30));
        runner.shutdown();
        let result = recv.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(ChannelError::Interrupted(_))));
    }

    #[test]
    fn shutdown_aborts_undelivered_delayed_values() {
        let runner = Arc::new(ThreadPoolRunner::new(1));
        let (input, output) = channel(config()
            .with_runner(RunnerRef::from_arc(runner.clone())));
        input.after(Duration::from_secs(60)).pass(1).unwrap();
        runner.shutdown();
        let err = output.next().unwrap_err();
        assert!(err.abort().unwrap().cause().downcast_ref::<RunnerError>().is_some());
    }

    #[test]
    fn next_fut_api() {
        let (input, output) = channel(config());
        let mut fut = output.recv();
        assert!(matches!(fut.try_now(), Err(ChannelError::WouldBlock)));
        assert!(matches!(fut.block_timeout(Duration::from_millis(10)), Err(ChannelError::WouldBlock)));
        input.pass(7).unwrap();
        assert_eq!(fut.block().unwrap(), Some(7));
        assert!(fut.is_terminated());
        input.close();
        assert_eq!(output.recv().block_deadline(Instant::now()).unwrap(), None);
    }

    #[test]
    fn iter_and_skip() {
        let (input, output) = channel(config());
        input.pass_all(0..10).unwrap();
        input.close();
        assert_eq!(output.skip_next(3).unwrap(), 3);
        let rest = output.iter().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(rest, (3..10).collect::<Vec<_>>());
        assert_eq!(output.skip_next(3).unwrap(), 0);
    }

    #[cfg(feature = "futures")]
    #[test]
    fn stream_reads_until_complete() {
        use futures::{executor::block_on, StreamExt};

        let (input, mut output) = channel(config());
        let join = thread::spawn(move || {
            for i in 0..5 {
                input.pass(i).unwrap();
                thread::sleep(Duration::from_millis(2));
            }
            input.close();
        });
        let got = block_on((&mut output).map(Result::unwrap).collect::<Vec<_>>());
        assert_eq!(got, (0..5).collect::<Vec<_>>());
        join.join().unwrap();
    }
}
