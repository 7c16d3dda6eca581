//! Invocations, the units of work routines run.
//!
//! An [`Invocation`] is a reusable worker. A routine takes an instance from its pool for each
//! invocation it runs, feeds it the input values one by one, and hands it a [`ResultChannel`] to
//! pass output into. After the input completes, or the invocation is aborted, the instance is
//! recycled or destroyed.
//!
//! Most invocations are simple enough to be written as closures with the adapters in this module:
//!
//! ```rust
//! use sluice::{invocation, InvocationConfig, Routine};
//!
//! let routine = Routine::new(
//!     invocation::mapping(|s: String| Ok(s.len())),
//!     InvocationConfig::default(),
//! );
//! let output = routine.call_sync(vec!["a".to_owned(), "abc".to_owned()]);
//! assert_eq!(output.all().unwrap(), [1, 3]);
//! ```

use crate::{
    channel::{InputChannel, OutputChannel},
    error::{AbortError, ChannelError},
};
use std::{
    fmt::{self, Debug, Formatter},
    marker::PhantomData,
    mem::take,
    sync::Arc,
    time::Duration,
};


/// Unit of work with a lifecycle
///
/// All callbacks of one instance are called one at a time, but not necessarily on the same
/// thread. Errors returned from callbacks, and panics escaping them, abort the invocation's
/// channels with an [`InvocationError`](crate::error::InvocationError) as the cause.
pub trait Invocation<IN, OUT: Send + 'static>: Send {
    /// Called before the instance starts an invocation, whether it is new or recycled
    fn on_restart(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called with each input value, in the input channel's delivery order
    fn on_input(&mut self, input: IN, result: &ResultChannel<OUT>) -> anyhow::Result<()>;

    /// Called once the input channel completed, before the result channel is closed
    fn on_complete(&mut self, result: &ResultChannel<OUT>) -> anyhow::Result<()> {
        let _ = result;
        Ok(())
    }

    /// Called if the invocation is aborted, from either side or by a failing callback
    fn on_abort(&mut self, abort: &AbortError) {
        let _ = abort;
    }

    /// Called when the invocation is done; returning false destroys the instance instead of
    /// keeping it for reuse
    fn on_recycle(&mut self) -> bool {
        true
    }

    /// Called before the instance is dropped
    fn on_destroy(&mut self) {}
}

/// Creates invocation instances for a routine
///
/// A failure to create an instance aborts the invocation which needed it. Closures returning a
/// boxed invocation are factories.
pub trait InvocationFactory<IN, OUT: Send + 'static>: Send + Sync + 'static {
    /// Create a new instance
    fn new_invocation(&self) -> anyhow::Result<Box<dyn Invocation<IN, OUT>>>;
}

impl<IN, OUT, F> InvocationFactory<IN, OUT> for F
where
    F: Fn() -> anyhow::Result<Box<dyn Invocation<IN, OUT>>> + Send + Sync + 'static,
    OUT: Send + 'static,
{
    fn new_invocation(&self) -> anyhow::Result<Box<dyn Invocation<IN, OUT>>> {
        self()
    }
}


/// Channel an invocation passes its output into
///
/// A restricted view of the invocation's output channel: closing it is up to the routine.
pub struct ResultChannel<OUT: Send + 'static>(InputChannel<OUT>);

impl<OUT: Send + 'static> ResultChannel<OUT> {
    pub(crate) fn new(input: InputChannel<OUT>) -> Self {
        ResultChannel(input)
    }

    /// Pass an output value, see [`InputChannel::pass`]
    pub fn pass(&self, value: OUT) -> Result<&Self, ChannelError> {
        self.0.pass(value)?;
        Ok(self)
    }

    /// Pass all output values of an iterator, see [`InputChannel::pass_all`]
    pub fn pass_all<I>(&self, values: I) -> Result<&Self, ChannelError>
    where
        I: IntoIterator<Item = OUT>,
    {
        self.0.pass_all(values)?;
        Ok(self)
    }

    /// Feed another channel's output into the output, see [`InputChannel::pass_from`]
    pub fn pass_from(&self, output: &OutputChannel<OUT>) -> Result<&Self, ChannelError> {
        self.0.pass_from(output)?;
        Ok(self)
    }

    /// Delay output passed from now on, see [`InputChannel::after`]
    pub fn after(&self, delay: Duration) -> &Self {
        self.0.after(delay);
        self
    }

    /// Stop delaying output passed from now on
    pub fn now(&self) -> &Self {
        self.0.now();
        self
    }

    /// Abort the invocation with the given cause
    pub fn abort<E>(&self, cause: E) -> bool
    where
        E: Into<anyhow::Error>,
    {
        self.0.abort(cause)
    }

    /// Whether output can still be passed
    pub fn is_open(&self) -> bool {
        self.0.is_open()
    }

    /// Number of output values queued or on their way
    pub fn pending_len(&self) -> usize {
        self.0.pending_len()
    }

    pub(crate) fn close(&self) {
        self.0.close();
    }

    pub(crate) fn abort_with(&self, abort: AbortError) -> bool {
        self.0.shared().abort(abort)
    }
}

impl<OUT: Send + 'static> Debug for ResultChannel<OUT> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_tuple("ResultChannel").field(&self.0).finish()
    }
}


// ==== closure adapters ====


/// Invocation passing each input through a function, see [`mapping`]
pub struct Mapping<F>(Arc<F>);

/// Invocation passing each input and the result channel to a function, see [`consuming`]
pub struct Consuming<F>(Arc<F>);

/// Invocation collecting all inputs and passing them to a function at completion, see
/// [`collecting`]
pub struct Collecting<F>(Arc<F>);

// instance of a collecting invocation.
struct Collect<F, IN> {
    f: Arc<F>,
    inputs: Vec<IN>,
}

/// Invocation passing each input through unchanged, see [`pass_through`]
pub struct PassThrough<T>(PhantomData<fn(T) -> T>);

/// Invocation mapping each input to one output
pub fn mapping<IN, OUT, F>(f: F) -> Mapping<F>
where
    F: Fn(IN) -> anyhow::Result<OUT> + Send + Sync + 'static,
{
    Mapping(Arc::new(f))
}

/// Invocation handling each input with full access to the result channel
pub fn consuming<IN, OUT, F>(f: F) -> Consuming<F>
where
    F: Fn(IN, &ResultChannel<OUT>) -> anyhow::Result<()> + Send + Sync + 'static,
    OUT: Send + 'static,
{
    Consuming(Arc::new(f))
}

/// Invocation seeing all inputs at once, when the input completes
pub fn collecting<IN, OUT, F>(f: F) -> Collecting<F>
where
    F: Fn(Vec<IN>, &ResultChannel<OUT>) -> anyhow::Result<()> + Send + Sync + 'static,
    OUT: Send + 'static,
{
    Collecting(Arc::new(f))
}

/// Invocation passing each input through unchanged
pub fn pass_through<T>() -> PassThrough<T> {
    PassThrough(PhantomData)
}

impl<IN, OUT, F> Invocation<IN, OUT> for Mapping<F>
where
    F: Fn(IN) -> anyhow::Result<OUT> + Send + Sync + 'static,
    OUT: Send + 'static,
{
    fn on_input(&mut self, input: IN, result: &ResultChannel<OUT>) -> anyhow::Result<()> {
        result.pass((self.0)(input)?)?;
        Ok(())
    }
}

impl<IN, OUT, F> InvocationFactory<IN, OUT> for Mapping<F>
where
    F: Fn(IN) -> anyhow::Result<OUT> + Send + Sync + 'static,
    IN: 'static,
    OUT: Send + 'static,
{
    fn new_invocation(&self) -> anyhow::Result<Box<dyn Invocation<IN, OUT>>> {
        Ok(Box::new(Mapping(Arc::clone(&self.0))))
    }
}

impl<IN, OUT, F> Invocation<IN, OUT> for Consuming<F>
where
    F: Fn(IN, &ResultChannel<OUT>) -> anyhow::Result<()> + Send + Sync + 'static,
    OUT: Send + 'static,
{
    fn on_input(&mut self, input: IN, result: &ResultChannel<OUT>) -> anyhow::Result<()> {
        (self.0)(input, result)
    }
}

impl<IN, OUT, F> InvocationFactory<IN, OUT> for Consuming<F>
where
    F: Fn(IN, &ResultChannel<OUT>) -> anyhow::Result<()> + Send + Sync + 'static,
    IN: 'static,
    OUT: Send + 'static,
{
    fn new_invocation(&self) -> anyhow::Result<Box<dyn Invocation<IN, OUT>>> {
        Ok(Box::new(Consuming(Arc::clone(&self.0))))
    }
}

impl<IN, OUT, F> Invocation<IN, OUT> for Collect<F, IN>
where
    F: Fn(Vec<IN>, &ResultChannel<OUT>) -> anyhow::Result<()> + Send + Sync + 'static,
    IN: Send,
    OUT: Send + 'static,
{
    fn on_restart(&mut self) -> anyhow::Result<()> {
        self.inputs.clear();
        Ok(())
    }

    fn on_input(&mut self, input: IN, _: &ResultChannel<OUT>) -> anyhow::Result<()> {
        self.inputs.push(input);
        Ok(())
    }

    fn on_complete(&mut self, result: &ResultChannel<OUT>) -> anyhow::Result<()> {
        (self.f)(take(&mut self.inputs), result)
    }

    fn on_abort(&mut self, _: &AbortError) {
        self.inputs.clear();
    }
}

impl<IN, OUT, F> InvocationFactory<IN, OUT> for Collecting<F>
where
    F: Fn(Vec<IN>, &ResultChannel<OUT>) -> anyhow::Result<()> + Send + Sync + 'static,
    IN: Send + 'static,
    OUT: Send + 'static,
{
    fn new_invocation(&self) -> anyhow::Result<Box<dyn Invocation<IN, OUT>>> {
        Ok(Box::new(Collect { f: Arc::clone(&self.0), inputs: Vec::new() }))
    }
}

impl<T: Send + 'static> Invocation<T, T> for PassThrough<T> {
    fn on_input(&mut self, input: T, result: &ResultChannel<T>) -> anyhow::Result<()> {
        result.pass(input)?;
        Ok(())
    }
}

impl<T: Send + 'static> InvocationFactory<T, T> for PassThrough<T> {
    fn new_invocation(&self) -> anyhow::Result<Box<dyn Invocation<T, T>>> {
        Ok(Box::new(pass_through::<T>()))
    }
}
