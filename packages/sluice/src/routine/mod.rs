//! Routines, which run invocations over channels.
//!
//! A [`Routine`] couples an [`InvocationFactory`] with an [`InvocationConfig`]. Each time it is
//! invoked, it creates an input and an output channel and starts an invocation in between: values
//! passed into the input are handed to an invocation instance, which passes its results into the
//! output. Closing the input completes the invocation, and the output completes once everything
//! passed into it has been read.
//!
//! ```rust
//! use sluice::{invocation, ChannelConfig, InvocationConfig, OrderType, Routine};
//!
//! let routine = Routine::new(
//!     invocation::mapping(|n: u32| Ok(n * n)),
//!     InvocationConfig::default()
//!         .with_output(ChannelConfig::default().with_order(OrderType::ByCall)),
//! );
//! let (input, output) = routine.parallel();
//! input.pass_all(1..=4).unwrap();
//! input.close();
//! let output = output.with_read_timeout(std::time::Duration::from_secs(10));
//! assert_eq!(output.all().unwrap(), [1, 4, 9, 16]);
//! ```
//!
//! Invocations come in three modes, see [`InvocationMode`].

use self::{
    execution::{Instances, InvocationExecution},
    pool::InstancePool,
};
use crate::{
    channel::{channel, core::link, InputChannel, OutputChannel},
    config::InvocationConfig,
    invocation::{InvocationFactory, ResultChannel},
    runner::{default_runner, sync_runner, RunnerRef},
};
use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
    thread,
};

mod execution;
mod pool;
mod builder;

pub use self::builder::{on, RoutineBuilder, RoutineCache};


/// How an invocation is run
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InvocationMode {
    /// On the thread which passes input or closes the input channel, before the call returns
    Sync,
    /// On the routine's runner
    ///
    /// Falls back to `Sync` when invoked from a thread of the routine's runner which has no spare
    /// capacity, since handing the invocation off would wait on the very thread doing so.
    Async,
    /// One asynchronous invocation per input value
    ///
    /// The outputs are merged in input order if the output channel delivers
    /// [`ByCall`](crate::OrderType::ByCall), and as they arrive otherwise.
    Parallel,
}


/// Factory of invocations, configured once and invoked many times
///
/// Cheap to clone. Clones share the instance pool.
pub struct Routine<IN, OUT: Send + 'static> {
    inner: Arc<RoutineInner<IN, OUT>>,
}

pub(crate) struct RoutineInner<IN, OUT: Send + 'static> {
    config: InvocationConfig,
    runner: RunnerRef,
    pool: Arc<InstancePool<IN, OUT>>,
}

impl<IN: Send + 'static, OUT: Send + 'static> Routine<IN, OUT> {
    /// Construct from an invocation factory and configuration
    pub fn new<F>(factory: F, config: InvocationConfig) -> Self
    where
        F: InvocationFactory<IN, OUT>,
    {
        Self::from_factory(Arc::new(factory), config)
    }

    pub(crate) fn from_factory(
        factory: Arc<dyn InvocationFactory<IN, OUT>>,
        config: InvocationConfig,
    ) -> Self {
        let runner = config.runner.clone().unwrap_or_else(default_runner);
        let pool = InstancePool::new(factory, config.core_instances, config.max_instances);
        Routine {
            inner: Arc::new(RoutineInner { config, runner, pool: Arc::new(pool) }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RoutineInner<IN, OUT>>) -> Self {
        Routine { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<RoutineInner<IN, OUT>> {
        &self.inner
    }

    /// The routine's configuration
    pub fn config(&self) -> &InvocationConfig {
        &self.inner.config
    }

    /// The runner asynchronous invocations run on
    pub fn runner(&self) -> &RunnerRef {
        &self.inner.runner
    }

    /// Start an invocation in the given mode, returning its input and output channels
    pub fn invoke(&self, mode: InvocationMode) -> (InputChannel<IN>, OutputChannel<OUT>) {
        match mode {
            InvocationMode::Sync => self.start(sync_runner(), Instances::Pool(self.pool())),
            InvocationMode::Async => {
                let runner = if self.inner.runner.would_deadlock(thread::current().id()) {
                    debug!("runner has no spare thread for an invocation from its own thread, \
                        invoking synchronously");
                    sync_runner()
                } else {
                    self.inner.runner.clone()
                };
                self.start(runner, Instances::Pool(self.pool()))
            }
            InvocationMode::Parallel => {
                self.start(sync_runner(), Instances::Dispatch(self.clone()))
            }
        }
    }

    /// Start a synchronous invocation
    pub fn sync(&self) -> (InputChannel<IN>, OutputChannel<OUT>) {
        self.invoke(InvocationMode::Sync)
    }

    /// Start an asynchronous invocation
    pub fn asynchronous(&self) -> (InputChannel<IN>, OutputChannel<OUT>) {
        self.invoke(InvocationMode::Async)
    }

    /// Start a parallel invocation
    pub fn parallel(&self) -> (InputChannel<IN>, OutputChannel<OUT>) {
        self.invoke(InvocationMode::Parallel)
    }

    /// Invoke with the given inputs and close the input right away
    ///
    /// Failures to pass input show on the output channel, which is aborted.
    pub fn call<I>(&self, mode: InvocationMode, inputs: I) -> OutputChannel<OUT>
    where
        I: IntoIterator<Item = IN>,
    {
        let (input, output) = self.invoke(mode);
        if let Err(e) = input.pass_all(inputs) {
            debug!(%e, "failed to pass invocation input, aborting");
            input.abort(e);
        }
        input.close();
        output
    }

    /// Invoke synchronously with the given inputs, see [`call`](Self::call)
    pub fn call_sync<I>(&self, inputs: I) -> OutputChannel<OUT>
    where
        I: IntoIterator<Item = IN>,
    {
        self.call(InvocationMode::Sync, inputs)
    }

    /// Invoke asynchronously with the given inputs, see [`call`](Self::call)
    pub fn call_async<I>(&self, inputs: I) -> OutputChannel<OUT>
    where
        I: IntoIterator<Item = IN>,
    {
        self.call(InvocationMode::Async, inputs)
    }

    /// Invoke in parallel with the given inputs, see [`call`](Self::call)
    pub fn call_parallel<I>(&self, inputs: I) -> OutputChannel<OUT>
    where
        I: IntoIterator<Item = IN>,
    {
        self.call(InvocationMode::Parallel, inputs)
    }

    /// Destroy the idle invocation instances
    ///
    /// Instances of running invocations are unaffected.
    pub fn clear(&self) {
        self.inner.pool.clear();
    }

    fn pool(&self) -> Arc<InstancePool<IN, OUT>> {
        Arc::clone(&self.inner.pool)
    }

    fn start(
        &self,
        runner: RunnerRef,
        instances: Instances<IN, OUT>,
    ) -> (InputChannel<IN>, OutputChannel<OUT>) {
        let config = &self.inner.config;
        let input_config = config.input.clone().or_runner(&self.inner.runner);
        let output_config = config.output.clone().or_runner(&self.inner.runner);

        let (input, exec_input) = channel(input_config);
        let (exec_output, output) = channel(output_config);
        link(input.shared(), output.shared());
        trace!(?runner, "starting invocation");
        InvocationExecution::new(exec_input, ResultChannel::new(exec_output), instances, runner)
            .start();
        (input, output)
    }
}

impl<IN, OUT: Send + 'static> Clone for Routine<IN, OUT> {
    fn clone(&self) -> Self {
        Routine { inner: Arc::clone(&self.inner) }
    }
}

impl<IN, OUT: Send + 'static> Debug for Routine<IN, OUT> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Routine")
            .field("config", &self.inner.config)
            .field("runner", &self.inner.runner)
            .finish_non_exhaustive()
    }
}
