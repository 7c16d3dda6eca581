//! Configuration values for channels and routines.
//!
//! All configuration is plain data: comparable, hashable and built with ownership-chaining
//! `with_*` methods starting from `Default`.
//!
//! ```rust
//! use sluice::{Backoff, ChannelConfig, OrderType, TimeoutAction};
//! use std::time::Duration;
//!
//! let config = ChannelConfig::default()
//!     .with_order(OrderType::ByCall)
//!     .with_max_size(16)
//!     .with_backoff(Backoff::after_count(8).linear_delay(Duration::from_millis(5)))
//!     .with_read_timeout(Duration::from_secs(1))
//!     .with_timeout_action(TimeoutAction::Abort);
//! assert_eq!(config.max_size, Some(16));
//! ```

use crate::{backoff::Backoff, runner::RunnerRef};
use std::time::Duration;


/// Order in which a channel delivers passed values
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum OrderType {
    /// Deliver values in the order they were passed, whatever order they land in
    ///
    /// Delayed values and values fed from other channels hold their position until they land.
    ByCall,
    /// Deliver values in the order their delays elapse
    ///
    /// Buffers the same way as [`ByChance`](Self::ByChance): values are appended when they land,
    /// which for delayed values is when their delay elapses.
    ByDelay,
    /// Deliver values in the order they land
    #[default]
    ByChance,
}

/// What a blocking read does when its timeout elapses without output
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum TimeoutAction {
    /// Return what was read so far without error
    Exit,
    /// Abort the channel and fail with the abort
    Abort,
    /// Fail with [`DeadlockError::ReadTimeout`](crate::error::DeadlockError::ReadTimeout)
    #[default]
    Deadlock,
}


/// Configuration of a channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ChannelConfig {
    /// Delivery order, defaults to [`OrderType::ByChance`]
    pub order: OrderType,
    /// Maximum number of pending values, unbounded by default
    pub max_size: Option<usize>,
    /// Pacing of writers, by number of pending values, defaults to no delay
    pub backoff: Backoff,
    /// How long blocking reads wait for output, defaults to not waiting at all
    pub read_timeout: Duration,
    /// What blocking reads do when the read timeout elapses
    pub timeout_action: TimeoutAction,
    /// Runner which lands delayed values, and whose threads reads check for deadlock
    ///
    /// Defaults to the invoking routine's runner for routine channels, and to a process-wide
    /// thread pool for standalone channels.
    pub runner: Option<RunnerRef>,
}

impl ChannelConfig {
    /// Set the delivery order
    pub fn with_order(mut self, order: OrderType) -> Self {
        self.order = order;
        self
    }

    /// Bound the number of pending values
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Set the writer backoff
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the read timeout
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Set the timeout action
    pub fn with_timeout_action(mut self, timeout_action: TimeoutAction) -> Self {
        self.timeout_action = timeout_action;
        self
    }

    /// Set the runner
    pub fn with_runner(mut self, runner: impl Into<RunnerRef>) -> Self {
        self.runner = Some(runner.into());
        self
    }

    // fill in the runner if not set.
    pub(crate) fn or_runner(mut self, runner: &RunnerRef) -> Self {
        if self.runner.is_none() {
            self.runner = Some(runner.clone());
        }
        self
    }
}


/// Default number of idle invocation instances a routine retains
pub const DEFAULT_CORE_INSTANCES: usize = 10;

/// Configuration of a routine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvocationConfig {
    /// Runner for asynchronous and parallel invocations
    ///
    /// If unset, routines share a process-wide thread pool with one thread per available core.
    pub runner: Option<RunnerRef>,
    /// Configuration of invocation input channels
    pub input: ChannelConfig,
    /// Configuration of invocation output channels
    pub output: ChannelConfig,
    /// Number of idle invocation instances retained for reuse
    pub core_instances: usize,
    /// Maximum number of concurrently active invocation instances, unbounded by default
    pub max_instances: Option<usize>,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        InvocationConfig {
            runner: None,
            input: ChannelConfig::default(),
            output: ChannelConfig::default(),
            core_instances: DEFAULT_CORE_INSTANCES,
            max_instances: None,
        }
    }
}

impl InvocationConfig {
    /// Set the runner
    pub fn with_runner(mut self, runner: impl Into<RunnerRef>) -> Self {
        self.runner = Some(runner.into());
        self
    }

    /// Set the input channel configuration
    pub fn with_input(mut self, input: ChannelConfig) -> Self {
        self.input = input;
        self
    }

    /// Set the output channel configuration
    pub fn with_output(mut self, output: ChannelConfig) -> Self {
        self.output = output;
        self
    }

    /// Set the number of retained idle instances
    pub fn with_core_instances(mut self, core_instances: usize) -> Self {
        self.core_instances = core_instances;
        self
    }

    /// Bound the number of concurrently active instances
    ///
    /// Panics if zero.
    pub fn with_max_instances(mut self, max_instances: usize) -> Self {
        assert!(max_instances > 0, "max_instances must be positive");
        self.max_instances = Some(max_instances);
        self
    }
}
