//! Routines invoked over back-pressured channels.
//!
//! A [`Routine`] runs [`Invocation`]s synchronously, asynchronously or in parallel. The caller
//! talks to each invocation through a pair of channels: it passes input into an [`InputChannel`]
//! and reads results from an [`OutputChannel`]. Channels can delay values, keep them in call
//! order, pace writers with a [`Backoff`], and be aborted from either end, which propagates to
//! every channel linked to them.
//!
//! ```rust
//! use sluice::{channel, ChannelConfig};
//! use std::time::Duration;
//!
//! let (input, output) = channel::<&str>(ChannelConfig::default());
//! input.after(Duration::from_millis(10)).pass("later").unwrap();
//! input.now().pass("now").unwrap();
//! input.close();
//!
//! let output = output.with_read_timeout(Duration::from_secs(10));
//! assert_eq!(output.all().unwrap(), ["now", "later"]);
//! ```
//!
//! Where invocations run is up to a [`Runner`](runner::Runner). Blocking reads on a runner's own
//! thread which could never be satisfied fail fast with a
//! [`DeadlockError`](error::DeadlockError) instead of hanging.

#[macro_use]
extern crate tracing;

mod channel;

pub mod backoff;
pub mod queue;
pub mod runner;
pub mod config;
pub mod error;
pub mod invocation;
pub mod routine;

pub use crate::{
    backoff::Backoff,
    channel::{channel, Consumer, InputChannel, Iter, OutputChannel},
    config::{ChannelConfig, InvocationConfig, OrderType, TimeoutAction},
    error::{AbortError, ChannelError, InvocationError},
    invocation::{Invocation, InvocationFactory, ResultChannel},
    routine::{on, InvocationMode, Routine, RoutineBuilder, RoutineCache},
};

/// Future types
pub mod future {
    pub use crate::channel::NextFut;
}
