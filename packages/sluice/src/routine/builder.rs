// building routines, and sharing them through a cache.

use super::{Routine, RoutineInner};
use crate::{
    config::{ChannelConfig, InvocationConfig},
    invocation::InvocationFactory,
    runner::RunnerRef,
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    any::{Any, TypeId},
    fmt::{self, Debug, Formatter},
    sync::{Arc, Weak},
};

/// Start building a routine around the given invocation factory
///
/// ```rust
/// use sluice::invocation;
///
/// let routine = sluice::on(invocation::mapping(|s: &'static str| Ok(s.len())))
///     .with_core_instances(2)
///     .build();
/// assert_eq!(routine.call_sync(["four"]).all().unwrap(), [4]);
/// ```
pub fn on<IN, OUT, F>(factory: F) -> RoutineBuilder<IN, OUT>
where
    IN: Send + 'static,
    OUT: Send + 'static,
    F: InvocationFactory<IN, OUT>,
{
    RoutineBuilder {
        factory: Arc::new(factory),
        factory_type: TypeId::of::<F>(),
        config: InvocationConfig::default(),
    }
}

/// Builder of a [`Routine`], see [`on`]
pub struct RoutineBuilder<IN, OUT: Send + 'static> {
    factory: Arc<dyn InvocationFactory<IN, OUT>>,
    factory_type: TypeId,
    config: InvocationConfig,
}

impl<IN: Send + 'static, OUT: Send + 'static> RoutineBuilder<IN, OUT> {
    /// Replace the whole configuration
    pub fn with_config(mut self, config: InvocationConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the runner, see [`InvocationConfig::runner`]
    pub fn with_runner(mut self, runner: impl Into<RunnerRef>) -> Self {
        self.config.runner = Some(runner.into());
        self
    }

    /// Set the input channel configuration
    pub fn with_input(mut self, input: ChannelConfig) -> Self {
        self.config.input = input;
        self
    }

    /// Set the output channel configuration
    pub fn with_output(mut self, output: ChannelConfig) -> Self {
        self.config.output = output;
        self
    }

    /// Set the number of retained idle instances
    pub fn with_core_instances(mut self, core_instances: usize) -> Self {
        self.config.core_instances = core_instances;
        self
    }

    /// Bound the number of concurrently active instances
    ///
    /// Panics if zero.
    pub fn with_max_instances(mut self, max_instances: usize) -> Self {
        self.config = self.config.with_max_instances(max_instances);
        self
    }

    /// The configuration built so far
    pub fn config(&self) -> &InvocationConfig {
        &self.config
    }

    /// Build a new routine
    pub fn build(self) -> Routine<IN, OUT> {
        Routine::from_factory(self.factory, self.config)
    }

    /// Get the routine cached under the given name for the same factory type and configuration,
    /// or build and cache it
    ///
    /// The cache only holds on to routines while they are in use elsewhere.
    pub fn build_cached(self, cache: &RoutineCache, name: &str) -> Routine<IN, OUT> {
        let key = CacheKey {
            name: name.to_owned(),
            factory_type: self.factory_type,
            io_type: TypeId::of::<(IN, OUT)>(),
            config: self.config.clone(),
        };
        cache.get_or_insert(key, move || self.build())
    }
}

impl<IN, OUT: Send + 'static> Debug for RoutineBuilder<IN, OUT> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("RoutineBuilder").field("config", &self.config).finish_non_exhaustive()
    }
}

/// Cache of routines, so that the instance pool of a routine is shared by everyone building it
/// with the same name, factory type and configuration
#[derive(Default)]
pub struct RoutineCache {
    routines: DashMap<CacheKey, Weak<dyn Any + Send + Sync>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    name: String,
    factory_type: TypeId,
    io_type: TypeId,
    config: InvocationConfig,
}

impl RoutineCache {
    /// Construct empty
    pub fn new() -> Self {
        RoutineCache::default()
    }

    /// Number of cached routines still in use
    pub fn len(&self) -> usize {
        self.sweep();
        self.routines.len()
    }

    /// Whether no cached routine is still in use
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget all cached routines
    ///
    /// Routines already handed out keep working, but are no longer shared with later builds.
    pub fn clear(&self) {
        self.routines.clear();
    }

    fn get_or_insert<IN, OUT, F>(&self, key: CacheKey, build: F) -> Routine<IN, OUT>
    where
        IN: Send + 'static,
        OUT: Send + 'static,
        F: FnOnce() -> Routine<IN, OUT>,
    {
        self.sweep();
        let cached = |weak: &Weak<dyn Any + Send + Sync>| {
            weak.upgrade()?.downcast::<RoutineInner<IN, OUT>>().ok().map(Routine::from_inner)
        };
        match self.routines.entry(key) {
            Entry::Occupied(mut entry) => match cached(entry.get()) {
                Some(routine) => routine,
                None => {
                    let routine = build();
                    entry.insert(erase(&routine));
                    routine
                }
            },
            Entry::Vacant(entry) => {
                let routine = build();
                trace!(name = %entry.key().name, "caching new routine");
                entry.insert(erase(&routine));
                routine
            }
        }
    }

    // forget routines no longer in use.
    fn sweep(&self) {
        self.routines.retain(|_, routine| routine.strong_count() > 0);
    }
}

impl Debug for RoutineCache {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("RoutineCache").field("len", &self.routines.len()).finish()
    }
}

fn erase<IN, OUT>(routine: &Routine<IN, OUT>) -> Weak<dyn Any + Send + Sync>
where
    IN: Send + 'static,
    OUT: Send + 'static,
{
    let inner: Arc<dyn Any + Send + Sync> = routine.inner().clone();
    Arc::downgrade(&inner)
}
