// pool of invocation instances belonging to a routine.
//
// instances are taken out for the duration of one invocation and given back afterwards. up to
// the core count of idle instances are retained for reuse. if the maximum number of active
// instances is reached, executions asking for one are parked in FIFO order and resumed, on their
// own runner, when an instance is given back.

use crate::invocation::{Invocation, InvocationFactory};
use std::{
    collections::VecDeque,
    mem::take,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};


// execution waiting for an instance.
pub(crate) trait Resume: Send + Sync {
    // try again to get an instance. returns false if the execution no longer wants one, in which
    // case the next parked execution is resumed instead.
    fn resume(self: Arc<Self>) -> bool;
}

pub(crate) enum Acquired<IN, OUT: Send + 'static> {
    Instance(Box<dyn Invocation<IN, OUT>>),
    // the factory failed. the error has already been accounted for.
    Failed(anyhow::Error),
    // the maximum is reached, the waiter is queued.
    Parked,
}

pub(crate) struct InstancePool<IN, OUT: Send + 'static> {
    factory: Arc<dyn InvocationFactory<IN, OUT>>,
    core: usize,
    max: Option<usize>,
    state: Mutex<PoolState<IN, OUT>>,
}

struct PoolState<IN, OUT: Send + 'static> {
    idle: Vec<Box<dyn Invocation<IN, OUT>>>,
    // instances taken out, plus instances being created.
    active: usize,
    parked: VecDeque<Arc<dyn Resume>>,
}

impl<IN: 'static, OUT: Send + 'static> InstancePool<IN, OUT> {
    pub(crate) fn new(
        factory: Arc<dyn InvocationFactory<IN, OUT>>,
        core: usize,
        max: Option<usize>,
    ) -> Self {
        InstancePool {
            factory,
            core,
            max,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                active: 0,
                parked: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<IN, OUT>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // take an idle instance, create a new one, or park the waiter.
    pub(crate) fn acquire(&self, waiter: &Arc<dyn Resume>) -> Acquired<IN, OUT> {
        let mut lock = self.lock();
        if self.max.is_some_and(|max| lock.active >= max) {
            trace!(active = lock.active, "instance pool exhausted, parking execution");
            lock.parked.push_back(Arc::clone(waiter));
            return Acquired::Parked;
        }
        lock.active += 1;
        if let Some(instance) = lock.idle.pop() {
            return Acquired::Instance(instance);
        }
        drop(lock);

        // the factory is foreign code, so it runs unlocked
        let created = panic::catch_unwind(AssertUnwindSafe(|| self.factory.new_invocation()))
            .unwrap_or_else(|payload| Err(crate::error::InvocationError::panicked(payload).into()));
        match created {
            Ok(instance) => Acquired::Instance(instance),
            Err(e) => {
                warn!(%e, "failed to create invocation instance");
                self.lock().active -= 1;
                self.unpark();
                Acquired::Failed(e)
            }
        }
    }

    // give an instance back after its invocation is done.
    pub(crate) fn release(&self, mut instance: Box<dyn Invocation<IN, OUT>>) {
        let recycle = panic::catch_unwind(AssertUnwindSafe(|| instance.on_recycle()))
            .unwrap_or(false);
        let destroy = {
            let mut lock = self.lock();
            lock.active -= 1;
            if recycle && lock.idle.len() < self.core {
                lock.idle.push(instance);
                None
            } else {
                Some(instance)
            }
        };
        if let Some(instance) = destroy {
            destroy_instance(instance);
        }
        self.unpark();
    }

    // resume parked executions until one takes the freed capacity.
    fn unpark(&self) {
        loop {
            let next = {
                let mut lock = self.lock();
                if self.max.is_some_and(|max| lock.active >= max) {
                    return;
                }
                lock.parked.pop_front()
            };
            match next {
                Some(waiter) => {
                    if waiter.resume() {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    // destroy all idle instances.
    pub(crate) fn clear(&self) {
        let idle = take(&mut self.lock().idle);
        if !idle.is_empty() {
            debug!(count = idle.len(), "destroying idle invocation instances");
        }
        for instance in idle {
            destroy_instance(instance);
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        self.lock().idle.len()
    }

    #[cfg(test)]
    pub(crate) fn active_len(&self) -> usize {
        self.lock().active
    }
}

impl<IN, OUT: Send + 'static> Drop for InstancePool<IN, OUT> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for instance in take(&mut state.idle) {
            destroy_instance(instance);
        }
    }
}

fn destroy_instance<IN, OUT: Send + 'static>(mut instance: Box<dyn Invocation<IN, OUT>>) {
    if panic::catch_unwind(AssertUnwindSafe(|| instance.on_destroy())).is_err() {
        warn!("invocation instance panicked while being destroyed");
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::{pass_through, ResultChannel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted {
        destroyed: Arc<AtomicUsize>,
        recycle: bool,
    }

    impl Invocation<i32, i32> for Counted {
        fn on_input(&mut self, _: i32, _: &ResultChannel<i32>) -> anyhow::Result<()> {
            Ok(())
        }

        fn on_recycle(&mut self) -> bool {
            self.recycle
        }

        fn on_destroy(&mut self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted_pool(
        core: usize,
        max: Option<usize>,
        recycle: bool,
    ) -> (InstancePool<i32, i32>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let created2 = Arc::clone(&created);
        let destroyed2 = Arc::clone(&destroyed);
        let factory = move || -> anyhow::Result<Box<dyn Invocation<i32, i32>>> {
            created2.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Counted { destroyed: Arc::clone(&destroyed2), recycle }))
        };
        (InstancePool::new(Arc::new(factory), core, max), created, destroyed)
    }

    struct Waiter(AtomicUsize);

    impl Resume for Waiter {
        fn resume(self: Arc<Self>) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn waiter() -> (Arc<Waiter>, Arc<dyn Resume>) {
        let waiter = Arc::new(Waiter(AtomicUsize::new(0)));
        let dyn_waiter: Arc<dyn Resume> = waiter.clone();
        (waiter, dyn_waiter)
    }

    fn instance<IN, OUT>(acquired: Acquired<IN, OUT>) -> Box<dyn Invocation<IN, OUT>>
    where
        OUT: Send + 'static,
    {
        match acquired {
            Acquired::Instance(instance) => instance,
            Acquired::Failed(e) => panic!("failed: {}", e),
            Acquired::Parked => panic!("parked"),
        }
    }

    #[test]
    fn recycles_up_to_core() {
        let (pool, created, destroyed) = counted_pool(1, None, true);
        let (_, w) = waiter();
        let a = instance(pool.acquire(&w));
        let b = instance(pool.acquire(&w));
        assert_eq!(pool.active_len(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle_len(), 1);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);

        let _c = instance(pool.acquire(&w));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_len(), 0);
    }

    #[test]
    fn refused_recycle_destroys() {
        let (pool, _, destroyed) = counted_pool(10, None, false);
        let (_, w) = waiter();
        let a = instance(pool.acquire(&w));
        pool.release(a);
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parks_at_max_and_resumes_in_order() {
        let (pool, _, _) = counted_pool(10, Some(1), true);
        let (_, w) = waiter();
        let (first, w1) = waiter();
        let (second, w2) = waiter();
        let a = instance(pool.acquire(&w));
        assert!(matches!(pool.acquire(&w1), Acquired::Parked));
        assert!(matches!(pool.acquire(&w2), Acquired::Parked));
        pool.release(a);
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clear_destroys_idle() {
        let (pool, _, destroyed) = counted_pool(10, None, true);
        let (_, w) = waiter();
        let a = instance(pool.acquire(&w));
        let b = instance(pool.acquire(&w));
        pool.release(a);
        pool.release(b);
        pool.clear();
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        pool.clear();
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_factory() {
        let factory = || -> anyhow::Result<Box<dyn Invocation<i32, i32>>> {
            anyhow::bail!("no instance for you")
        };
        let pool = InstancePool::new(Arc::new(factory), 10, Some(1));
        let (_, w) = waiter();
        assert!(matches!(pool.acquire(&w), Acquired::Failed(_)));
        assert_eq!(pool.active_len(), 0);

        let pool = InstancePool::<u8, u8>::new(Arc::new(pass_through()), 10, None);
        assert!(matches!(pool.acquire(&w), Acquired::Instance(_)));
    }
}
