// driving one invocation.
//
// an execution sits between the invocation's input channel, which it reads, and its output
// channel, which the invocation writes through a ResultChannel. it is scheduled on its runner by
// the input channel's ready hook whenever new input, completion or an abort arrives, and then
// processes everything available before yielding the thread.
//
// lifecycle:
//
//     Idle ---> Parked ---> Idle
//       |                    |
//       \--------------------+--> Running ---> Done
//                                   |           ^
//                                   \-> Aborting/
//
// at most one step runs at a time. a schedule request arriving while a step runs marks the
// execution dirty instead, which makes the running step go around again before it yields.

use super::{
    pool::{Acquired, InstancePool, Resume},
    Routine,
    InvocationMode,
};
use crate::{
    channel::{core::Take, OutputChannel},
    error::{AbortError, ChannelError, InterruptedError, InvocationError, RunnerError},
    invocation::{Invocation, ResultChannel},
    runner::{Execution, RunnerRef},
};
use std::{
    mem::take,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};


// where an execution gets its invocation instance from.
pub(crate) enum Instances<IN, OUT: Send + 'static> {
    // the routine's instance pool.
    Pool(Arc<InstancePool<IN, OUT>>),
    // a fresh dispatcher which spreads the input over asynchronous invocations of the routine.
    Dispatch(Routine<IN, OUT>),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Parked,
    Running,
    Aborting,
    Done,
}

struct ExecState {
    phase: Phase,
    running: bool,
    dirty: bool,
    // resumed by the pool while still on the way to parking.
    resumed: bool,
}

pub(crate) struct InvocationExecution<IN: Send + 'static, OUT: Send + 'static> {
    input: OutputChannel<IN>,
    result: ResultChannel<OUT>,
    instances: Instances<IN, OUT>,
    runner: RunnerRef,
    state: Mutex<ExecState>,
    // only touched by the running step.
    instance: Mutex<Option<Box<dyn Invocation<IN, OUT>>>>,
}

impl<IN: Send + 'static, OUT: Send + 'static> InvocationExecution<IN, OUT> {
    pub(crate) fn new(
        input: OutputChannel<IN>,
        result: ResultChannel<OUT>,
        instances: Instances<IN, OUT>,
        runner: RunnerRef,
    ) -> Arc<Self> {
        Arc::new(InvocationExecution {
            input,
            result,
            instances,
            runner,
            state: Mutex::new(ExecState {
                phase: Phase::Idle,
                running: false,
                dirty: false,
                resumed: false,
            }),
            instance: Mutex::new(None),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ExecState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // start listening to the input. the hook holds the execution alive until it is done, and is
    // called once right away, which acquires the instance.
    pub(crate) fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.input.shared().set_hook(Some(Arc::new(move || this.schedule())));
    }

    // make sure a step runs after this call.
    fn schedule(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            if state.phase == Phase::Done {
                return;
            }
            if state.running {
                state.dirty = true;
                return;
            }
            state.running = true;
        }
        let step = Step { exec: Some(Arc::clone(self)) };
        self.runner.run(Execution::new(move || step.run()), Duration::ZERO);
    }

    // process until nothing is left to do, then yield.
    fn step(self: &Arc<Self>) {
        loop {
            self.lock_state().dirty = false;
            self.advance();
            let mut state = self.lock_state();
            if !state.dirty || state.phase == Phase::Done {
                state.running = false;
                return;
            }
        }
    }

    fn advance(self: &Arc<Self>) {
        let mut slot = self.instance.lock().unwrap_or_else(PoisonError::into_inner);

        // get hold of an instance
        loop {
            let phase = self.lock_state().phase;
            match phase {
                Phase::Done => return,
                Phase::Running | Phase::Aborting => break,
                Phase::Parked => {
                    // still waiting, unless aborted in the meantime
                    if let Some(abort) = self.input.abort_reason() {
                        debug!(%abort, "invocation aborted while waiting for an instance");
                        self.result.abort_with(abort);
                        self.finish(None);
                    }
                    return;
                }
                Phase::Idle => {
                    let waiter: Arc<dyn Resume> = self.clone();
                    match self.instances.acquire(&waiter) {
                        Acquired::Instance(mut instance) => {
                            self.lock_state().phase = Phase::Running;
                            if let Err(abort) = guarded(|| instance.on_restart()) {
                                self.fail(Some(instance), abort);
                                return;
                            }
                            *slot = Some(instance);
                        }
                        Acquired::Failed(e) => {
                            self.fail(None, abort_for(e));
                            return;
                        }
                        Acquired::Parked => {
                            // the pool may have resumed us before we got here
                            let mut state = self.lock_state();
                            if !take(&mut state.resumed) {
                                state.phase = Phase::Parked;
                            }
                        }
                    }
                }
            }
        }

        loop {
            let Some(instance) = slot.as_mut() else { return };
            match self.input.take() {
                Take::Value(value) => {
                    if let Err(abort) = guarded(|| instance.on_input(value, &self.result)) {
                        self.fail(slot.take(), abort);
                        return;
                    }
                }
                Take::Empty => return,
                Take::Complete => {
                    if let Err(abort) = guarded(|| instance.on_complete(&self.result)) {
                        self.fail(slot.take(), abort);
                        return;
                    }
                    trace!("invocation complete");
                    self.result.close();
                    self.finish(slot.take());
                    return;
                }
                Take::Aborted(abort) => {
                    debug!(%abort, "invocation aborted");
                    self.abort(slot.take(), abort);
                    return;
                }
            }
        }
    }

    // abort the invocation from inside. the input may already be complete, so the abort is
    // delivered to the output directly as well as to the input.
    fn fail(&self, instance: Option<Box<dyn Invocation<IN, OUT>>>, abort: AbortError) {
        debug!(%abort, "invocation failed");
        self.input.shared().abort(abort.clone());
        self.abort(instance, abort);
    }

    fn abort(&self, instance: Option<Box<dyn Invocation<IN, OUT>>>, abort: AbortError) {
        self.lock_state().phase = Phase::Aborting;
        let instance = instance.map(|mut instance| {
            if panic::catch_unwind(AssertUnwindSafe(|| instance.on_abort(&abort))).is_err() {
                warn!("invocation panicked while handling abort");
            }
            instance
        });
        self.result.abort_with(abort);
        self.finish(instance);
    }

    fn finish(&self, instance: Option<Box<dyn Invocation<IN, OUT>>>) {
        self.lock_state().phase = Phase::Done;
        if let Some(instance) = instance {
            self.instances.release(instance);
        }
        self.input.shared().set_hook(None);
    }

    // the runner discarded a step. abort and wrap up on the current thread.
    fn abandon(self: &Arc<Self>) {
        debug!("runner discarded invocation step, aborting");
        self.input.shared().abort(AbortError::new(RunnerError::Shutdown));
        self.step();
    }
}

impl<IN: Send + 'static, OUT: Send + 'static> Resume for InvocationExecution<IN, OUT> {
    fn resume(self: Arc<Self>) -> bool {
        {
            let mut state = self.lock_state();
            match state.phase {
                Phase::Parked => state.phase = Phase::Idle,
                // resumed before parking completed, the running step retries right away
                Phase::Idle => {
                    state.resumed = true;
                    return true;
                }
                _ => return false,
            }
        }
        self.schedule();
        true
    }
}

impl<IN: Send + 'static, OUT: Send + 'static> Instances<IN, OUT> {
    fn acquire(&self, waiter: &Arc<dyn Resume>) -> Acquired<IN, OUT> {
        match self {
            Instances::Pool(pool) => pool.acquire(waiter),
            Instances::Dispatch(routine) => {
                Acquired::Instance(Box::new(Dispatcher { routine: routine.clone() }))
            }
        }
    }

    fn release(&self, instance: Box<dyn Invocation<IN, OUT>>) {
        match self {
            Instances::Pool(pool) => pool.release(instance),
            Instances::Dispatch(_) => drop(instance),
        }
    }
}


// scheduled step. dropped without running if the runner discards it.
struct Step<IN: Send + 'static, OUT: Send + 'static> {
    exec: Option<Arc<InvocationExecution<IN, OUT>>>,
}

impl<IN: Send + 'static, OUT: Send + 'static> Step<IN, OUT> {
    fn run(mut self) {
        if let Some(exec) = self.exec.take() {
            exec.step();
        }
    }
}

impl<IN: Send + 'static, OUT: Send + 'static> Drop for Step<IN, OUT> {
    fn drop(&mut self) {
        if let Some(exec) = self.exec.take() {
            exec.abandon();
        }
    }
}


// invocation behind a parallel invocation. each input value gets an asynchronous invocation of
// its own, the outputs of which are fed into the result in call order.
struct Dispatcher<IN, OUT: Send + 'static> {
    routine: Routine<IN, OUT>,
}

impl<IN: Send + 'static, OUT: Send + 'static> Invocation<IN, OUT> for Dispatcher<IN, OUT> {
    fn on_input(&mut self, input: IN, result: &ResultChannel<OUT>) -> anyhow::Result<()> {
        let (child_input, child_output) = self.routine.invoke(InvocationMode::Async);
        child_input.pass(input)?;
        child_input.close();
        result.pass_from(&child_output)?;
        Ok(())
    }
}


// run an invocation callback, turning errors and panics into the abort they cause.
fn guarded<F>(f: F) -> Result<(), AbortError>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(abort_for(e)),
        Err(payload) => {
            let e = InvocationError::panicked(payload);
            warn!(%e, "invocation panicked");
            Err(AbortError::new(e))
        }
    }
}

// the abort an error escaping invocation code causes. an interrupted wait is re-armed, so that
// the thread's owner still sees it, and becomes the cause as is.
fn abort_for(e: anyhow::Error) -> AbortError {
    let e = match e.downcast::<InvocationError>() {
        Ok(e) => return AbortError::new(e),
        Err(e) => e,
    };
    let e = match e.downcast::<InterruptedError>() {
        Ok(interrupted) => {
            interrupted.reinterrupt();
            return AbortError::new(interrupted);
        }
        Err(e) => e,
    };
    match e.downcast::<ChannelError>() {
        Ok(ChannelError::Interrupted(interrupted)) => {
            interrupted.reinterrupt();
            AbortError::new(interrupted)
        }
        Ok(e) => AbortError::new(InvocationError::new(e.into())),
        Err(e) => AbortError::new(InvocationError::new(e)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::Interrupt;

    #[test]
    fn abort_for_wraps_errors() {
        let abort = abort_for(anyhow::anyhow!("boom"));
        let e = abort.invocation_error().unwrap();
        assert_eq!(e.inner().to_string(), "boom");

        let abort = abort_for(ChannelError::Closed.into());
        assert!(abort.invocation_error().is_some());
    }

    #[test]
    fn abort_for_keeps_invocation_errors() {
        let abort = abort_for(InvocationError::new(anyhow::anyhow!("inner")).into());
        assert_eq!(abort.invocation_error().unwrap().inner().to_string(), "inner");
    }

    #[test]
    fn abort_for_reinterrupts() {
        let interrupt = Interrupt::new();
        let abort = abort_for(ChannelError::Interrupted(InterruptedError::new(interrupt.clone())).into());
        assert!(interrupt.is_triggered());
        assert!(abort.cause().downcast_ref::<InterruptedError>().is_some());
        assert!(abort.invocation_error().is_none());
    }

    #[test]
    fn guarded_catches_panics() {
        let abort = guarded(|| panic!("oh no")).unwrap_err();
        let e = abort.invocation_error().unwrap();
        assert!(e.to_string().contains("oh no"));
        assert!(guarded(|| Ok(())).is_ok());
    }
}
