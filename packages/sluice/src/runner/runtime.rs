use super::{Execution, Runner};
use std::time::Duration;
use tokio::runtime::Handle;


/// Runner which schedules executions on a tokio runtime
///
/// Executions are blocking code, so they run on the runtime's blocking thread pool. Delays are
/// timed by the runtime's timer, which must be enabled. If the runtime shuts down first, pending
/// executions are dropped.
#[derive(Debug, Clone)]
pub struct TokioRunner {
    handle: Handle,
}

impl TokioRunner {
    /// Construct from a runtime handle
    pub fn new(handle: Handle) -> Self {
        TokioRunner { handle }
    }

    /// Construct for the runtime of the current context
    ///
    /// Panics if called outside of a tokio runtime, like [`Handle::current`].
    pub fn current() -> Self {
        TokioRunner::new(Handle::current())
    }

    /// Construct for the runtime of the current context, if there is one
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(TokioRunner::new)
    }

    /// The runtime handle
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Runner for TokioRunner {
    fn run(&self, execution: Execution, delay: Duration) {
        if delay.is_zero() {
            self.handle.spawn_blocking(move || execution.run());
        } else {
            self.handle.spawn(async move {
                tokio::time::sleep(delay).await;
                if tokio::task::spawn_blocking(move || execution.run()).await.is_err() {
                    warn!("delayed execution panicked or was cancelled on tokio runtime");
                }
            });
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc, time::Instant};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .unwrap()
    }

    #[test]
    fn runs_immediate_and_delayed() {
        let rt = runtime();
        let runner = TokioRunner::new(rt.handle().clone());
        let (send, recv) = mpsc::channel();
        let start = Instant::now();
        let send2 = send.clone();
        runner.run(Execution::new(move || send2.send("delayed").unwrap()), Duration::from_millis(30));
        runner.run(Execution::new(move || send.send("now").unwrap()), Duration::ZERO);
        assert_eq!(recv.recv_timeout(Duration::from_secs(5)).unwrap(), "now");
        assert_eq!(recv.recv_timeout(Duration::from_secs(5)).unwrap(), "delayed");
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn current_outside_runtime() {
        assert!(TokioRunner::try_current().is_none());
        let rt = runtime();
        let runner = rt.block_on(async { TokioRunner::try_current() });
        assert!(runner.is_some());
    }
}
