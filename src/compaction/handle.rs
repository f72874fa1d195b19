//! Handles for the scheduler's background timer tasks.

use std::{future::Future, time::Duration};

use futures::{
    channel::mpsc,
    future::{AbortHandle, Abortable, Aborted},
    StreamExt,
};
use tokio::{runtime::Handle, task::JoinHandle};

#[derive(Debug)]
pub(crate) enum TimerTrigger {
    Kick,
}

/// Handle to a background timer task.
///
/// The task is aborted when the handle is dropped.
pub(crate) struct TimerTaskHandle {
    name: &'static str,
    abort: AbortHandle,
    join: Option<JoinHandle<Result<(), Aborted>>>,
    trigger: Option<mpsc::Sender<TimerTrigger>>,
}

impl TimerTaskHandle {
    pub(crate) fn new(
        name: &'static str,
        abort: AbortHandle,
        join: Option<JoinHandle<Result<(), Aborted>>>,
        trigger: Option<mpsc::Sender<TimerTrigger>>,
    ) -> Self {
        Self {
            name,
            abort,
            join,
            trigger,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// Best-effort trigger to run the next tick now.
    pub(crate) fn kick(&self) {
        if let Some(sender) = &self.trigger {
            let mut sender = sender.clone();
            let _ = sender.try_send(TimerTrigger::Kick);
        }
    }

    pub(crate) fn abort(&self) {
        self.abort.abort();
    }

    /// Wait for the task to exit. Call [`abort`](Self::abort) first unless
    /// the task ends by itself.
    pub(crate) async fn join(&mut self) {
        if let Some(join) = self.join.take() {
            match join.await {
                Ok(Ok(())) | Ok(Err(Aborted)) => {}
                Err(err) => tracing::error!("timer task {} failed: {err}", self.name),
            }
        }
    }
}

impl Drop for TimerTaskHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Run `tick` every `interval` on the blocking pool, or earlier when kicked.
/// The loop ends when `tick` returns `false`.
pub(crate) fn spawn_timer<F>(
    runtime: &Handle,
    name: &'static str,
    interval: Duration,
    tick: F,
) -> TimerTaskHandle
where
    F: Fn() -> bool + Clone + Send + Sync + 'static,
{
    let (trigger_tx, mut trigger_rx) = mpsc::channel(1);
    let (abort, registration) = AbortHandle::new_pair();
    let task = async move {
        loop {
            match tokio::time::timeout(interval, trigger_rx.next()).await {
                Ok(None) => break,
                Ok(Some(TimerTrigger::Kick)) | Err(_) => {}
            }
            let tick = tick.clone();
            match tokio::task::spawn_blocking(tick).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => tracing::error!("timer task {name} tick panicked: {err}"),
            }
        }
    };
    let join = runtime.spawn(Abortable::new(task, registration));
    TimerTaskHandle::new(name, abort, Some(join), Some(trigger_tx))
}

/// Spawn a future that runs until aborted.
pub(crate) fn spawn_worker<Fut>(runtime: &Handle, name: &'static str, worker: Fut) -> TimerTaskHandle
where
    Fut: Future<Output = ()> + Send + 'static,
{
    let (abort, registration) = AbortHandle::new_pair();
    let join = runtime.spawn(Abortable::new(worker, registration));
    TimerTaskHandle::new(name, abort, Some(join), None)
}
