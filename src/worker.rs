use crate::errors::QueueError;
use crate::queue::{JobQueue, Shared};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

/// State of a queue's processing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// No loop is running.
    Idle,
    /// The loop is draining the queue or waiting for the next cycle.
    Processing,
    /// A stop was requested and the shutdown hook is running.
    Stopping,
}

impl JobQueue {
    /// Start processing jobs in a background task.
    ///
    /// Each cycle drains the queue, then waits `delay` (plus any configured
    /// jitter) before the next one. Cycles never overlap. The loop runs until
    /// [`stop_processing`](Self::stop_processing) is called, or until an error
    /// other than `QueueEmpty` aborts it. That error is returned by
    /// [`RunHandle::wait`].
    ///
    /// Fails with `QueueError::AlreadyProcessing` if the loop is running.
    pub fn start_processing(&self, delay: Duration) -> Result<RunHandle, QueueError> {
        let started = self.shared.loop_state.send_if_modified(|state| {
            if *state == LoopState::Idle {
                self.shared.stop_requested.store(false, Ordering::SeqCst);
                *state = LoopState::Processing;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(QueueError::AlreadyProcessing);
        }

        info!(delay = ?delay, "Starting job processing…");

        let worker = Worker {
            queue: self.clone(),
            delay,
        };
        let span = info_span!("worker");
        let handle = tokio::spawn(async move { worker.run().await }.instrument(span));

        Ok(RunHandle { handle })
    }

    /// Start processing jobs, waiting the configured poll interval between cycles.
    pub fn start_processing_default(&self) -> Result<RunHandle, QueueError> {
        self.start_processing(self.shared.config.poll_interval)
    }

    /// Ask the processing loop to stop and wait until it has.
    ///
    /// A job that is already running is finished first and no new cycle
    /// starts. Resolves once the shutdown hook has run. Returns immediately if
    /// the loop is not running.
    pub async fn stop_processing(&self) {
        let mut state = self.shared.loop_state.subscribe();
        if *state.borrow_and_update() == LoopState::Idle {
            return;
        }

        debug!("Requesting job processing to stop…");
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.stop_signal.notify_waiters();

        // The sender lives in `self`, so this cannot fail
        let _ = state.wait_for(|state| *state == LoopState::Idle).await;
    }

    /// Current state of the processing loop.
    pub fn loop_state(&self) -> LoopState {
        *self.shared.loop_state.borrow()
    }

    /// Whether the processing loop is running.
    pub fn is_processing(&self) -> bool {
        self.loop_state() != LoopState::Idle
    }
}

/// Handle to a running processing loop
#[derive(Debug)]
pub struct RunHandle {
    handle: JoinHandle<Result<(), QueueError>>,
}

impl RunHandle {
    /// Wait for the processing loop to end.
    ///
    /// Returns the error that aborted the loop, if any.
    pub async fn wait(self) -> Result<(), QueueError> {
        match self.handle.await {
            Ok(result) => result,
            Err(error) => {
                warn!(%error, "Job processing task panicked");
                Ok(())
            }
        }
    }

    /// Whether the loop has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

struct Worker {
    queue: JobQueue,
    delay: Duration,
}

impl Worker {
    async fn run(self) -> Result<(), QueueError> {
        let _idle = IdleOnDrop(&self.queue.shared);

        let result = self.process_until_stopped().await;
        match &result {
            Ok(()) => info!("Job processing stopped"),
            Err(error) => error!("Job processing aborted: {error}"),
        }
        result
    }

    async fn process_until_stopped(&self) -> Result<(), QueueError> {
        let shared = &self.queue.shared;
        loop {
            match self.queue.process_all_jobs().await {
                Err(QueueError::QueueEmpty) => trace!("No pending jobs found"),
                Err(error) => return Err(error),
                Ok(never) => match never {},
            }

            // Registered before the check, so a stop in between still wakes it
            let stop_signal = shared.stop_signal.notified();
            if shared.stop_requested.load(Ordering::SeqCst) {
                return self.shutdown().await;
            }

            let sleep_duration = shared.config.sleep_duration_with_jitter(self.delay);
            trace!("Polling again in {sleep_duration:?}…");
            tokio::select! {
                () = sleep(sleep_duration) => {}
                () = stop_signal => {}
            }

            if shared.stop_requested.load(Ordering::SeqCst) {
                return self.shutdown().await;
            }
        }
    }

    async fn shutdown(&self) -> Result<(), QueueError> {
        self.queue.shared.loop_state.send_replace(LoopState::Stopping);
        debug!("Shutting down job processing…");

        let hook = self.queue.handlers().shutdown_hook().cloned();
        if let Some(hook) = hook {
            hook().await;
        }
        Ok(())
    }
}

/// Returns the loop to `Idle` however it ends, so stop requests resolve.
struct IdleOnDrop<'a>(&'a Shared);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.loop_state.send_replace(LoopState::Idle);
    }
}
