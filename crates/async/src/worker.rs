//! Off-loop execution of blocking or CPU heavy work.
//!
//! Jobs run on tokio's blocking pool. The runtime is created lazily the first
//! time a loop offloads work, so loops that never do pay nothing for it.

use std::fmt;

use futures::channel::oneshot;
use once_cell::unsync::OnceCell;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, error};

use crate::AsyncError;

pub(crate) struct WorkerPool {
    runtime: OnceCell<Runtime>,
    threads: Option<usize>,
    thread_name: String,
    shut_down: bool,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("started", &self.runtime.get().is_some())
            .field("threads", &self.threads)
            .field("thread_name", &self.thread_name)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

impl WorkerPool {
    pub(crate) fn new(threads: Option<usize>, thread_name: String) -> Self {
        Self { runtime: OnceCell::new(), threads, thread_name, shut_down: false }
    }

    fn runtime(&self) -> Result<&Runtime, AsyncError> {
        self.runtime.get_or_try_init(|| {
            let mut builder = Builder::new_multi_thread();
            builder.worker_threads(1).thread_name(self.thread_name.as_str());
            if let Some(threads) = self.threads {
                builder.max_blocking_threads(threads);
            }
            debug!(threads = ?self.threads, name = %self.thread_name, "starting worker pool");
            builder.build().map_err(|e| {
                error!(cause = %e, "failed to start worker pool");
                AsyncError::from(e)
            })
        })
    }

    /// Queues `work` on the pool. The receiver completes with the job's result,
    /// or with `Canceled` if the job panicked.
    pub(crate) fn submit<T, F>(&self, work: F) -> Result<oneshot::Receiver<T>, AsyncError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.shut_down {
            return Err(AsyncError::cancelled_with("worker pool is shut down"));
        }
        let runtime = self.runtime()?;
        let (sender, receiver) = oneshot::channel();
        runtime.spawn_blocking(move || {
            // the loop may have stopped waiting, in which case the result is dropped
            let _ = sender.send(work());
        });
        Ok(receiver)
    }

    /// Stops the runtime without waiting for running jobs. Later submissions fail.
    pub(crate) fn shutdown(&mut self) {
        self.shut_down = true;
        if let Some(runtime) = self.runtime.take() {
            debug!(name = %self.thread_name, "stopping worker pool");
            runtime.shutdown_background();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
