//! Task executors used by the crash generation cleaner.
//!
//! The cleaner hands each worker to an [`Executor`] and later blocks on the
//! returned [`JobResult`]. A worker panic surfaces as
//! [`CleanerError::WorkerPanicked`] instead of unwinding into the caller.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::thread::JoinHandle;

use crate::cleaner::CleanerError;

/// A unit of cleanup work.
pub type CleanupTask = Box<dyn FnOnce() -> Result<(), CleanerError> + Send + 'static>;

/// Runs cleanup tasks.
pub trait Executor: Send + Sync {
    /// Start `task`. `label` names the task in thread names and logs.
    fn submit(&self, label: &str, task: CleanupTask) -> JobResult;
}

/// Handle to a submitted task.
#[must_use = "a job must be awaited with get()"]
pub struct JobResult {
    inner: JobInner,
}

enum JobInner {
    Thread(JoinHandle<Result<(), CleanerError>>),
    Done(Result<(), CleanerError>),
}

impl JobResult {
    /// A job that has already finished.
    pub const fn completed(result: Result<(), CleanerError>) -> Self {
        Self {
            inner: JobInner::Done(result),
        }
    }

    /// Block until the task finishes and return its outcome.
    pub fn get(self) -> Result<(), CleanerError> {
        match self.inner {
            JobInner::Thread(handle) => handle.join().unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                Err(CleanerError::WorkerPanicked(message))
            }),
            JobInner::Done(result) => result,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs every task on its own named OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn submit(&self, label: &str, task: CleanupTask) -> JobResult {
        match std::thread::Builder::new().name(label.to_string()).spawn(task) {
            Ok(handle) => JobResult {
                inner: JobInner::Thread(handle),
            },
            Err(e) => {
                tracing::warn!("failed to spawn '{label}': {e}");
                JobResult::completed(Err(CleanerError::Spawn(e)))
            }
        }
    }
}

/// Runs every task to completion on the submitting thread.
///
/// Used where deterministic ordering matters more than parallelism.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn submit(&self, _label: &str, task: CleanupTask) -> JobResult {
        let result = std::panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            Err(CleanerError::WorkerPanicked(message))
        });
        JobResult::completed(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(f: impl FnOnce() -> Result<(), CleanerError> + Send + 'static) -> CleanupTask {
        Box::new(f)
    }

    #[test]
    fn test_thread_executor_returns_task_result() {
        let job = ThreadExecutor.submit("ok", task(|| Ok(())));
        assert!(job.get().is_ok());

        let job = ThreadExecutor.submit(
            "fails",
            task(|| Err(CleanerError::WorkerPanicked("boom".to_string()))),
        );
        assert!(job.get().is_err());
    }

    #[test]
    fn test_thread_executor_names_thread_after_label() {
        let job = ThreadExecutor.submit(
            "Recovery clean up of 'test'",
            task(|| {
                assert_eq!(
                    std::thread::current().name(),
                    Some("Recovery clean up of 'test'")
                );
                Ok(())
            }),
        );
        assert!(job.get().is_ok());
    }

    #[test]
    fn test_panic_becomes_error() {
        let job = ThreadExecutor.submit("panics", task(|| panic!("worker exploded")));
        match job.get() {
            Err(CleanerError::WorkerPanicked(message)) => assert_eq!(message, "worker exploded"),
            other => panic!("unexpected result: {other:?}"),
        }

        let job = InlineExecutor.submit("panics", task(|| panic!("inline {}", 7)));
        match job.get() {
            Err(CleanerError::WorkerPanicked(message)) => assert_eq!(message, "inline 7"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
