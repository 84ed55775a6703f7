//! Run a batch of fallible tasks to completion and collect every error.
//!
//! Unlike `try_join_all`, a failure does not cancel the remaining tasks:
//! sysctls and env sources are all attempted so the log shows every problem
//! at once.

use std::future::Future;

use tokio::task::JoinSet;

use crate::error::{InitError, JoinedError};

pub struct TaskGroup<T> {
    set: JoinSet<Result<T, InitError>>,
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new() -> Self {
        Self {
            set: JoinSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T, InitError>> + Send + 'static,
    {
        self.set.spawn(task);
    }

    pub fn spawn_blocking<F>(&mut self, task: F)
    where
        F: FnOnce() -> Result<T, InitError> + Send + 'static,
    {
        self.set.spawn_blocking(task);
    }

    /// Wait for every task. Results come back in completion order.
    pub async fn join(mut self) -> Result<Vec<T>, JoinedError> {
        let mut values = Vec::with_capacity(self.set.len());
        let mut errors = Vec::new();
        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok(Ok(value)) => values.push(value),
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(InitError::Task(e)),
            }
        }
        JoinedError::check(errors)?;
        Ok(values)
    }
}
