//! Detached task dispatch
//!
//! Work handed to the dispatcher runs on its own tokio task. The caller gets
//! no handle, result or cancellation: a failure is logged and dropped, and a
//! panic stays inside the task.

use crate::error::Result;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Launches fire-and-forget work
#[derive(Debug, Clone, Default)]
pub struct TaskDispatcher {
    dispatched: Arc<AtomicU64>,
}

impl TaskDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `work` and return immediately
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch<F>(&self, label: impl Into<String>, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let label = label.into();
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(task = %label, "Dispatching detached task");

        // The join handle is dropped on purpose; nobody waits for this task.
        drop(tokio::spawn(async move {
            match work.await {
                Ok(()) => debug!(task = %label, "Detached task finished"),
                Err(e) => warn!(task = %label, "Detached task failed: {}", e),
            }
        }));
    }

    /// Number of tasks dispatched so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
}
