//! Cooperative cancellation and job state observation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Clonable handle to a job, usable from any thread.
///
/// `cancel()` stops the executor from scheduling anything new; dispatches
/// already running see the flag through their `ExecutionContext` and stop at
/// their next check.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    state: Arc<Mutex<JobState>>,
}

impl CancelHandle {
    pub(crate) fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(JobState::Pending)),
        }
    }

    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::AcqRel) {
            tracing::info!("job cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn job_state(&self) -> JobState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: JobState) {
        *self.state.lock() = state;
    }

    /// The flag handed to platforms.
    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag_and_state() {
        let a = CancelHandle::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        a.cancel();
        assert!(b.is_cancelled());
        assert!(b.flag().load(Ordering::Acquire));

        a.set_state(JobState::Running);
        assert_eq!(b.job_state(), JobState::Running);
    }
}
