//! Drop guard that runs a cleanup closure exactly once.

/// Runs its closure when dropped, unless disarmed.
///
/// The orchestrator holds one per run so the pipeline claim is released even
/// when the run task panics or is dropped mid-flight.
pub struct CleanupGuard<C: FnOnce()> {
    cleanup: Option<C>,
}

impl<C: FnOnce()> CleanupGuard<C> {
    /// Arms a guard.
    pub fn new(cleanup: C) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    /// Runs the cleanup now instead of on drop.
    pub fn run(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }

    /// Drops the guard without running the cleanup.
    pub fn disarm(mut self) {
        self.cleanup = None;
    }
}

impl<C: FnOnce()> Drop for CleanupGuard<C> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl<C: FnOnce()> std::fmt::Debug for CleanupGuard<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupGuard")
            .field("armed", &self.cleanup.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_guard(counter: &Arc<AtomicUsize>) -> CleanupGuard<impl FnOnce()> {
        let counter = counter.clone();
        CleanupGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_runs_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _guard = counter_guard(&counter);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_is_not_repeated_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        counter_guard(&counter).run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disarm() {
        let counter = Arc::new(AtomicUsize::new(0));
        counter_guard(&counter).disarm();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_runs_when_task_panics() {
        let counter = Arc::new(AtomicUsize::new(0));
        let guard_counter = counter.clone();
        let handle = tokio::spawn(async move {
            let _guard = counter_guard(&guard_counter);
            panic!("stage blew up");
        });
        assert!(handle.await.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
