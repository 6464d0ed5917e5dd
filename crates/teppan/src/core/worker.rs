//! Background task ownership for the async driver.

use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
use tokio::{task::JoinHandle, sync::Notify};

/// Owns a spawned loop that steps a scheduler until told to stop.
///
/// The loop receives a running flag and a [`Notify`]. It should check the
/// flag on every iteration and park on the notifier when it has nothing to
/// do; [`WorkerHandle::wake`] hands it a permit when new work arrives, so a
/// wake-up sent before the loop parks is not lost.
///
/// Dropping the handle clears the flag and wakes the loop so it can exit.
pub struct WorkerHandle {
    running: Arc<AtomicBool>,
    /// `None` once shutdown has started
    handle: Option<JoinHandle<()>>,
    notifier: Arc<Notify>,
}

impl WorkerHandle {
    /// Spawn the loop built by `task`
    pub fn spawn<F>(task: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>) -> JoinHandle<()>,
    {
        let running = Arc::new(AtomicBool::new(true));
        let notifier = Arc::new(Notify::new());
        let handle = task(running.clone(), notifier.clone());
        Self {
            running,
            handle: Some(handle),
            notifier,
        }
    }

    /// Tell the loop there is work
    pub fn wake(&self) {
        self.notifier.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the loop after its current iteration. The task is detached and
    /// awaited in the background.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.notify_one();
        if let Some(handle) = self.handle.take() {
            tokio::spawn(async move {
                let _ = handle.await;
            });
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
