//! Single-slot delayed task for trailing-edge debouncing.
//!
//! A [`Debouncer`] holds at most one scheduled task. Scheduling again
//! replaces the previous task and restarts the delay, so only the last call
//! in a burst runs. Cancellation applies to the waiting phase only: once the
//! delay elapses the task is spawned on its own and runs to completion even
//! if the slot is cancelled or rescheduled afterwards.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use workmirror_sync::utils::debounce::Debouncer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut debouncer = Debouncer::new();
//!
//!     debouncer.schedule(Duration::from_millis(100), async { println!("first") });
//!     debouncer.schedule(Duration::from_millis(100), async { println!("second") });
//!
//!     // Only "second" is printed, 100ms after the second call.
//!     tokio::time::sleep(Duration::from_millis(200)).await;
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// Default debounce interval in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// A cancellable, replaceable delayed task.
#[derive(Debug, Default)]
pub struct Debouncer {
    /// The waiting timer, if one is scheduled.
    handle: Option<JoinHandle<()>>,
}

impl Debouncer {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` after `delay`, replacing any task still waiting.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule<F>(&mut self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();

        trace!(delay_ms = delay.as_millis(), "Scheduling delayed task");

        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Detach so that a later cancel cannot interrupt the task itself.
            tokio::spawn(task);
        }));
    }

    /// Cancels the waiting task, if any. A task that already fired is unaffected.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Returns true if a task is scheduled and its delay has not elapsed yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_task_runs_after_delay() {
        let (tx, mut rx) = mpsc::channel(10);
        let mut debouncer = Debouncer::new();

        debouncer.schedule(Duration::from_millis(50), async move {
            tx.send(42).await.unwrap();
        });

        // Not before the delay
        let early = timeout(Duration::from_millis(20), rx.recv()).await;
        assert!(early.is_err(), "Should not run before delay");

        let result = timeout(Duration::from_millis(200), rx.recv()).await;
        assert_eq!(result.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_reschedule_replaces_previous() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(10);
        let mut debouncer = Debouncer::new();

        for i in 0..5 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            debouncer.schedule(Duration::from_millis(50), async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(i).await.unwrap();
            });
        }

        let result = timeout(Duration::from_millis(200), rx.recv()).await;
        assert_eq!(result.unwrap(), Some(4), "Only the last task should run");

        sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timer_reset_on_reschedule() {
        let (tx, mut rx) = mpsc::channel(10);
        let mut debouncer = Debouncer::new();

        let tx1 = tx.clone();
        debouncer.schedule(Duration::from_millis(100), async move {
            tx1.send(1).await.unwrap();
        });
        sleep(Duration::from_millis(60)).await;

        debouncer.schedule(Duration::from_millis(100), async move {
            tx.send(2).await.unwrap();
        });

        // The first deadline passes without anything running
        let early = timeout(Duration::from_millis(60), rx.recv()).await;
        assert!(early.is_err());

        let result = timeout(Duration::from_millis(200), rx.recv()).await;
        assert_eq!(result.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_cancel_prevents_run() {
        let (tx, mut rx) = mpsc::channel::<i32>(10);
        let mut debouncer = Debouncer::new();

        debouncer.schedule(Duration::from_millis(30), async move {
            tx.send(1).await.unwrap();
        });
        assert!(debouncer.is_pending());

        debouncer.cancel();
        assert!(!debouncer.is_pending());

        // Sender was dropped with the aborted task, so the channel closes
        let result = timeout(Duration::from_millis(200), rx.recv()).await;
        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_after_fire_does_not_interrupt_task() {
        let (tx, mut rx) = mpsc::channel(10);
        let mut debouncer = Debouncer::new();

        debouncer.schedule(Duration::from_millis(10), async move {
            sleep(Duration::from_millis(50)).await;
            tx.send("done").await.unwrap();
        });

        sleep(Duration::from_millis(30)).await;
        assert!(!debouncer.is_pending());
        debouncer.cancel();

        let result = timeout(Duration::from_millis(200), rx.recv()).await;
        assert_eq!(result.unwrap(), Some("done"));
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let (tx, mut rx) = mpsc::channel::<i32>(10);
        {
            let mut debouncer = Debouncer::new();
            debouncer.schedule(Duration::from_millis(30), async move {
                tx.send(1).await.unwrap();
            });
        }

        let result = timeout(Duration::from_millis(200), rx.recv()).await;
        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zero_delay_runs_promptly() {
        let (tx, mut rx) = mpsc::channel(10);
        let mut debouncer = Debouncer::new();

        debouncer.schedule(Duration::ZERO, async move {
            tx.send(7).await.unwrap();
        });

        let result = timeout(Duration::from_millis(100), rx.recv()).await;
        assert_eq!(result.unwrap(), Some(7));
    }
}
