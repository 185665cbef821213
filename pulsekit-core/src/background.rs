//! Background loop primitives
//!
//! Every periodic job in the SDK (event flush, configuration refresh, push
//! pull) runs as a [`RepeatingTask`]: the next cycle is scheduled only after
//! the current one finishes, never at a fixed rate. Work that can also be
//! triggered from outside the loop takes a [`Latch`] so overlapping cycles are
//! skipped instead of stacked.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Busy flag with start/stop bookkeeping
#[derive(Debug, Default)]
pub struct Latch {
    held: AtomicBool,
    last_start_ms: AtomicI64,
    last_stop_ms: AtomicI64,
}

/// Releases its [`Latch`] on drop
pub struct LatchGuard<'a> {
    latch: &'a Latch,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the latch unless someone else holds it
    pub fn try_acquire(&self) -> Option<LatchGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.last_start_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        Some(LatchGuard { latch: self })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// When the latch was last taken, ms since epoch
    pub fn last_start(&self) -> Option<i64> {
        non_zero(self.last_start_ms.load(Ordering::Relaxed))
    }

    /// When the latch was last released, ms since epoch
    pub fn last_stop(&self) -> Option<i64> {
        non_zero(self.last_stop_ms.load(Ordering::Relaxed))
    }
}

fn non_zero(ms: i64) -> Option<i64> {
    (ms != 0).then_some(ms)
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.latch
            .last_stop_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.latch.held.store(false, Ordering::Release);
    }
}

/// A spawned loop: wait, run, wait again
pub struct RepeatingTask {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RepeatingTask {
    /// Spawn a loop that first waits `first_delay`, then runs `work` and
    /// waits `interval()` after each completed run.
    ///
    /// `interval` is re-evaluated every cycle so cadence changes take effect
    /// on the next sleep. Must be called inside a tokio runtime.
    pub fn spawn<I, W, Fut>(name: &'static str, first_delay: Duration, interval: I, mut work: W) -> Self
    where
        I: Fn() -> Duration + Send + 'static,
        W: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut delay = first_delay;
            loop {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop_rx.changed() => {}
                    }
                }
                if *stop_rx.borrow() {
                    break;
                }

                work().await;

                delay = interval();
                tracing::trace!(task = name, delay_ms = delay.as_millis() as u64, "Cycle complete");
            }
            tracing::debug!(task = name, "Background task stopped");
        });

        tracing::debug!(task = name, "Background task started");
        Self {
            name,
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Cancel the timer; a cycle already running is allowed to finish
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Cancel the timer and wait for the loop to exit
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(task = self.name, error = %e, "Background task ended abnormally");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}
