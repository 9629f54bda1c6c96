//! Retry loop for transient I/O failures.
//!
//! Disk-full and similar conditions clear when the operator intervenes, so
//! failed index/journal operations are retried once a second instead of
//! failing the store. The loop aborts only when the host service has been
//! asked to stop, or when the error is fatal by classification.

use std::time::Duration;

use longshore_error::{Result, StoreError};
use parking_lot::{Condvar, Mutex};
use tracing::warn;

/// Interval between retry attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Shared "the service is stopping" flag with a cancellation-aware sleep.
#[derive(Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    /// Fresh, un-stopped signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the service as stopping and wake every sleeper.
    pub fn stop(&self) {
        *self.stopped.lock() = true;
        self.condvar.notify_all();
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for up to `timeout`, returning early when the service stops.
    /// Returns the stopped state on wakeup.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.condvar.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

/// Run `op` until it succeeds, fails fatally, or the service stops.
///
/// The first failure is logged; repeats are silent until the outcome
/// changes.
pub fn retry<T>(stop: &StopSignal, operation: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut logged = false;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                if !logged {
                    warn!(operation, %error, "operation failed, retrying every 1s");
                    logged = true;
                }
                if stop.wait(RETRY_INTERVAL) {
                    return Err(StoreError::Stopping);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn returns_first_success() {
        let stop = StopSignal::new();
        let calls = AtomicU32::new(0);
        let result = retry(&stop, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, StoreError>(7)
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let stop = StopSignal::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&stop, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::InvalidConfig {
                detail: "bad".to_owned(),
            })
        });
        assert!(result.unwrap_err().is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_aborts_the_loop() {
        let stop = Arc::new(StopSignal::new());
        let stopper = stop.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stopper.stop();
        });

        let result: Result<()> = retry(&stop, "test", || {
            Err(StoreError::index("disk full"))
        });
        assert!(matches!(result, Err(StoreError::Stopping)));
        handle.join().unwrap();
    }

    #[test]
    fn wait_returns_early_on_stop() {
        let stop = Arc::new(StopSignal::new());
        let stopper = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            stopper.stop();
        });

        let start = std::time::Instant::now();
        assert!(stop.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
