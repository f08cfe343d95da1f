//! Generic timer handles used for sender/receiver inactivity, the A-timer,
//! the rate window, the RTX timer, and the rendezvous timer (§4.11).
//!
//! An async handle that can be armed, re-armed, and cancelled by a
//! background task driven by `futures-timer`, since §4.11's timers must fire
//! handlers on expiration rather than only being polled.
use async_std::task::{self, JoinHandle};
use futures_timer::Delay;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A single-shot, re-armable countdown whose expiration runs an
/// asynchronous handler.
///
/// Grounded on `dtcp/src/lib.rs`'s `Timer` for the enable/start/stop
/// vocabulary; reimplemented on top of a spawned task since the data model
/// requires timers to actively invoke policy hooks on expiry, not just be
/// polled by the next protocol operation.
pub struct Timer {
    cancel: std::sync::Mutex<Arc<AtomicBool>>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Creates a disarmed timer.
    pub fn new() -> Self {
        Self {
            cancel: std::sync::Mutex::new(Arc::new(AtomicBool::new(true))),
            handle: std::sync::Mutex::new(None),
        }
    }

    /// Arms the timer to run `on_expire` after `interval`, cancelling any
    /// previously scheduled firing first.
    pub fn arm<F, Fut>(&self, interval: Duration, on_expire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.stop();
        let cancel = Arc::new(AtomicBool::new(false));
        let my_cancel = cancel.clone();
        let handle = task::spawn(async move {
            Delay::new(interval).await;
            if !my_cancel.load(Ordering::SeqCst) {
                on_expire().await;
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
        *self.cancel.lock().unwrap() = cancel;
    }

    /// Cancels any pending firing. Does not await the handler if it is
    /// already running (cancellation busy-waiting is the caller's
    /// responsibility during teardown, per §5).
    pub fn stop(&self) {
        self.cancel.lock().unwrap().store(true, Ordering::SeqCst);
        self.handle.lock().unwrap().take();
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the sender-inactivity interval `3*(MPL+R+A)`.
pub fn sender_inactivity_interval(mpl: Duration, r: Duration, a: Duration) -> Duration {
    (mpl + r + a) * 3
}

/// Computes the receiver-inactivity interval `2*(MPL+R+A)`.
pub fn receiver_inactivity_interval(mpl: Duration, r: Duration, a: Duration) -> Duration {
    (mpl + r + a) * 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_inactivity_matches_formula() {
        let mpl = Duration::from_millis(100);
        let r = Duration::from_millis(50);
        let a = Duration::from_millis(20);
        assert_eq!(sender_inactivity_interval(mpl, r, a), Duration::from_millis(510));
    }

    #[test]
    fn receiver_inactivity_matches_formula() {
        let mpl = Duration::from_millis(100);
        let r = Duration::from_millis(50);
        let a = Duration::from_millis(20);
        assert_eq!(receiver_inactivity_interval(mpl, r, a), Duration::from_millis(340));
    }
}
