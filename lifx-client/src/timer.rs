use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Fires a callback on a fixed interval on a single background worker until cancelled.
///
/// Ticks never overlap: the worker waits for the previous invocation to return before
/// scheduling the next wait. Cancellation takes effect at most one interval later, since
/// it's only checked between ticks, not in the middle of a running callback.
///
/// Grounded on the reference `RepeatTimer`, which loops creating a fresh
/// `threading.Timer` each cycle and joins it; here a single thread blocks on a
/// cancellation channel with a timeout equal to the interval, and treats a timeout (as
/// opposed to a cancellation) as "time to fire" rather than spawning a new thread per tick.
pub struct RepeatTimer {
    cancelled: Arc<AtomicBool>,
    cancel_tx: mpsc::Sender<()>,
}

impl RepeatTimer {
    /// Spawns the worker thread and starts the interval immediately (the first tick fires
    /// after one interval, not at spawn time).
    pub fn start<F>(interval: Duration, mut callback: F) -> RepeatTimer
    where
        F: FnMut() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();

        let worker_cancelled = Arc::clone(&cancelled);
        thread::spawn(move || loop {
            match cancel_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if worker_cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    callback();
                }
            }
        });

        RepeatTimer {
            cancelled,
            cancel_tx,
        }
    }

    /// Requests cancellation. Non-blocking: the worker may complete an in-flight callback
    /// before it observes this.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.cancel_tx.send(());
    }
}

impl Drop for RepeatTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    #[test]
    fn fires_at_least_six_times_in_40ms_at_a_5ms_interval_then_cancels() {
        let count = Arc::new(AtomicU32::new(0));
        let count2 = Arc::clone(&count);
        let timer = RepeatTimer::start(Duration::from_millis(5), move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_millis(40);
        while Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        timer.cancel();
        assert!(count.load(Ordering::SeqCst) >= 6);

        let seen_after_cancel = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), seen_after_cancel);
    }

    #[test]
    fn ticks_do_not_overlap_a_slow_callback() {
        let running = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let running2 = Arc::clone(&running);
        let overlapped2 = Arc::clone(&overlapped);

        let timer = RepeatTimer::start(Duration::from_millis(2), move || {
            if running2.swap(true, Ordering::SeqCst) {
                overlapped2.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(10));
            running2.store(false, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        timer.cancel();
        assert!(!overlapped.load(Ordering::SeqCst));
    }
}
