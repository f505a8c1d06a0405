//! Background worker threads
//!
//! Each resilience component runs its loop on a named thread built by
//! [`Worker::spawn`]. A tick that fails (or panics) is logged and followed
//! by a backoff sleep; the thread itself only exits when stopped. Sleeps
//! wait on a [`StopSignal`] so `stop()` interrupts them immediately.

use crate::error::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poll interval while waiting for a worker to finish
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Shared stop flag with an interruptible sleep.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake every sleeper.
    pub fn stop(&self) {
        *self.stopped.lock().unwrap() = true;
        self.cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap()
    }

    /// Sleep for up to `timeout`. Returns `true` if a stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap();
        if timeout.is_zero() {
            return *guard;
        }
        let (guard, _) = self
            .cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap();
        *guard
    }
}

/// A named thread running a tick function on a fixed interval.
pub struct Worker {
    name: String,
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker that calls `tick` immediately, then every `interval`.
    ///
    /// After a failed tick the worker sleeps for `backoff` instead.
    pub fn spawn<F>(name: &str, interval: Duration, backoff: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut(&StopSignal) -> Result<()> + Send + 'static,
    {
        let signal = Arc::new(StopSignal::new());
        let thread_signal = Arc::clone(&signal);
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                tracing::info!(worker = %thread_name, "Worker started");
                let mut ticks = 0u64;

                while !thread_signal.is_stopped() {
                    ticks += 1;
                    let outcome = catch_unwind(AssertUnwindSafe(|| tick(&thread_signal)));

                    let pause = match outcome {
                        Ok(Ok(())) => interval,
                        Ok(Err(e)) => {
                            tracing::warn!(
                                worker = %thread_name,
                                tick = ticks,
                                error = %e,
                                "Worker tick failed, backing off"
                            );
                            backoff
                        }
                        Err(_) => {
                            tracing::error!(
                                worker = %thread_name,
                                tick = ticks,
                                "Worker tick panicked, backing off"
                            );
                            backoff
                        }
                    };

                    if thread_signal.wait(pause) {
                        break;
                    }
                }

                tracing::info!(worker = %thread_name, ticks, "Worker stopped");
            })?;

        Ok(Self {
            name: name.to_string(),
            signal,
            handle: Some(handle),
        })
    }

    /// Whether the thread is still alive.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the worker and wait up to `timeout` for it to exit.
    ///
    /// A worker still mid-tick after the timeout is detached. Returns
    /// whether the thread was joined.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.signal.stop();

        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }

        if handle.is_finished() {
            if handle.join().is_err() {
                tracing::warn!(worker = %self.name, "Worker thread panicked on exit");
            }
            true
        } else {
            tracing::warn!(
                worker = %self.name,
                timeout_ms = timeout.as_millis() as u64,
                "Worker did not stop in time, detaching"
            );
            false
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.signal.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_wait_returns_early_on_stop() {
        let signal = Arc::new(StopSignal::new());
        let s = Arc::clone(&signal);
        let waiter = thread::spawn(move || s.wait(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        signal.stop();
        assert!(waiter.join().unwrap());
        assert!(signal.is_stopped());
    }

    #[test]
    fn test_worker_survives_errors_and_panics() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        let mut worker = Worker::spawn(
            "test-worker",
            Duration::from_millis(1),
            Duration::from_millis(1),
            move |_| {
                let n = t.fetch_add(1, Ordering::SeqCst);
                match n % 3 {
                    0 => Err(Error::Detection("source offline".to_string())),
                    1 => panic!("tick blew up"),
                    _ => Ok(()),
                }
            },
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 6 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.is_running());
        assert!(ticks.load(Ordering::SeqCst) >= 6);

        assert!(worker.stop(Duration::from_secs(5)));
        assert!(!worker.is_running());
        // Second stop is a no-op
        assert!(worker.stop(Duration::from_secs(1)));
    }

    #[test]
    fn test_stop_interrupts_long_interval() {
        let mut worker = Worker::spawn(
            "sleepy",
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            |_| Ok(()),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        assert!(worker.stop(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_stop_detaches_busy_worker() {
        let mut worker = Worker::spawn(
            "busy",
            Duration::from_secs(1),
            Duration::from_secs(1),
            |_| {
                thread::sleep(Duration::from_millis(500));
                Ok(())
            },
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!worker.stop(Duration::from_millis(10)));
    }
}
