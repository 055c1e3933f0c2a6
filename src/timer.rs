//! Background interval timer.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::thread;
use std::time::Duration;

/// A stoppable timer that invokes a callback on its own thread every `interval`.
///
/// Stopping never joins the timer thread, so a callback may stop (and start)
/// the timer that is running it. A stopped thread exits once its current
/// callback returns.
pub(crate) struct Timer {
    name: &'static str,
    interval: Duration,
    /// Dropping the sender wakes and stops the running thread.
    stop: Mutex<Option<Sender<()>>>,
}

impl Timer {
    pub(crate) fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            stop: Mutex::new(None),
        }
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    /// Start ticking. Returns false if already running.
    pub(crate) fn start<F>(&self, mut tick: F) -> bool
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let mut stop = self.stop.lock();
        if stop.is_some() {
            return false;
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let interval = self.interval;
        let spawned = thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if tick().is_break() {
                            break;
                        }
                    }
                    _ => break,
                }
            });

        match spawned {
            Ok(_) => {
                *stop = Some(stop_tx);
                true
            }
            Err(e) => {
                tracing::error!(timer = self.name, error = %e, "failed to spawn timer thread");
                false
            }
        }
    }

    /// Stop ticking. Returns false if it was not running.
    pub(crate) fn stop(&self) -> bool {
        self.stop.lock().take().is_some()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.stop.lock().is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}
