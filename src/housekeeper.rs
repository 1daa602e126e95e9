//! # Background Housekeeper
//!
//! Each attached [`MessageStore`](crate::MessageStore) runs one housekeeper: a
//! dedicated thread that periodically purges terminal rows and, when enabled,
//! repairs duplicate ids and checkpoints the engine.
//!
//! ## Scheduling
//!
//! ```text
//!  spawn                                                       stop()
//!    │                                                            │
//!    ▼                                                            ▼
//!  Running ── initial delay ── pass ── interval ── pass ── ... ── Stopped
//!                               │                   │
//!                          errors/panics logged, never stop the loop
//! ```
//!
//! The delay is fixed between the end of one pass and the start of the next,
//! so a slow pass never overlaps with the following one.
//!
//! ## Thread Model
//!
//! The thread drives a single-threaded Tokio runtime. The sleep between passes
//! is raced against a oneshot stop signal, so `stop()` interrupts a sleeping
//! housekeeper immediately. A pass that is already running is never
//! interrupted: `stop()` waits for it, bounded by a timeout, then detaches the
//! thread with a warning. A detached housekeeper keeps reporting
//! [`HousekeeperState::Running`] until its thread actually exits.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Delay before the first pass after spawn.
pub const INITIAL_DELAY: Duration = Duration::from_secs(1);

/// How long `stop()` waits for a running pass to finish.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(30);

const THREAD_NAME: &str = "outboxdb-housekeeper";

/// Lifecycle state of a housekeeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HousekeeperState {
    /// The background thread is scheduled or running a pass.
    Running,
    /// The background thread has exited.
    Stopped,
}

/// Handle to a running housekeeper thread.
///
/// Dropping the handle stops the housekeeper.
#[derive(Debug)]
pub struct Housekeeper {
    label: String,
    stop_tx: Option<oneshot::Sender<()>>,
    done_rx: mpsc::Receiver<()>,
    thread_handle: Option<JoinHandle<()>>,
    passes: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
}

/// Marks the thread finished when dropped, including on unwind.
struct FinishedGuard(Arc<AtomicBool>);

impl Drop for FinishedGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

impl Housekeeper {
    /// Spawns a housekeeper that runs `task` after `initial_delay`, then
    /// again `interval` after each pass finishes.
    ///
    /// `label` identifies the housekeeper in log lines.
    ///
    /// # Errors
    ///
    /// `Error::Config` if the thread cannot be spawned.
    pub fn spawn<F>(
        label: impl Into<String>,
        initial_delay: Duration,
        interval: Duration,
        task: F,
    ) -> Result<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let label = label.into();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let passes = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let thread_label = label.clone();
        let thread_passes = Arc::clone(&passes);
        let guard = FinishedGuard(Arc::clone(&finished));
        let thread_handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let _guard = guard;
                run_housekeeper(
                    &thread_label,
                    initial_delay,
                    interval,
                    task,
                    stop_rx,
                    &thread_passes,
                );
                let _ = done_tx.send(());
            })
            .map_err(|e| Error::Config(format!("failed to spawn housekeeper thread: {e}")))?;

        info!(
            store = %label,
            interval_secs = interval.as_secs(),
            "housekeeper started"
        );

        Ok(Self {
            label,
            stop_tx: Some(stop_tx),
            done_rx,
            thread_handle: Some(thread_handle),
            passes,
            finished,
        })
    }

    /// Returns the current state.
    ///
    /// Follows the thread, not the handle: after a `stop` that timed out and
    /// detached a pass, this stays `Running` until that pass returns.
    pub fn state(&self) -> HousekeeperState {
        if self.finished.load(Ordering::Acquire) {
            HousekeeperState::Stopped
        } else {
            HousekeeperState::Running
        }
    }

    /// Number of passes completed so far, successful or not.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Stops the housekeeper, waiting up to [`STOP_TIMEOUT`] for a running
    /// pass to finish.
    pub fn stop(&mut self) {
        self.stop_with_timeout(STOP_TIMEOUT);
    }

    /// Same as [`stop`](Self::stop) with an explicit bound.
    ///
    /// Returns false if the pass did not finish in time and the thread was
    /// detached.
    pub fn stop_with_timeout(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.thread_handle.take() else {
            return true;
        };

        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    error!(store = %self.label, "housekeeper thread panicked");
                }
                info!(store = %self.label, passes = self.passes(), "housekeeper stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    store = %self.label,
                    timeout_secs = timeout.as_secs(),
                    "housekeeper pass still running, detaching thread"
                );
                false
            }
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The housekeeper thread's main loop.
fn run_housekeeper<F>(
    label: &str,
    initial_delay: Duration,
    interval: Duration,
    mut task: F,
    mut stop_rx: oneshot::Receiver<()>,
    passes: &AtomicU64,
) where
    F: FnMut() -> Result<()>,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(store = %label, error = %e, "failed to build housekeeper runtime");
            return;
        }
    };

    runtime.block_on(async {
        let mut delay = initial_delay;
        loop {
            // A dropped sender also resolves the receiver.
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let pass = passes.load(Ordering::Relaxed) + 1;
            debug!(store = %label, pass, "housekeeper pass starting");

            match panic::catch_unwind(AssertUnwindSafe(&mut task)) {
                Ok(Ok(())) => debug!(store = %label, pass, "housekeeper pass finished"),
                Ok(Err(e)) => error!(store = %label, pass, error = %e, "housekeeper pass failed"),
                Err(_) => error!(store = %label, pass, "housekeeper pass panicked"),
            }

            passes.fetch_add(1, Ordering::Relaxed);
            delay = interval;
        }
    });
}

// =============================================================================
// Tests
// =============================================================================
