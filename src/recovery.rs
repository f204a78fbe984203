//! Failure Recovery Engine
//!
//! Event-driven retry manager decoupled from protocol specifics. Failure
//! sites hold a cheap [`RecoveryHandle`] and signal it; a background worker
//! consumes the signal, enforces the consecutive-failure budget, sleeps the
//! backoff interval, and invokes the supplied recovery action.
//!
//! Signals are idempotent: any number of triggers raised before the worker
//! wakes collapse into a single recovery attempt. Once the failure budget
//! is exhausted the manager is permanently failed for its lifetime; the
//! terminal callback fires exactly once and no further attempts run.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// Errors from recovery lifecycle operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("recovery worker already running")]
    AlreadyRunning,

    #[error("recovery worker is not running")]
    NotRunning,
}

/// State shared between the manager, its handles, and the worker thread.
struct Shared {
    /// Pending-failure signal, collapsed across triggers.
    signal: Mutex<bool>,
    /// Wakes the worker when the signal is raised.
    condvar: Condvar,
    /// Tells the worker to exit at its next wake.
    stop: AtomicBool,
    /// Consecutive failures since the last successful handshake.
    fail_count: AtomicU32,
    /// Set once when the failure budget is exhausted; never cleared.
    failed: AtomicBool,
}

impl Shared {
    fn raise(&self) {
        let mut signal = crate::lock(&self.signal);
        *signal = true;
        self.condvar.notify_one();
    }

    /// Block until the signal is raised, then consume it.
    fn consume(&self) {
        let mut signal = crate::lock(&self.signal);
        while !*signal {
            signal = self
                .condvar
                .wait(signal)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        *signal = false;
    }
}

/// Cloneable trigger held by failure sites.
#[derive(Clone)]
pub struct RecoveryHandle {
    shared: Arc<Shared>,
}

impl RecoveryHandle {
    /// Signal a failure. Idempotent until the worker consumes the signal.
    pub fn trigger(&self) {
        self.shared.raise();
    }

    /// Clear the consecutive-failure counter.
    ///
    /// Called after a successful handshake so escalation requires a fresh
    /// run of consecutive failures. Does not clear a permanent failure.
    pub fn reset_fail_count(&self) {
        self.shared.fail_count.store(0, Ordering::SeqCst);
    }

    /// Whether recovery has permanently failed for this manager instance.
    pub fn is_recovery_failed(&self) -> bool {
        self.shared.failed.load(Ordering::SeqCst)
    }
}

/// Owns the recovery worker thread and its lifecycle.
pub struct RecoveryManager {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl RecoveryManager {
    /// Create a manager with no worker running.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                signal: Mutex::new(false),
                condvar: Condvar::new(),
                stop: AtomicBool::new(false),
                fail_count: AtomicU32::new(0),
                failed: AtomicBool::new(false),
            }),
            thread: None,
        }
    }

    /// Get a trigger handle for failure sites.
    pub fn handle(&self) -> RecoveryHandle {
        RecoveryHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Start the background worker.
    ///
    /// The worker waits for failure signals. On each wake it exits if
    /// stopping; escalates to permanent failure (invoking `on_failed` and
    /// exiting) once `max_retries` consecutive failures have been consumed;
    /// otherwise it counts the failure, sleeps `interval`, and invokes
    /// `recovery_action`.
    pub fn start_monitoring<F, G>(
        &mut self,
        mut recovery_action: F,
        on_failed: G,
        max_retries: u32,
        interval: Duration,
    ) -> Result<(), RecoveryError>
    where
        F: FnMut() + Send + 'static,
        G: FnOnce() + Send + 'static,
    {
        if self.is_running() {
            return Err(RecoveryError::AlreadyRunning);
        }
        // Reap a previously exited worker.
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.failed.store(false, Ordering::SeqCst);
        self.shared.fail_count.store(0, Ordering::SeqCst);
        *crate::lock(&self.shared.signal) = false;

        let shared = Arc::clone(&self.shared);
        let worker = thread::spawn(move || {
            loop {
                shared.consume();
                if shared.stop.load(Ordering::SeqCst) {
                    break;
                }
                let fail_count = shared.fail_count.load(Ordering::SeqCst);
                if fail_count >= max_retries {
                    error!(max_retries, "recovery failed, giving up");
                    shared.failed.store(true, Ordering::SeqCst);
                    on_failed();
                    break;
                }
                let fail_count = shared.fail_count.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    interval_secs = interval.as_secs(),
                    fail_count, "recovery scheduled"
                );
                thread::sleep(interval);
                if shared.stop.load(Ordering::SeqCst) {
                    break;
                }
                recovery_action();
            }
            debug!("recovery worker exited");
        });
        self.thread = Some(worker);
        debug!("recovery worker started");
        Ok(())
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop_monitoring(&mut self) -> Result<(), RecoveryError> {
        if !self.is_running() {
            return Err(RecoveryError::NotRunning);
        }
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.raise();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        debug!("recovery worker stopped");
        Ok(())
    }

    /// Whether the worker thread is currently alive.
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Whether recovery has permanently failed for this manager instance.
    pub fn is_recovery_failed(&self) -> bool {
        self.shared.failed.load(Ordering::SeqCst)
    }

    /// Clear the consecutive-failure counter.
    pub fn reset_fail_count(&self) {
        self.shared.fail_count.store(0, Ordering::SeqCst);
    }
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn wait_until(deadline_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_trigger_invokes_action() {
        let mut manager = RecoveryManager::new();
        let actions = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&actions);
        manager
            .start_monitoring(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                || {},
                3,
                Duration::ZERO,
            )
            .unwrap();

        manager.handle().trigger();
        assert!(wait_until(1000, || actions.load(Ordering::SeqCst) == 1));
        assert!(!manager.is_recovery_failed());

        manager.stop_monitoring().unwrap();
    }

    #[test]
    fn test_escalation_after_max_retries() {
        // With max_retries = 2, three consecutive failures run the action
        // exactly twice, then the terminal callback fires once.
        let mut manager = RecoveryManager::new();
        let actions = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(AtomicU32::new(0));

        let handle = manager.handle();
        let action_counter = Arc::clone(&actions);
        let action_handle = handle.clone();
        let failure_counter = Arc::clone(&failures);
        manager
            .start_monitoring(
                move || {
                    action_counter.fetch_add(1, Ordering::SeqCst);
                    // The recovery attempt fails again.
                    action_handle.trigger();
                },
                move || {
                    failure_counter.fetch_add(1, Ordering::SeqCst);
                },
                2,
                Duration::ZERO,
            )
            .unwrap();

        handle.trigger();
        assert!(wait_until(1000, || manager.is_recovery_failed()));
        assert!(wait_until(1000, || !manager.is_running()));

        assert_eq!(actions.load(Ordering::SeqCst), 2);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert!(handle.is_recovery_failed());
    }

    #[test]
    fn test_reset_fail_count_restarts_escalation() {
        // A reset between attempts buys a fresh run of max_retries.
        let mut manager = RecoveryManager::new();
        let actions = Arc::new(AtomicU32::new(0));

        let handle = manager.handle();
        let action_counter = Arc::clone(&actions);
        let action_handle = handle.clone();
        manager
            .start_monitoring(
                move || {
                    let n = action_counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n == 1 {
                        // First attempt "succeeds": handshake resets the count,
                        // then a new failure arrives.
                        action_handle.reset_fail_count();
                    }
                    action_handle.trigger();
                },
                || {},
                2,
                Duration::ZERO,
            )
            .unwrap();

        handle.trigger();
        assert!(wait_until(1000, || !manager.is_running()));

        // Without the reset this would be 2 attempts; the reset makes the
        // second failure streak start from zero.
        assert_eq!(actions.load(Ordering::SeqCst), 3);
        assert!(manager.is_recovery_failed());
    }

    #[test]
    fn test_signals_collapse_while_worker_busy() {
        let mut manager = RecoveryManager::new();
        let actions = Arc::new(AtomicU32::new(0));
        let started = Arc::new(AtomicBool::new(false));

        let action_counter = Arc::clone(&actions);
        let action_started = Arc::clone(&started);
        manager
            .start_monitoring(
                move || {
                    action_counter.fetch_add(1, Ordering::SeqCst);
                    action_started.store(true, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(150));
                },
                || {},
                10,
                Duration::ZERO,
            )
            .unwrap();

        let handle = manager.handle();
        handle.trigger();
        assert!(wait_until(1000, || started.load(Ordering::SeqCst)));

        // Burst of signals while the worker is inside the action.
        handle.trigger();
        handle.trigger();
        handle.trigger();

        assert!(wait_until(1000, || actions.load(Ordering::SeqCst) == 2));
        thread::sleep(Duration::from_millis(250));
        // The burst collapsed into one pending attempt.
        assert_eq!(actions.load(Ordering::SeqCst), 2);

        manager.stop_monitoring().unwrap();
    }

    #[test]
    fn test_start_twice_fails() {
        let mut manager = RecoveryManager::new();
        manager
            .start_monitoring(|| {}, || {}, 3, Duration::ZERO)
            .unwrap();
        let err = manager
            .start_monitoring(|| {}, || {}, 3, Duration::ZERO)
            .unwrap_err();
        assert_eq!(err, RecoveryError::AlreadyRunning);
        manager.stop_monitoring().unwrap();
    }

    #[test]
    fn test_stop_when_not_running_fails() {
        let mut manager = RecoveryManager::new();
        assert_eq!(manager.stop_monitoring().unwrap_err(), RecoveryError::NotRunning);
    }

    #[test]
    fn test_stop_unblocks_waiting_worker() {
        let mut manager = RecoveryManager::new();
        manager
            .start_monitoring(|| {}, || {}, 3, Duration::from_secs(60))
            .unwrap();
        assert!(manager.is_running());
        manager.stop_monitoring().unwrap();
        assert!(!manager.is_running());
    }

    #[test]
    fn test_restart_after_permanent_failure() {
        let mut manager = RecoveryManager::new();
        let handle = manager.handle();
        let trigger = handle.clone();
        manager
            .start_monitoring(move || trigger.trigger(), || {}, 0, Duration::ZERO)
            .unwrap();
        handle.trigger();
        assert!(wait_until(1000, || !manager.is_running()));
        assert!(manager.is_recovery_failed());

        // A fresh start clears the flag and accepts signals again.
        manager
            .start_monitoring(|| {}, || {}, 3, Duration::ZERO)
            .unwrap();
        assert!(!manager.is_recovery_failed());
        manager.stop_monitoring().unwrap();
    }
}
