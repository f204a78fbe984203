//! BLE Transport Abstraction
//!
//! Trait and types for the radio-level collaborator the protocol core sits
//! on: a connected GATT peripheral offering attribute writes and
//! notification delivery. Concrete bindings (BlueZ, a vendor HCI stack, a
//! test double) implement [`BleTransport`]; the core never touches the
//! radio directly.
//!
//! Also hosts the notification worker: the background thread that performs
//! the short blocking receive against the transport and feeds inbound
//! fragments into the reassembly pipeline.

use crate::recovery::RecoveryHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// GATT handle of the write characteristic.
pub const WRITE_HANDLE: u16 = 0x000D;

/// GATT handle of the notification characteristic.
pub const NOTIFY_HANDLE: u16 = 0x000F;

/// The CCCD sits at the handle following its characteristic.
pub const CCCD_OFFSET: u16 = 1;

/// CCCD value enabling notification delivery.
pub const NOTIFY_ENABLE: [u8; 2] = [0x01, 0x00];

/// How long one blocking receive against the transport may take.
pub const EVENT_WAIT: Duration = Duration::from_secs(1);

/// Errors from transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("failed to disconnect: {0}")]
    DisconnectFailed(String),

    #[error("failed to write attribute {handle:#06x}: {reason}")]
    WriteFailed { handle: u16, reason: String },

    #[error("failed to enable notifications: {0}")]
    NotifyEnableFailed(String),

    #[error("receive failed: {0}")]
    RecvFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("notification worker is not running")]
    WorkerNotRunning,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One raw notification fragment delivered by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    /// Characteristic handle that produced the fragment.
    pub handle: u16,
    /// Fragment bytes, header byte included.
    pub data: Vec<u8>,
}

/// Channel sender for inbound fragments.
pub type FragmentTx = mpsc::Sender<Fragment>;

/// Channel receiver for inbound fragments.
pub type FragmentRx = mpsc::Receiver<Fragment>;

/// Create a fragment channel connecting a transport to the worker.
pub fn fragment_channel() -> (FragmentTx, FragmentRx) {
    mpsc::channel()
}

/// Radio-level operations the protocol core requires.
///
/// Implementations own their internal synchronization; the core calls every
/// method through a shared reference, possibly from several threads.
pub trait BleTransport: Send + Sync {
    /// Establish a connection to the peripheral at `address`.
    fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Tear the connection down.
    fn disconnect(&self) -> Result<(), TransportError>;

    /// Write `data` to the attribute at `handle`.
    fn write_attribute(
        &self,
        handle: u16,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError>;

    /// Enable notification delivery for the characteristic at
    /// `notify_handle` by writing the enable value to its CCCD.
    fn enable_notifications(&self, notify_handle: u16) -> Result<(), TransportError> {
        self.write_attribute(notify_handle + CCCD_OFFSET, &NOTIFY_ENABLE, true)
            .map_err(|e| TransportError::NotifyEnableFailed(e.to_string()))
    }

    /// Register the channel into which notification fragments are delivered.
    ///
    /// Replaces any previous subscription; fragments arrive during
    /// [`wait_for_event`](Self::wait_for_event) calls.
    fn subscribe(&self, fragments: FragmentTx);

    /// Block for up to `timeout` waiting for notification traffic.
    ///
    /// Returns `Ok(true)` when at least one fragment was delivered into the
    /// subscribed channel, `Ok(false)` on timeout.
    fn wait_for_event(&self, timeout: Duration) -> Result<bool, TransportError>;
}

/// Background thread servicing inbound notifications.
///
/// Repeatedly performs the short blocking receive, drains delivered
/// fragments through the supplied pipeline on its own thread, and funnels
/// transport errors into recovery before exiting.
pub struct NotificationWorker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NotificationWorker {
    /// Spawn the worker.
    ///
    /// `pipeline` is invoked once per fragment, in arrival order, always on
    /// the worker thread.
    pub fn spawn<F>(
        transport: Arc<dyn BleTransport>,
        fragments: FragmentRx,
        mut pipeline: F,
        recovery: RecoveryHandle,
    ) -> Self
    where
        F: FnMut(Fragment) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                match transport.wait_for_event(EVENT_WAIT) {
                    Ok(true) => {
                        while let Ok(fragment) = fragments.try_recv() {
                            pipeline(fragment);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        error!(error = %e, "notification wait failed");
                        recovery.trigger();
                        break;
                    }
                }
            }
            debug!("notification worker exited");
        });
        debug!("notification worker started");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    /// Whether the worker thread is currently alive.
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop(&mut self) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::WorkerNotRunning);
        }
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        debug!("notification worker stopped");
        Ok(())
    }
}

impl Drop for NotificationWorker {
    fn drop(&mut self) {
        // Let a forgotten worker wind down on its own; joining here could
        // block drop for a full receive timeout.
        self.stop.store(true, Ordering::SeqCst);
    }
}
