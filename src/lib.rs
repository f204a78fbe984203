//! SSM Lock Client
//!
//! Client-side implementation of the SesameOS3 BLE lock-control protocol:
//! connect to a lock peripheral, authenticate with its secret key, operate
//! the bolt and follow its mechanical telemetry.
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------+
//! |                   client                      |
//! |   session state machine, commands, events     |
//! +------+-----------+-----------+----------------+
//!        |           |           |
//!   +----v----+ +----v-----+ +---v------+
//!   | protocol| |  cipher  | | recovery |
//!   | dispatch| | AES-CCM  | | retries  |
//!   +----+----+ +----------+ +----------+
//!        |
//!   +----v----+
//!   |  frame  |  20-byte fragmentation
//!   +----+----+
//!        |
//!   +----v--------+
//!   |  transport  |  BLE GATT abstraction
//!   +-------------+
//! ```
//!
//! The transport is a trait; plug in a BlueZ binding, a vendor HCI stack or
//! a test double. Everything above it is radio-agnostic.

pub mod cipher;
pub mod client;
pub mod config;
pub mod frame;
pub mod protocol;
pub mod recovery;
pub mod transport;

pub use cipher::{derive_token, CipherError, CipherState};
pub use client::{ClientError, DeviceStatus, EventHandler, SsmClient};
pub use config::ClientConfig;
pub use frame::{fragment, Reassembler, MAX_CHUNK_SIZE, MAX_FRAME_SIZE};
pub use protocol::{
    Dispatcher, HandshakeArtifacts, ItemCode, LockStatus, MechStatus, MechStatusReport,
    MessageSink, OpCode, ProtocolError,
};
pub use recovery::{RecoveryError, RecoveryHandle, RecoveryManager};
pub use transport::{
    fragment_channel, BleTransport, Fragment, FragmentRx, FragmentTx, NotificationWorker,
    TransportError, NOTIFY_HANDLE, WRITE_HANDLE,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data from a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
