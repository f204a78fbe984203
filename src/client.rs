//! Lock Client
//!
//! The session layer tying the stack together: owns the transport, the
//! cipher slot, the dispatcher and the recovery manager, and drives the
//! connect/login handshake through to an operable session.
//!
//! ## Session Sequence
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> LoggingIn -> Unlocked/Locked
//! ```
//!
//! Connect establishes the link, subscribes to notifications, waits for the
//! device's random code, derives the session token, installs the cipher and
//! logs in. Any failure along the way raises recovery, which tears the
//! session down and replays the sequence until it succeeds or the retry
//! budget is spent.

use crate::cipher::{derive_token, CipherError, CipherState};
use crate::config::ClientConfig;
use crate::frame::{fragment, Reassembler};
use crate::protocol::{
    Dispatcher, HandshakeArtifacts, ItemCode, MechStatus, MechStatusReport, MessageSink,
};
use crate::recovery::{RecoveryError, RecoveryHandle, RecoveryManager};
use crate::transport::{
    fragment_channel, BleTransport, NotificationWorker, TransportError, NOTIFY_HANDLE, WRITE_HANDLE,
};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

// ============================================================================
// Device State
// ============================================================================

/// Connection lifecycle states, ordered by progress.
///
/// `Locked`, `Unlocked` and `Moving` all mean "logged in"; which one holds
/// follows the latest mechanical telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum DeviceStatus {
    /// Never used.
    NoUse = 0,
    /// No active session.
    Disconnected = 1,
    /// Searching for the peripheral.
    Scanning = 2,
    /// Link establishment in progress.
    Connecting = 3,
    /// Link up, not yet authenticated.
    Connected = 4,
    /// Login exchange in progress.
    LoggingIn = 5,
    /// Logged in, bolt in the lock range.
    Locked = 6,
    /// Logged in, bolt in the unlock range. Also the assumed state right
    /// after login, until the first telemetry publish corrects it.
    Unlocked = 7,
    /// Logged in, mechanism in motion.
    Moving = 8,
}

impl DeviceStatus {
    /// Whether the session is authenticated and commands may be sent.
    pub fn is_logged_in(self) -> bool {
        self > DeviceStatus::LoggingIn
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceStatus::NoUse => "noUse",
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Scanning => "scanning",
            DeviceStatus::Connecting => "connecting",
            DeviceStatus::Connected => "connected",
            DeviceStatus::LoggingIn => "loggingIn",
            DeviceStatus::Locked => "locked",
            DeviceStatus::Unlocked => "unlocked",
            DeviceStatus::Moving => "moving",
        };
        write!(f, "{}", name)
    }
}

/// Per-device session record.
struct SsmDevice {
    status: DeviceStatus,
    address: String,
    secret_key: Option<[u8; 16]>,
    token: Option<[u8; 16]>,
}

impl SsmDevice {
    fn new() -> Self {
        Self {
            status: DeviceStatus::NoUse,
            address: String::new(),
            secret_key: None,
            token: None,
        }
    }
}

impl fmt::Debug for SsmDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsmDevice")
            .field("status", &self.status)
            .field("address", &self.address)
            .field("secret_key", &self.secret_key.map(|_| "[redacted]"))
            .field("token", &self.token.map(|_| "[redacted]"))
            .finish()
    }
}

// ============================================================================
// Events
// ============================================================================

/// Session events delivered to the embedding application.
///
/// Callbacks run on client-internal threads; implementations must not block
/// for long and must not call back into the client.
pub trait EventHandler: Send + Sync {
    /// Session became operable (`true`) or was lost for good (`false`).
    fn on_connect(&self, _logged_in: bool) {}

    /// Mechanical telemetry arrived and the lifecycle state was updated.
    fn on_status(&self, _status: DeviceStatus, _report: &MechStatusReport, _raw: &MechStatus) {}
}

/// Errors surfaced by client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(#[from] hex::FromHexError),

    #[error("secret key must be 16 bytes, got {0}")]
    InvalidSecretKeyLength(usize),

    #[error("no secret key configured")]
    MissingSecretKey,

    #[error("timed out waiting for {0}")]
    HandshakeTimeout(&'static str),

    #[error("encryption is not established")]
    CipherNotReady,

    #[error("session recovery failed")]
    RecoveryFailed,

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

// ============================================================================
// Client
// ============================================================================

/// Client for one SSM lock device.
///
/// Cheap to clone-by-handle through internal `Arc`s; all methods take
/// `&self` and are safe to call from any thread.
pub struct SsmClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn BleTransport>,
    device: Mutex<SsmDevice>,
    cipher: Arc<Mutex<Option<CipherState>>>,
    artifacts: Arc<HandshakeArtifacts>,
    handler: Arc<dyn EventHandler>,
    recovery: Mutex<RecoveryManager>,
    recovery_handle: RecoveryHandle,
    worker: Mutex<Option<NotificationWorker>>,
    dispatcher: Arc<Dispatcher>,
    config: Mutex<ClientConfig>,
    /// Serializes teardown-plus-sequence across the caller and recovery
    /// threads; at most one connect sequence is in flight per session.
    sequence_lock: Mutex<()>,
}

/// Routes decoded telemetry from the dispatcher into the session state.
struct StatusRelay {
    inner: Weak<ClientInner>,
}

impl MessageSink for StatusRelay {
    fn on_mech_status(&self, report: MechStatusReport, raw: MechStatus) {
        if let Some(inner) = self.inner.upgrade() {
            inner.apply_mech_status(report, raw);
        }
    }
}

impl SsmClient {
    /// Create a client over the given transport.
    pub fn new(transport: Arc<dyn BleTransport>, handler: Arc<dyn EventHandler>) -> Self {
        let manager = RecoveryManager::new();
        let recovery_handle = manager.handle();
        let cipher = Arc::new(Mutex::new(None));
        let artifacts = Arc::new(HandshakeArtifacts::new());

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let relay = Arc::new(StatusRelay {
                inner: weak.clone(),
            });
            let dispatcher = Arc::new(Dispatcher::new(
                Arc::clone(&cipher),
                Arc::clone(&artifacts),
                relay,
                recovery_handle.clone(),
            ));
            ClientInner {
                transport,
                device: Mutex::new(SsmDevice::new()),
                cipher,
                artifacts,
                handler,
                recovery: Mutex::new(manager),
                recovery_handle,
                worker: Mutex::new(None),
                dispatcher,
                config: Mutex::new(ClientConfig::default()),
                sequence_lock: Mutex::new(()),
            }
        });
        Self { inner }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> DeviceStatus {
        crate::lock(&self.inner.device).status
    }

    /// Whether commands may currently be sent.
    pub fn is_logged_in(&self) -> bool {
        self.status().is_logged_in()
    }

    /// Connect and log in, blocking until the session is operable.
    ///
    /// `secret_key_hex` is the 32-hex-digit device secret. Returns once the
    /// session is logged in, or with an error when the key is malformed or
    /// the retry budget is exhausted. Called while a session is already
    /// active, logs and returns without touching it.
    pub fn connect(
        &self,
        address: &str,
        secret_key_hex: &str,
        config: ClientConfig,
    ) -> Result<(), ClientError> {
        {
            let device = crate::lock(&self.inner.device);
            if device.status > DeviceStatus::Disconnected {
                warn!(status = %device.status, "connect ignored while session active");
                return Ok(());
            }
        }

        let key_bytes = hex::decode(secret_key_hex)?;
        let secret_key: [u8; 16] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| ClientError::InvalidSecretKeyLength(key_bytes.len()))?;
        {
            let mut device = crate::lock(&self.inner.device);
            device.address = address.to_string();
            device.secret_key = Some(secret_key);
        }
        *crate::lock(&self.inner.config) = config.clone();

        {
            let mut recovery = crate::lock(&self.inner.recovery);
            if !recovery.is_running() {
                let action = Arc::downgrade(&self.inner);
                let escalation = Arc::downgrade(&self.inner);
                recovery.start_monitoring(
                    move || {
                        if let Some(inner) = action.upgrade() {
                            inner.reconnect();
                        }
                    },
                    move || {
                        if let Some(inner) = escalation.upgrade() {
                            inner.on_recovery_failed();
                        }
                    },
                    config.max_retries,
                    config.retry_interval(),
                )?;
            }
        }

        self.inner.run_sequence();

        loop {
            if self.inner.recovery_handle.is_recovery_failed() {
                return Err(ClientError::RecoveryFailed);
            }
            if crate::lock(&self.inner.device).status.is_logged_in() {
                return Ok(());
            }
            thread::sleep(config.poll_interval());
        }
    }

    /// Send the lock command.
    ///
    /// `history_tag` is recorded in the device's operation history. A no-op
    /// before login.
    pub fn lock(&self, history_tag: &str) {
        self.inner.operate(ItemCode::Lock, history_tag);
    }

    /// Send the unlock command.
    pub fn unlock(&self, history_tag: &str) {
        self.inner.operate(ItemCode::Unlock, history_tag);
    }

    /// Stop recovery and tear the session down.
    pub fn stop(&self) {
        {
            let mut recovery = crate::lock(&self.inner.recovery);
            if recovery.is_running() {
                if let Err(e) = recovery.stop_monitoring() {
                    warn!(error = %e, "failed to stop recovery monitoring");
                }
            }
        }
        let _sequence = crate::lock(&self.inner.sequence_lock);
        self.inner.teardown();
        info!("client stopped");
    }
}

impl ClientInner {
    /// Run the connect/login sequence; failures raise recovery.
    fn run_sequence(&self) {
        let _sequence = crate::lock(&self.sequence_lock);
        self.attempt_sequence();
    }

    /// Caller must hold the sequence lock.
    fn attempt_sequence(&self) {
        if let Err(e) = self.sequence() {
            error!(error = %e, "session sequence failed");
            self.recovery_handle.trigger();
        }
    }

    fn sequence(&self) -> Result<(), ClientError> {
        let config = crate::lock(&self.config).clone();
        let (address, secret_key) = {
            let mut device = crate::lock(&self.device);
            device.status = DeviceStatus::Connecting;
            let key = device.secret_key.ok_or(ClientError::MissingSecretKey)?;
            (device.address.clone(), key)
        };

        debug!(%address, "connecting");
        self.transport.connect(&address)?;
        crate::lock(&self.device).status = DeviceStatus::Connected;

        let (tx, rx) = fragment_channel();
        self.transport.subscribe(tx);
        self.transport.enable_notifications(NOTIFY_HANDLE)?;

        let dispatcher = Arc::clone(&self.dispatcher);
        let mut reassembler = Reassembler::new();
        let worker = NotificationWorker::spawn(
            Arc::clone(&self.transport),
            rx,
            move |frag| {
                if frag.handle != NOTIFY_HANDLE {
                    return;
                }
                if let Some((message, is_encrypted)) = reassembler.push(&frag.data) {
                    dispatcher.process(message, is_encrypted);
                }
            },
            self.recovery_handle.clone(),
        );
        *crate::lock(&self.worker) = Some(worker);

        let random_code = self.wait_for(
            "initial random code",
            config.poll_interval(),
            config.handshake_timeout(),
            || self.artifacts.random_code(),
        )?;

        let token = derive_token(&secret_key, &random_code)?;
        *crate::lock(&self.cipher) = Some(CipherState::new(token, &random_code)?);
        {
            let mut device = crate::lock(&self.device);
            device.token = Some(token);
            device.status = DeviceStatus::LoggingIn;
        }

        let mut login = Vec::with_capacity(5);
        login.push(ItemCode::Login.to_byte());
        login.extend_from_slice(&token[..4]);
        self.send(&login, false)?;

        let timestamp = self.wait_for(
            "login response",
            config.poll_interval(),
            config.handshake_timeout(),
            || self.artifacts.login_timestamp(),
        )?;
        debug!(timestamp, "logged in");

        self.recovery_handle.reset_fail_count();
        {
            let mut device = crate::lock(&self.device);
            // Telemetry may already have moved the state past login.
            if device.status == DeviceStatus::LoggingIn {
                device.status = DeviceStatus::Unlocked;
            }
        }
        info!(%address, "session established");
        self.handler.on_connect(true);
        Ok(())
    }

    fn wait_for<T>(
        &self,
        what: &'static str,
        poll: Duration,
        timeout: Duration,
        mut probe: impl FnMut() -> Option<T>,
    ) -> Result<T, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = probe() {
                return Ok(value);
            }
            if Instant::now() >= deadline {
                return Err(ClientError::HandshakeTimeout(what));
            }
            thread::sleep(poll);
        }
    }

    fn send(&self, data: &[u8], should_encrypt: bool) -> Result<(), ClientError> {
        let payload = if should_encrypt {
            let mut cipher = crate::lock(&self.cipher);
            let cipher = cipher.as_mut().ok_or(ClientError::CipherNotReady)?;
            cipher.encrypt(data)?
        } else {
            data.to_vec()
        };
        for frame in fragment(&payload, should_encrypt) {
            self.transport.write_attribute(WRITE_HANDLE, &frame, true)?;
        }
        Ok(())
    }

    fn operate(&self, item: ItemCode, history_tag: &str) {
        let status = crate::lock(&self.device).status;
        if !status.is_logged_in() {
            warn!(%status, command = %item, "command ignored before login");
            return;
        }
        let tag = history_tag.as_bytes();
        if tag.len() > u8::MAX as usize {
            warn!(
                len = tag.len(),
                "history tag exceeds the length byte, truncating to 255 bytes"
            );
        }
        let tag = &tag[..tag.len().min(u8::MAX as usize)];
        let mut command = Vec::with_capacity(2 + tag.len());
        command.push(item.to_byte());
        command.push(tag.len() as u8);
        command.extend_from_slice(tag);
        if let Err(e) = self.send(&command, true) {
            error!(error = %e, command = %item, "failed to send command");
            self.recovery_handle.trigger();
        }
    }

    fn apply_mech_status(&self, report: MechStatusReport, raw: MechStatus) {
        let status = {
            let mut device = crate::lock(&self.device);
            if device.status < DeviceStatus::LoggingIn {
                debug!(status = %device.status, "telemetry before login dropped");
                return;
            }
            if raw.is_lock_range {
                device.status = DeviceStatus::Locked;
            } else if raw.is_unlock_range {
                device.status = DeviceStatus::Unlocked;
            } else if !raw.is_stop {
                device.status = DeviceStatus::Moving;
            }
            device.status
        };
        debug!(%status, position = report.position, "mech status");
        self.handler.on_status(status, &report, &raw);
    }

    /// Recovery action: rebuild the session from scratch.
    ///
    /// Holds the sequence lock across teardown and the new sequence, so a
    /// connect sequence still in flight on the caller thread finishes (or
    /// times out) before its session is torn down under it.
    fn reconnect(&self) {
        debug!("attempting session recovery");
        let _sequence = crate::lock(&self.sequence_lock);
        self.teardown();
        self.attempt_sequence();
    }

    fn on_recovery_failed(&self) {
        let _sequence = crate::lock(&self.sequence_lock);
        self.teardown();
        self.handler.on_connect(false);
    }

    /// Stop the worker, drop the link and forget all session secrets.
    fn teardown(&self) {
        if let Some(mut worker) = crate::lock(&self.worker).take() {
            let _ = worker.stop();
        }
        let status = crate::lock(&self.device).status;
        if status >= DeviceStatus::Connected {
            if let Err(e) = self.transport.disconnect() {
                warn!(error = %e, "disconnect failed during teardown");
            }
        }
        {
            let mut device = crate::lock(&self.device);
            device.status = DeviceStatus::Disconnected;
            device.token = None;
        }
        self.artifacts.clear();
        *crate::lock(&self.cipher) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::derive_token;
    use crate::protocol::{ItemCode, LockStatus, OpCode};
    use crate::transport::{Fragment, FragmentTx};
    use std::collections::VecDeque;

    const SECRET_HEX: &str = "00112233445566778899aabbccddeeff";

    fn secret_key() -> [u8; 16] {
        hex::decode(SECRET_HEX).unwrap().try_into().unwrap()
    }

    /// Random code issued for the n-th successful connect.
    fn session_code(session: u8) -> [u8; 4] {
        [0xC0, 0xFF, 0xEE, session]
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            max_retries: 1,
            retry_interval_secs: 0,
            handshake_timeout_secs: 2,
            poll_interval_ms: 5,
        }
    }

    #[derive(Default)]
    struct MockState {
        connected: bool,
        attempts: u32,
        connects: u32,
        disconnects: u32,
        logins: u32,
        writes: Vec<(u16, Vec<u8>)>,
        decrypted_commands: Vec<Vec<u8>>,
        subscriber: Option<FragmentTx>,
        inbound: VecDeque<Vec<u8>>,
        device_cipher: Option<CipherState>,
        expected_token: Option<[u8; 16]>,
        reassembler: Reassembler,
    }

    /// Peripheral double that performs the device side of the handshake.
    ///
    /// Each successful connect starts a fresh session with its own random
    /// code and cipher; a login carrying a token from any other session
    /// fails the test.
    struct MockTransport {
        state: Mutex<MockState>,
        /// Fail this many connect attempts before succeeding.
        fail_connects: u32,
        /// Answer the first login with a corrupt encrypted frame instead of
        /// a login response.
        corrupt_first_login: bool,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Self::with(0, false)
        }

        fn failing() -> Arc<Self> {
            Self::with(u32::MAX, false)
        }

        fn with(fail_connects: u32, corrupt_first_login: bool) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(MockState::default()),
                fail_connects,
                corrupt_first_login,
            })
        }

        fn queue_message(state: &mut MockState, message: &[u8], encrypted: bool) {
            let payload = if encrypted {
                state
                    .device_cipher
                    .as_mut()
                    .expect("device cipher not ready")
                    .encrypt(message)
                    .unwrap()
            } else {
                message.to_vec()
            };
            for frame in fragment(&payload, encrypted) {
                state.inbound.push_back(frame);
            }
        }

        fn push_mech_status(&self, battery: u16, target: i16, position: i16, flags: u8) {
            let mut state = crate::lock(&self.state);
            let mut message = vec![OpCode::Publish.to_byte(), ItemCode::MechStatus.to_byte()];
            message.extend_from_slice(&battery.to_le_bytes());
            message.extend_from_slice(&target.to_le_bytes());
            message.extend_from_slice(&position.to_le_bytes());
            message.push(flags);
            Self::queue_message(&mut state, &message, true);
        }

        fn writes(&self) -> Vec<(u16, Vec<u8>)> {
            crate::lock(&self.state).writes.clone()
        }

        fn decrypted_commands(&self) -> Vec<Vec<u8>> {
            crate::lock(&self.state).decrypted_commands.clone()
        }

        fn disconnects(&self) -> u32 {
            crate::lock(&self.state).disconnects
        }

        /// (connect attempts, successful connects, logins received)
        fn counts(&self) -> (u32, u32, u32) {
            let state = crate::lock(&self.state);
            (state.attempts, state.connects, state.logins)
        }

        fn handle_client_message(&self, state: &mut MockState, message: Vec<u8>, encrypted: bool) {
            let message = if encrypted {
                let decrypted = state
                    .device_cipher
                    .as_mut()
                    .expect("device cipher not ready")
                    .decrypt(&message)
                    .unwrap();
                state.decrypted_commands.push(decrypted.clone());
                decrypted
            } else {
                message
            };
            if message.first() == Some(&ItemCode::Login.to_byte()) {
                state.logins += 1;
                assert!(
                    state.logins <= state.connects,
                    "login without a matching session"
                );
                let token = state.expected_token.expect("login before connect");
                assert_eq!(&message[1..5], &token[..4], "login used a stale token");
                if self.corrupt_first_login && state.logins == 1 {
                    let mut bogus = state
                        .device_cipher
                        .as_mut()
                        .unwrap()
                        .encrypt(&[0u8; 8])
                        .unwrap();
                    bogus[0] ^= 0x01;
                    for frame in fragment(&bogus, true) {
                        state.inbound.push_back(frame);
                    }
                    return;
                }
                let mut response = vec![OpCode::Response.to_byte(), ItemCode::Login.to_byte(), 0];
                response.extend_from_slice(&0x6565_6565u32.to_le_bytes());
                Self::queue_message(state, &response, false);
            }
        }
    }

    impl BleTransport for MockTransport {
        fn connect(&self, address: &str) -> Result<(), TransportError> {
            let mut state = crate::lock(&self.state);
            state.attempts += 1;
            if state.attempts <= self.fail_connects {
                return Err(TransportError::ConnectFailed {
                    address: address.to_string(),
                    reason: "out of range".into(),
                });
            }
            state.connected = true;
            state.connects += 1;
            let code = session_code(state.connects as u8);
            let token = derive_token(&secret_key(), &code).unwrap();
            state.expected_token = Some(token);
            state.device_cipher = Some(CipherState::new(token, &code).unwrap());
            state.inbound.clear();
            state.reassembler = Reassembler::new();
            let mut initial = vec![OpCode::Publish.to_byte(), ItemCode::Initial.to_byte()];
            initial.extend_from_slice(&code);
            Self::queue_message(&mut state, &initial, false);
            Ok(())
        }

        fn disconnect(&self) -> Result<(), TransportError> {
            let mut state = crate::lock(&self.state);
            state.connected = false;
            state.disconnects += 1;
            Ok(())
        }

        fn write_attribute(
            &self,
            handle: u16,
            data: &[u8],
            _with_response: bool,
        ) -> Result<(), TransportError> {
            let mut state = crate::lock(&self.state);
            state.writes.push((handle, data.to_vec()));
            if handle == WRITE_HANDLE {
                if let Some((message, encrypted)) = state.reassembler.push(data) {
                    self.handle_client_message(&mut state, message, encrypted);
                }
            }
            Ok(())
        }

        fn subscribe(&self, fragments: FragmentTx) {
            crate::lock(&self.state).subscriber = Some(fragments);
        }

        fn wait_for_event(&self, _timeout: Duration) -> Result<bool, TransportError> {
            {
                let mut state = crate::lock(&self.state);
                if !state.inbound.is_empty() {
                    if let Some(tx) = state.subscriber.clone() {
                        while let Some(data) = state.inbound.pop_front() {
                            let _ = tx.send(Fragment {
                                handle: NOTIFY_HANDLE,
                                data,
                            });
                        }
                        return Ok(true);
                    }
                }
            }
            thread::sleep(Duration::from_millis(2));
            Ok(false)
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        connects: Mutex<Vec<bool>>,
        statuses: Mutex<Vec<(DeviceStatus, MechStatusReport)>>,
    }

    impl EventHandler for RecordingHandler {
        fn on_connect(&self, logged_in: bool) {
            crate::lock(&self.connects).push(logged_in);
        }

        fn on_status(&self, status: DeviceStatus, report: &MechStatusReport, _raw: &MechStatus) {
            crate::lock(&self.statuses).push((status, report.clone()));
        }
    }

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
    fn test_connect_performs_login_handshake() {
        let transport = MockTransport::new();
        let handler = Arc::new(RecordingHandler::default());
        let client = SsmClient::new(transport.clone(), handler.clone());

        client
            .connect("aa:bb:cc:dd:ee:ff", SECRET_HEX, fast_config())
            .unwrap();

        assert_eq!(client.status(), DeviceStatus::Unlocked);
        assert!(client.is_logged_in());
        assert_eq!(*crate::lock(&handler.connects), vec![true]);

        let writes = transport.writes();
        // CCCD enable precedes the login write.
        assert!(writes
            .iter()
            .any(|(handle, data)| *handle == NOTIFY_HANDLE + 1 && data == &[0x01, 0x00]));
        let token = derive_token(&secret_key(), &session_code(1)).unwrap();
        let login = writes
            .iter()
            .find(|(handle, data)| *handle == WRITE_HANDLE && data.get(1) == Some(&2))
            .expect("no login write");
        assert_eq!(login.1[0], 0b011);
        assert_eq!(&login.1[2..6], &token[..4]);

        client.stop();
    }

    #[test]
    fn test_command_before_login_is_ignored() {
        let transport = MockTransport::new();
        let client = SsmClient::new(transport.clone(), Arc::new(RecordingHandler::default()));

        client.lock("tag");
        client.unlock("tag");

        assert!(transport.writes().is_empty());
        assert_eq!(client.status(), DeviceStatus::NoUse);
    }

    #[test]
    fn test_lock_sends_encrypted_command() {
        let transport = MockTransport::new();
        let client = SsmClient::new(transport.clone(), Arc::new(RecordingHandler::default()));
        client
            .connect("aa:bb:cc:dd:ee:ff", SECRET_HEX, fast_config())
            .unwrap();

        client.lock("tester");

        let commands = transport.decrypted_commands();
        assert_eq!(commands.len(), 1);
        let mut expected = vec![ItemCode::Lock.to_byte(), 6];
        expected.extend_from_slice(b"tester");
        assert_eq!(commands[0], expected);

        client.stop();
    }

    #[test]
    fn test_mech_status_updates_state() {
        let transport = MockTransport::new();
        let handler = Arc::new(RecordingHandler::default());
        let client = SsmClient::new(transport.clone(), handler.clone());
        client
            .connect("aa:bb:cc:dd:ee:ff", SECRET_HEX, fast_config())
            .unwrap();

        // lock range + stopped
        transport.push_mech_status(2900, 0, 0, 0b0010010);
        assert!(wait_until(2000, || client.status() == DeviceStatus::Locked));

        let statuses = crate::lock(&handler.statuses).clone();
        let (status, report) = statuses.last().expect("no status event");
        assert_eq!(*status, DeviceStatus::Locked);
        assert_eq!(report.lock_status, LockStatus::Locked);

        client.stop();
    }

    #[test]
    fn test_stop_without_connect() {
        let transport = MockTransport::new();
        let client = SsmClient::new(transport.clone(), Arc::new(RecordingHandler::default()));

        client.stop();

        assert_eq!(client.status(), DeviceStatus::Disconnected);
        assert_eq!(transport.disconnects(), 0);
    }

    #[test]
    fn test_permanent_failure_reports_disconnect() {
        let transport = MockTransport::failing();
        let handler = Arc::new(RecordingHandler::default());
        let client = SsmClient::new(transport, handler.clone());

        let result = client.connect("aa:bb:cc:dd:ee:ff", SECRET_HEX, fast_config());
        assert!(matches!(result, Err(ClientError::RecoveryFailed)));
        assert!(wait_until(2000, || crate::lock(&handler.connects)
            .contains(&false)));
        assert_eq!(client.status(), DeviceStatus::Disconnected);

        client.stop();
    }

    #[test]
    fn test_recovery_reestablishes_session() {
        // First link attempt fails; recovery retries, and the login must use
        // the retry session's random code, not leftovers from the first.
        let transport = MockTransport::with(1, false);
        let handler = Arc::new(RecordingHandler::default());
        let client = SsmClient::new(transport.clone(), handler.clone());

        client
            .connect("aa:bb:cc:dd:ee:ff", SECRET_HEX, fast_config())
            .unwrap();

        assert_eq!(client.status(), DeviceStatus::Unlocked);
        let (attempts, connects, logins) = transport.counts();
        assert_eq!(attempts, 2);
        assert_eq!(connects, 1);
        assert_eq!(logins, 1);
        assert_eq!(*crate::lock(&handler.connects), vec![true]);

        client.stop();
    }

    #[test]
    fn test_failure_during_login_recovers_without_interleaving() {
        // A corrupt encrypted frame during the login wait raises recovery
        // while the caller's sequence is still in flight. The retry sequence
        // must not overlap it: every login pairs with its own session, and
        // the session converges to logged in with no failure event.
        let transport = MockTransport::with(0, true);
        let handler = Arc::new(RecordingHandler::default());
        let client = SsmClient::new(transport.clone(), handler.clone());

        let config = ClientConfig {
            max_retries: 3,
            retry_interval_secs: 0,
            handshake_timeout_secs: 1,
            poll_interval_ms: 5,
        };
        client
            .connect("aa:bb:cc:dd:ee:ff", SECRET_HEX, config)
            .unwrap();

        assert!(wait_until(3000, || {
            let (_, connects, logins) = transport.counts();
            connects >= 2 && logins == connects
        }));
        assert!(wait_until(2000, || client.status() == DeviceStatus::Unlocked));

        let (_, connects, logins) = transport.counts();
        assert_eq!(logins, connects);
        let events = crate::lock(&handler.connects).clone();
        assert!(!events.is_empty());
        assert!(events.iter().all(|&logged_in| logged_in));

        client.stop();
    }

    #[test]
    fn test_oversize_history_tag_is_truncated() {
        let transport = MockTransport::new();
        let client = SsmClient::new(transport.clone(), Arc::new(RecordingHandler::default()));
        client
            .connect("aa:bb:cc:dd:ee:ff", SECRET_HEX, fast_config())
            .unwrap();

        client.lock(&"x".repeat(300));

        let commands = transport.decrypted_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0][1], u8::MAX);
        assert_eq!(commands[0].len(), 2 + u8::MAX as usize);

        client.stop();
    }

    #[test]
    fn test_invalid_secret_key_rejected() {
        let transport = MockTransport::new();
        let client = SsmClient::new(transport, Arc::new(RecordingHandler::default()));

        let result = client.connect("aa:bb:cc:dd:ee:ff", "not-hex", fast_config());
        assert!(matches!(result, Err(ClientError::InvalidSecretKey(_))));

        let result = client.connect("aa:bb:cc:dd:ee:ff", "0011", fast_config());
        assert!(matches!(result, Err(ClientError::InvalidSecretKeyLength(2))));
    }

    #[test]
    fn test_connect_while_active_is_ignored() {
        let transport = MockTransport::new();
        let handler = Arc::new(RecordingHandler::default());
        let client = SsmClient::new(transport, handler.clone());
        client
            .connect("aa:bb:cc:dd:ee:ff", SECRET_HEX, fast_config())
            .unwrap();

        client
            .connect("aa:bb:cc:dd:ee:ff", SECRET_HEX, fast_config())
            .unwrap();
        // The second call performed no handshake.
        assert_eq!(*crate::lock(&handler.connects), vec![true]);

        client.stop();
    }
}
