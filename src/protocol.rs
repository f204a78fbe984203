//! SSM Protocol Messages
//!
//! Operation/item code tables, mechanical-status telemetry decoding, and
//! the inbound message dispatcher.
//!
//! ## Message Layout
//!
//! Every reassembled (and, where flagged, decrypted) message starts with a
//! two-byte discriminator:
//!
//! ```text
//! | Offset | Field     | Notes                                   |
//! |--------|-----------|------------------------------------------|
//! | 0      | op code   | response (0x07) or publish (0x08)        |
//! | 1      | item code | message meaning within the operation     |
//! | 2..    | payload   | responses skip one reserved byte first   |
//! ```
//!
//! Unknown op or item codes are logged and dropped; they are never an
//! error.

use crate::cipher::CipherState;
use crate::recovery::RecoveryHandle;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error};

// ============================================================================
// Operation / Item Codes
// ============================================================================

/// Message operation codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Reply to a command we sent.
    Response = 0x07,
    /// Unsolicited device-originated message.
    Publish = 0x08,
}

impl OpCode {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x07 => Some(OpCode::Response),
            0x08 => Some(OpCode::Publish),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Response => "Response",
            OpCode::Publish => "Publish",
        };
        write!(f, "{}", name)
    }
}

/// Item command codes.
///
/// The full wire table; the client only ever sends `Login`, `Lock` and
/// `Unlock` and only reacts to `Login`, `Initial` and `MechStatus`, but the
/// remaining codes are part of the protocol and show up in traffic from
/// other clients' sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemCode {
    /// No operation.
    None = 0,
    /// Device registration.
    Registration = 1,
    /// Session login.
    Login = 2,
    /// User management.
    User = 3,
    /// Operation history retrieval.
    History = 4,
    /// Firmware version detail.
    VersionDetail = 5,
    /// Immediate disconnect and reboot.
    DisconnectRebootNow = 6,
    /// Enter firmware-update mode.
    EnableDfu = 7,
    /// Clock synchronization.
    Time = 8,
    /// Session initialization (carries the random code).
    Initial = 14,
    /// Magnet sensor.
    Magnet = 17,
    /// Mechanism settings.
    MechSetting = 80,
    /// Mechanism status telemetry.
    MechStatus = 81,
    /// Lock command.
    Lock = 82,
    /// Unlock command.
    Unlock = 83,
    /// Autolock timer settings.
    OpsTimerSetting = 92,
}

impl ItemCode {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ItemCode::None),
            1 => Some(ItemCode::Registration),
            2 => Some(ItemCode::Login),
            3 => Some(ItemCode::User),
            4 => Some(ItemCode::History),
            5 => Some(ItemCode::VersionDetail),
            6 => Some(ItemCode::DisconnectRebootNow),
            7 => Some(ItemCode::EnableDfu),
            8 => Some(ItemCode::Time),
            14 => Some(ItemCode::Initial),
            17 => Some(ItemCode::Magnet),
            80 => Some(ItemCode::MechSetting),
            81 => Some(ItemCode::MechStatus),
            82 => Some(ItemCode::Lock),
            83 => Some(ItemCode::Unlock),
            92 => Some(ItemCode::OpsTimerSetting),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ItemCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemCode::None => "None",
            ItemCode::Registration => "Registration",
            ItemCode::Login => "Login",
            ItemCode::User => "User",
            ItemCode::History => "History",
            ItemCode::VersionDetail => "VersionDetail",
            ItemCode::DisconnectRebootNow => "DisconnectRebootNow",
            ItemCode::EnableDfu => "EnableDfu",
            ItemCode::Time => "Time",
            ItemCode::Initial => "Initial",
            ItemCode::Magnet => "Magnet",
            ItemCode::MechSetting => "MechSetting",
            ItemCode::MechStatus => "MechStatus",
            ItemCode::Lock => "Lock",
            ItemCode::Unlock => "Unlock",
            ItemCode::OpsTimerSetting => "OpsTimerSetting",
        };
        write!(f, "{}", name)
    }
}

/// Payload offset within a response message (one reserved byte after the
/// item code).
const RESPONSE_PAYLOAD_OFFSET: usize = 3;

/// Payload offset within a publish message.
const PUBLISH_PAYLOAD_OFFSET: usize = 2;

/// Errors from message decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message too short: expected at least {expected}, got {got}")]
    Truncated { expected: usize, got: usize },
}

// ============================================================================
// Mechanical Status
// ============================================================================

/// Minimum mech-status payload length.
pub const MECH_STATUS_SIZE: usize = 7;

/// Raw mechanical-status telemetry as decoded off the wire.
///
/// ## Wire Format
///
/// ```text
/// | Offset | Field    | Size | Notes                       |
/// |--------|----------|------|------------------------------|
/// | 0      | battery  | 2    | u16 LE raw reading           |
/// | 2      | target   | 2    | i16 LE target angle          |
/// | 4      | position | 2    | i16 LE current angle         |
/// | 6      | flags    | 1    | 7 condition bits, bit 0 up   |
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MechStatus {
    /// Raw battery reading.
    pub battery: u16,
    /// Target angle.
    pub target: i16,
    /// Current angle.
    pub position: i16,
    /// Clutch failed to engage.
    pub is_clutch_failed: bool,
    /// Position within the configured lock range.
    pub is_lock_range: bool,
    /// Position within the configured unlock range.
    pub is_unlock_range: bool,
    /// Critical mechanical condition.
    pub is_critical: bool,
    /// Mechanism is stopped.
    pub is_stop: bool,
    /// Battery is low.
    pub is_low_battery: bool,
    /// Last motion was clockwise.
    pub is_clockwise: bool,
}

impl MechStatus {
    /// Decode a mech-status payload.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < MECH_STATUS_SIZE {
            return Err(ProtocolError::Truncated {
                expected: MECH_STATUS_SIZE,
                got: payload.len(),
            });
        }
        let flags = payload[6];
        Ok(Self {
            battery: u16::from_le_bytes([payload[0], payload[1]]),
            target: i16::from_le_bytes([payload[2], payload[3]]),
            position: i16::from_le_bytes([payload[4], payload[5]]),
            is_clutch_failed: flags & (1 << 0) != 0,
            is_lock_range: flags & (1 << 1) != 0,
            is_unlock_range: flags & (1 << 2) != 0,
            is_critical: flags & (1 << 3) != 0,
            is_stop: flags & (1 << 4) != 0,
            is_low_battery: flags & (1 << 5) != 0,
            is_clockwise: flags & (1 << 6) != 0,
        })
    }

    /// Battery voltage in volts (the raw reading covers half the pack).
    pub fn battery_voltage(&self) -> f64 {
        f64::from(self.battery) * 2.0 / 1000.0
    }

    /// Derive the presentation report, timestamped with the current wall
    /// clock (the device reports no time of its own).
    pub fn report(&self) -> MechStatusReport {
        let battery_voltage = self.battery_voltage();
        let lock_status = if self.is_lock_range {
            LockStatus::Locked
        } else if self.is_unlock_range {
            LockStatus::Unlocked
        } else {
            LockStatus::Unknown
        };
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        MechStatusReport {
            battery_percentage: battery_percentage(battery_voltage),
            battery_voltage,
            position: i32::from(self.position) * 1024 / 360,
            lock_status,
            timestamp,
        }
    }
}

/// Tri-state lock position label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    /// Within the lock range.
    Locked,
    /// Within the unlock range.
    Unlocked,
    /// In neither range.
    Unknown,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockStatus::Locked => "locked",
            LockStatus::Unlocked => "unlocked",
            LockStatus::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Derived mechanical-status report in the Web API shape.
///
/// Serializes with the Web API's camelCase field names; `lock_status` keeps
/// its historical `CHSesame2Status` key.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MechStatusReport {
    /// Estimated battery charge, 0-100.
    pub battery_percentage: u8,
    /// Battery voltage in volts.
    pub battery_voltage: f64,
    /// Angle scaled to 1024 steps per revolution, truncated toward zero.
    pub position: i32,
    /// Lock position label.
    #[serde(rename = "CHSesame2Status")]
    pub lock_status: LockStatus,
    /// Wall-clock UNIX timestamp taken at parse time.
    pub timestamp: u64,
}

/// Battery discharge curve: (voltage, percentage) breakpoints, decreasing.
const BATTERY_CURVE: [(f64, f64); 16] = [
    (5.85, 100.0),
    (5.82, 95.0),
    (5.79, 90.0),
    (5.76, 85.0),
    (5.73, 80.0),
    (5.70, 70.0),
    (5.65, 60.0),
    (5.60, 50.0),
    (5.55, 40.0),
    (5.50, 32.0),
    (5.40, 21.0),
    (5.20, 13.0),
    (5.10, 10.0),
    (5.00, 7.0),
    (4.80, 3.0),
    (4.60, 0.0),
];

/// Estimate battery percentage from voltage.
///
/// Piecewise-linear interpolation over [`BATTERY_CURVE`], clamped at the
/// table ends, truncated toward zero.
pub fn battery_percentage(voltage: f64) -> u8 {
    let (highest_v, highest_p) = BATTERY_CURVE[0];
    let (lowest_v, lowest_p) = BATTERY_CURVE[BATTERY_CURVE.len() - 1];
    if voltage >= highest_v {
        return highest_p as u8;
    }
    if voltage <= lowest_v {
        return lowest_p as u8;
    }
    for pair in BATTERY_CURVE.windows(2) {
        let (upper_v, upper_p) = pair[0];
        let (lower_v, lower_p) = pair[1];
        if voltage > lower_v && voltage <= upper_v {
            let ratio = (voltage - lower_v) / (upper_v - lower_v);
            return ((upper_p - lower_p) * ratio + lower_p) as u8;
        }
    }
    0
}

// ============================================================================
// Handshake Artifacts
// ============================================================================

/// Handshake values extracted by the dispatcher and polled by the session:
/// the device-issued random code and the login timestamp.
///
/// Cleared on teardown so a reconnect never logs in against a previous
/// session's random code.
#[derive(Debug, Default)]
pub struct HandshakeArtifacts {
    random_code: Mutex<Option<Vec<u8>>>,
    login_timestamp: Mutex<Option<u32>>,
}

impl HandshakeArtifacts {
    /// Create empty artifacts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Random code published by the device, if received.
    pub fn random_code(&self) -> Option<Vec<u8>> {
        crate::lock(&self.random_code).clone()
    }

    /// Login timestamp from the login response, if received.
    pub fn login_timestamp(&self) -> Option<u32> {
        *crate::lock(&self.login_timestamp)
    }

    /// Forget both values.
    pub fn clear(&self) {
        *crate::lock(&self.random_code) = None;
        *crate::lock(&self.login_timestamp) = None;
    }

    fn set_random_code(&self, code: Vec<u8>) {
        *crate::lock(&self.random_code) = Some(code);
    }

    fn set_login_timestamp(&self, timestamp: u32) {
        *crate::lock(&self.login_timestamp) = Some(timestamp);
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Receives decoded mechanical status from the dispatcher.
pub trait MessageSink: Send + Sync {
    /// Called once per mech-status publish, raw and derived records
    /// together.
    fn on_mech_status(&self, report: MechStatusReport, raw: MechStatus);
}

/// Decodes reassembled inbound messages.
///
/// Decrypts messages flagged encrypted through the shared cipher slot,
/// routes by op/item code, stores handshake artifacts, and forwards
/// telemetry to the sink. Decryption problems trigger recovery and drop
/// the message; unknown codes and truncated payloads are logged and
/// dropped.
pub struct Dispatcher {
    cipher: Arc<Mutex<Option<CipherState>>>,
    artifacts: Arc<HandshakeArtifacts>,
    sink: Arc<dyn MessageSink>,
    recovery: RecoveryHandle,
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// `cipher` starts empty; the session fills the slot once the token is
    /// derived, which enables decryption.
    pub fn new(
        cipher: Arc<Mutex<Option<CipherState>>>,
        artifacts: Arc<HandshakeArtifacts>,
        sink: Arc<dyn MessageSink>,
        recovery: RecoveryHandle,
    ) -> Self {
        Self {
            cipher,
            artifacts,
            sink,
            recovery,
        }
    }

    /// Process one reassembled message.
    pub fn process(&self, message: Vec<u8>, is_encrypted: bool) {
        let message = if is_encrypted {
            let mut cipher = crate::lock(&self.cipher);
            let Some(cipher) = cipher.as_mut() else {
                error!("encrypted message received while decryption is disabled");
                self.recovery.trigger();
                return;
            };
            match cipher.decrypt(&message) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    error!(error = %e, "failed to decrypt message");
                    self.recovery.trigger();
                    return;
                }
            }
        } else {
            message
        };

        let [op_byte, item_byte, ..] = message[..] else {
            debug!(len = message.len(), "message too short for header");
            return;
        };
        match OpCode::from_byte(op_byte) {
            Some(OpCode::Response) => {
                let payload = message.get(RESPONSE_PAYLOAD_OFFSET..).unwrap_or_default();
                self.handle_response(item_byte, payload);
            }
            Some(OpCode::Publish) => {
                let payload = message.get(PUBLISH_PAYLOAD_OFFSET..).unwrap_or_default();
                self.handle_publish(item_byte, payload);
            }
            None => {
                debug!(op_code = op_byte, "unknown op code");
            }
        }
    }

    fn handle_response(&self, item_byte: u8, payload: &[u8]) {
        match ItemCode::from_byte(item_byte) {
            Some(ItemCode::Login) => self.handle_login_response(payload),
            other => {
                debug!(
                    item_code = item_byte,
                    known = other.is_some(),
                    "unhandled response"
                );
            }
        }
    }

    fn handle_publish(&self, item_byte: u8, payload: &[u8]) {
        match ItemCode::from_byte(item_byte) {
            Some(ItemCode::Initial) => {
                self.artifacts.set_random_code(payload.to_vec());
            }
            Some(ItemCode::MechStatus) => self.handle_mech_status(payload),
            other => {
                debug!(
                    item_code = item_byte,
                    known = other.is_some(),
                    "unhandled publish"
                );
            }
        }
    }

    fn handle_login_response(&self, payload: &[u8]) {
        let Some(bytes) = payload.get(..4) else {
            debug!(len = payload.len(), "truncated login response");
            return;
        };
        let timestamp = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.artifacts.set_login_timestamp(timestamp);
    }

    fn handle_mech_status(&self, payload: &[u8]) {
        match MechStatus::parse(payload) {
            Ok(status) => {
                self.sink.on_mech_status(status.report(), status);
            }
            Err(e) => {
                debug!(error = %e, "malformed mech status payload");
            }
        }
    }
}
