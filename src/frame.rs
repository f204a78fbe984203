//! BLE Frame Codec
//!
//! Fragmentation and reassembly of SSM messages over the 20-byte GATT
//! notification/write transport. Every frame is one header byte followed by
//! up to 19 payload bytes.
//!
//! ## Header Byte
//!
//! ```text
//! | Bit | Meaning                            |
//! |-----|------------------------------------|
//! | 0   | first fragment of a message        |
//! | 1   | last fragment, message plaintext   |
//! | 2   | last fragment, message encrypted   |
//! ```
//!
//! Bits 1 and 2 are mutually exclusive in well-formed traffic. A message
//! that fits a single fragment sets the first bit together with the
//! appropriate last bit. Headers are not validated beyond bit extraction;
//! garbage reaching the dispatcher surfaces as a dispatch-level drop, not a
//! codec error.

/// Maximum size of one transport frame (header byte included).
pub const MAX_FRAME_SIZE: usize = 20;

/// Maximum payload bytes carried by one frame.
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE - 1;

/// Header bit: first fragment of a message.
const HEADER_FIRST: u8 = 0b001;

/// Header bit: last fragment of a plaintext message.
const HEADER_LAST_PLAINTEXT: u8 = 0b010;

/// Header bit: last fragment of an encrypted message.
const HEADER_LAST_ENCRYPTED: u8 = 0b100;

/// Mask covering both last-fragment bits.
const HEADER_LAST_MASK: u8 = HEADER_LAST_PLAINTEXT | HEADER_LAST_ENCRYPTED;

/// Split a payload into transport frames, in send order.
///
/// An empty payload produces no frames.
pub fn fragment(payload: &[u8], is_encrypted: bool) -> Vec<Vec<u8>> {
    let last_bit = if is_encrypted {
        HEADER_LAST_ENCRYPTED
    } else {
        HEADER_LAST_PLAINTEXT
    };

    let mut frames = Vec::with_capacity(payload.len().div_ceil(MAX_CHUNK_SIZE));
    let total = payload.chunks(MAX_CHUNK_SIZE).count();
    for (index, chunk) in payload.chunks(MAX_CHUNK_SIZE).enumerate() {
        let mut header = 0u8;
        if index == 0 {
            header |= HEADER_FIRST;
        }
        if index + 1 == total {
            header |= last_bit;
        }
        let mut frame = Vec::with_capacity(1 + chunk.len());
        frame.push(header);
        frame.extend_from_slice(chunk);
        frames.push(frame);
    }
    frames
}

/// Accumulates inbound fragments into complete messages.
///
/// Scoped to one logical message at a time: a first-bit fragment resets the
/// buffer, a last-bit fragment closes it and yields the message together
/// with its encrypted flag.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound frame.
    ///
    /// Returns `Some((message, is_encrypted))` when the frame closes a
    /// message, `None` while still accumulating. An empty frame is ignored.
    pub fn push(&mut self, frame: &[u8]) -> Option<(Vec<u8>, bool)> {
        let (&header, payload) = frame.split_first()?;

        if header & HEADER_FIRST != 0 {
            self.buffer.clear();
        }
        self.buffer.extend_from_slice(payload);

        if header & HEADER_LAST_MASK == 0 {
            return None;
        }
        let is_encrypted = header & HEADER_LAST_ENCRYPTED != 0;
        Some((std::mem::take(&mut self.buffer), is_encrypted))
    }
}
