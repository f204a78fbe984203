//! SSM Session Cipher
//!
//! Authenticated encryption for the SSM session layer: AES-128-CCM with a
//! 4-byte tag and a counter-based nonce, plus AES-CMAC derivation of the
//! session token from the pre-shared secret and the device-issued random
//! code.
//!
//! ## Nonce Construction
//!
//! ```text
//! | Offset | Field          | Size | Notes                        |
//! |--------|----------------|------|------------------------------|
//! | 0      | counter        | 8    | little-endian, per direction |
//! | 8      | zero byte      | 1    |                              |
//! | 9      | random code    | 4    | fixed for the session        |
//! ```
//!
//! 13 bytes total, a valid CCM nonce length. Each direction (outbound
//! encrypt, inbound decrypt) owns an independent monotonically increasing
//! counter; a (direction, counter) pair is used for at most one AEAD
//! operation per session. Counters are never reset — a fresh handshake
//! produces a fresh `CipherState`.

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U13, U4};
use ccm::Ccm;
use cmac::{Cmac, Mac};
use std::fmt;
use thiserror::Error;

/// AES-CCM configuration used by the protocol: 4-byte tag, 13-byte nonce.
type SsmCcm = Ccm<Aes128, U4, U13>;

/// Size of the pre-shared secret key in bytes.
pub const SECRET_KEY_SIZE: usize = 16;

/// Size of the derived session token in bytes (full CMAC digest).
pub const TOKEN_SIZE: usize = 16;

/// Size of the device-issued random code in bytes.
pub const RANDOM_CODE_SIZE: usize = 4;

/// Size of the AEAD authentication tag.
pub const TAG_SIZE: usize = 4;

/// Size of the constructed nonce.
pub const NONCE_SIZE: usize = 13;

/// Fixed associated data authenticated with every message, both directions.
const ASSOCIATED_DATA: [u8; 1] = [0x00];

/// Errors from cipher operations.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("invalid secret key length: expected {SECRET_KEY_SIZE}, got {got}")]
    KeyLength { got: usize },

    #[error("invalid random code length: expected {RANDOM_CODE_SIZE}, got {got}")]
    RandomCodeLength { got: usize },

    #[error("encryption failed")]
    Encrypt,

    #[error("authentication failed")]
    Authentication,

    #[error("message too short: expected at least {expected}, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("nonce counter overflow")]
    NonceOverflow,
}

/// Derive the session token from the pre-shared secret and the random code.
///
/// AES-128 CMAC over the random code, keyed with the secret; the full
/// 16-byte digest is the token. The token keys the session cipher and its
/// first 4 bytes authenticate the login command.
pub fn derive_token(
    secret_key: &[u8],
    random_code: &[u8],
) -> Result<[u8; TOKEN_SIZE], CipherError> {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(secret_key).map_err(|_| {
        CipherError::KeyLength {
            got: secret_key.len(),
        }
    })?;
    mac.update(random_code);
    let digest = mac.finalize().into_bytes();

    let mut token = [0u8; TOKEN_SIZE];
    token.copy_from_slice(&digest);
    Ok(token)
}

/// Session cipher state: token key, random-code nonce salt, and the two
/// per-direction rolling counters.
///
/// Callers sharing one instance must serialize access (the session keeps it
/// behind a mutex) so that counter advance-and-use stays atomic — nonce
/// uniqueness depends on it.
#[derive(Clone)]
pub struct CipherState {
    /// Derived session token, used as the AES-CCM key.
    token: [u8; TOKEN_SIZE],
    /// Device-issued random code, appended to every nonce.
    random_code: [u8; RANDOM_CODE_SIZE],
    /// Outbound (encrypt) nonce counter.
    encrypt_counter: u64,
    /// Inbound (decrypt) nonce counter.
    decrypt_counter: u64,
}

impl CipherState {
    /// Create a cipher state from a derived token and the random code.
    ///
    /// Both counters start at zero. The random code must be exactly
    /// [`RANDOM_CODE_SIZE`] bytes so the constructed nonce is a valid CCM
    /// nonce length.
    pub fn new(token: [u8; TOKEN_SIZE], random_code: &[u8]) -> Result<Self, CipherError> {
        if random_code.len() != RANDOM_CODE_SIZE {
            return Err(CipherError::RandomCodeLength {
                got: random_code.len(),
            });
        }
        let mut code = [0u8; RANDOM_CODE_SIZE];
        code.copy_from_slice(random_code);
        Ok(Self {
            token,
            random_code: code,
            encrypt_counter: 0,
            decrypt_counter: 0,
        })
    }

    /// Encrypt plaintext, returning ciphertext with the 4-byte tag appended.
    ///
    /// Advances the outbound counter by exactly one on success.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if self.encrypt_counter == u64::MAX {
            return Err(CipherError::NonceOverflow);
        }
        let nonce = self.build_nonce(self.encrypt_counter);
        let cipher =
            SsmCcm::new_from_slice(&self.token).map_err(|_| CipherError::Encrypt)?;
        let ciphertext = cipher
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &ASSOCIATED_DATA,
                },
            )
            .map_err(|_| CipherError::Encrypt)?;
        self.encrypt_counter += 1;
        Ok(ciphertext)
    }

    /// Decrypt ciphertext (with appended tag), verifying authenticity.
    ///
    /// Advances the inbound counter by exactly one on success. A failed
    /// verification leaves the counter untouched: no valid message consumed
    /// that nonce slot.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.len() < TAG_SIZE {
            return Err(CipherError::MessageTooShort {
                expected: TAG_SIZE,
                got: data.len(),
            });
        }
        if self.decrypt_counter == u64::MAX {
            return Err(CipherError::NonceOverflow);
        }
        let nonce = self.build_nonce(self.decrypt_counter);
        let cipher =
            SsmCcm::new_from_slice(&self.token).map_err(|_| CipherError::Authentication)?;
        let plaintext = cipher
            .decrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: data,
                    aad: &ASSOCIATED_DATA,
                },
            )
            .map_err(|_| CipherError::Authentication)?;
        self.decrypt_counter += 1;
        Ok(plaintext)
    }

    /// Current outbound counter value.
    pub fn encrypt_counter(&self) -> u64 {
        self.encrypt_counter
    }

    /// Current inbound counter value.
    pub fn decrypt_counter(&self) -> u64 {
        self.decrypt_counter
    }

    /// Build the 13-byte nonce for a counter value.
    fn build_nonce(&self, counter: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0..8].copy_from_slice(&counter.to_le_bytes());
        // nonce[8] stays zero
        nonce[9..].copy_from_slice(&self.random_code);
        nonce
    }
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherState")
            .field("encrypt_counter", &self.encrypt_counter)
            .field("decrypt_counter", &self.decrypt_counter)
            .field("token", &"[redacted]")
            .field("random_code", &"[redacted]")
            .finish()
    }
}
