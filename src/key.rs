//! Key material as handed to the trust boundary.
//!
//! A [`CryptoKey`] holds the still-wrapped key fields parsed out of a license
//! response. The engine never sees clear key bytes; it passes these fields to
//! the boundary, which unwraps them internally.

use crate::boundary::{CipherMode, GenericAlgorithm, KeyObject};

/// Minimum key control block length.
pub const KEY_CONTROL_SIZE: usize = 16;

/// A wrapped key from a license.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CryptoKey {
    pub key_id: Vec<u8>,
    pub key_data: Vec<u8>,
    pub key_data_iv: Vec<u8>,
    pub key_control: Vec<u8>,
    pub key_control_iv: Vec<u8>,
    /// Sub-session this key is loaded into (sub-license keys only).
    pub sub_session_key_id: Vec<u8>,
    /// Session key used to re-derive keys for that sub-session.
    pub sub_session_key: Vec<u8>,
    /// Entitlement key unlocking this content key (entitled keys only).
    pub entitlement_key_id: Vec<u8>,
    pub track_label: String,
    pub cipher_mode: CipherMode,
}

impl CryptoKey {
    /// Create a key with its wrapped data and no control block.
    pub fn new(key_id: &[u8], key_data: &[u8], key_data_iv: &[u8], cipher_mode: CipherMode) -> Self {
        Self {
            key_id: key_id.to_vec(),
            key_data: key_data.to_vec(),
            key_data_iv: key_data_iv.to_vec(),
            cipher_mode,
            ..Default::default()
        }
    }

    pub fn has_key_control(&self) -> bool {
        self.key_control.len() >= KEY_CONTROL_SIZE
    }

    /// Borrow this key as a boundary load object.
    pub fn as_key_object(&self) -> KeyObject<'_> {
        let (key_control_iv, key_control) = if self.has_key_control() {
            (Some(self.key_control_iv.as_slice()), Some(self.key_control.as_slice()))
        } else {
            warn!(
                "key {} has no control block (size={})",
                hex::encode(&self.key_id),
                self.key_control.len()
            );
            (None, None)
        };
        KeyObject {
            key_id: &self.key_id,
            key_data_iv: &self.key_data_iv,
            key_data: &self.key_data,
            key_control_iv,
            key_control,
            cipher_mode: self.cipher_mode,
        }
    }
}

/// Security level a key requires on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeySecurityLevel {
    #[default]
    Unset,
    SwSecureCrypto,
    SwSecureDecode,
    HwSecureCrypto,
    HwSecureDecode,
    HwSecureAll,
}

/// Operations a license allows a key to be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyAllowedUsage {
    pub decrypt_to_clear_buffer: bool,
    pub decrypt_to_secure_buffer: bool,
    pub generic_encrypt: bool,
    pub generic_decrypt: bool,
    pub generic_sign: bool,
    pub generic_verify: bool,
    pub key_security_level: KeySecurityLevel,
    pub valid: bool,
}

impl KeyAllowedUsage {
    /// Usage of an ordinary content key.
    pub fn content(key_security_level: KeySecurityLevel) -> Self {
        Self {
            decrypt_to_clear_buffer: true,
            decrypt_to_secure_buffer: true,
            key_security_level,
            valid: true,
            ..Default::default()
        }
    }
}

/// Caller-facing generic encryption algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    Unknown,
    AesCbc128,
}

impl EncryptionAlgorithm {
    /// Boundary algorithm, `None` when unsupported.
    pub fn to_boundary(self) -> Option<GenericAlgorithm> {
        match self {
            EncryptionAlgorithm::AesCbc128 => Some(GenericAlgorithm::AesCbc128NoPadding),
            EncryptionAlgorithm::Unknown => None,
        }
    }

    /// Required IV length.
    pub fn block_size(self) -> usize {
        match self {
            EncryptionAlgorithm::AesCbc128 => crate::decrypt::AES_BLOCK_SIZE,
            EncryptionAlgorithm::Unknown => 0,
        }
    }
}

/// Caller-facing generic signing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    Unknown,
    HmacSha256,
}

impl SigningAlgorithm {
    pub fn to_boundary(self) -> Option<GenericAlgorithm> {
        match self {
            SigningAlgorithm::HmacSha256 => Some(GenericAlgorithm::HmacSha256),
            SigningAlgorithm::Unknown => None,
        }
    }
}
