//! Key loading and selection policy for a crypto session.
//!
//! A [`KeySession`] decides how license keys reach the trust boundary:
//!
//! - [`ContentKeySession`]: keys go straight into the primary handle.
//! - [`EntitlementKeySession`]: entitlement keys are loaded first, then the
//!   content keys they unlock are loaded in a second pass.
//! - [`SubLicenseKeySession`]: one license is split over several boundary
//!   handles, one key per handle.
//!
//! The owning crypto session swaps the variant in place when an operation
//! needs a different one.

mod content;
mod entitlement;
mod sublicense;

use std::collections::BTreeMap;

pub use content::ContentKeySession;
pub use entitlement::EntitlementKeySession;
pub use sublicense::{SubLicenseKeySession, SubLicenseState};

use crate::boundary::{
    BoundaryHandle, BoundaryResult, CencSample, CipherMode, CryptoBoundary, DestBufferDesc,
    KeyObject, LicenseType, LoadKeysRequest, PatternDescriptor,
};
use crate::key::CryptoKey;

/// MAC key material length (server and client keys).
pub const MAC_KEY_SIZE: usize = 32;
/// Wrapped key IV length.
pub const KEY_IV_SIZE: usize = 16;

/// Boundary handles of the sub-sessions of a sub-license, keyed by
/// sub-session key id. Owned by the crypto session.
pub type SubSessionMap = BTreeMap<Vec<u8>, BoundaryHandle>;

/// Which variant is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySessionType {
    Content,
    Entitlement,
    SubLicense,
}

/// What a key session may touch during one call.
#[derive(Clone, Copy)]
pub struct KeySessionEnv<'a> {
    pub boundary: &'a dyn CryptoBoundary,
    pub sub_sessions: &'a SubSessionMap,
}

/// Fields of a license response needed to load its keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadKeysArgs<'a> {
    pub message: &'a [u8],
    pub signature: &'a [u8],
    pub mac_key_iv: &'a [u8],
    pub mac_key: &'a [u8],
    pub keys: &'a [CryptoKey],
    pub provider_session_token: &'a [u8],
    pub srm_requirement: &'a [u8],
}

impl<'a> LoadKeysArgs<'a> {
    /// Boundary request for `key_objects` tagged with `license_type`.
    pub fn request(
        &self,
        key_objects: &'a [KeyObject<'a>],
        license_type: LicenseType,
    ) -> LoadKeysRequest<'a> {
        let (enc_mac_key_iv, enc_mac_keys) =
            if self.mac_key.len() >= MAC_KEY_SIZE && self.mac_key_iv.len() >= KEY_IV_SIZE {
                (Some(self.mac_key_iv), Some(self.mac_key))
            } else {
                trace!("enc_mac_key not set");
                (None, None)
            };
        LoadKeysRequest {
            message: self.message,
            signature: self.signature,
            enc_mac_key_iv,
            enc_mac_keys,
            keys: key_objects,
            provider_session_token: non_empty(self.provider_session_token),
            srm_requirement: non_empty(self.srm_requirement),
            license_type,
        }
    }
}

fn non_empty(bytes: &[u8]) -> Option<&[u8]> {
    if bytes.is_empty() {
        None
    } else {
        Some(bytes)
    }
}

/// Operations every key session variant implements.
pub trait KeySessionOps {
    fn session_type(&self) -> KeySessionType;

    /// Derive session keys from a license request (keybox devices).
    fn generate_derived_keys(&mut self, env: KeySessionEnv<'_>, message: &[u8])
        -> BoundaryResult<()>;

    /// Derive session keys from an RSA wrapped session key.
    fn generate_derived_keys_with_session_key(
        &mut self,
        env: KeySessionEnv<'_>,
        message: &[u8],
        session_key: &[u8],
    ) -> BoundaryResult<()>;

    /// Load license keys. Returns the cipher mode of the last key loaded.
    fn load_keys(
        &mut self,
        env: KeySessionEnv<'_>,
        args: &LoadKeysArgs<'_>,
    ) -> BoundaryResult<Option<CipherMode>>;

    fn load_entitled_content_keys(
        &mut self,
        env: KeySessionEnv<'_>,
        keys: &[CryptoKey],
    ) -> BoundaryResult<()>;

    fn select_key(
        &mut self,
        env: KeySessionEnv<'_>,
        key_id: &[u8],
        mode: CipherMode,
    ) -> BoundaryResult<()>;

    fn decrypt(
        &mut self,
        env: KeySessionEnv<'_>,
        sample: &CencSample<'_>,
        dest: &mut DestBufferDesc<'_>,
        pattern: &PatternDescriptor,
    ) -> BoundaryResult<()>;
}

/// The installed key session variant.
#[derive(Debug)]
pub enum KeySession {
    Content(ContentKeySession),
    Entitlement(EntitlementKeySession),
    SubLicense(SubLicenseKeySession),
}

impl KeySession {
    pub fn content(handle: BoundaryHandle) -> Self {
        KeySession::Content(ContentKeySession::new(handle))
    }

    fn ops(&mut self) -> &mut dyn KeySessionOps {
        match self {
            KeySession::Content(s) => s,
            KeySession::Entitlement(s) => s,
            KeySession::SubLicense(s) => s,
        }
    }
}

impl KeySessionOps for KeySession {
    fn session_type(&self) -> KeySessionType {
        match self {
            KeySession::Content(s) => s.session_type(),
            KeySession::Entitlement(s) => s.session_type(),
            KeySession::SubLicense(s) => s.session_type(),
        }
    }

    fn generate_derived_keys(
        &mut self,
        env: KeySessionEnv<'_>,
        message: &[u8],
    ) -> BoundaryResult<()> {
        self.ops().generate_derived_keys(env, message)
    }

    fn generate_derived_keys_with_session_key(
        &mut self,
        env: KeySessionEnv<'_>,
        message: &[u8],
        session_key: &[u8],
    ) -> BoundaryResult<()> {
        self.ops()
            .generate_derived_keys_with_session_key(env, message, session_key)
    }

    fn load_keys(
        &mut self,
        env: KeySessionEnv<'_>,
        args: &LoadKeysArgs<'_>,
    ) -> BoundaryResult<Option<CipherMode>> {
        self.ops().load_keys(env, args)
    }

    fn load_entitled_content_keys(
        &mut self,
        env: KeySessionEnv<'_>,
        keys: &[CryptoKey],
    ) -> BoundaryResult<()> {
        self.ops().load_entitled_content_keys(env, keys)
    }

    fn select_key(
        &mut self,
        env: KeySessionEnv<'_>,
        key_id: &[u8],
        mode: CipherMode,
    ) -> BoundaryResult<()> {
        self.ops().select_key(env, key_id, mode)
    }

    fn decrypt(
        &mut self,
        env: KeySessionEnv<'_>,
        sample: &CencSample<'_>,
        dest: &mut DestBufferDesc<'_>,
        pattern: &PatternDescriptor,
    ) -> BoundaryResult<()> {
        self.ops().decrypt(env, sample, dest, pattern)
    }
}

/// Key derivation contexts for `message`: `(mac_context, enc_context)`.
pub fn derive_context(message: &[u8]) -> (Vec<u8>, Vec<u8>) {
    fn enc_context(msg: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(11 + msg.len() + 4);
        out.extend_from_slice(b"ENCRYPTION");
        out.push(0);
        out.extend_from_slice(msg);
        out.extend_from_slice(&(16u32 * 8).to_be_bytes());
        out
    }

    fn mac_context(msg: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(15 + msg.len() + 4);
        out.extend_from_slice(b"AUTHENTICATION");
        out.push(0);
        out.extend_from_slice(msg);
        out.extend_from_slice(&(MAC_KEY_SIZE as u32 * 8 * 2).to_be_bytes());
        out
    }

    (mac_context(message), enc_context(message))
}
