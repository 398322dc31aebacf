use crate::boundary::{
    BoundaryError, BoundaryHandle, BoundaryResult, CencSample, CipherMode, DestBufferDesc,
    KeyObject, LicenseType, PatternDescriptor,
};
use crate::key::CryptoKey;

use super::{derive_context, KeySessionEnv, KeySessionOps, KeySessionType, LoadKeysArgs};

/// Loads keys into the primary handle and remembers the last selection.
#[derive(Debug)]
pub struct ContentKeySession {
    handle: BoundaryHandle,
    cached_key_id: Option<Vec<u8>>,
    cipher_mode: CipherMode,
}

impl ContentKeySession {
    pub fn new(handle: BoundaryHandle) -> Self {
        Self {
            handle,
            cached_key_id: None,
            cipher_mode: CipherMode::Ctr,
        }
    }

    pub fn handle(&self) -> BoundaryHandle {
        self.handle
    }

    /// Key id of the last successful selection.
    pub fn cached_key_id(&self) -> Option<&[u8]> {
        self.cached_key_id.as_deref()
    }

    /// Load `args.keys` with an explicit license type tag.
    pub(super) fn load_keys_as(
        &mut self,
        env: KeySessionEnv<'_>,
        args: &LoadKeysArgs<'_>,
        license_type: LicenseType,
    ) -> BoundaryResult<Option<CipherMode>> {
        self.cached_key_id = None;
        let objects: Vec<KeyObject<'_>> = args.keys.iter().map(CryptoKey::as_key_object).collect();
        let request = args.request(&objects, license_type);
        trace!("LoadKeys: handle={:?} keys={}", self.handle, objects.len());
        env.boundary.load_keys(self.handle, &request)?;
        Ok(args.keys.last().map(|k| k.cipher_mode))
    }
}

impl KeySessionOps for ContentKeySession {
    fn session_type(&self) -> KeySessionType {
        KeySessionType::Content
    }

    fn generate_derived_keys(
        &mut self,
        env: KeySessionEnv<'_>,
        message: &[u8],
    ) -> BoundaryResult<()> {
        let (mac_context, enc_context) = derive_context(message);
        env.boundary
            .generate_derived_keys(self.handle, &mac_context, &enc_context)
            .inspect_err(|e| error!("GenerateDerivedKeys failed: {:?}", e))
    }

    fn generate_derived_keys_with_session_key(
        &mut self,
        env: KeySessionEnv<'_>,
        message: &[u8],
        session_key: &[u8],
    ) -> BoundaryResult<()> {
        let (mac_context, enc_context) = derive_context(message);
        env.boundary
            .derive_keys_from_session_key(self.handle, session_key, &mac_context, &enc_context)
            .inspect_err(|e| error!("DeriveKeysFromSessionKey failed: {:?}", e))
    }

    fn load_keys(
        &mut self,
        env: KeySessionEnv<'_>,
        args: &LoadKeysArgs<'_>,
    ) -> BoundaryResult<Option<CipherMode>> {
        self.load_keys_as(env, args, LicenseType::Content)
    }

    fn load_entitled_content_keys(
        &mut self,
        _env: KeySessionEnv<'_>,
        _keys: &[CryptoKey],
    ) -> BoundaryResult<()> {
        Err(BoundaryError::InvalidContext)
    }

    fn select_key(
        &mut self,
        env: KeySessionEnv<'_>,
        key_id: &[u8],
        mode: CipherMode,
    ) -> BoundaryResult<()> {
        if self.cached_key_id.as_deref() == Some(key_id) && self.cipher_mode == mode {
            return Ok(());
        }

        self.cached_key_id = Some(key_id.to_vec());
        self.cipher_mode = mode;
        env.boundary
            .select_key(self.handle, key_id, mode)
            .inspect_err(|_| self.cached_key_id = None)
    }

    fn decrypt(
        &mut self,
        env: KeySessionEnv<'_>,
        sample: &CencSample<'_>,
        dest: &mut DestBufferDesc<'_>,
        pattern: &PatternDescriptor,
    ) -> BoundaryResult<()> {
        env.boundary.decrypt_cenc(self.handle, sample, dest, pattern)
    }
}
