use crate::boundary::{
    BoundaryError, BoundaryHandle, BoundaryResult, CencSample, CipherMode, DestBufferDesc,
    LicenseType, PatternDescriptor,
};
use crate::key::CryptoKey;

use super::{derive_context, KeySessionEnv, KeySessionOps, KeySessionType, LoadKeysArgs};

/// Progress of the first license load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubLicenseState {
    Initializing,
    InitialLicenseLoaded,
    InitialLicenseFailed,
}

/// One license spread over several boundary handles, one key per handle.
///
/// The handles belong to the crypto session; this variant only looks them up
/// by sub-session key id.
#[derive(Debug)]
pub struct SubLicenseKeySession {
    state: SubLicenseState,
    keys: Vec<CryptoKey>,
    cached_sub_session_key_id: Option<Vec<u8>>,
    wrapped_private_device_key: Vec<u8>,
    group_id: Vec<u8>,
}

impl SubLicenseKeySession {
    pub fn new(wrapped_private_device_key: Vec<u8>, group_id: Vec<u8>) -> Self {
        Self {
            state: SubLicenseState::Initializing,
            keys: Vec::new(),
            cached_sub_session_key_id: None,
            wrapped_private_device_key,
            group_id,
        }
    }

    pub fn state(&self) -> SubLicenseState {
        self.state
    }

    pub fn keys(&self) -> &[CryptoKey] {
        &self.keys
    }

    pub fn group_id(&self) -> &[u8] {
        &self.group_id
    }

    pub fn wrapped_private_device_key(&self) -> &[u8] {
        &self.wrapped_private_device_key
    }

    fn load_and_select(
        env: KeySessionEnv<'_>,
        handle: BoundaryHandle,
        args: &LoadKeysArgs<'_>,
        key: &CryptoKey,
    ) -> BoundaryResult<()> {
        let objects = [key.as_key_object()];
        let request = args.request(&objects, LicenseType::Content);
        env.boundary.load_keys(handle, &request)?;
        env.boundary.select_key(handle, &key.key_id, key.cipher_mode)
    }

    /// Every key goes into the handle named by its sub-session key id.
    fn load_initial(
        &self,
        env: KeySessionEnv<'_>,
        args: &LoadKeysArgs<'_>,
    ) -> BoundaryResult<Option<CipherMode>> {
        let mut cipher_mode = None;
        for key in args.keys {
            cipher_mode = Some(key.cipher_mode);
            let handle = *env
                .sub_sessions
                .get(&key.sub_session_key_id)
                .ok_or_else(|| {
                    error!(
                        "unrecognized sub session {}",
                        hex::encode(&key.sub_session_key_id)
                    );
                    BoundaryError::InvalidSession
                })?;
            Self::load_and_select(env, handle, args, key)?;
        }
        Ok(cipher_mode)
    }

    /// Single key update matched by track label.
    fn load_update(
        &mut self,
        env: KeySessionEnv<'_>,
        args: &LoadKeysArgs<'_>,
        key: &CryptoKey,
    ) -> BoundaryResult<Option<CipherMode>> {
        let Some(index) = self
            .keys
            .iter()
            .position(|k| k.track_label == key.track_label)
        else {
            return Ok(None);
        };

        let existing = &self.keys[index];
        let updated = CryptoKey {
            sub_session_key_id: existing.sub_session_key_id.clone(),
            sub_session_key: existing.sub_session_key.clone(),
            ..key.clone()
        };
        self.keys[index] = updated;
        let key = &self.keys[index];

        let Some(&handle) = env.sub_sessions.get(&key.sub_session_key_id) else {
            return Ok(None);
        };

        let mut context = self.group_id.clone();
        context.extend_from_slice(args.message);
        let (mac_context, enc_context) = derive_context(&context);
        env.boundary
            .derive_keys_from_session_key(handle, &key.sub_session_key, &mac_context, &enc_context)
            .inspect_err(|e| error!("DeriveKeysFromSessionKey failed: {:?}", e))?;

        Self::load_and_select(env, handle, args, key)?;
        Ok(None)
    }
}

impl KeySessionOps for SubLicenseKeySession {
    fn session_type(&self) -> KeySessionType {
        KeySessionType::SubLicense
    }

    /// Keybox derivation has no meaning across sub-sessions.
    fn generate_derived_keys(
        &mut self,
        _env: KeySessionEnv<'_>,
        _message: &[u8],
    ) -> BoundaryResult<()> {
        Err(BoundaryError::NotImplemented)
    }

    fn generate_derived_keys_with_session_key(
        &mut self,
        env: KeySessionEnv<'_>,
        message: &[u8],
        session_key: &[u8],
    ) -> BoundaryResult<()> {
        let (mac_context, enc_context) = derive_context(message);
        for &handle in env.sub_sessions.values() {
            env.boundary
                .derive_keys_from_session_key(handle, session_key, &mac_context, &enc_context)
                .inspect_err(|e| error!("DeriveKeysFromSessionKey failed: {:?}", e))?;
        }
        Ok(())
    }

    fn load_keys(
        &mut self,
        env: KeySessionEnv<'_>,
        args: &LoadKeysArgs<'_>,
    ) -> BoundaryResult<Option<CipherMode>> {
        if self.state == SubLicenseState::Initializing {
            self.keys = args.keys.to_vec();
            let result = self.load_initial(env, args);
            self.state = if result.is_ok() {
                SubLicenseState::InitialLicenseLoaded
            } else {
                SubLicenseState::InitialLicenseFailed
            };
            return result;
        }
        match args.keys.first() {
            Some(key) => self.load_update(env, args, key),
            None => Ok(None),
        }
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
        let mut found = false;
        for key in self.keys.iter_mut().filter(|k| k.key_id == key_id) {
            found = true;
            self.cached_sub_session_key_id = Some(key.sub_session_key_id.clone());
            if key.cipher_mode != mode {
                let handle = *env
                    .sub_sessions
                    .get(&key.sub_session_key_id)
                    .ok_or(BoundaryError::InvalidSession)?;
                env.boundary.select_key(handle, &key.key_id, mode)?;
                key.cipher_mode = mode;
            }
        }
        if found {
            Ok(())
        } else {
            Err(BoundaryError::NoContentKey)
        }
    }

    fn decrypt(
        &mut self,
        env: KeySessionEnv<'_>,
        sample: &CencSample<'_>,
        dest: &mut DestBufferDesc<'_>,
        pattern: &PatternDescriptor,
    ) -> BoundaryResult<()> {
        let handle = self
            .cached_sub_session_key_id
            .as_ref()
            .and_then(|id| env.sub_sessions.get(id))
            .copied()
            .ok_or(BoundaryError::InvalidSession)?;
        env.boundary.decrypt_cenc(handle, sample, dest, pattern)
    }
}
