use crate::boundary::{
    BoundaryResult, CencSample, CipherMode, DestBufferDesc, EntitledContentKey, LicenseType,
    PatternDescriptor,
};
use crate::key::CryptoKey;

use super::{ContentKeySession, KeySessionEnv, KeySessionOps, KeySessionType, LoadKeysArgs};

/// Content key session whose license carries entitlement keys.
///
/// Selection and decryption behave exactly like [`ContentKeySession`].
#[derive(Debug)]
pub struct EntitlementKeySession {
    inner: ContentKeySession,
    entitlement_key_ids: Vec<Vec<u8>>,
}

impl EntitlementKeySession {
    pub fn new(inner: ContentKeySession) -> Self {
        Self {
            inner,
            entitlement_key_ids: Vec::new(),
        }
    }

    /// Entitlement key ids from the last license load.
    pub fn entitlement_key_ids(&self) -> &[Vec<u8>] {
        &self.entitlement_key_ids
    }
}

impl KeySessionOps for EntitlementKeySession {
    fn session_type(&self) -> KeySessionType {
        KeySessionType::Entitlement
    }

    fn generate_derived_keys(
        &mut self,
        env: KeySessionEnv<'_>,
        message: &[u8],
    ) -> BoundaryResult<()> {
        self.inner.generate_derived_keys(env, message)
    }

    fn generate_derived_keys_with_session_key(
        &mut self,
        env: KeySessionEnv<'_>,
        message: &[u8],
        session_key: &[u8],
    ) -> BoundaryResult<()> {
        self.inner
            .generate_derived_keys_with_session_key(env, message, session_key)
    }

    fn load_keys(
        &mut self,
        env: KeySessionEnv<'_>,
        args: &LoadKeysArgs<'_>,
    ) -> BoundaryResult<Option<CipherMode>> {
        self.entitlement_key_ids = args.keys.iter().map(|k| k.key_id.clone()).collect();
        self.inner.load_keys_as(env, args, LicenseType::Entitlement)
    }

    fn load_entitled_content_keys(
        &mut self,
        env: KeySessionEnv<'_>,
        keys: &[CryptoKey],
    ) -> BoundaryResult<()> {
        let entitled: Vec<EntitledContentKey<'_>> = keys
            .iter()
            .map(|k| {
                if !self.entitlement_key_ids.contains(&k.entitlement_key_id) {
                    warn!(
                        "content key {} references unknown entitlement key {}",
                        hex::encode(&k.key_id),
                        hex::encode(&k.entitlement_key_id)
                    );
                }
                EntitledContentKey {
                    entitlement_key_id: &k.entitlement_key_id,
                    content_key_id: &k.key_id,
                    content_key_data_iv: &k.key_data_iv,
                    content_key_data: &k.key_data,
                }
            })
            .collect();
        env.boundary
            .load_entitled_content_keys(self.inner.handle(), &entitled)
    }

    fn select_key(
        &mut self,
        env: KeySessionEnv<'_>,
        key_id: &[u8],
        mode: CipherMode,
    ) -> BoundaryResult<()> {
        self.inner.select_key(env, key_id, mode)
    }

    fn decrypt(
        &mut self,
        env: KeySessionEnv<'_>,
        sample: &CencSample<'_>,
        dest: &mut DestBufferDesc<'_>,
        pattern: &PatternDescriptor,
    ) -> BoundaryResult<()> {
        self.inner.decrypt(env, sample, dest, pattern)
    }
}
