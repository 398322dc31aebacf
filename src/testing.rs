//! Software trust boundary and license session doubles for unit tests.
//!
//! [`FakeBoundary`] keeps clear keys in memory and runs real AES-128 CTR and
//! CBC, AES-CMAC key derivation and HMAC-SHA256, so decrypt and signing paths
//! can be checked byte for byte. Every call is counted and most can be forced
//! to fail by name.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use byteorder::{BigEndian, ByteOrder};
use cmac::Cmac;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::boundary::{
    BoundaryError, BoundaryHandle, BoundaryResult, BufferSizes, CencSample, CipherMode,
    CryptoBoundary, DestBufferDesc, EntitledContentKey, GenericAlgorithm, HdcpCapability,
    KeyRefreshObject, LicenseType as KeyLicenseType, LoadKeysRequest, PatternDescriptor,
    ProvisioningMethod, RequestedSecurityLevel, SUPPORTS_RSA_2048, SUPPORTS_RSA_3072,
};
use crate::crypto_session::{CryptoContext, CryptoSession};
use crate::decrypt::{increment_iv, AES_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::key::{CryptoKey, KeyAllowedUsage, KeySecurityLevel};
use crate::key_session::LoadKeysArgs;
use crate::session::{
    generate_key_set_id, generate_session_id, AppParameterMap, CertificateProvisioning,
    CertificateType, EventListener, InitData, KeyRequest, KeyRequestType, KeyStatus, LicenseSession,
    LicenseType, PropertySet, ProvisionedCertificate, ProvisioningRequest, QueryMap, SessionFactory,
};

type HmacSha256 = Hmac<Sha256>;
type CmacAes128 = Cmac<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const DEVICE_KEY: [u8; 16] = *b"fake-device-key!";
const DEVICE_ID: &[u8; 32] = b"fake-device-id-0123456789abcdef!";
const PROVISIONING_ID: &[u8; 16] = b"fake-prov-id-001";
const HEADER_MAGIC: &[u8; 4] = b"HDR1";
const ENTRY_MAGIC: &[u8; 4] = b"ENT1";
const RSA_SIGNATURE_LENGTH: usize = 256;
const HMAC_LENGTH: usize = 32;
const SRM_VERSION: u16 = 3;
const OEM_SYSTEM_ID_OID: &[u8] = &[
    0x06, 0x0a, 0x2b, 0x06, 0x01, 0x04, 0x01, 0xd6, 0x79, 0x04, 0x01, 0x01,
];

fn aes128(key: &[u8; 16]) -> Aes128 {
    <Aes128 as aes::cipher::KeyInit>::new(key.into())
}

fn cmac(key: &[u8; 16], counter: u8, context: &[u8]) -> Vec<u8> {
    let mut mac = CmacAes128::new_from_slice(key).expect("cmac key");
    mac.update(&[counter]);
    mac.update(context);
    mac.finalize().into_bytes().to_vec()
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac key");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn key_bytes(data: &[u8]) -> BoundaryResult<[u8; 16]> {
    data.get(..16)
        .and_then(|k| k.try_into().ok())
        .ok_or(BoundaryError::InvalidContext)
}

/// Apply CENC protection to `data`. CTR is its own inverse; CBC runs the
/// block cipher in the direction `encrypt` asks for.
fn cenc_transform(
    key: &[u8; 16],
    iv: &[u8; 16],
    mode: CipherMode,
    pattern: &PatternDescriptor,
    block_offset: usize,
    data: &[u8],
    encrypt: bool,
) -> Vec<u8> {
    let cipher = aes128(key);
    let mut out = data.to_vec();
    let period = pattern.encrypt + pattern.skip;
    let is_encrypted_block = |index: usize| period == 0 || index % period < pattern.encrypt;

    match mode {
        CipherMode::Ctr if period == 0 => {
            let mut counter = *iv;
            let mut keystream = aes::Block::clone_from_slice(&counter);
            cipher.encrypt_block(&mut keystream);
            let mut pos = block_offset % AES_BLOCK_SIZE;
            for byte in out.iter_mut() {
                if pos == AES_BLOCK_SIZE {
                    increment_iv(&mut counter, 1);
                    keystream = aes::Block::clone_from_slice(&counter);
                    cipher.encrypt_block(&mut keystream);
                    pos = 0;
                }
                *byte ^= keystream[pos];
                pos += 1;
            }
        }
        CipherMode::Ctr => {
            let mut counter = *iv;
            for (index, block) in out.chunks_mut(AES_BLOCK_SIZE).enumerate() {
                if block.len() < AES_BLOCK_SIZE || !is_encrypted_block(index) {
                    continue;
                }
                let mut keystream = aes::Block::clone_from_slice(&counter);
                cipher.encrypt_block(&mut keystream);
                block.iter_mut().zip(keystream.iter()).for_each(|(b, k)| *b ^= k);
                increment_iv(&mut counter, 1);
            }
        }
        CipherMode::Cbc => {
            let mut chain = *iv;
            for (index, block) in out.chunks_mut(AES_BLOCK_SIZE).enumerate() {
                if block.len() < AES_BLOCK_SIZE || !is_encrypted_block(index) {
                    continue;
                }
                if encrypt {
                    block.iter_mut().zip(chain.iter()).for_each(|(b, c)| *b ^= c);
                    let mut b = aes::Block::clone_from_slice(block);
                    cipher.encrypt_block(&mut b);
                    block.copy_from_slice(&b);
                    chain.copy_from_slice(block);
                } else {
                    let ciphertext: [u8; 16] = (&*block).try_into().expect("full block");
                    let mut b = aes::Block::clone_from_slice(block);
                    cipher.decrypt_block(&mut b);
                    block.copy_from_slice(&b);
                    block.iter_mut().zip(chain.iter()).for_each(|(b, c)| *b ^= c);
                    chain = ciphertext;
                }
            }
        }
    }
    out
}

/// Encrypt `plaintext` the way a packager would for `mode` and `pattern`.
pub fn cenc_encrypt(
    key: &[u8; 16],
    iv: &[u8; 16],
    mode: CipherMode,
    pattern: &PatternDescriptor,
    plaintext: &[u8],
) -> Vec<u8> {
    cenc_transform(key, iv, mode, pattern, 0, plaintext, true)
}

/// Content key whose wrapped data is the clear key (the fake does not wrap).
pub fn content_key(key_id: &[u8], key: [u8; 16]) -> CryptoKey {
    let mut crypto_key = CryptoKey::new(key_id, &key, &[0u8; 16], CipherMode::Ctr);
    crypto_key.key_control = b"kctl\0\0\0\0\0\0\0\0\0\0\0\0".to_vec();
    crypto_key.key_control_iv = vec![0u8; 16];
    crypto_key
}

/// Content key unlocked by `entitlement_key_id`.
pub fn entitled_key(entitlement_key_id: &[u8], content_key_id: &[u8], key: [u8; 16]) -> CryptoKey {
    CryptoKey {
        entitlement_key_id: entitlement_key_id.to_vec(),
        ..CryptoKey::new(content_key_id, &key, &[0u8; 16], CipherMode::Ctr)
    }
}

/// Sub-license key bound to `sub_session_key_id` with a track label.
pub fn sub_license_key(
    key_id: &[u8],
    sub_session_key_id: &[u8],
    track_label: &str,
    key: [u8; 16],
) -> CryptoKey {
    CryptoKey {
        sub_session_key_id: sub_session_key_id.to_vec(),
        sub_session_key: [b"session-key-".as_slice(), sub_session_key_id].concat(),
        track_label: track_label.to_string(),
        ..content_key(key_id, key)
    }
}

#[derive(Debug, Default)]
struct HandleState {
    keys: HashMap<Vec<u8>, [u8; 16]>,
    selected: Option<([u8; 16], CipherMode)>,
    loaded_key_ids: Vec<Vec<u8>>,
    load_count: usize,
    license_type: Option<KeyLicenseType>,
    mac_key: Option<Vec<u8>>,
    session_key_context: Option<Vec<u8>>,
    device_key: Option<Vec<u8>>,
    usage_entry: Option<u32>,
    nonce: u32,
}

#[derive(Debug)]
struct FakeState {
    initialized: bool,
    initialize_count: usize,
    terminate_count: usize,
    next_handle: u32,
    handles: BTreeMap<BoundaryHandle, HandleState>,
    max_sessions: usize,
    failures: HashMap<&'static str, BoundaryError>,
    provisioning_method: ProvisioningMethod,
    api_version: u32,
    security_level: String,
    supports_usage_table: bool,
    max_decrypt_size: Option<usize>,
    max_copy_size: Option<usize>,
    decrypt_flags: Vec<u8>,
    copy_flags: Vec<u8>,
    last_decrypt_handle: Option<BoundaryHandle>,
    select_count: usize,
    update_usage_table_count: usize,
    create_usage_table_header_count: usize,
    secure_buffers: HashMap<u64, Vec<u8>>,
    force_deleted: Vec<Vec<u8>>,
    header_generation: u64,
    usage_entries: u32,
    random_counter: u64,
}

impl FakeState {
    fn check(&self, op: &str) -> BoundaryResult<()> {
        match self.failures.get(op) {
            Some(code) => Err(*code),
            None => Ok(()),
        }
    }

    fn handle(&mut self, handle: BoundaryHandle) -> BoundaryResult<&mut HandleState> {
        self.handles
            .get_mut(&handle)
            .ok_or(BoundaryError::InvalidSession)
    }

    fn header(&self, generation: u64, entries: u32) -> Vec<u8> {
        let mut header = HEADER_MAGIC.to_vec();
        header.extend_from_slice(&generation.to_be_bytes());
        header.extend_from_slice(&entries.to_be_bytes());
        header
    }

    fn write_output(&mut self, dest: &mut DestBufferDesc<'_>, data: &[u8]) -> BoundaryResult<()> {
        match dest {
            DestBufferDesc::Clear { buffer } => {
                if buffer.len() < data.len() {
                    return Err(BoundaryError::ShortBuffer(BufferSizes::single(data.len())));
                }
                buffer[..data.len()].copy_from_slice(data);
            }
            DestBufferDesc::Secure {
                handle,
                offset,
                max_length,
            } => {
                let end = *offset + data.len();
                if end > *max_length {
                    return Err(BoundaryError::ShortBuffer(BufferSizes::single(end)));
                }
                let buffer = self.secure_buffers.entry(*handle).or_default();
                if buffer.len() < end {
                    buffer.resize(end, 0);
                }
                buffer[*offset..end].copy_from_slice(data);
            }
            DestBufferDesc::Direct { .. } => {}
        }
        Ok(())
    }
}

fn copy_sized(data: &[u8], out: &mut [u8]) -> BoundaryResult<usize> {
    if out.len() < data.len() {
        return Err(BoundaryError::ShortBuffer(BufferSizes::single(data.len())));
    }
    out[..data.len()].copy_from_slice(data);
    Ok(data.len())
}

/// In-memory trust boundary.
#[derive(Debug)]
pub struct FakeBoundary {
    state: Mutex<FakeState>,
}

impl Default for FakeBoundary {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBoundary {
    pub const SYSTEM_ID: u32 = 0x1234;

    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                initialized: false,
                initialize_count: 0,
                terminate_count: 0,
                next_handle: 0,
                handles: BTreeMap::new(),
                max_sessions: 16,
                failures: HashMap::new(),
                provisioning_method: ProvisioningMethod::Keybox,
                api_version: 16,
                security_level: "L3".to_string(),
                supports_usage_table: true,
                max_decrypt_size: None,
                max_copy_size: None,
                decrypt_flags: Vec::new(),
                copy_flags: Vec::new(),
                last_decrypt_handle: None,
                select_count: 0,
                update_usage_table_count: 0,
                create_usage_table_header_count: 0,
                secure_buffers: HashMap::new(),
                force_deleted: Vec::new(),
                header_generation: 0,
                usage_entries: 0,
                random_counter: 0,
            }),
        }
    }

    /// Keybox key data: system id at offset 4, provisioning id at 8..24.
    pub fn key_data(&self) -> Vec<u8> {
        let mut data = vec![0u8; 72];
        data[..4].copy_from_slice(b"kbox");
        BigEndian::write_u32(&mut data[4..8], Self::SYSTEM_ID);
        data[8..24].copy_from_slice(PROVISIONING_ID);
        data
    }

    /// DER fragment carrying the system id certificate extension.
    pub fn oem_certificate(&self) -> Vec<u8> {
        let id = Self::SYSTEM_ID.to_be_bytes();
        let integer = [0x02, 0x02, id[2], id[3]];
        let mut extension = OEM_SYSTEM_ID_OID.to_vec();
        extension.extend_from_slice(&[0x04, integer.len() as u8]);
        extension.extend_from_slice(&integer);
        let mut der = vec![0x30, extension.len() as u8];
        der.extend_from_slice(&extension);
        der
    }

    pub fn initialize_count(&self) -> usize {
        self.state.lock().initialize_count
    }

    pub fn terminate_count(&self) -> usize {
        self.state.lock().terminate_count
    }

    pub fn open_handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub fn select_count(&self) -> usize {
        self.state.lock().select_count
    }

    pub fn update_usage_table_count(&self) -> usize {
        self.state.lock().update_usage_table_count
    }

    pub fn create_usage_table_header_count(&self) -> usize {
        self.state.lock().create_usage_table_header_count
    }

    /// Subsample flags of every decrypt call, in order.
    pub fn decrypt_flags(&self) -> Vec<u8> {
        self.state.lock().decrypt_flags.clone()
    }

    /// Subsample flags of every copy call, in order.
    pub fn copy_flags(&self) -> Vec<u8> {
        self.state.lock().copy_flags.clone()
    }

    pub fn secure_buffer(&self, handle: u64) -> Vec<u8> {
        self.state
            .lock()
            .secure_buffers
            .get(&handle)
            .cloned()
            .unwrap_or_default()
    }

    pub fn force_deleted(&self) -> Vec<Vec<u8>> {
        self.state.lock().force_deleted.clone()
    }

    pub fn set_max_sessions(&self, max_sessions: usize) {
        self.state.lock().max_sessions = max_sessions;
    }

    /// Make every later call of `op` fail with `code`.
    pub fn fail(&self, op: &'static str, code: BoundaryError) {
        self.state.lock().failures.insert(op, code);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn set_provisioning_method(&self, method: ProvisioningMethod) {
        self.state.lock().provisioning_method = method;
    }

    pub fn set_api_version(&self, version: u32) {
        self.state.lock().api_version = version;
    }

    /// Level reported for [`RequestedSecurityLevel::Default`].
    pub fn set_security_level(&self, level: &str) {
        self.state.lock().security_level = level.to_string();
    }

    pub fn set_supports_usage_table(&self, supported: bool) {
        self.state.lock().supports_usage_table = supported;
    }

    /// Decrypt calls with more input than this answer `BufferTooLarge`.
    pub fn set_max_decrypt_size(&self, size: Option<usize>) {
        self.state.lock().max_decrypt_size = size;
    }

    pub fn set_max_copy_size(&self, size: Option<usize>) {
        self.state.lock().max_copy_size = size;
    }

    pub fn last_license_type(&self, handle: BoundaryHandle) -> Option<KeyLicenseType> {
        self.state
            .lock()
            .handles
            .get(&handle)
            .and_then(|h| h.license_type)
    }

    pub fn loaded_key_ids(&self, handle: BoundaryHandle) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .handles
            .get(&handle)
            .map(|h| h.loaded_key_ids.clone())
            .unwrap_or_default()
    }

    pub fn load_count(&self, handle: BoundaryHandle) -> usize {
        self.state
            .lock()
            .handles
            .get(&handle)
            .map_or(0, |h| h.load_count)
    }

    /// MAC context of the last session key derivation on `handle`.
    pub fn last_session_key_context(&self, handle: BoundaryHandle) -> Option<Vec<u8>> {
        self.state
            .lock()
            .handles
            .get(&handle)
            .and_then(|h| h.session_key_context.clone())
    }

    pub fn last_decrypt_handle(&self) -> Option<BoundaryHandle> {
        self.state.lock().last_decrypt_handle
    }
}

impl CryptoBoundary for FakeBoundary {
    fn initialize(&self) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("initialize")?;
        s.initialized = true;
        s.initialize_count += 1;
        Ok(())
    }

    fn terminate(&self) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("terminate")?;
        s.initialized = false;
        s.terminate_count += 1;
        Ok(())
    }

    fn open_session(&self, _level: RequestedSecurityLevel) -> BoundaryResult<BoundaryHandle> {
        let mut s = self.state.lock();
        s.check("open_session")?;
        if s.handles.len() >= s.max_sessions {
            return Err(BoundaryError::TooManySessions);
        }
        s.next_handle += 1;
        let handle = BoundaryHandle(s.next_handle);
        s.handles.insert(handle, HandleState::default());
        Ok(handle)
    }

    fn close_session(&self, handle: BoundaryHandle) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("close_session")?;
        s.handles
            .remove(&handle)
            .map(|_| ())
            .ok_or(BoundaryError::InvalidSession)
    }

    fn provisioning_method(
        &self,
        _level: RequestedSecurityLevel,
    ) -> BoundaryResult<ProvisioningMethod> {
        let s = self.state.lock();
        s.check("provisioning_method")?;
        Ok(s.provisioning_method)
    }

    fn get_key_data(&self, _level: RequestedSecurityLevel, out: &mut [u8]) -> BoundaryResult<usize> {
        self.state.lock().check("get_key_data")?;
        copy_sized(&self.key_data(), out)
    }

    fn get_oem_public_certificate(
        &self,
        handle: BoundaryHandle,
        out: &mut [u8],
    ) -> BoundaryResult<usize> {
        let method = {
            let mut s = self.state.lock();
            s.check("get_oem_public_certificate")?;
            s.handle(handle)?;
            s.provisioning_method
        };
        if method != ProvisioningMethod::OemCertificate {
            return Err(BoundaryError::NotImplemented);
        }
        copy_sized(&self.oem_certificate(), out)
    }

    fn get_device_id(&self, _level: RequestedSecurityLevel, out: &mut [u8]) -> BoundaryResult<usize> {
        self.state.lock().check("get_device_id")?;
        copy_sized(DEVICE_ID, out)
    }

    fn security_level(&self, level: RequestedSecurityLevel) -> Option<String> {
        match level {
            RequestedSecurityLevel::L3 => Some("L3".to_string()),
            RequestedSecurityLevel::Default => Some(self.state.lock().security_level.clone()),
        }
    }

    fn api_version(&self, _level: RequestedSecurityLevel) -> BoundaryResult<u32> {
        let s = self.state.lock();
        s.check("api_version")?;
        Ok(s.api_version)
    }

    fn security_patch_level(&self, _level: RequestedSecurityLevel) -> u8 {
        2
    }

    fn supports_usage_table(&self, _level: RequestedSecurityLevel) -> bool {
        self.state.lock().supports_usage_table
    }

    fn get_random(&self, out: &mut [u8]) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("get_random")?;
        for chunk in out.chunks_mut(32) {
            s.random_counter += 1;
            let digest = Sha256::digest(s.random_counter.to_be_bytes());
            chunk.copy_from_slice(&digest[..chunk.len()]);
        }
        Ok(())
    }

    fn generate_derived_keys(
        &self,
        handle: BoundaryHandle,
        mac_context: &[u8],
        _enc_context: &[u8],
    ) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("generate_derived_keys")?;
        let h = s.handle(handle)?;
        let mut mac_key = cmac(&DEVICE_KEY, 1, mac_context);
        mac_key.extend(cmac(&DEVICE_KEY, 2, mac_context));
        h.mac_key = Some(mac_key);
        Ok(())
    }

    fn derive_keys_from_session_key(
        &self,
        handle: BoundaryHandle,
        enc_session_key: &[u8],
        mac_context: &[u8],
        _enc_context: &[u8],
    ) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("derive_keys_from_session_key")?;
        let h = s.handle(handle)?;
        let session_key = key_bytes(&Sha256::digest(enc_session_key))?;
        let mut mac_key = cmac(&session_key, 1, mac_context);
        mac_key.extend(cmac(&session_key, 2, mac_context));
        h.mac_key = Some(mac_key);
        h.session_key_context = Some(mac_context.to_vec());
        Ok(())
    }

    fn load_keys(&self, handle: BoundaryHandle, request: &LoadKeysRequest<'_>) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("load_keys")?;
        let h = s.handle(handle)?;
        h.load_count += 1;
        h.license_type = Some(request.license_type);
        h.selected = None;
        for key in request.keys {
            let clear = key_bytes(key.key_data)?;
            h.keys.insert(key.key_id.to_vec(), clear);
            h.loaded_key_ids.push(key.key_id.to_vec());
        }
        Ok(())
    }

    fn load_entitled_content_keys(
        &self,
        handle: BoundaryHandle,
        keys: &[EntitledContentKey<'_>],
    ) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("load_entitled_content_keys")?;
        let h = s.handle(handle)?;
        for key in keys {
            if !h.keys.contains_key(key.entitlement_key_id) {
                return Err(BoundaryError::NoContentKey);
            }
            h.keys
                .insert(key.content_key_id.to_vec(), key_bytes(key.content_key_data)?);
        }
        Ok(())
    }

    fn refresh_keys(
        &self,
        handle: BoundaryHandle,
        _message: &[u8],
        _signature: &[u8],
        _keys: &[KeyRefreshObject<'_>],
    ) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("refresh_keys")?;
        s.handle(handle)?;
        Ok(())
    }

    fn select_key(
        &self,
        handle: BoundaryHandle,
        key_id: &[u8],
        mode: CipherMode,
    ) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.select_count += 1;
        s.check("select_key")?;
        let h = s.handle(handle)?;
        let key = *h.keys.get(key_id).ok_or(BoundaryError::NoContentKey)?;
        h.selected = Some((key, mode));
        Ok(())
    }

    fn load_device_rsa_key(&self, handle: BoundaryHandle, wrapped_key: &[u8]) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("load_device_rsa_key")?;
        let h = s.handle(handle)?;
        if wrapped_key.is_empty() {
            return Err(BoundaryError::NoDeviceKey);
        }
        h.device_key = Some(wrapped_key.to_vec());
        Ok(())
    }

    fn generate_nonce(&self, handle: BoundaryHandle) -> BoundaryResult<u32> {
        let mut s = self.state.lock();
        s.check("generate_nonce")?;
        let h = s.handle(handle)?;
        h.nonce += 1;
        Ok(handle.0.wrapping_mul(1000).wrapping_add(h.nonce))
    }

    fn decrypt_cenc(
        &self,
        handle: BoundaryHandle,
        sample: &CencSample<'_>,
        dest: &mut DestBufferDesc<'_>,
        pattern: &PatternDescriptor,
    ) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.decrypt_flags.push(sample.subsample_flags);
        s.last_decrypt_handle = Some(handle);
        s.check("decrypt_cenc")?;
        if s.max_decrypt_size.is_some_and(|max| sample.data.len() > max) {
            return Err(BoundaryError::BufferTooLarge);
        }
        let h = s.handle(handle)?;
        let output = if sample.is_encrypted {
            let (key, mode) = h.selected.ok_or(BoundaryError::NoContentKey)?;
            cenc_transform(
                &key,
                &sample.iv,
                mode,
                pattern,
                sample.block_offset,
                sample.data,
                false,
            )
        } else {
            sample.data.to_vec()
        };
        s.write_output(dest, &output)
    }

    fn copy_buffer(
        &self,
        _level: RequestedSecurityLevel,
        data: &[u8],
        dest: &mut DestBufferDesc<'_>,
        subsample_flags: u8,
    ) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.copy_flags.push(subsample_flags);
        s.check("copy_buffer")?;
        if s.max_copy_size.is_some_and(|max| data.len() > max) {
            return Err(BoundaryError::BufferTooLarge);
        }
        s.write_output(dest, data)
    }

    fn generic_encrypt(
        &self,
        handle: BoundaryHandle,
        input: &[u8],
        iv: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("generic_encrypt")?;
        let (key, _) = s.handle(handle)?.selected.ok_or(BoundaryError::NoContentKey)?;
        if algorithm != GenericAlgorithm::AesCbc128NoPadding || out.len() < input.len() {
            return Err(BoundaryError::InvalidContext);
        }
        let mut buffer = input.to_vec();
        let encrypted = Aes128CbcEnc::new_from_slices(&key, iv)
            .map_err(|_| BoundaryError::InvalidContext)?
            .encrypt_padded_mut::<NoPadding>(&mut buffer, input.len())
            .map_err(|_| BoundaryError::InvalidContext)?;
        out[..encrypted.len()].copy_from_slice(encrypted);
        Ok(())
    }

    fn generic_decrypt(
        &self,
        handle: BoundaryHandle,
        input: &[u8],
        iv: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("generic_decrypt")?;
        let (key, _) = s.handle(handle)?.selected.ok_or(BoundaryError::NoContentKey)?;
        if algorithm != GenericAlgorithm::AesCbc128NoPadding || out.len() < input.len() {
            return Err(BoundaryError::InvalidContext);
        }
        let mut buffer = input.to_vec();
        let decrypted = Aes128CbcDec::new_from_slices(&key, iv)
            .map_err(|_| BoundaryError::InvalidContext)?
            .decrypt_padded_mut::<NoPadding>(&mut buffer)
            .map_err(|_| BoundaryError::InvalidContext)?;
        out[..decrypted.len()].copy_from_slice(decrypted);
        Ok(())
    }

    fn generic_sign(
        &self,
        handle: BoundaryHandle,
        message: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> BoundaryResult<usize> {
        let mut s = self.state.lock();
        s.check("generic_sign")?;
        let (key, _) = s.handle(handle)?.selected.ok_or(BoundaryError::NoContentKey)?;
        if algorithm != GenericAlgorithm::HmacSha256 {
            return Err(BoundaryError::InvalidContext);
        }
        copy_sized(&hmac_sha256(&key, message), out)
    }

    fn generic_verify(
        &self,
        handle: BoundaryHandle,
        message: &[u8],
        algorithm: GenericAlgorithm,
        signature: &[u8],
    ) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("generic_verify")?;
        let (key, _) = s.handle(handle)?.selected.ok_or(BoundaryError::NoContentKey)?;
        if algorithm != GenericAlgorithm::HmacSha256 {
            return Err(BoundaryError::InvalidContext);
        }
        if hmac_sha256(&key, message) != signature {
            return Err(BoundaryError::SignatureFailure);
        }
        Ok(())
    }

    fn generate_signature(
        &self,
        handle: BoundaryHandle,
        message: &[u8],
        out: &mut [u8],
    ) -> BoundaryResult<usize> {
        let mut s = self.state.lock();
        s.check("generate_signature")?;
        let h = s.handle(handle)?;
        let key = h.mac_key.clone().unwrap_or_else(|| DEVICE_KEY.to_vec());
        if out.len() < HMAC_LENGTH {
            return Err(BoundaryError::ShortBuffer(BufferSizes::single(HMAC_LENGTH)));
        }
        copy_sized(&hmac_sha256(&key, message), out)
    }

    fn generate_rsa_signature(
        &self,
        handle: BoundaryHandle,
        message: &[u8],
        out: &mut [u8],
    ) -> BoundaryResult<usize> {
        let mut s = self.state.lock();
        s.check("generate_rsa_signature")?;
        let device_key = s
            .handle(handle)?
            .device_key
            .clone()
            .ok_or(BoundaryError::NoDeviceKey)?;
        if out.len() < RSA_SIGNATURE_LENGTH {
            return Err(BoundaryError::ShortBuffer(BufferSizes::single(
                RSA_SIGNATURE_LENGTH,
            )));
        }
        for (i, chunk) in out[..RSA_SIGNATURE_LENGTH].chunks_mut(32).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(&device_key);
            hasher.update([i as u8]);
            hasher.update(message);
            chunk.copy_from_slice(&hasher.finalize());
        }
        Ok(RSA_SIGNATURE_LENGTH)
    }

    fn hdcp_capability(
        &self,
        _level: RequestedSecurityLevel,
    ) -> BoundaryResult<(HdcpCapability, HdcpCapability)> {
        self.state.lock().check("hdcp_capability")?;
        Ok((HdcpCapability::V1, HdcpCapability::V2_2))
    }

    fn supported_certificates(&self, _level: RequestedSecurityLevel) -> u32 {
        SUPPORTS_RSA_2048 | SUPPORTS_RSA_3072
    }

    fn number_of_open_sessions(&self, _level: RequestedSecurityLevel) -> BoundaryResult<usize> {
        let s = self.state.lock();
        s.check("number_of_open_sessions")?;
        Ok(s.handles.len())
    }

    fn max_number_of_sessions(&self, _level: RequestedSecurityLevel) -> BoundaryResult<usize> {
        let s = self.state.lock();
        s.check("max_number_of_sessions")?;
        Ok(s.max_sessions)
    }

    fn current_srm_version(&self) -> BoundaryResult<u16> {
        self.state.lock().check("current_srm_version")?;
        Ok(SRM_VERSION)
    }

    fn update_usage_table(&self) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("update_usage_table")?;
        s.update_usage_table_count += 1;
        Ok(())
    }

    fn deactivate_usage_entry(&self, handle: BoundaryHandle, _pst: &[u8]) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("deactivate_usage_entry")?;
        s.handle(handle)?;
        Ok(())
    }

    fn report_usage(
        &self,
        handle: BoundaryHandle,
        pst: &[u8],
        out: &mut [u8],
    ) -> BoundaryResult<usize> {
        let mut s = self.state.lock();
        s.check("report_usage")?;
        s.handle(handle)?;
        let mut report = vec![0u8; 48];
        report[20] = 1;
        BigEndian::write_i64(&mut report[24..32], 100);
        BigEndian::write_i64(&mut report[32..40], 50);
        BigEndian::write_i64(&mut report[40..48], 10);
        report.extend_from_slice(pst);
        copy_sized(&report, out)
    }

    fn delete_usage_entry(
        &self,
        handle: BoundaryHandle,
        _pst: &[u8],
        _message: &[u8],
        _signature: &[u8],
    ) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("delete_usage_entry")?;
        s.handle(handle)?;
        Ok(())
    }

    fn force_delete_usage_entry(&self, pst: &[u8]) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("force_delete_usage_entry")?;
        s.force_deleted.push(pst.to_vec());
        Ok(())
    }

    fn delete_old_usage_table(&self) -> BoundaryResult<()> {
        self.state.lock().check("delete_old_usage_table")
    }

    fn create_usage_table_header(
        &self,
        _level: RequestedSecurityLevel,
        out: &mut [u8],
    ) -> BoundaryResult<usize> {
        let mut s = self.state.lock();
        s.check("create_usage_table_header")?;
        s.usage_entries = 0;
        let header = s.header(s.header_generation, 0);
        let len = copy_sized(&header, out)?;
        s.create_usage_table_header_count += 1;
        Ok(len)
    }

    fn load_usage_table_header(
        &self,
        _level: RequestedSecurityLevel,
        header: &[u8],
    ) -> BoundaryResult<()> {
        self.state.lock().check("load_usage_table_header")?;
        if !header.starts_with(HEADER_MAGIC) {
            return Err(BoundaryError::BadMagic);
        }
        Ok(())
    }

    fn create_new_usage_entry(&self, handle: BoundaryHandle) -> BoundaryResult<u32> {
        let mut s = self.state.lock();
        s.check("create_new_usage_entry")?;
        let index = s.usage_entries;
        s.handle(handle)?.usage_entry = Some(index);
        s.usage_entries += 1;
        Ok(index)
    }

    fn load_usage_entry(
        &self,
        handle: BoundaryHandle,
        index: u32,
        entry: &[u8],
    ) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("load_usage_entry")?;
        if !entry.starts_with(ENTRY_MAGIC) {
            return Err(BoundaryError::BadMagic);
        }
        s.handle(handle)?.usage_entry = Some(index);
        Ok(())
    }

    fn update_usage_entry(
        &self,
        handle: BoundaryHandle,
        header_out: &mut [u8],
        entry_out: &mut [u8],
    ) -> BoundaryResult<BufferSizes> {
        let mut s = self.state.lock();
        s.check("update_usage_entry")?;
        let index = s
            .handle(handle)?
            .usage_entry
            .ok_or(BoundaryError::InvalidContext)?;
        let generation = s.header_generation + 1;
        let header = s.header(generation, s.usage_entries);
        let mut entry = ENTRY_MAGIC.to_vec();
        entry.extend_from_slice(&index.to_be_bytes());
        entry.extend_from_slice(&generation.to_be_bytes());

        let sizes = BufferSizes {
            primary: header.len(),
            secondary: entry.len(),
        };
        if header_out.len() < sizes.primary || entry_out.len() < sizes.secondary {
            return Err(BoundaryError::ShortBuffer(sizes));
        }
        header_out[..sizes.primary].copy_from_slice(&header);
        entry_out[..sizes.secondary].copy_from_slice(&entry);
        s.header_generation = generation;
        Ok(sizes)
    }

    fn shrink_usage_table_header(
        &self,
        _level: RequestedSecurityLevel,
        new_entry_count: u32,
        out: &mut [u8],
    ) -> BoundaryResult<usize> {
        let mut s = self.state.lock();
        s.check("shrink_usage_table_header")?;
        let entries = new_entry_count.min(s.usage_entries);
        let header = s.header(s.header_generation, entries);
        let len = copy_sized(&header, out)?;
        s.usage_entries = entries;
        Ok(len)
    }

    fn move_entry(&self, handle: BoundaryHandle, new_index: u32) -> BoundaryResult<()> {
        let mut s = self.state.lock();
        s.check("move_entry")?;
        s.handle(handle)?.usage_entry = Some(new_index);
        Ok(())
    }
}

/// One key of a [`FakeLicense`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeLicenseKey {
    /// Hex key id.
    pub key_id: String,
    /// Hex clear key.
    pub key: String,
    #[serde(default)]
    pub hw_secure: bool,
}

/// License response understood by [`FakeSession`], carried as YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FakeLicense {
    pub keys: Vec<FakeLicenseKey>,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub pst: String,
}

impl FakeLicense {
    pub fn new(duration: i64) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key_id: &[u8], key: [u8; 16]) -> Self {
        self.keys.push(FakeLicenseKey {
            key_id: hex::encode(key_id),
            key: hex::encode(key),
            hw_secure: false,
        });
        self
    }

    pub fn with_hw_secure_key(mut self, key_id: &[u8], key: [u8; 16]) -> Self {
        self = self.with_key(key_id, key);
        if let Some(last) = self.keys.last_mut() {
            last.hw_secure = true;
        }
        self
    }

    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    pub fn with_pst(mut self, pst: &str) -> Self {
        self.pst = pst.to_string();
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_yaml::to_string(self)
            .expect("serialize license")
            .into_bytes()
    }

    fn parse(response: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(response)?)
    }

    fn key_id(key: &FakeLicenseKey) -> Result<Vec<u8>> {
        hex::decode(&key.key_id).map_err(|e| Error::Other(format!("bad key id: {}", e)))
    }

    fn crypto_keys(&self) -> Result<Vec<CryptoKey>> {
        self.keys
            .iter()
            .map(|k| {
                let key: [u8; 16] = hex::decode(&k.key)
                    .ok()
                    .and_then(|k| k.try_into().ok())
                    .ok_or_else(|| Error::Other("bad key".to_string()))?;
                Ok(content_key(&Self::key_id(k)?, key))
            })
            .collect()
    }
}

/// What the fake sessions of one factory did, plus their device state.
#[derive(Debug, Default)]
pub struct FakeLedger {
    events: Mutex<Vec<String>>,
    stored_licenses: Mutex<HashMap<String, Vec<u8>>>,
    unprovisioned: Mutex<HashSet<RequestedSecurityLevel>>,
    sharing_ids: Mutex<HashMap<String, u32>>,
    fail_provisioning_init: Mutex<bool>,
}

impl FakeLedger {
    fn record(&self, event: String) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Events starting with `prefix`.
    pub fn events_with(&self, prefix: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn is_provisioned(&self, level: RequestedSecurityLevel) -> bool {
        !self.unprovisioned.lock().contains(&level)
    }

    pub fn set_provisioned(&self, level: RequestedSecurityLevel, provisioned: bool) {
        let mut unprovisioned = self.unprovisioned.lock();
        if provisioned {
            unprovisioned.remove(&level);
        } else {
            unprovisioned.insert(level);
        }
    }

    pub fn store_license(&self, key_set_id: &str, response: Vec<u8>) {
        self.stored_licenses
            .lock()
            .insert(key_set_id.to_string(), response);
    }

    pub fn stored_license(&self, key_set_id: &str) -> Option<Vec<u8>> {
        self.stored_licenses.lock().get(key_set_id).cloned()
    }

    pub fn set_fail_provisioning_init(&self, fail: bool) {
        *self.fail_provisioning_init.lock() = fail;
    }
}

/// License session over a real [`CryptoSession`] with YAML licenses.
pub struct FakeSession {
    id: String,
    key_set_id: String,
    property_set: PropertySet,
    crypto: CryptoSession,
    ledger: Arc<FakeLedger>,
    listener: Option<Arc<dyn EventListener>>,
    license: Option<FakeLicense>,
    offline: bool,
    release: bool,
    initial_usage_update: bool,
    usage_update_needed: bool,
}

impl FakeSession {
    fn load_license(&mut self, response: &[u8]) -> Result<()> {
        let license = FakeLicense::parse(response)?;
        let keys = license.crypto_keys()?;
        self.crypto.generate_derived_keys(response)?;
        let args = LoadKeysArgs {
            message: response,
            keys: &keys,
            provider_session_token: license.pst.as_bytes(),
            ..Default::default()
        };
        self.crypto.load_keys(&args, KeyLicenseType::Content)?;

        if license.offline {
            self.offline = true;
            self.ledger.store_license(&self.key_set_id, response.to_vec());
        }
        if !license.pst.is_empty() {
            self.initial_usage_update = true;
            self.usage_update_needed = true;
        }
        if let Some(listener) = &self.listener {
            let statuses: Vec<(Vec<u8>, KeyStatus)> = keys
                .iter()
                .map(|k| (k.key_id.clone(), KeyStatus::Usable))
                .collect();
            listener.on_session_keys_change(&self.id, &statuses, true);
        }
        self.license = Some(license);
        Ok(())
    }

    fn find_key(&self, key_id: &[u8]) -> Option<&FakeLicenseKey> {
        self.license.as_ref()?.keys.iter().find(|k| {
            FakeLicense::key_id(k)
                .map(|id| id == key_id)
                .unwrap_or(false)
        })
    }

    fn signed_request(&self, mut message: Vec<u8>, request_type: KeyRequestType) -> Result<KeyRequest> {
        let signature = match request_type {
            KeyRequestType::Renewal => self.crypto.prepare_renewal_request(&message)?,
            _ => self.crypto.prepare_request(&message, false)?,
        };
        message.extend_from_slice(&signature);
        Ok(KeyRequest {
            message,
            request_type,
            url: String::new(),
        })
    }
}

impl LicenseSession for FakeSession {
    fn init(&mut self) -> Result<()> {
        let level = self.property_set.security_level;
        self.crypto.open(level)?;
        if !self.ledger.is_provisioned(level) {
            return Err(Error::NeedProvisioning);
        }
        self.crypto
            .load_certificate_private_key(b"wrapped-device-rsa-key")
    }

    fn session_id(&self) -> &str {
        &self.id
    }

    fn key_set_id(&self) -> &str {
        &self.key_set_id
    }

    fn requested_security_level(&self) -> RequestedSecurityLevel {
        self.property_set.security_level
    }

    fn crypto_session(&self) -> &CryptoSession {
        &self.crypto
    }

    fn generate_key_request(
        &mut self,
        init_data: &InitData,
        license_type: LicenseType,
        _app_parameters: &AppParameterMap,
    ) -> Result<KeyRequest> {
        let request_type = match license_type {
            LicenseType::Release => {
                if self.license.is_none() {
                    return Err(Error::InvalidContext("no license to release".to_string()));
                }
                self.release = true;
                KeyRequestType::Release
            }
            LicenseType::Offline => {
                self.offline = true;
                KeyRequestType::Initial
            }
            LicenseType::Streaming => KeyRequestType::Initial,
        };
        let mut message = self.crypto.generate_request_id()?.into_bytes();
        message.extend_from_slice(&init_data.data);
        message.extend_from_slice(&self.crypto.generate_nonce()?.to_be_bytes());
        self.ledger
            .record(format!("request:{}:{:?}", self.id, license_type));
        self.signed_request(message, request_type)
    }

    fn add_key(&mut self, response: &[u8]) -> Result<()> {
        if self.release {
            self.ledger.stored_licenses.lock().remove(&self.key_set_id);
            self.ledger.record(format!("released:{}", self.key_set_id));
            return Ok(());
        }
        self.load_license(response)?;
        self.ledger.record(format!("add_key:{}", self.id));
        Ok(())
    }

    fn restore_offline_session(&mut self, key_set_id: &str, license_type: LicenseType) -> Result<()> {
        let response = self
            .ledger
            .stored_license(key_set_id)
            .ok_or_else(|| Error::KeySetIdNotFound(key_set_id.to_string()))?;
        self.key_set_id = key_set_id.to_string();
        self.load_license(&response)?;
        self.release = license_type == LicenseType::Release;
        self.ledger.record(format!("restore:{}:{}", self.id, key_set_id));
        Ok(())
    }

    fn remove_keys(&mut self) {
        self.license = None;
    }

    fn generate_renewal_request(&mut self) -> Result<KeyRequest> {
        if self.license.is_none() {
            return Err(Error::InvalidContext("no license to renew".to_string()));
        }
        let message = format!("renewal:{}", self.id).into_bytes();
        self.signed_request(message, KeyRequestType::Renewal)
    }

    fn renew_key(&mut self, response: &[u8]) -> Result<()> {
        let renewal = FakeLicense::parse(response)?;
        let keys = renewal.crypto_keys()?;
        self.crypto.refresh_keys(response, &[], &keys)?;
        if let Some(license) = &mut self.license {
            license.duration = renewal.duration;
        }
        Ok(())
    }

    fn query_status(&self) -> Result<QueryMap> {
        let mut map = QueryMap::new();
        let license_type = if self.offline { "Offline" } else { "Streaming" };
        map.insert("LicenseType".to_string(), license_type.to_string());
        map.insert(
            "PlayAllowed".to_string(),
            if self.license.is_some() { "True" } else { "False" }.to_string(),
        );
        Ok(map)
    }

    fn query_key_status(&self) -> Result<QueryMap> {
        let license = self
            .license
            .as_ref()
            .ok_or_else(|| Error::InvalidContext("no license".to_string()))?;
        Ok(license
            .keys
            .iter()
            .map(|k| (k.key_id.clone(), "Usable".to_string()))
            .collect())
    }

    fn query_key_allowed_usage(&self, key_id: &[u8]) -> Result<KeyAllowedUsage> {
        let key = self.find_key(key_id).ok_or(Error::KeyNotFound)?;
        let level = if key.hw_secure {
            KeySecurityLevel::HwSecureAll
        } else {
            KeySecurityLevel::SwSecureCrypto
        };
        Ok(KeyAllowedUsage::content(level))
    }

    fn license_received(&self) -> bool {
        self.license.is_some()
    }

    fn is_release(&self) -> bool {
        self.release
    }

    fn is_offline(&self) -> bool {
        self.offline
    }

    fn has_provider_session_token(&self) -> bool {
        self.license.as_ref().is_some_and(|l| !l.pst.is_empty())
    }

    fn is_key_loaded(&self, key_id: &[u8]) -> bool {
        self.find_key(key_id).is_some()
    }

    fn duration_remaining(&self) -> i64 {
        self.license.as_ref().map_or(0, |l| l.duration)
    }

    fn notify_resolution(&mut self, width: u32, height: u32) {
        self.ledger
            .record(format!("resolution:{}:{}x{}", self.id, width, height));
    }

    fn on_timer_event(&mut self, update_usage: bool) {
        self.ledger
            .record(format!("timer:{}:{}", self.id, update_usage));
    }

    fn on_key_release_event(&mut self, key_set_id: &str) {
        self.ledger
            .record(format!("key_release:{}:{}", self.id, key_set_id));
    }

    fn is_initial_usage_update(&self) -> bool {
        self.initial_usage_update
    }

    fn is_usage_update_needed(&self) -> bool {
        self.usage_update_needed
    }

    fn reset_usage_flags(&mut self) {
        self.initial_usage_update = false;
        self.usage_update_needed = false;
    }

    fn update_usage_entry_information(&mut self) -> Result<()> {
        self.ledger.record(format!("usage_entry:{}", self.id));
        Ok(())
    }

    fn update_usage_table_information(&mut self) -> Result<()> {
        self.ledger.record(format!("usage_table:{}", self.id));
        self.crypto.update_usage_information()
    }
}

/// Provisioning flow that marks its level provisioned on any non-empty,
/// well-formed response.
pub struct FakeProvisioning {
    ledger: Arc<FakeLedger>,
    level: Option<RequestedSecurityLevel>,
}

impl CertificateProvisioning for FakeProvisioning {
    fn init(&mut self, _service_certificate: &[u8]) -> Result<()> {
        if *self.ledger.fail_provisioning_init.lock() {
            return Err(Error::InvalidContext("provisioning init".to_string()));
        }
        Ok(())
    }

    fn get_provisioning_request(
        &mut self,
        security_level: RequestedSecurityLevel,
        cert_type: CertificateType,
        cert_authority: &str,
    ) -> Result<ProvisioningRequest> {
        self.level = Some(security_level);
        Ok(ProvisioningRequest {
            request: format!("provision:{:?}:{:?}:{}", security_level, cert_type, cert_authority)
                .into_bytes(),
            default_url: "https://provisioning.test/".to_string(),
        })
    }

    fn handle_provisioning_response(&mut self, response: &[u8]) -> Result<ProvisionedCertificate> {
        if response == b"malformed" {
            return Err(Error::Other("malformed provisioning response".to_string()));
        }
        let level = self
            .level
            .ok_or_else(|| Error::InvalidContext("no provisioning request".to_string()))?;
        self.ledger.set_provisioned(level, true);
        Ok(ProvisionedCertificate {
            certificate: response.to_vec(),
            wrapped_key: b"wrapped-device-rsa-key".to_vec(),
        })
    }
}

/// Factory handing out [`FakeSession`]s that share one ledger.
#[derive(Default)]
pub struct FakeSessionFactory {
    ledger: Arc<FakeLedger>,
}

impl FakeSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> Arc<FakeLedger> {
        self.ledger.clone()
    }
}

impl SessionFactory for FakeSessionFactory {
    fn create_session(
        &self,
        context: &Arc<CryptoContext>,
        property_set: Option<&PropertySet>,
        forced_session_id: Option<&str>,
        listener: Option<Arc<dyn EventListener>>,
    ) -> Box<dyn LicenseSession> {
        let property_set = property_set.cloned().unwrap_or_default();
        let id = forced_session_id
            .map(str::to_string)
            .unwrap_or_else(generate_session_id);
        self.ledger
            .sharing_ids
            .lock()
            .insert(id.clone(), property_set.session_sharing_id);
        Box::new(FakeSession {
            id,
            key_set_id: generate_key_set_id(),
            property_set,
            crypto: CryptoSession::new(context.clone()),
            ledger: self.ledger.clone(),
            listener,
            license: None,
            offline: false,
            release: false,
            initial_usage_update: false,
            usage_update_needed: false,
        })
    }

    fn create_provisioning(&self, _context: &Arc<CryptoContext>) -> Box<dyn CertificateProvisioning> {
        Box::new(FakeProvisioning {
            ledger: self.ledger.clone(),
            level: None,
        })
    }

    fn session_sharing_id(&self, session_id: &str) -> u32 {
        self.ledger
            .sharing_ids
            .lock()
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Listener that remembers key change notifications.
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub key_changes: Mutex<Vec<(String, usize)>>,
}

impl EventListener for RecordingListener {
    fn on_session_keys_change(
        &self,
        session_id: &str,
        keys: &[(Vec<u8>, KeyStatus)],
        _has_new_usable_key: bool,
    ) {
        self.key_changes
            .lock()
            .push((session_id.to_string(), keys.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cenc_round_trips_with_block_offset() {
        let key = [1u8; 16];
        let iv = [2u8; 16];
        let plaintext: Vec<u8> = (0..100u8).collect();
        let pattern = PatternDescriptor::default();
        let ciphertext = cenc_encrypt(&key, &iv, CipherMode::Ctr, &pattern, &plaintext);
        let tail = cenc_transform(&key, &iv, CipherMode::Ctr, &pattern, 0, &ciphertext, false);
        assert_eq!(tail, plaintext);

        // Decrypting from byte 20 continues the keystream 4 bytes into block 1.
        let mut next_iv = iv;
        increment_iv(&mut next_iv, 1);
        let part = cenc_transform(&key, &next_iv, CipherMode::Ctr, &pattern, 4, &ciphertext[20..], false);
        assert_eq!(part, plaintext[20..]);
    }

    #[test]
    fn cbcs_leaves_skip_blocks_and_tail_clear() {
        let pattern = PatternDescriptor { encrypt: 1, skip: 1 };
        let plaintext = vec![7u8; 40];
        let ciphertext = cenc_encrypt(&[3u8; 16], &[4u8; 16], CipherMode::Cbc, &pattern, &plaintext);
        assert_ne!(ciphertext[..16], plaintext[..16]);
        assert_eq!(ciphertext[16..], plaintext[16..]);
    }

    #[test]
    fn fake_license_parses_back() {
        let license = FakeLicense::new(30).with_key(b"k1", [9u8; 16]).with_pst("pst");
        let parsed = FakeLicense::parse(&license.to_bytes()).expect("parse");
        assert_eq!(parsed.duration, 30);
        assert_eq!(parsed.crypto_keys().expect("keys")[0].key_id, b"k1".to_vec());
        assert!(FakeLicense::parse(b": not yaml [").is_err());
    }
}
