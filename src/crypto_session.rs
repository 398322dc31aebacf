//! Crypto session: one trust boundary handle and everything done through it.
//!
//! [`CryptoContext`] is the process-wide part (boundary initialize/terminate
//! reference count, request id counter and the per-level usage table
//! headers). It is shared by every [`CryptoSession`] created from it, so
//! tests can build a fresh one per case.
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::boundary::{
    probe_and_fill, read_into_vec, BoundaryError, BoundaryHandle, BoundaryResult, CencSample,
    CipherMode, CryptoBoundary, DestBufferDesc, HdcpCapability, KeyRefreshObject, LicenseType,
    PatternDescriptor, ProvisioningMethod, RequestedSecurityLevel, SecurityLevel,
    UsageEntryStatus, ANALOG_OUTPUT_CAN_DISABLE, ANALOG_OUTPUT_CGMS_A, ANALOG_OUTPUT_SUPPORTED,
    FIRST_SUBSAMPLE, LAST_SUBSAMPLE, SUPPORTS_RSA_2048, SUPPORTS_RSA_3072, SUPPORTS_RSA_CAST,
};
use crate::config::EngineConfig;
use crate::decrypt::{
    check_pattern, chunk_size_for, next_chunk_iv, DecryptOutput, DecryptParams, DestinationBufferType,
    MAX_CHUNK_SIZE,
};
use crate::error::{Error, Result, UsageLoadFailure};
use crate::key::{CryptoKey, EncryptionAlgorithm, SigningAlgorithm};
use crate::key_session::{
    ContentKeySession, EntitlementKeySession, KeySession, KeySessionEnv, KeySessionOps,
    KeySessionType, LoadKeysArgs, SubLicenseKeySession, SubSessionMap,
};
use crate::usage_table::UsageTableHeader;

const KEYBOX_KEY_DATA_SIZE: usize = 72;
const DEVICE_ID_SIZE: usize = 32;
const RSA_SIGNATURE_LENGTH: usize = 256;
const HMAC_SIGNATURE_LENGTH: usize = 32;
const ESTIMATED_INITIAL_USAGE_TABLE_HEADER: usize = 40;
const API_VERSION_SUPPORTS_BIG_USAGE_TABLES: u32 = 13;
const API_VERSION_SUPPORTS_SWITCHING_CIPHER_MODE: u32 = 14;
/// Signature (20), status, clock security level, PST length, padding, then
/// three big-endian i64 durations.
const PST_REPORT_SIZE: usize = 48;

/// DER encoding of OID 1.3.6.1.4.1.11129.4.1.1 (Widevine system id).
const SYSTEM_ID_EXTENSION_OID: &[u8] = &[
    0x06, 0x0a, 0x2b, 0x06, 0x01, 0x04, 0x01, 0xd6, 0x79, 0x04, 0x01, 0x01,
];

/// How the device accounts for offline license usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageSupportType {
    NonSecure,
    /// One shared table, updated as a whole.
    Table,
    /// Per-entry accounting indexed by a signed header.
    Entry,
}

/// Whether a usage report carries meaningful durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageDurationStatus {
    Invalid,
    PlaybackNotBegun,
    Valid,
}

/// Parsed usage report for one provider session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    /// Raw signed report, forwarded to the license server.
    pub report: Vec<u8>,
    pub status: UsageDurationStatus,
    pub seconds_since_started: i64,
    pub seconds_since_last_played: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupportedCertificateTypes {
    pub rsa_2048: bool,
    pub rsa_3072: bool,
    pub rsa_cast: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnalogOutputCapabilities {
    pub supported: bool,
    pub cgms_a: bool,
    pub can_disable: bool,
}

#[derive(Debug, Default)]
struct ContextState {
    initialized: bool,
    session_count: usize,
    request_id_index: u64,
}

#[derive(Debug, Default)]
struct UsageHeaders {
    l1: Option<Arc<UsageTableHeader>>,
    l3: Option<Arc<UsageTableHeader>>,
}

impl UsageHeaders {
    fn slot(&mut self, level: SecurityLevel) -> Option<&mut Option<Arc<UsageTableHeader>>> {
        match level {
            SecurityLevel::L1 => Some(&mut self.l1),
            SecurityLevel::L3 => Some(&mut self.l3),
            _ => None,
        }
    }
}

/// State shared by every crypto session of one engine.
pub struct CryptoContext {
    boundary: Arc<dyn CryptoBoundary>,
    config: EngineConfig,
    state: Mutex<ContextState>,
    // Separate from `state`: header creation calls back into a session.
    usage_headers: Mutex<UsageHeaders>,
}

impl CryptoContext {
    pub fn new(boundary: Arc<dyn CryptoBoundary>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            boundary,
            config,
            state: Mutex::new(ContextState::default()),
            usage_headers: Mutex::new(UsageHeaders::default()),
        })
    }

    pub fn boundary(&self) -> &dyn CryptoBoundary {
        self.boundary.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Number of live crypto sessions.
    pub fn session_count(&self) -> usize {
        self.state.lock().session_count
    }

    /// Process-wide count of successful opens.
    pub fn request_id_index(&self) -> u64 {
        self.state.lock().request_id_index
    }

    /// Usage table header for `level`, if one was created.
    pub fn usage_table_header(&self, level: SecurityLevel) -> Option<Arc<UsageTableHeader>> {
        self.usage_headers.lock().slot(level)?.clone()
    }

    fn next_request_id_index(&self) {
        self.state.lock().request_id_index += 1;
    }

    fn usage_table_header_or_init(
        &self,
        level: SecurityLevel,
        init: impl FnOnce() -> Result<UsageTableHeader>,
    ) -> Option<Arc<UsageTableHeader>> {
        let mut headers = self.usage_headers.lock();
        let slot = headers.slot(level)?;
        if slot.is_none() {
            // Failures are tolerated: the session may never need usage entries.
            match init() {
                Ok(header) => *slot = Some(Arc::new(header)),
                Err(e) => warn!("usage table header init failed at {:?}: {}", level, e),
            }
        }
        slot.clone()
    }

    fn acquire(&self) {
        let mut state = self.state.lock();
        state.session_count += 1;
        if state.initialized {
            return;
        }
        match self.boundary.initialize() {
            Ok(()) => {
                debug!("crypto boundary initialized");
                state.initialized = true;
            }
            Err(e) => error!("crypto boundary initialize failed: {:?}", e),
        }
    }

    fn release(&self) {
        {
            let mut state = self.state.lock();
            if state.session_count == 0 {
                error!("crypto context released more often than acquired");
                return;
            }
            state.session_count -= 1;
            if state.session_count > 0 || !state.initialized {
                return;
            }
            if let Err(e) = self.boundary.terminate() {
                error!("crypto boundary terminate failed: {:?}", e);
            }
            state.initialized = false;
            debug!("crypto boundary terminated");
        }
        *self.usage_headers.lock() = UsageHeaders::default();
    }
}

#[derive(Default)]
struct CryptoState {
    handle: Option<BoundaryHandle>,
    requested_security_level: RequestedSecurityLevel,
    provisioning_method: Option<ProvisioningMethod>,
    oem_token: Option<Vec<u8>>,
    system_id: Option<u32>,
    request_id_base: [u8; 8],
    api_version: u32,
    usage_support_type: Option<UsageSupportType>,
    usage_table_header: Option<Arc<UsageTableHeader>>,
    update_usage_table_after_close: bool,
    destination_buffer_type: Option<DestinationBufferType>,
    cipher_mode: CipherMode,
    key_session: Option<KeySession>,
    sub_sessions: SubSessionMap,
    wrapped_key: Vec<u8>,
}

impl CryptoState {
    fn handle(&self) -> Result<BoundaryHandle> {
        self.handle.ok_or(Error::CryptoSessionNotOpen)
    }

    fn key_session_env<'a>(
        &'a mut self,
        boundary: &'a dyn CryptoBoundary,
    ) -> Result<(&'a mut KeySession, KeySessionEnv<'a>)> {
        let key_session = self
            .key_session
            .as_mut()
            .ok_or(Error::CryptoSessionNotOpen)?;
        let env = KeySessionEnv {
            boundary,
            sub_sessions: &self.sub_sessions,
        };
        Ok((key_session, env))
    }

    fn select_key(
        &mut self,
        boundary: &dyn CryptoBoundary,
        key_id: &[u8],
        mode: CipherMode,
    ) -> Result<()> {
        let (key_session, env) = self.key_session_env(boundary)?;
        key_session
            .select_key(env, key_id, mode)
            .map_err(map_select_key_error)
    }
}

/// One primary boundary handle with its key session.
pub struct CryptoSession {
    context: Arc<CryptoContext>,
    state: Mutex<CryptoState>,
}

impl CryptoSession {
    /// Create a session and take a reference on the boundary.
    pub fn new(context: Arc<CryptoContext>) -> Self {
        context.acquire();
        Self {
            context,
            state: Mutex::new(CryptoState::default()),
        }
    }

    pub fn context(&self) -> &Arc<CryptoContext> {
        &self.context
    }

    fn boundary(&self) -> &dyn CryptoBoundary {
        self.context.boundary()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    pub fn handle(&self) -> Option<BoundaryHandle> {
        self.state.lock().handle
    }

    pub fn requested_security_level(&self) -> RequestedSecurityLevel {
        self.state.lock().requested_security_level
    }

    pub fn key_session_type(&self) -> Option<KeySessionType> {
        self.state
            .lock()
            .key_session
            .as_ref()
            .map(KeySessionOps::session_type)
    }

    /// Cipher mode of the last loaded key.
    pub fn cipher_mode(&self) -> CipherMode {
        self.state.lock().cipher_mode
    }

    /// Open the primary handle at `requested_security_level`.
    pub fn open(&self, requested_security_level: RequestedSecurityLevel) -> Result<()> {
        let boundary = self.boundary();
        let (security_level, usage_support) = {
            let mut state = self.state.lock();
            if !self.context.is_initialized() {
                return Err(Error::UnknownError);
            }
            if state.handle.is_some() {
                return Ok(());
            }

            let method = boundary
                .provisioning_method(requested_security_level)
                .map_err(|e| {
                    error!("provisioning method unavailable: {:?}", e);
                    Error::GetProvisioningMethodError
                })?;
            state.provisioning_method = Some(method);
            state.requested_security_level = requested_security_level;

            let handle = boundary
                .open_session(requested_security_level)
                .map_err(|e| {
                    error!(
                        "OpenSession failed: {:?}, crypto sessions: {}",
                        e,
                        self.context.session_count()
                    );
                    match e {
                        BoundaryError::TooManySessions => Error::InsufficientCryptoResources,
                        _ => Error::UnknownError,
                    }
                })?;
            state.handle = Some(handle);
            info!("crypto session opened: handle={:?}", handle);

            state.system_id = self.read_system_id(&mut state).map_err(|e| {
                error!("failed to fetch system id: {}", e);
                Error::LoadSystemIdError
            })?;

            let mut base = [0u8; 8];
            if let Err(e) = boundary.get_random(&mut base) {
                warn!("GetRandom failed: {:?}", e);
            }
            state.request_id_base = base;
            self.context.next_request_id_index();

            state.api_version = boundary
                .api_version(requested_security_level)
                .map_err(|e| {
                    error!("APIVersion failed: {:?}", e);
                    Error::UsageSupportGetApiFailed
                })?;
            let usage_support = self.resolve_usage_support_type(&mut state);

            state.key_session = Some(KeySession::content(handle));
            (self.security_level_of(requested_security_level), usage_support)
        };

        if usage_support == UsageSupportType::Entry {
            let header = self.context.usage_table_header_or_init(security_level, || {
                UsageTableHeader::init(requested_security_level, self)
            });
            self.state.lock().usage_table_header = header;
        }
        Ok(())
    }

    /// Close the primary handle and every sub-session handle.
    pub fn close(&self) {
        let boundary = self.boundary();
        let update_usage_table = {
            let mut state = self.state.lock();
            let Some(handle) = state.handle else {
                return;
            };
            for (id, sub_handle) in std::mem::take(&mut state.sub_sessions) {
                if let Err(e) = boundary.close_session(sub_handle) {
                    warn!("closing sub session {} failed: {:?}", hex::encode(&id), e);
                }
            }
            match boundary.close_session(handle) {
                Ok(()) => {
                    info!("crypto session closed: handle={:?}", handle);
                    state.handle = None;
                    state.key_session = None;
                    state.update_usage_table_after_close
                        && state.usage_support_type == Some(UsageSupportType::Table)
                }
                Err(e) => {
                    error!("CloseSession failed: {:?}", e);
                    false
                }
            }
        };
        if update_usage_table {
            if let Err(e) = self.update_usage_information() {
                warn!("usage table update after close failed: {}", e);
            }
        }
    }

    fn security_level_of(&self, level: RequestedSecurityLevel) -> SecurityLevel {
        if !self.context.is_initialized() {
            return SecurityLevel::Uninitialized;
        }
        match self.boundary().security_level(level) {
            Some(s) => SecurityLevel::from_boundary_str(&s),
            None => SecurityLevel::Unknown,
        }
    }

    /// Security level reported by the boundary for the requested level.
    pub fn security_level(&self) -> SecurityLevel {
        let level = self.requested_security_level();
        self.security_level_of(level)
    }

    fn resolve_usage_support_type(&self, state: &mut CryptoState) -> UsageSupportType {
        if let Some(support) = state.usage_support_type {
            return support;
        }
        let support = if !self
            .boundary()
            .supports_usage_table(state.requested_security_level)
        {
            UsageSupportType::NonSecure
        } else if state.api_version >= API_VERSION_SUPPORTS_BIG_USAGE_TABLES {
            UsageSupportType::Entry
        } else {
            UsageSupportType::Table
        };
        state.usage_support_type = Some(support);
        support
    }

    pub fn usage_support_type(&self) -> Result<UsageSupportType> {
        let mut state = self.state.lock();
        state.handle()?;
        Ok(self.resolve_usage_support_type(&mut state))
    }

    pub fn usage_table_header(&self) -> Option<Arc<UsageTableHeader>> {
        self.state.lock().usage_table_header.clone()
    }

    fn read_system_id(&self, state: &mut CryptoState) -> Result<Option<u32>> {
        match state.provisioning_method {
            Some(ProvisioningMethod::Keybox) => {
                let key_data = self.token_from_keybox(state.requested_security_level)?;
                if key_data.len() < 8 {
                    return Err(Error::LoadSystemIdError);
                }
                Ok(Some(BigEndian::read_u32(&key_data[4..8])))
            }
            Some(ProvisioningMethod::OemCertificate) => {
                let certificate = self.token_from_oem_certificate(state)?;
                system_id_from_oem_certificate(&certificate)
                    .map(Some)
                    .ok_or(Error::LoadSystemIdError)
            }
            // Known only once a DRM certificate is loaded.
            Some(ProvisioningMethod::DrmCertificate) | None => Ok(None),
        }
    }

    fn token_from_keybox(&self, level: RequestedSecurityLevel) -> Result<Vec<u8>> {
        let mut key_data = vec![0u8; KEYBOX_KEY_DATA_SIZE];
        let len = self
            .boundary()
            .get_key_data(level, &mut key_data)
            .map_err(|code| Error::Boundary {
                operation: "GetKeyData",
                code,
            })?;
        key_data.truncate(len);
        Ok(key_data)
    }

    fn token_from_oem_certificate(&self, state: &mut CryptoState) -> Result<Vec<u8>> {
        if let Some(token) = &state.oem_token {
            return Ok(token.clone());
        }
        let handle = state.handle()?;
        let token = read_into_vec(0, |buf| {
            self.boundary().get_oem_public_certificate(handle, buf)
        })
        .map_err(|code| Error::Boundary {
            operation: "GetOEMPublicCertificate",
            code,
        })?;
        state.oem_token = Some(token.clone());
        Ok(token)
    }

    /// Keybox key data or OEM certificate, depending on the root of trust.
    pub fn get_provisioning_token(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if !self.context.is_initialized() {
            return Err(Error::UnknownError);
        }
        match state.provisioning_method {
            Some(ProvisioningMethod::Keybox) => {
                self.token_from_keybox(state.requested_security_level)
            }
            Some(ProvisioningMethod::OemCertificate) => self.token_from_oem_certificate(&mut state),
            other => {
                error!("no provisioning token for {:?}", other);
                Err(Error::UnknownError)
            }
        }
    }

    pub fn provisioning_method(&self) -> Option<ProvisioningMethod> {
        self.state.lock().provisioning_method
    }

    /// Device id as the boundary reports it (the whole OEM certificate on
    /// OEM certificate devices).
    pub fn internal_device_unique_id(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if !self.context.is_initialized() {
            return Err(Error::UnknownError);
        }
        if state.provisioning_method == Some(ProvisioningMethod::OemCertificate) {
            return self.token_from_oem_certificate(&mut state);
        }
        let level = state.requested_security_level;
        read_into_vec(DEVICE_ID_SIZE, |buf| {
            self.boundary().get_device_id(level, buf)
        })
        .map_err(|code| Error::Boundary {
            operation: "GetDeviceID",
            code,
        })
    }

    /// Device id safe to hand to applications. OEM certificates are hashed.
    pub fn external_device_unique_id(&self) -> Result<Vec<u8>> {
        let id = self.internal_device_unique_id()?;
        if self.provisioning_method() == Some(ProvisioningMethod::OemCertificate) {
            return Ok(Sha256::digest(&id).to_vec());
        }
        Ok(id)
    }

    pub fn provisioning_id(&self) -> Result<Vec<u8>> {
        if !self.context.is_initialized() {
            return Err(Error::UnknownError);
        }
        if self.provisioning_method() == Some(ProvisioningMethod::OemCertificate) {
            // No unique id is embedded; derive one from the external id.
            let mut id = self.external_device_unique_id()?;
            id.iter_mut().for_each(|b| *b = !*b);
            return Ok(id);
        }
        let key_data = self.token_from_keybox(self.requested_security_level())?;
        key_data
            .get(8..24)
            .map(<[u8]>::to_vec)
            .ok_or(Error::Boundary {
                operation: "GetKeyData",
                code: BoundaryError::KeyboxInvalid,
            })
    }

    /// System id read at open. `None` on DRM certificate devices.
    pub fn system_id(&self) -> Option<u32> {
        self.state.lock().system_id
    }

    /// Boundary API version read at open.
    pub fn api_version(&self) -> u32 {
        self.state.lock().api_version
    }

    pub fn security_patch_level(&self) -> u8 {
        let level = self.requested_security_level();
        self.boundary().security_patch_level(level)
    }

    /// Hex of the random per-session base followed by hex of the
    /// process-wide open counter.
    pub fn generate_request_id(&self) -> Result<String> {
        let state = self.state.lock();
        state.handle()?;
        let index = self.context.request_id_index();
        Ok(format!(
            "{}{}",
            hex::encode_upper(state.request_id_base),
            hex::encode_upper(index.to_le_bytes())
        ))
    }

    /// Sign a license or provisioning request.
    ///
    /// Keybox provisioning derives session keys from the request and signs
    /// with HMAC. Everything else is signed with the device RSA key.
    pub fn prepare_request(&self, message: &[u8], is_provisioning: bool) -> Result<Vec<u8>> {
        let boundary = self.boundary();
        let mut state = self.state.lock();
        let handle = state.handle()?;
        if is_provisioning && state.provisioning_method == Some(ProvisioningMethod::Keybox) {
            let (key_session, env) = state.key_session_env(boundary)?;
            key_session
                .generate_derived_keys(env, message)
                .map_err(|code| Error::Boundary {
                    operation: "GenerateDerivedKeys",
                    code,
                })?;
            return self.generate_signature(handle, message);
        }
        read_into_vec(RSA_SIGNATURE_LENGTH, |buf| {
            boundary.generate_rsa_signature(handle, message, buf)
        })
        .map_err(|code| {
            error!("GenerateRSASignature failed: {:?}", code);
            Error::Boundary {
                operation: "GenerateRSASignature",
                code,
            }
        })
    }

    /// HMAC signature of a renewal request.
    pub fn prepare_renewal_request(&self, message: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let handle = state.handle()?;
        self.generate_signature(handle, message)
    }

    fn generate_signature(&self, handle: BoundaryHandle, message: &[u8]) -> Result<Vec<u8>> {
        read_into_vec(HMAC_SIGNATURE_LENGTH, |buf| {
            self.boundary().generate_signature(handle, message, buf)
        })
        .map_err(|code| {
            error!("GenerateSignature failed: {:?}", code);
            Error::Boundary {
                operation: "GenerateSignature",
                code,
            }
        })
    }

    /// Derive session keys from `message` (keybox devices).
    pub fn generate_derived_keys(&self, message: &[u8]) -> Result<()> {
        let boundary = self.boundary();
        let mut state = self.state.lock();
        let (key_session, env) = state.key_session_env(boundary)?;
        key_session
            .generate_derived_keys(env, message)
            .map_err(|code| Error::Boundary {
                operation: "GenerateDerivedKeys",
                code,
            })
    }

    /// Derive session keys from an RSA wrapped session key.
    pub fn generate_derived_keys_with_session_key(
        &self,
        message: &[u8],
        session_key: &[u8],
    ) -> Result<()> {
        let boundary = self.boundary();
        let mut state = self.state.lock();
        let (key_session, env) = state.key_session_env(boundary)?;
        key_session
            .generate_derived_keys_with_session_key(env, message, session_key)
            .map_err(|code| Error::Boundary {
                operation: "DeriveKeysFromSessionKey",
                code,
            })
    }

    /// Load license keys.
    ///
    /// An entitlement license swaps in an [`EntitlementKeySession`] first.
    /// When the license carries a provider session token on a table based
    /// device, the usage table is refreshed after the session lock is
    /// released.
    pub fn load_keys(&self, args: &LoadKeysArgs<'_>, license_type: LicenseType) -> Result<()> {
        let boundary = self.boundary();
        let update_usage_table = {
            let mut state = self.state.lock();
            let handle = state.handle()?;
            if license_type == LicenseType::Entitlement
                && state.key_session.as_ref().map(KeySessionOps::session_type)
                    != Some(KeySessionType::Entitlement)
            {
                debug!("switching to entitlement key session");
                state.key_session = Some(KeySession::Entitlement(EntitlementKeySession::new(
                    ContentKeySession::new(handle),
                )));
            }

            let (key_session, env) = state.key_session_env(boundary)?;
            match key_session.load_keys(env, args) {
                Ok(cipher_mode) => {
                    if let Some(mode) = cipher_mode {
                        state.cipher_mode = mode;
                    }
                    if !args.provider_session_token.is_empty() {
                        state.update_usage_table_after_close = true;
                    }
                }
                Err(e) => {
                    error!("LoadKeys failed: {:?}", e);
                    return Err(match e {
                        BoundaryError::TooManyKeys => Error::InsufficientCryptoResources,
                        BoundaryError::UsageTableUnrecoverable => Error::NeedProvisioning,
                        _ => Error::LoadKeyError,
                    });
                }
            }
            !args.provider_session_token.is_empty()
                && state.usage_support_type == Some(UsageSupportType::Table)
        };
        if update_usage_table {
            if let Err(e) = self.update_usage_information() {
                warn!("usage table update after LoadKeys failed: {}", e);
            }
        }
        Ok(())
    }

    /// Second phase of an entitlement license.
    pub fn load_entitled_content_keys(&self, keys: &[CryptoKey]) -> Result<()> {
        let boundary = self.boundary();
        let mut state = self.state.lock();
        let (key_session, env) = state.key_session_env(boundary)?;
        key_session
            .load_entitled_content_keys(env, keys)
            .map_err(|e| {
                error!("LoadEntitledContentKeys failed: {:?}", e);
                Error::LoadKeyError
            })
    }

    /// Load the wrapped device RSA key and keep it for sub-sessions.
    pub fn load_certificate_private_key(&self, wrapped_key: &[u8]) -> Result<()> {
        let boundary = self.boundary();
        let mut state = self.state.lock();
        let handle = state.handle()?;
        // Some boundaries require the OEM certificate to be fetched first.
        let _ = read_into_vec(0, |buf| boundary.get_oem_public_certificate(handle, buf));
        boundary
            .load_device_rsa_key(handle, wrapped_key)
            .map_err(|code| {
                error!("LoadDeviceRSAKey failed: {:?}", code);
                Error::Boundary {
                    operation: "LoadDeviceRSAKey",
                    code,
                }
            })?;
        state.wrapped_key = wrapped_key.to_vec();
        Ok(())
    }

    /// Apply a license renewal.
    pub fn refresh_keys(&self, message: &[u8], signature: &[u8], keys: &[CryptoKey]) -> Result<()> {
        let state = self.state.lock();
        let handle = state.handle()?;
        let objects: Vec<KeyRefreshObject<'_>> = keys
            .iter()
            .map(|key| {
                let key_id = (!key.key_id.is_empty()).then_some(key.key_id.as_slice());
                if key.has_key_control() {
                    KeyRefreshObject {
                        key_id,
                        key_control_iv: (!key.key_control_iv.is_empty())
                            .then_some(key.key_control_iv.as_slice()),
                        key_control: &key.key_control,
                    }
                } else {
                    KeyRefreshObject {
                        key_id,
                        key_control_iv: None,
                        key_control: &[],
                    }
                }
            })
            .collect();
        self.boundary()
            .refresh_keys(handle, message, signature, &objects)
            .map_err(|e| {
                error!("RefreshKeys failed: {:?}", e);
                Error::RefreshKeysError
            })
    }

    pub fn select_key(&self, key_id: &[u8], mode: CipherMode) -> Result<()> {
        let boundary = self.boundary();
        self.state.lock().select_key(boundary, key_id, mode)
    }

    pub fn generate_nonce(&self) -> Result<u32> {
        let state = self.state.lock();
        let handle = state.handle()?;
        self.boundary()
            .generate_nonce(handle)
            .map_err(|code| Error::Boundary {
                operation: "GenerateNonce",
                code,
            })
    }

    /// Open a sub-session handle for a sub-license and load the cached
    /// device key into it.
    pub fn add_sub_session(&self, sub_session_key_id: &[u8], group_master_key_id: &[u8]) -> Result<()> {
        let boundary = self.boundary();
        let mut state = self.state.lock();
        state.handle()?;
        if state.sub_sessions.contains_key(sub_session_key_id) {
            error!(
                "sub session already exists: {}",
                hex::encode(sub_session_key_id)
            );
            return Err(Error::UnknownError);
        }

        let sub_handle = boundary
            .open_session(state.requested_security_level)
            .map_err(|e| {
                error!("OpenSession for sub session failed: {:?}", e);
                match e {
                    BoundaryError::TooManySessions => Error::InsufficientCryptoResources,
                    _ => Error::UnknownError,
                }
            })?;
        if let Err(e) = boundary.load_device_rsa_key(sub_handle, &state.wrapped_key) {
            error!("LoadDeviceRSAKey for sub session failed: {:?}", e);
            let _ = boundary.close_session(sub_handle);
            return Err(Error::NeedProvisioning);
        }

        state
            .sub_sessions
            .insert(sub_session_key_id.to_vec(), sub_handle);
        if state.key_session.as_ref().map(KeySessionOps::session_type)
            != Some(KeySessionType::SubLicense)
        {
            debug!("switching to sub-license key session");
            state.key_session = Some(KeySession::SubLicense(SubLicenseKeySession::new(
                state.wrapped_key.clone(),
                group_master_key_id.to_vec(),
            )));
        }
        Ok(())
    }

    /// Nonce from a sub-session handle. `None` when there is no such
    /// sub-session.
    pub fn generate_sub_session_nonce(&self, sub_session_key_id: &[u8]) -> Result<Option<u32>> {
        let state = self.state.lock();
        let Some(&handle) = state.sub_sessions.get(sub_session_key_id) else {
            return Ok(None);
        };
        self.boundary()
            .generate_nonce(handle)
            .map(Some)
            .map_err(|code| Error::Boundary {
                operation: "GenerateNonce",
                code,
            })
    }

    fn resolve_destination_buffer_type(
        &self,
        level: RequestedSecurityLevel,
    ) -> Result<DestinationBufferType> {
        let config = self.context.config();
        if config.use_secure_buffers {
            if self.security_level_of(level) == SecurityLevel::L1 {
                Ok(DestinationBufferType::Secure)
            } else {
                Ok(DestinationBufferType::Clear)
            }
        } else if config.use_fifo {
            Ok(DestinationBufferType::Direct)
        } else if config.use_userspace_buffers {
            Ok(DestinationBufferType::Clear)
        } else {
            error!("no destination buffer type configured");
            Err(Error::UnknownError)
        }
    }

    /// Decrypt (or copy) one subsample.
    pub fn decrypt(&self, params: &mut DecryptParams<'_>) -> Result<()> {
        if params.is_encrypted {
            check_pattern(&params.pattern, params.cipher_mode).map_err(|reason| {
                error!("decrypt: {}: {:?}", reason, params.pattern);
                Error::InvalidDecryptParameters(reason)
            })?;
        }
        let boundary = self.boundary();
        let mut state = self.state.lock();
        let handle = state.handle()?;
        let buffer_type = match state.destination_buffer_type {
            Some(buffer_type) => buffer_type,
            None => {
                let buffer_type =
                    self.resolve_destination_buffer_type(state.requested_security_level)?;
                state.destination_buffer_type = Some(buffer_type);
                buffer_type
            }
        };
        let dest_type = if params.is_secure {
            buffer_type
        } else {
            DestinationBufferType::Clear
        };
        if params.is_secure && dest_type == DestinationBufferType::Clear {
            return Err(Error::SecureBufferRequired);
        }

        let input = params.input;
        let mut target = OutputTarget::new(
            &mut params.output,
            dest_type,
            params.output_offset,
            input.len(),
            params.is_video,
        )?;

        let mut status = Err(BoundaryError::NotImplemented);
        if !params.is_encrypted && params.subsample_flags == FIRST_SUBSAMPLE | LAST_SUBSAMPLE {
            let level = state.requested_security_level;
            status = boundary.copy_buffer(level, input, &mut target.desc(0), params.subsample_flags);
            if status == Err(BoundaryError::BufferTooLarge) && input.len() > MAX_CHUNK_SIZE {
                debug!("CopyBuffer too large, copying {} bytes in chunks", input.len());
                status = copy_in_chunks(boundary, level, input, &mut target);
            }
        }

        if state.api_version < API_VERSION_SUPPORTS_SWITCHING_CIPHER_MODE
            && params.is_encrypted
            && params.cipher_mode != state.cipher_mode
        {
            return Err(Error::IncorrectCryptoMode);
        }

        if params.is_encrypted || status == Err(BoundaryError::NotImplemented) {
            if params.is_encrypted {
                state.select_key(boundary, params.key_id, params.cipher_mode)?;
            }
            let (key_session, env) = state.key_session_env(boundary)?;
            let sample = CencSample {
                data: input,
                is_encrypted: params.is_encrypted,
                iv: params.iv,
                block_offset: params.block_offset,
                subsample_flags: params.subsample_flags,
            };
            status = key_session.decrypt(env, &sample, &mut target.desc(0), &params.pattern);
            if status == Err(BoundaryError::BufferTooLarge) {
                let chunk_size = chunk_size_for(&params.pattern);
                if input.len() > chunk_size {
                    debug!(
                        "DecryptCENC too large, decrypting {} bytes in {} byte chunks",
                        input.len(),
                        chunk_size
                    );
                    status = decrypt_in_chunks(
                        key_session,
                        env,
                        &sample,
                        params.cipher_mode,
                        &params.pattern,
                        &mut target,
                        chunk_size,
                    );
                }
            }
        }

        status.map_err(|e| {
            error!("decrypt failed: {:?}", e);
            match e {
                BoundaryError::InsufficientResources => Error::InsufficientCryptoResources,
                BoundaryError::KeyExpired => Error::NeedKey,
                BoundaryError::InvalidSession => Error::SessionNotFound(handle.0.to_string()),
                BoundaryError::DecryptFailed | BoundaryError::UnknownFailure => {
                    Error::DecryptError
                }
                BoundaryError::InsufficientHdcp => Error::InsufficientOutputProtection,
                BoundaryError::AnalogOutput => Error::AnalogOutputError,
                _ => Error::UnknownError,
            }
        })
    }

    fn with_generic_key<T>(
        &self,
        key_id: &[u8],
        call: impl FnOnce(&dyn CryptoBoundary, BoundaryHandle) -> BoundaryResult<T>,
    ) -> Result<T> {
        let boundary = self.boundary();
        let mut state = self.state.lock();
        let handle = state.handle()?;
        state.select_key(boundary, key_id, CipherMode::Cbc)?;
        call(boundary, handle).map_err(|e| {
            error!("generic crypto failed: {:?}", e);
            match e {
                BoundaryError::KeyExpired => Error::NeedKey,
                BoundaryError::NoContentKey => Error::KeyNotFound,
                _ => Error::UnknownError,
            }
        })
    }

    pub fn generic_encrypt(
        &self,
        input: &[u8],
        key_id: &[u8],
        iv: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> Result<Vec<u8>> {
        let algorithm = generic_cipher(iv, algorithm)?;
        let mut out = vec![0u8; input.len()];
        self.with_generic_key(key_id, |boundary, handle| {
            boundary.generic_encrypt(handle, input, iv, algorithm, &mut out)
        })?;
        Ok(out)
    }

    pub fn generic_decrypt(
        &self,
        input: &[u8],
        key_id: &[u8],
        iv: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> Result<Vec<u8>> {
        let algorithm = generic_cipher(iv, algorithm)?;
        let mut out = vec![0u8; input.len()];
        self.with_generic_key(key_id, |boundary, handle| {
            boundary.generic_decrypt(handle, input, iv, algorithm, &mut out)
        })?;
        Ok(out)
    }

    pub fn generic_sign(
        &self,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
    ) -> Result<Vec<u8>> {
        let algorithm = algorithm
            .to_boundary()
            .ok_or_else(|| Error::InvalidParameters("signing algorithm".to_string()))?;
        self.with_generic_key(key_id, |boundary, handle| {
            read_into_vec(HMAC_SIGNATURE_LENGTH, |buf| {
                boundary.generic_sign(handle, message, algorithm, buf)
            })
        })
    }

    pub fn generic_verify(
        &self,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
        signature: &[u8],
    ) -> Result<()> {
        let algorithm = algorithm
            .to_boundary()
            .ok_or_else(|| Error::InvalidParameters("signing algorithm".to_string()))?;
        self.with_generic_key(key_id, |boundary, handle| {
            boundary.generic_verify(handle, message, algorithm, signature)
        })
    }

    /// Refresh the shared usage table. A no-op when a usage table header is
    /// in use.
    pub fn update_usage_information(&self) -> Result<()> {
        if !self.context.is_initialized() {
            return Err(Error::UnknownError);
        }
        if self.state.lock().usage_table_header.is_some() {
            trace!("usage table update skipped: per-entry accounting");
            return Ok(());
        }
        self.boundary().update_usage_table().map_err(|e| {
            error!("UpdateUsageTable failed: {:?}", e);
            Error::UnknownError
        })
    }

    fn update_usage_table_if_table_based(&self) {
        if self.state.lock().usage_support_type == Some(UsageSupportType::Table) {
            if let Err(e) = self.update_usage_information() {
                warn!("usage table update failed: {}", e);
            }
        }
    }

    /// Stop usage accounting for `pst`.
    pub fn deactivate_usage_information(&self, provider_session_token: &[u8]) -> Result<()> {
        let state = self.state.lock();
        let handle = state.handle()?;
        self.boundary()
            .deactivate_usage_entry(handle, provider_session_token)
            .map_err(|e| {
                error!("DeactivateUsageEntry failed: {:?}", e);
                match e {
                    BoundaryError::InvalidContext => Error::KeyCanceled,
                    _ => Error::UnknownError,
                }
            })
    }

    /// Signed usage report for `pst` with its parsed durations.
    pub fn generate_usage_report(&self, provider_session_token: &[u8]) -> Result<UsageReport> {
        let report = {
            let state = self.state.lock();
            let handle = state.handle()?;
            read_into_vec(0, |buf| {
                self.boundary()
                    .report_usage(handle, provider_session_token, buf)
            })
            .map_err(|e| {
                error!("ReportUsage failed: {:?}", e);
                Error::UnknownError
            })?
        };
        Ok(parse_usage_report(report))
    }

    /// Release a usage entry after the server acknowledged it.
    pub fn release_usage_information(
        &self,
        message: &[u8],
        signature: &[u8],
        provider_session_token: &[u8],
    ) -> Result<()> {
        {
            let state = self.state.lock();
            let handle = state.handle()?;
            if state.usage_table_header.is_some() {
                trace!("release usage information skipped: per-entry accounting");
                return Ok(());
            }
            self.boundary()
                .delete_usage_entry(handle, provider_session_token, message, signature)
                .map_err(|e| {
                    error!("DeleteUsageEntry failed: {:?}", e);
                    Error::UnknownError
                })?;
        }
        self.update_usage_table_if_table_based();
        Ok(())
    }

    pub fn delete_usage_information(&self, provider_session_token: &[u8]) -> Result<()> {
        let result = self
            .boundary()
            .force_delete_usage_entry(provider_session_token)
            .map_err(|e| {
                error!("ForceDeleteUsageEntry failed: {:?}", e);
                Error::UnknownError
            });
        self.update_usage_table_if_table_based();
        result
    }

    pub fn delete_multiple_usage_information(&self, provider_session_tokens: &[Vec<u8>]) -> Result<()> {
        let mut result = Ok(());
        for pst in provider_session_tokens {
            if let Err(e) = self.boundary().force_delete_usage_entry(pst) {
                warn!("ForceDeleteUsageEntry {} failed: {:?}", hex::encode(pst), e);
                result = Err(Error::UnknownError);
            }
        }
        self.update_usage_table_if_table_based();
        result
    }

    pub fn delete_all_usage_reports(&self) -> Result<()> {
        if let Err(e) = self.boundary().delete_old_usage_table() {
            warn!("DeleteOldUsageTable failed: {:?}", e);
        }
        self.update_usage_table_if_table_based();
        Ok(())
    }

    pub fn create_usage_table_header(&self, level: RequestedSecurityLevel) -> Result<Vec<u8>> {
        if !self.context.is_initialized() {
            return Err(Error::UnknownError);
        }
        read_into_vec(ESTIMATED_INITIAL_USAGE_TABLE_HEADER, |buf| {
            self.boundary().create_usage_table_header(level, buf)
        })
        .map_err(|e| {
            error!("CreateUsageTableHeader failed: {:?}", e);
            Error::CreateUsageTableError
        })
    }

    pub fn load_usage_table_header(&self, level: RequestedSecurityLevel, header: &[u8]) -> Result<()> {
        match self.boundary().load_usage_table_header(level, header) {
            Ok(()) => Ok(()),
            Err(BoundaryError::WarningGenerationSkew) => {
                warn!("LoadUsageTableHeader: generation skew warning");
                Ok(())
            }
            Err(e) => {
                error!("LoadUsageTableHeader failed: {:?}", e);
                Err(Error::LoadUsageHeader(usage_load_failure(e)))
            }
        }
    }

    /// New usage entry in this session. Returns its index.
    pub fn create_usage_entry(&self) -> Result<u32> {
        let state = self.state.lock();
        let handle = state.handle()?;
        self.boundary().create_new_usage_entry(handle).map_err(|e| {
            error!("CreateNewUsageEntry failed: {:?}", e);
            match e {
                BoundaryError::InsufficientResources => Error::InsufficientCryptoResources,
                _ => Error::CreateUsageEntryError,
            }
        })
    }

    pub fn load_usage_entry(&self, index: u32, entry: &[u8]) -> Result<()> {
        let state = self.state.lock();
        let handle = state.handle()?;
        match self.boundary().load_usage_entry(handle, index, entry) {
            Ok(()) => Ok(()),
            Err(BoundaryError::WarningGenerationSkew) => {
                warn!("LoadUsageEntry: generation skew warning");
                Ok(())
            }
            Err(BoundaryError::InsufficientResources) => Err(Error::InsufficientCryptoResources),
            Err(e) => {
                error!("LoadUsageEntry failed: {:?}", e);
                Err(Error::LoadUsageEntry(usage_load_failure(e)))
            }
        }
    }

    /// Re-sign the loaded usage entry. Returns `(header, entry)`.
    pub fn update_usage_entry(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let state = self.state.lock();
        let handle = state.handle()?;
        let boundary = self.boundary();
        let mut buffers: (Vec<u8>, Vec<u8>) = (Vec::new(), Vec::new());
        let sizes = probe_and_fill(
            &mut buffers,
            |(header, entry)| {
                boundary.update_usage_entry(handle, header.as_mut_slice(), entry.as_mut_slice())
            },
            |(header, entry), sizes| {
                header.resize(sizes.primary, 0);
                entry.resize(sizes.secondary, 0);
                boundary.update_usage_entry(handle, header.as_mut_slice(), entry.as_mut_slice())
            },
        )
        .map_err(|e| {
            error!("UpdateUsageEntry failed: {:?}", e);
            Error::UpdateUsageEntryError
        })?;
        let (mut header, mut entry) = buffers;
        header.truncate(sizes.primary);
        entry.truncate(sizes.secondary);
        Ok((header, entry))
    }

    pub fn shrink_usage_table_header(
        &self,
        level: RequestedSecurityLevel,
        new_entry_count: u32,
    ) -> Result<Vec<u8>> {
        read_into_vec(0, |buf| {
            self.boundary()
                .shrink_usage_table_header(level, new_entry_count, buf)
        })
        .map_err(|e| {
            error!("ShrinkUsageTableHeader failed: {:?}", e);
            Error::ShrinkUsageTableHeaderError
        })
    }

    pub fn move_usage_entry(&self, new_index: u32) -> Result<()> {
        let state = self.state.lock();
        let handle = state.handle()?;
        self.boundary().move_entry(handle, new_index).map_err(|e| {
            error!("MoveEntry failed: {:?}", e);
            Error::MoveUsageEntryError
        })
    }

    fn require_initialized(&self) -> Result<RequestedSecurityLevel> {
        if !self.context.is_initialized() {
            return Err(Error::UnknownError);
        }
        Ok(self.requested_security_level())
    }

    /// Current and maximum HDCP level.
    pub fn hdcp_capabilities(&self) -> Result<(HdcpCapability, HdcpCapability)> {
        let level = self.require_initialized()?;
        self.boundary()
            .hdcp_capability(level)
            .map_err(|code| Error::Boundary {
                operation: "GetHDCPCapability",
                code,
            })
    }

    pub fn supported_certificate_types(&self) -> Result<SupportedCertificateTypes> {
        let level = self.require_initialized()?;
        let bits = self.boundary().supported_certificates(level);
        Ok(SupportedCertificateTypes {
            rsa_2048: bits & SUPPORTS_RSA_2048 != 0,
            rsa_3072: bits & SUPPORTS_RSA_3072 != 0,
            rsa_cast: bits & SUPPORTS_RSA_CAST != 0,
        })
    }

    pub fn get_random(&self, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.boundary()
            .get_random(&mut out)
            .map_err(|code| Error::Boundary {
                operation: "GetRandom",
                code,
            })?;
        Ok(out)
    }

    pub fn number_of_open_sessions(&self) -> Result<usize> {
        let level = self.require_initialized()?;
        self.boundary()
            .number_of_open_sessions(level)
            .map_err(|code| Error::Boundary {
                operation: "GetNumberOfOpenSessions",
                code,
            })
    }

    pub fn max_number_of_sessions(&self) -> Result<usize> {
        let level = self.require_initialized()?;
        self.boundary()
            .max_number_of_sessions(level)
            .map_err(|code| Error::Boundary {
                operation: "GetMaxNumberOfSessions",
                code,
            })
    }

    pub fn srm_version(&self) -> Result<u16> {
        self.require_initialized()?;
        self.boundary()
            .current_srm_version()
            .map_err(|code| Error::Boundary {
                operation: "GetCurrentSRMVersion",
                code,
            })
    }

    pub fn is_srm_update_supported(&self) -> bool {
        self.context.is_initialized() && self.boundary().is_srm_update_supported()
    }

    pub fn load_srm(&self, srm: &[u8]) -> Result<()> {
        self.require_initialized()?;
        if srm.is_empty() {
            return Err(Error::InvalidParameters("empty SRM".to_string()));
        }
        self.boundary().load_srm(srm).map_err(|code| Error::Boundary {
            operation: "LoadSRM",
            code,
        })
    }

    pub fn analog_output_capabilities(&self) -> Result<AnalogOutputCapabilities> {
        let level = self.require_initialized()?;
        let flags = self.boundary().analog_output_flags(level);
        Ok(AnalogOutputCapabilities {
            supported: flags & ANALOG_OUTPUT_SUPPORTED != 0,
            cgms_a: flags & ANALOG_OUTPUT_CGMS_A != 0,
            can_disable: flags & ANALOG_OUTPUT_CAN_DISABLE != 0,
        })
    }

    pub fn is_anti_rollback_hw_present(&self) -> bool {
        let level = self.requested_security_level();
        self.context.is_initialized() && self.boundary().is_anti_rollback_hw_present(level)
    }
}

impl Drop for CryptoSession {
    fn drop(&mut self) {
        self.close();
        self.context.release();
    }
}

fn map_select_key_error(e: BoundaryError) -> Error {
    error!("SelectKey failed: {:?}", e);
    match e {
        BoundaryError::KeyExpired => Error::NeedKey,
        BoundaryError::InsufficientHdcp => Error::InsufficientOutputProtection,
        BoundaryError::AnalogOutput => Error::AnalogOutputError,
        BoundaryError::InvalidSession => Error::InvalidSession,
        BoundaryError::NoDeviceKey => Error::NoDeviceKey,
        BoundaryError::NoContentKey => Error::NoContentKey,
        BoundaryError::InsufficientResources => Error::InsufficientCryptoResources,
        other => Error::SelectKeyError(other),
    }
}

fn usage_load_failure(e: BoundaryError) -> UsageLoadFailure {
    match e {
        BoundaryError::GenerationSkew => UsageLoadFailure::GenerationSkew,
        BoundaryError::SignatureFailure => UsageLoadFailure::SignatureFailure,
        BoundaryError::BadMagic => UsageLoadFailure::BadMagic,
        _ => UsageLoadFailure::Unknown,
    }
}

fn generic_cipher(
    iv: &[u8],
    algorithm: EncryptionAlgorithm,
) -> Result<crate::boundary::GenericAlgorithm> {
    match algorithm.to_boundary() {
        Some(boundary_algorithm) if iv.len() == algorithm.block_size() => Ok(boundary_algorithm),
        _ => Err(Error::InvalidParameters(format!(
            "algorithm {:?} with {} byte iv",
            algorithm,
            iv.len()
        ))),
    }
}

fn parse_usage_report(report: Vec<u8>) -> UsageReport {
    let mut parsed = UsageReport {
        report,
        status: UsageDurationStatus::Invalid,
        seconds_since_started: 0,
        seconds_since_last_played: 0,
    };
    if parsed.report.len() < PST_REPORT_SIZE {
        return parsed;
    }
    let header = &parsed.report[..PST_REPORT_SIZE];
    let status = UsageEntryStatus::from(header[20]);
    let since_license_received = BigEndian::read_i64(&header[24..32]);
    let since_first_decrypt = BigEndian::read_i64(&header[32..40]);
    let since_last_decrypt = BigEndian::read_i64(&header[40..48]);

    let not_begun = match status {
        UsageEntryStatus::Unused | UsageEntryStatus::InactiveUnused => true,
        // Older boundaries only say "inactive"; infer from the clocks.
        UsageEntryStatus::Inactive => {
            since_first_decrypt < 0 || since_license_received < since_first_decrypt
        }
        _ => false,
    };
    if not_begun {
        parsed.status = UsageDurationStatus::PlaybackNotBegun;
        return parsed;
    }
    parsed.status = UsageDurationStatus::Valid;
    parsed.seconds_since_started = since_first_decrypt;
    parsed.seconds_since_last_played = since_last_decrypt;
    parsed
}

/// Find the system id extension in a DER encoded certificate (chain).
fn system_id_from_oem_certificate(der: &[u8]) -> Option<u32> {
    let start = der
        .windows(SYSTEM_ID_EXTENSION_OID.len())
        .position(|w| w == SYSTEM_ID_EXTENSION_OID)?;
    let mut rest = &der[start + SYSTEM_ID_EXTENSION_OID.len()..];
    // critical BOOLEAN
    if rest.first() == Some(&0x01) {
        rest = der_element(rest)?.1;
    }
    if rest.first() != Some(&0x04) {
        return None;
    }
    let (octets, _) = der_element(rest)?;
    if octets.first() != Some(&0x02) {
        return None;
    }
    let (integer, _) = der_element(octets)?;
    if integer.is_empty() {
        return None;
    }
    let leading_zeros = integer.iter().take_while(|b| **b == 0).count();
    let integer = &integer[leading_zeros..];
    if integer.len() > 4 {
        return None;
    }
    Some(integer.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// Split one DER element into its contents and whatever follows it.
fn der_element(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let first = *data.get(1)?;
    let (len, header_len) = if first & 0x80 == 0 {
        (usize::from(first), 2)
    } else {
        let count = usize::from(first & 0x7f);
        if count == 0 || count > 4 {
            return None;
        }
        let bytes = data.get(2..2 + count)?;
        (
            bytes.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b)),
            2 + count,
        )
    };
    let end = header_len.checked_add(len)?;
    Some((data.get(header_len..end)?, data.get(end..)?))
}

/// Caller output resolved against the session's destination type.
enum OutputTarget<'b> {
    Clear(&'b mut [u8]),
    Secure {
        handle: u64,
        offset: usize,
        length: usize,
    },
    Direct {
        is_video: bool,
    },
}

impl<'b> OutputTarget<'b> {
    fn new(
        output: &'b mut DecryptOutput<'_>,
        dest_type: DestinationBufferType,
        output_offset: usize,
        input_len: usize,
        is_video: bool,
    ) -> Result<Self> {
        match (dest_type, output) {
            (DestinationBufferType::Clear, DecryptOutput::Clear(buffer)) => {
                let fits = output_offset
                    .checked_add(input_len)
                    .is_some_and(|end| end <= buffer.len());
                if !fits {
                    return Err(Error::InvalidDecryptParameters("output buffer too small"));
                }
                Ok(OutputTarget::Clear(&mut buffer[output_offset..]))
            }
            (DestinationBufferType::Secure, DecryptOutput::Secure { handle, length }) => {
                Ok(OutputTarget::Secure {
                    handle: *handle,
                    offset: output_offset,
                    length: *length,
                })
            }
            (DestinationBufferType::Direct, _) => Ok(OutputTarget::Direct { is_video }),
            _ => Err(Error::InvalidDecryptParameters(
                "output does not match destination buffer type",
            )),
        }
    }

    /// Fresh descriptor for output starting `offset` bytes in. The boundary
    /// may modify a descriptor, so every call gets its own.
    fn desc(&mut self, offset: usize) -> DestBufferDesc<'_> {
        match self {
            OutputTarget::Clear(buffer) => {
                let start = offset.min(buffer.len());
                DestBufferDesc::Clear {
                    buffer: &mut buffer[start..],
                }
            }
            OutputTarget::Secure {
                handle,
                offset: base,
                length,
            } => DestBufferDesc::Secure {
                handle: *handle,
                offset: *base + offset,
                max_length: *length,
            },
            OutputTarget::Direct { is_video } => DestBufferDesc::Direct {
                is_video: *is_video,
            },
        }
    }
}

fn copy_in_chunks(
    boundary: &dyn CryptoBoundary,
    level: RequestedSecurityLevel,
    data: &[u8],
    target: &mut OutputTarget<'_>,
) -> BoundaryResult<()> {
    let mut offset = 0;
    for chunk in data.chunks(MAX_CHUNK_SIZE) {
        let mut flags = 0;
        if offset == 0 {
            flags |= FIRST_SUBSAMPLE;
        }
        if offset + chunk.len() == data.len() {
            flags |= LAST_SUBSAMPLE;
        }
        boundary.copy_buffer(level, chunk, &mut target.desc(offset), flags)?;
        offset += chunk.len();
    }
    Ok(())
}

/// Decrypt `sample` in `max_chunk` pieces. `max_chunk` is a whole number of
/// pattern repetitions, so block offset and pattern carry over unchanged and
/// only the IV moves.
fn decrypt_in_chunks(
    key_session: &mut KeySession,
    env: KeySessionEnv<'_>,
    sample: &CencSample<'_>,
    cipher_mode: CipherMode,
    pattern: &PatternDescriptor,
    target: &mut OutputTarget<'_>,
    max_chunk: usize,
) -> BoundaryResult<()> {
    let mut iv = sample.iv;
    let mut offset = 0;
    for chunk in sample.data.chunks(max_chunk) {
        let last = offset + chunk.len() == sample.data.len();
        let mut flags = 0;
        if offset == 0 {
            flags |= sample.subsample_flags & FIRST_SUBSAMPLE;
        }
        if last {
            flags |= sample.subsample_flags & LAST_SUBSAMPLE;
        }
        let chunk_sample = CencSample {
            data: chunk,
            iv,
            subsample_flags: flags,
            ..*sample
        };
        key_session.decrypt(env, &chunk_sample, &mut target.desc(offset), pattern)?;
        if !last {
            iv = next_chunk_iv(&iv, chunk, cipher_mode, pattern);
        }
        offset += chunk.len();
    }
    Ok(())
}
