//! Session registry.
//!
//! [`CdmEngine`] maps session ids and release key set ids to live license
//! sessions, routes every caller operation to the right session, and runs the
//! periodic maintenance (policy timers, usage accounting, expiry of release
//! sessions). Certificate provisioning state is engine-wide.
//!
//! The session map and the key set map share one lock. It is held across
//! whole-registry scans so they see a consistent snapshot; sessions are always
//! locked after it, never before.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::boundary::{CryptoBoundary, HdcpCapability, RequestedSecurityLevel, SecurityLevel};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::crypto_session::{CryptoContext, CryptoSession, UsageSupportType};
use crate::decrypt::{DecryptOutput, DecryptParams};
use crate::error::{Error, Result};
use crate::key::{EncryptionAlgorithm, KeyAllowedUsage, SigningAlgorithm};
use crate::session::{
    generate_session_id, AppParameterMap, CertificateProvisioning, CertificateType, EventListener,
    InitData, KeyRequest, KeySetId, LicenseType, PropertySet, ProvisionedCertificate,
    ProvisioningRequest, QueryMap, SessionFactory, SessionId, SharedSession,
};

/// Device status query tokens.
pub const QUERY_KEY_SECURITY_LEVEL: &str = "SecurityLevel";
pub const QUERY_KEY_DEVICE_ID: &str = "DeviceID";
pub const QUERY_KEY_SYSTEM_ID: &str = "SystemID";
pub const QUERY_KEY_PROVISIONING_ID: &str = "ProvisioningID";
pub const QUERY_KEY_CURRENT_HDCP_LEVEL: &str = "HdcpLevel";
pub const QUERY_KEY_MAX_HDCP_LEVEL: &str = "MaxHdcpLevel";
pub const QUERY_KEY_USAGE_SUPPORT: &str = "UsageSupport";
pub const QUERY_KEY_NUMBER_OF_OPEN_SESSIONS: &str = "NumberOfOpenSessions";
pub const QUERY_KEY_MAX_NUMBER_OF_SESSIONS: &str = "MaxNumberOfSessions";
pub const QUERY_KEY_OEMCRYPTO_API_VERSION: &str = "OemCryptoApiVersion";
pub const QUERY_KEY_CURRENT_SRM_VERSION: &str = "CurrentSRMVersion";
pub const QUERY_KEY_SRM_UPDATE_SUPPORT: &str = "SRMUpdateSupport";
pub const QUERY_KEY_WVCDM_VERSION: &str = "WidevineCdmVersion";

pub const QUERY_VALUE_TRUE: &str = "True";
pub const QUERY_VALUE_FALSE: &str = "False";
pub const QUERY_VALUE_SECURITY_LEVEL_L1: &str = "L1";
pub const QUERY_VALUE_SECURITY_LEVEL_L2: &str = "L2";
pub const QUERY_VALUE_SECURITY_LEVEL_L3: &str = "L3";
pub const QUERY_VALUE_SECURITY_LEVEL_UNKNOWN: &str = "Unknown";
pub const QUERY_VALUE_HDCP_NONE: &str = "Unprotected";
pub const QUERY_VALUE_HDCP_V1: &str = "HDCP-1.x";
pub const QUERY_VALUE_HDCP_V2_0: &str = "HDCP-2.0";
pub const QUERY_VALUE_HDCP_V2_1: &str = "HDCP-2.1";
pub const QUERY_VALUE_HDCP_V2_2: &str = "HDCP-2.2";
pub const QUERY_VALUE_HDCP_NO_DIGITAL_OUTPUT: &str = "Disconnected";
pub const QUERY_VALUE_HDCP_LEVEL_UNKNOWN: &str = "Unknown";

fn hdcp_value(capability: HdcpCapability) -> &'static str {
    match capability {
        HdcpCapability::None => QUERY_VALUE_HDCP_NONE,
        HdcpCapability::V1 => QUERY_VALUE_HDCP_V1,
        HdcpCapability::V2 => QUERY_VALUE_HDCP_V2_0,
        HdcpCapability::V2_1 => QUERY_VALUE_HDCP_V2_1,
        HdcpCapability::V2_2 => QUERY_VALUE_HDCP_V2_2,
        HdcpCapability::NoDigitalOutput => QUERY_VALUE_HDCP_NO_DIGITAL_OUTPUT,
    }
}

fn bool_value(value: bool) -> &'static str {
    if value {
        QUERY_VALUE_TRUE
    } else {
        QUERY_VALUE_FALSE
    }
}

fn requested_level(level: SecurityLevel) -> RequestedSecurityLevel {
    if level == SecurityLevel::L3 {
        RequestedSecurityLevel::L3
    } else {
        RequestedSecurityLevel::Default
    }
}

#[derive(Default)]
struct Registry {
    sessions: BTreeMap<SessionId, SharedSession>,
    /// Release key set id to (session id, expiry time).
    release_key_sets: BTreeMap<KeySetId, (SessionId, i64)>,
}

impl Registry {
    fn release_session_id(&self, key_set_id: &str) -> Result<SessionId> {
        self.release_key_sets
            .get(key_set_id)
            .map(|(session_id, _)| session_id.clone())
            .ok_or_else(|| Error::KeySetIdNotFound(key_set_id.to_string()))
    }
}

struct ProvisioningState {
    flow: Option<Box<dyn CertificateProvisioning>>,
    /// Level the last "needs provisioning" failure asked for.
    requested_level: RequestedSecurityLevel,
}

/// DRM engine: the registry of live license sessions.
pub struct CdmEngine {
    context: Arc<CryptoContext>,
    factory: Arc<dyn SessionFactory>,
    clock: Arc<dyn Clock>,
    registry: Mutex<Registry>,
    provisioning: Mutex<ProvisioningState>,
    last_usage_update: AtomicI64,
}

impl CdmEngine {
    pub fn new(
        boundary: Arc<dyn CryptoBoundary>,
        config: EngineConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self::with_clock(boundary, config, factory, Arc::new(SystemClock))
    }

    pub fn with_clock(
        boundary: Arc<dyn CryptoBoundary>,
        config: EngineConfig,
        factory: Arc<dyn SessionFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            context: CryptoContext::new(boundary, config),
            factory,
            clock,
            registry: Mutex::new(Registry::default()),
            provisioning: Mutex::new(ProvisioningState {
                flow: None,
                requested_level: RequestedSecurityLevel::Default,
            }),
            last_usage_update: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        self.context.config()
    }

    fn session(&self, session_id: &str) -> Result<SharedSession> {
        self.registry
            .lock()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                error!("session not found: {}", session_id);
                Error::SessionNotFound(session_id.to_string())
            })
    }

    fn note_provisioning_needed(&self, error: &Error, level: RequestedSecurityLevel) {
        if matches!(error, Error::NeedProvisioning) {
            self.provisioning.lock().requested_level = level;
        }
    }

    /// Open a new session.
    ///
    /// When the device has no certificate for the requested level the error
    /// is [`Error::SessionNeedsProvisioning`] carrying a reserved session id,
    /// and the level is remembered for the next provisioning request.
    pub fn open_session(
        &self,
        key_system: &str,
        property_set: Option<&PropertySet>,
        forced_session_id: Option<&str>,
        listener: Option<Arc<dyn EventListener>>,
    ) -> Result<SessionId> {
        info!("open_session");
        if !self.config().is_valid_key_system(key_system) {
            info!("invalid key system: {}", key_system);
            return Err(Error::InvalidKeySystem(key_system.to_string()));
        }
        if let Some(id) = forced_session_id {
            if self.registry.lock().sessions.contains_key(id) {
                return Err(Error::DuplicateSessionId(id.to_string()));
            }
        }

        self.close_expired_release_sessions();

        let mut session =
            self.factory
                .create_session(&self.context, property_set, forced_session_id, listener);
        if let Err(e) = session.init() {
            if matches!(e, Error::NeedProvisioning) {
                self.provisioning.lock().requested_level = session.requested_security_level();
                let reserved = forced_session_id
                    .map(str::to_string)
                    .unwrap_or_else(generate_session_id);
                return Err(Error::SessionNeedsProvisioning(reserved));
            }
            error!("bad session init: {}", e);
            return Err(e);
        }

        let id = session.session_id().to_string();
        let session: SharedSession = Arc::new(Mutex::new(session));
        {
            let mut registry = self.registry.lock();
            if !registry.sessions.contains_key(&id) {
                registry.sessions.insert(id.clone(), session);
                info!("opened session {}", id);
                return Ok(id);
            }
        }
        Err(Error::DuplicateSessionId(id))
    }

    /// Open a session for releasing `key_set_id` and map the key set to it.
    ///
    /// A session still mapped to the same key set is closed first.
    pub fn open_key_set_session(
        &self,
        key_set_id: &str,
        property_set: Option<&PropertySet>,
        listener: Option<Arc<dyn EventListener>>,
    ) -> Result<SessionId> {
        info!("open_key_set_session");
        if key_set_id.is_empty() {
            error!("invalid key set id");
            return Err(Error::EmptyKeySetId);
        }

        let in_use = self
            .registry
            .lock()
            .release_key_sets
            .contains_key(key_set_id);
        if in_use {
            if let Err(e) = self.close_key_set_session(key_set_id) {
                warn!("closing stale key set session failed: {}", e);
            }
        }

        let session_id =
            self.open_session(&self.config().key_system, property_set, None, listener)?;
        let expiry = self.clock.now() + self.config().release_session_ttl_secs;
        self.registry
            .lock()
            .release_key_sets
            .insert(key_set_id.to_string(), (session_id.clone(), expiry));
        Ok(session_id)
    }

    pub fn close_session(&self, session_id: &str) -> Result<()> {
        info!("close_session: {}", session_id);
        let removed = self.registry.lock().sessions.remove(session_id);
        // The session is dropped here, outside the registry lock.
        match removed {
            Some(_) => Ok(()),
            None => {
                error!("session not found: {}", session_id);
                Err(Error::SessionNotFound(session_id.to_string()))
            }
        }
    }

    pub fn close_key_set_session(&self, key_set_id: &str) -> Result<()> {
        info!("close_key_set_session");
        let session_id = self.registry.lock().release_session_id(key_set_id)?;
        let result = self.close_session(&session_id);
        self.registry.lock().release_key_sets.remove(key_set_id);
        result
    }

    pub fn is_open_session(&self, session_id: &str) -> bool {
        self.registry.lock().sessions.contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.registry.lock().sessions.len()
    }

    /// Session currently mapped to a release key set.
    pub fn key_set_session_id(&self, key_set_id: &str) -> Option<SessionId> {
        self.registry.lock().release_session_id(key_set_id).ok()
    }

    pub fn is_release_session(&self, session_id: &str) -> bool {
        match self.registry.lock().sessions.get(session_id) {
            Some(session) => session.lock().is_release(),
            None => false,
        }
    }

    pub fn is_offline_session(&self, session_id: &str) -> bool {
        match self.registry.lock().sessions.get(session_id) {
            Some(session) => session.lock().is_offline(),
            None => false,
        }
    }

    /// Build a license request.
    ///
    /// Release requests are addressed by `key_set_id` and `session_id` must
    /// be empty, unless the engine is configured to always use key set ids.
    /// A release whose license is not loaded yet is restored from storage
    /// first; on success every other session hears about the release.
    pub fn generate_key_request(
        &self,
        session_id: &str,
        key_set_id: &str,
        init_data: &InitData,
        license_type: LicenseType,
        app_parameters: &AppParameterMap,
    ) -> Result<KeyRequest> {
        info!("generate_key_request");
        let mut id = session_id.to_string();
        if license_type == LicenseType::Release && !self.config().always_use_key_set_ids {
            if key_set_id.is_empty() {
                error!("invalid key set id");
                return Err(Error::EmptyKeySetId);
            }
            if !session_id.is_empty() {
                error!("invalid session id: {}", session_id);
                return Err(Error::InvalidSessionId(session_id.to_string()));
            }
            id = self.registry.lock().release_session_id(key_set_id)?;
        }

        let shared = self.session(&id)?;
        let (result, level) = {
            let mut session = shared.lock();
            let level = session.requested_security_level();
            if license_type == LicenseType::Release && !session.license_received() {
                if let Err(e) = session.restore_offline_session(key_set_id, LicenseType::Release) {
                    error!("key release restoration failed: {}", e);
                    return Err(e);
                }
            }
            (
                session.generate_key_request(init_data, license_type, app_parameters),
                level,
            )
        };

        match result {
            Ok(request) => {
                if license_type == LicenseType::Release {
                    self.notify_key_release(key_set_id, Some(&id));
                }
                Ok(request)
            }
            Err(e) => {
                self.note_provisioning_needed(&e, level);
                error!("key request generation failed: {}", e);
                Err(e)
            }
        }
    }

    /// Load a license response.
    ///
    /// An empty `session_id` marks a release response addressed by
    /// `key_set_id`. The key set id is returned for offline licenses and
    /// licenses with a provider session token.
    pub fn add_key(
        &self,
        session_id: &str,
        response: &[u8],
        key_set_id: Option<&str>,
    ) -> Result<Option<KeySetId>> {
        info!("add_key");
        let is_release = session_id.is_empty();
        let id = if is_release {
            let key_set_id = key_set_id.ok_or(Error::ParameterNull("key_set_id"))?;
            if key_set_id.is_empty() {
                error!("invalid key set id");
                return Err(Error::EmptyKeySetId);
            }
            self.registry.lock().release_session_id(key_set_id)?
        } else {
            session_id.to_string()
        };

        let shared = self.session(&id)?;
        if response.is_empty() {
            error!("no key data");
            return Err(Error::EmptyKeyData);
        }

        let mut session = shared.lock();
        if let Err(e) = session.add_key(response) {
            error!("keys not added: {}", e);
            return Err(e);
        }
        if !is_release && (session.is_offline() || session.has_provider_session_token()) {
            Ok(Some(session.key_set_id().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Load a persisted offline license into `session_id`.
    pub fn restore_key(&self, session_id: &str, key_set_id: &str) -> Result<()> {
        info!("restore_key");
        if key_set_id.is_empty() {
            return Err(Error::EmptyKeySetId);
        }
        let shared = self.session(session_id)?;
        let (result, level) = {
            let mut session = shared.lock();
            (
                session.restore_offline_session(key_set_id, LicenseType::Offline),
                session.requested_security_level(),
            )
        };
        result.map_err(|e| {
            self.note_provisioning_needed(&e, level);
            error!("restore offline session failed: {}", e);
            e
        })
    }

    pub fn remove_keys(&self, session_id: &str) -> Result<()> {
        info!("remove_keys");
        self.session(session_id)?.lock().remove_keys();
        Ok(())
    }

    pub fn generate_renewal_request(&self, session_id: &str) -> Result<KeyRequest> {
        info!("generate_renewal_request");
        self.session(session_id)?
            .lock()
            .generate_renewal_request()
            .map_err(|e| {
                error!("renewal request generation failed: {}", e);
                e
            })
    }

    pub fn renew_key(&self, session_id: &str, response: &[u8]) -> Result<()> {
        info!("renew_key");
        let shared = self.session(session_id)?;
        if response.is_empty() {
            error!("no key data");
            return Err(Error::EmptyKeyData);
        }
        let result = shared.lock().renew_key(response);
        result.map_err(|e| {
            error!("keys not renewed: {}", e);
            e
        })
    }

    /// Answer a device status query over a temporary crypto session.
    pub fn query_status(&self, security_level: RequestedSecurityLevel, token: &str) -> Result<String> {
        info!("query_status: {}", token);
        let crypto = CryptoSession::new(self.context.clone());
        crypto.open(security_level)?;

        let unknown = |e: Error| {
            warn!("status query {} failed: {}", token, e);
            Error::UnknownError
        };
        let response = match token {
            QUERY_KEY_SECURITY_LEVEL => match crypto.security_level() {
                SecurityLevel::L1 => QUERY_VALUE_SECURITY_LEVEL_L1,
                SecurityLevel::L2 => QUERY_VALUE_SECURITY_LEVEL_L2,
                SecurityLevel::L3 => QUERY_VALUE_SECURITY_LEVEL_L3,
                SecurityLevel::Uninitialized | SecurityLevel::Unknown => {
                    QUERY_VALUE_SECURITY_LEVEL_UNKNOWN
                }
            }
            .to_string(),
            QUERY_KEY_DEVICE_ID => hex::encode(crypto.external_device_unique_id().map_err(unknown)?),
            QUERY_KEY_SYSTEM_ID => crypto
                .system_id()
                .ok_or_else(|| unknown(Error::LoadSystemIdError))?
                .to_string(),
            QUERY_KEY_PROVISIONING_ID => hex::encode(crypto.provisioning_id().map_err(unknown)?),
            QUERY_KEY_CURRENT_HDCP_LEVEL | QUERY_KEY_MAX_HDCP_LEVEL => {
                let (current, max) = crypto.hdcp_capabilities().map_err(unknown)?;
                let capability = if token == QUERY_KEY_CURRENT_HDCP_LEVEL {
                    current
                } else {
                    max
                };
                hdcp_value(capability).to_string()
            }
            QUERY_KEY_USAGE_SUPPORT => {
                let support = crypto.usage_support_type().map_err(unknown)?;
                bool_value(support != UsageSupportType::NonSecure).to_string()
            }
            QUERY_KEY_NUMBER_OF_OPEN_SESSIONS => crypto
                .number_of_open_sessions()
                .map_err(unknown)?
                .to_string(),
            QUERY_KEY_MAX_NUMBER_OF_SESSIONS => crypto
                .max_number_of_sessions()
                .map_err(unknown)?
                .to_string(),
            QUERY_KEY_OEMCRYPTO_API_VERSION => crypto.api_version().to_string(),
            QUERY_KEY_CURRENT_SRM_VERSION => crypto.srm_version().map_err(unknown)?.to_string(),
            QUERY_KEY_SRM_UPDATE_SUPPORT => bool_value(crypto.is_srm_update_supported()).to_string(),
            QUERY_KEY_WVCDM_VERSION => self.config().cdm_version.clone(),
            _ => {
                warn!("unknown status requested: {}", token);
                return Err(Error::InvalidQueryKey(token.to_string()));
            }
        };
        Ok(response)
    }

    pub fn query_session_status(&self, session_id: &str) -> Result<QueryMap> {
        self.session(session_id)?.lock().query_status()
    }

    pub fn query_key_status(&self, session_id: &str) -> Result<QueryMap> {
        self.session(session_id)?.lock().query_key_status()
    }

    /// Allowed usage of `key_id`.
    ///
    /// With an empty `session_id` every session is asked. Sessions that do
    /// not hold the key are skipped; two sessions reporting different usage
    /// are a [`Error::KeyConflict`].
    pub fn query_key_allowed_usage(&self, session_id: &str, key_id: &[u8]) -> Result<KeyAllowedUsage> {
        if !session_id.is_empty() {
            return self.session(session_id)?.lock().query_key_allowed_usage(key_id);
        }

        let registry = self.registry.lock();
        let mut found: Option<KeyAllowedUsage> = None;
        for session in registry.sessions.values() {
            match session.lock().query_key_allowed_usage(key_id) {
                Ok(usage) => match &found {
                    Some(previous) if *previous != usage => return Err(Error::KeyConflict),
                    Some(_) => {}
                    None => found = Some(usage),
                },
                Err(Error::KeyNotFound) => {}
                Err(e) => {
                    error!("query_key_allowed_usage failed: {}", e);
                    return Err(e);
                }
            }
        }
        found.ok_or(Error::KeyNotFound)
    }

    pub fn query_oemcrypto_session_id(&self, session_id: &str) -> Result<QueryMap> {
        self.session(session_id)?.lock().query_oemcrypto_session_id()
    }

    /// Start (or continue) certificate provisioning for the level the last
    /// "needs provisioning" failure asked for.
    pub fn get_provisioning_request(
        &self,
        cert_type: CertificateType,
        cert_authority: &str,
        service_certificate: &[u8],
    ) -> Result<ProvisioningRequest> {
        info!("get_provisioning_request");
        let mut state = self.provisioning.lock();
        let mut flow = match state.flow.take() {
            Some(flow) => flow,
            None => {
                let mut flow = self.factory.create_provisioning(&self.context);
                flow.init(service_certificate)?;
                flow
            }
        };
        match flow.get_provisioning_request(state.requested_level, cert_type, cert_authority) {
            Ok(request) => {
                state.flow = Some(flow);
                Ok(request)
            }
            Err(e) => {
                error!("provisioning request failed: {}", e);
                Err(e)
            }
        }
    }

    /// Finish certificate provisioning.
    ///
    /// The in-flight flow is kept when the response is rejected, so a later
    /// response can still complete it. Without a flow, answers `Ok(None)` if
    /// some other attempt already provisioned the pending level.
    pub fn handle_provisioning_response(
        &self,
        response: &[u8],
    ) -> Result<Option<ProvisionedCertificate>> {
        info!("handle_provisioning_response");
        let mut state = self.provisioning.lock();
        if response.is_empty() {
            error!("empty provisioning response");
            state.flow = None;
            return Err(Error::EmptyProvisioningResponse);
        }

        let pending = state.flow.take();
        let mut flow = match pending {
            Some(flow) => flow,
            None => {
                let level = state.requested_level;
                drop(state);
                let crypto = CryptoSession::new(self.context.clone());
                if let Err(e) = crypto.open(level) {
                    error!("provisioning object missing and open failed: {}", e);
                    return Err(Error::EmptyProvisioningCertificate);
                }
                if !self.is_provisioned(crypto.security_level()) {
                    error!("provisioning object missing");
                    return Err(Error::EmptyProvisioningCertificate);
                }
                return Ok(None);
            }
        };

        match flow.handle_provisioning_response(response) {
            Ok(certificate) => Ok(Some(certificate)),
            Err(e) => {
                error!("provisioning response rejected: {}", e);
                state.flow = Some(flow);
                Err(e)
            }
        }
    }

    /// Whether a session at `level` initializes, which needs a certificate.
    pub fn is_provisioned(&self, level: SecurityLevel) -> bool {
        let property_set = PropertySet {
            security_level: requested_level(level),
            ..Default::default()
        };
        let mut session = self
            .factory
            .create_session(&self.context, Some(&property_set), None, None);
        match session.init() {
            Ok(()) => true,
            Err(e) => {
                debug!("session init at {} failed: {}", level.as_str(), e);
                false
            }
        }
    }

    /// Delete every usage report at `level`.
    pub fn delete_usage_table(&self, level: SecurityLevel) -> Result<()> {
        let crypto = CryptoSession::new(self.context.clone());
        crypto.open(requested_level(level)).map_err(|e| {
            error!("delete_usage_table: open failed: {}", e);
            e
        })?;
        crypto.delete_all_usage_reports()
    }

    /// Decrypt one subsample.
    ///
    /// With an empty `session_id` the key is looked up in every session and
    /// the one with the longest remaining license wins.
    pub fn decrypt(&self, session_id: &str, params: &mut DecryptParams<'_>) -> Result<()> {
        if params.key_id.is_empty() && (params.is_encrypted || session_id.is_empty()) {
            error!("decrypt: no key id");
            return Err(Error::InvalidDecryptParameters("no key id"));
        }
        if params.input.is_empty() {
            error!("decrypt: no input buffer");
            return Err(Error::InvalidDecryptParameters("no input buffer"));
        }
        if matches!(params.output, DecryptOutput::Direct)
            && !params.is_secure
            && !self.config().use_fifo
        {
            error!("decrypt: no output buffer");
            return Err(Error::InvalidDecryptParameters("no output buffer"));
        }

        let shared = {
            let registry = self.registry.lock();
            if session_id.is_empty() {
                let mut chosen: Option<&SharedSession> = None;
                let mut seconds_remaining = 0;
                for session in registry.sessions.values() {
                    let s = session.lock();
                    if s.is_key_loaded(params.key_id) {
                        let duration = s.duration_remaining();
                        if duration > seconds_remaining {
                            chosen = Some(session);
                            seconds_remaining = duration;
                        }
                    }
                }
                chosen.cloned()
            } else {
                registry.sessions.get(session_id).cloned()
            }
        };
        let shared = shared.ok_or_else(|| {
            error!("decrypt: session not found: {:?}", session_id);
            Error::SessionNotFoundForDecrypt
        })?;
        let result = shared.lock().decrypt(params);
        result
    }

    pub fn generic_encrypt(
        &self,
        session_id: &str,
        input: &[u8],
        key_id: &[u8],
        iv: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> Result<Vec<u8>> {
        self.session(session_id)?
            .lock()
            .generic_encrypt(input, key_id, iv, algorithm)
    }

    pub fn generic_decrypt(
        &self,
        session_id: &str,
        input: &[u8],
        key_id: &[u8],
        iv: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> Result<Vec<u8>> {
        self.session(session_id)?
            .lock()
            .generic_decrypt(input, key_id, iv, algorithm)
    }

    pub fn generic_sign(
        &self,
        session_id: &str,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
    ) -> Result<Vec<u8>> {
        self.session(session_id)?
            .lock()
            .generic_sign(message, key_id, algorithm)
    }

    pub fn generic_verify(
        &self,
        session_id: &str,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
        signature: &[u8],
    ) -> Result<()> {
        self.session(session_id)?
            .lock()
            .generic_verify(message, key_id, algorithm, signature)
    }

    /// Whether any session holds `key_id`.
    pub fn is_key_loaded(&self, key_id: &[u8]) -> bool {
        self.registry
            .lock()
            .sessions
            .values()
            .any(|s| s.lock().is_key_loaded(key_id))
    }

    /// Session holding `key_id` with the longest remaining license, among
    /// sessions in the same sharing group as `session_id_hint`.
    pub fn find_session_for_key(&self, key_id: &[u8], session_id_hint: &str) -> Option<SessionId> {
        let sharing_id = self.factory.session_sharing_id(session_id_hint);
        let registry = self.registry.lock();
        let mut chosen = None;
        let mut seconds_remaining = 0;
        for (id, session) in &registry.sessions {
            if self.factory.session_sharing_id(id) != sharing_id {
                continue;
            }
            let s = session.lock();
            if s.is_key_loaded(key_id) {
                let duration = s.duration_remaining();
                if duration > seconds_remaining {
                    chosen = Some(id.clone());
                    seconds_remaining = duration;
                }
            }
        }
        chosen
    }

    /// Forward the output resolution. `false` when the session is unknown.
    pub fn notify_resolution(&self, session_id: &str, width: u32, height: u32) -> bool {
        match self.session(session_id) {
            Ok(session) => {
                session.lock().notify_resolution(width, height);
                true
            }
            Err(_) => false,
        }
    }

    /// Periodic maintenance. Must not be called concurrently with itself.
    ///
    /// Ticks every session's policy timer, refreshes usage accounting when a
    /// session needs it and the update period elapsed (or a session has not
    /// reported usage yet), then closes expired release sessions.
    pub fn on_timer_event(&self) {
        let now = self.clock.now();
        let period_expired =
            now - self.last_usage_update.load(Ordering::SeqCst) > self.config().usage_update_period_secs;
        if period_expired {
            self.last_usage_update.store(now, Ordering::SeqCst);
        }

        {
            let registry = self.registry.lock();
            let mut initial_update = false;
            let mut update_needed = false;
            for session in registry.sessions.values() {
                let mut s = session.lock();
                initial_update |= s.is_initial_usage_update();
                update_needed |= s.is_usage_update_needed();
                s.on_timer_event(period_expired);
            }

            if update_needed && (period_expired || initial_update) {
                // One shared table: refresh it once per tick.
                let mut table_updated = false;
                for session in registry.sessions.values() {
                    let mut s = session.lock();
                    s.reset_usage_flags();
                    match s.usage_support_type() {
                        Some(UsageSupportType::Entry) => {
                            if s.has_provider_session_token() {
                                if let Err(e) = s.update_usage_entry_information() {
                                    warn!("usage entry update failed: {}", e);
                                }
                            }
                        }
                        Some(UsageSupportType::Table) if !table_updated => {
                            match s.update_usage_table_information() {
                                Ok(()) => table_updated = true,
                                Err(e) => warn!("usage table update failed: {}", e),
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        self.close_expired_release_sessions();
    }

    /// Tell every session that `key_set_id` was released.
    pub fn on_key_release_event(&self, key_set_id: &str) {
        self.notify_key_release(key_set_id, None);
    }

    fn notify_key_release(&self, key_set_id: &str, releasing_session: Option<&str>) {
        let sessions: Vec<SharedSession> = self
            .registry
            .lock()
            .sessions
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != releasing_session)
            .map(|(_, session)| session.clone())
            .collect();
        for session in sessions {
            session.lock().on_key_release_event(key_set_id);
        }
    }

    /// Close release sessions whose key set mapping expired.
    pub fn close_expired_release_sessions(&self) {
        let now = self.clock.now();
        let mut expired = Vec::new();
        self.registry
            .lock()
            .release_key_sets
            .retain(|key_set_id, (session_id, expiry)| {
                if *expiry < now {
                    debug!("release key set {} expired", key_set_id);
                    expired.push(session_id.clone());
                    false
                } else {
                    true
                }
            });
        for session_id in expired {
            if let Err(e) = self.close_session(&session_id) {
                debug!("expired release session already closed: {}", e);
            }
        }
    }
}

impl Drop for CdmEngine {
    fn drop(&mut self) {
        let sessions = std::mem::take(&mut self.registry.get_mut().sessions);
        if !sessions.is_empty() {
            info!("closing {} sessions", sessions.len());
        }
    }
}
