//! License session interfaces consumed by the engine.
//!
//! The license protocol layer (request building, response parsing, renewal
//! and expiry policy, offline storage) lives behind [`LicenseSession`]. The
//! engine only creates sessions through a [`SessionFactory`], routes calls to
//! them, and drives their timers. Each session owns one
//! [`CryptoSession`](crate::crypto_session::CryptoSession), which the trait
//! exposes so the routing helpers below can talk to the boundary directly.
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::boundary::{BoundaryHandle, RequestedSecurityLevel};
use crate::crypto_session::{CryptoContext, CryptoSession, UsageSupportType};
use crate::decrypt::DecryptParams;
use crate::error::Result;
use crate::key::{EncryptionAlgorithm, KeyAllowedUsage, SigningAlgorithm};

pub type SessionId = String;
pub type KeySetId = String;
/// String key/value answers of status queries.
pub type QueryMap = BTreeMap<String, String>;
/// Application parameters forwarded into license requests.
pub type AppParameterMap = BTreeMap<String, String>;

/// Session shared between the engine's map and in-flight calls.
pub type SharedSession = Arc<Mutex<Box<dyn LicenseSession>>>;

/// Query key for the boundary handle of a session.
pub const QUERY_KEY_OEMCRYPTO_SESSION_ID: &str = "OemCryptoSessionId";

/// What a license request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseType {
    Streaming,
    Offline,
    /// Surrender a previously persisted license.
    Release,
}

/// Kind of certificate requested during provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateType {
    Widevine,
    X509,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRequestType {
    Initial,
    Renewal,
    Release,
}

/// Content initialization data (a PSSH box or a bare key id list).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitData {
    /// MIME style type, `"cenc"` or `"webm"`.
    pub init_data_type: String,
    pub data: Vec<u8>,
}

impl InitData {
    pub fn new(init_data_type: &str, data: &[u8]) -> Self {
        Self {
            init_data_type: init_data_type.to_string(),
            data: data.to_vec(),
        }
    }
}

/// Signed message to forward to the license server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub message: Vec<u8>,
    pub request_type: KeyRequestType,
    pub url: String,
}

/// Signed provisioning request with the server URL to post it to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningRequest {
    pub request: Vec<u8>,
    pub default_url: String,
}

/// Certificate and wrapped device key returned by provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedCertificate {
    pub certificate: Vec<u8>,
    pub wrapped_key: Vec<u8>,
}

/// Per-session client properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySet {
    pub security_level: RequestedSecurityLevel,
    pub use_privacy_mode: bool,
    pub service_certificate: Vec<u8>,
    pub app_id: String,
    /// Sessions with the same non-zero id may share keys.
    pub session_sharing_id: u32,
}

/// Status of one key as reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Usable,
    Expired,
    OutputNotAllowed,
    Pending,
    InternalError,
}

/// Callbacks from a session to the application.
pub trait EventListener: Send + Sync {
    fn on_session_renewal_needed(&self, _session_id: &str) {}
    fn on_session_keys_change(
        &self,
        _session_id: &str,
        _keys: &[(Vec<u8>, KeyStatus)],
        _has_new_usable_key: bool,
    ) {
    }
    fn on_expiration_update(&self, _session_id: &str, _new_expiry_time_secs: i64) {}
}

/// Fresh random session id.
pub fn generate_session_id() -> SessionId {
    format!("sid{}", Uuid::new_v4().simple())
}

/// Fresh random key set id.
pub fn generate_key_set_id() -> KeySetId {
    format!("ksid{}", Uuid::new_v4().simple())
}

/// One license session.
///
/// Methods returning `Result<()>` report success statuses of the license
/// protocol (keys added, message generated) as `Ok`.
pub trait LicenseSession: Send {
    /// Open the crypto session and load the device certificate. Fails with
    /// [`Error::NeedProvisioning`](crate::error::Error::NeedProvisioning)
    /// when the requested level has no certificate.
    fn init(&mut self) -> Result<()>;

    fn session_id(&self) -> &str;
    fn key_set_id(&self) -> &str;
    fn requested_security_level(&self) -> RequestedSecurityLevel;
    fn crypto_session(&self) -> &CryptoSession;

    fn generate_key_request(
        &mut self,
        init_data: &InitData,
        license_type: LicenseType,
        app_parameters: &AppParameterMap,
    ) -> Result<KeyRequest>;
    fn add_key(&mut self, response: &[u8]) -> Result<()>;
    fn restore_offline_session(
        &mut self,
        key_set_id: &str,
        license_type: LicenseType,
    ) -> Result<()>;
    fn remove_keys(&mut self);
    fn generate_renewal_request(&mut self) -> Result<KeyRequest>;
    fn renew_key(&mut self, response: &[u8]) -> Result<()>;

    fn query_status(&self) -> Result<QueryMap>;
    fn query_key_status(&self) -> Result<QueryMap>;
    /// Fails with [`Error::KeyNotFound`](crate::error::Error::KeyNotFound)
    /// when the key is not part of this session's license.
    fn query_key_allowed_usage(&self, key_id: &[u8]) -> Result<KeyAllowedUsage>;

    fn license_received(&self) -> bool;
    fn is_release(&self) -> bool;
    fn is_offline(&self) -> bool;
    fn has_provider_session_token(&self) -> bool;
    fn is_key_loaded(&self, key_id: &[u8]) -> bool;
    /// Seconds of license validity left.
    fn duration_remaining(&self) -> i64;

    fn notify_resolution(&mut self, width: u32, height: u32);
    /// Periodic policy tick.
    fn on_timer_event(&mut self, update_usage: bool);
    /// Another session released `key_set_id`.
    fn on_key_release_event(&mut self, key_set_id: &str);

    fn is_initial_usage_update(&self) -> bool;
    fn is_usage_update_needed(&self) -> bool;
    fn reset_usage_flags(&mut self);
    fn update_usage_entry_information(&mut self) -> Result<()>;

    fn update_usage_table_information(&mut self) -> Result<()> {
        self.crypto_session().update_usage_information()
    }

    fn usage_support_type(&self) -> Option<UsageSupportType> {
        self.crypto_session().usage_support_type().ok()
    }

    fn query_oemcrypto_session_id(&self) -> Result<QueryMap> {
        let handle = self
            .crypto_session()
            .handle()
            .ok_or(crate::error::Error::CryptoSessionNotOpen)?;
        let BoundaryHandle(id) = handle;
        let mut map = QueryMap::new();
        map.insert(QUERY_KEY_OEMCRYPTO_SESSION_ID.to_string(), id.to_string());
        Ok(map)
    }

    fn decrypt(&mut self, params: &mut DecryptParams<'_>) -> Result<()> {
        self.crypto_session().decrypt(params)
    }

    fn generic_encrypt(
        &mut self,
        input: &[u8],
        key_id: &[u8],
        iv: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> Result<Vec<u8>> {
        self.crypto_session()
            .generic_encrypt(input, key_id, iv, algorithm)
    }

    fn generic_decrypt(
        &mut self,
        input: &[u8],
        key_id: &[u8],
        iv: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> Result<Vec<u8>> {
        self.crypto_session()
            .generic_decrypt(input, key_id, iv, algorithm)
    }

    fn generic_sign(
        &mut self,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
    ) -> Result<Vec<u8>> {
        self.crypto_session().generic_sign(message, key_id, algorithm)
    }

    fn generic_verify(
        &mut self,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
        signature: &[u8],
    ) -> Result<()> {
        self.crypto_session()
            .generic_verify(message, key_id, algorithm, signature)
    }
}

/// Device certificate provisioning flow.
pub trait CertificateProvisioning: Send {
    fn init(&mut self, service_certificate: &[u8]) -> Result<()>;
    fn get_provisioning_request(
        &mut self,
        security_level: RequestedSecurityLevel,
        cert_type: CertificateType,
        cert_authority: &str,
    ) -> Result<ProvisioningRequest>;
    fn handle_provisioning_response(&mut self, response: &[u8]) -> Result<ProvisionedCertificate>;
}

/// Creates the engine's collaborators.
pub trait SessionFactory: Send + Sync {
    /// Build an uninitialized session. The engine calls
    /// [`LicenseSession::init`] next.
    fn create_session(
        &self,
        context: &Arc<CryptoContext>,
        property_set: Option<&PropertySet>,
        forced_session_id: Option<&str>,
        listener: Option<Arc<dyn EventListener>>,
    ) -> Box<dyn LicenseSession>;

    fn create_provisioning(&self, context: &Arc<CryptoContext>) -> Box<dyn CertificateProvisioning>;

    /// Sharing group of `session_id`. Sessions in the same group may decrypt
    /// with each other's keys.
    fn session_sharing_id(&self, _session_id: &str) -> u32 {
        0
    }
}
