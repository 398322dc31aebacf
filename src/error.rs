//! Error types for rswvcdm.
//!
//! Every public engine operation returns [`Result`]. Success statuses of the
//! engine (keys added, request generated) are plain `Ok` values; every other
//! status is a variant of [`Error`].

use thiserror::Error;

use crate::boundary::BoundaryError;

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed argument, unknown identifier. Never retried.
    CallerMisuse,
    /// Too many sessions, keys or usage entries. Retry after releasing some.
    ResourceExhausted,
    /// The device must be provisioned before the operation can succeed.
    ProvisioningRequired,
    /// Signature, key or output-protection failure. Fatal to the operation.
    Integrity,
    /// Trust boundary or local failure, surfaced as-is.
    Boundary,
}

/// Why a usage table header or usage entry could not be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageLoadFailure {
    GenerationSkew,
    SignatureFailure,
    BadMagic,
    Unknown,
}

/// Main error type for rswvcdm operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The key system string does not name this DRM scheme.
    #[error("Invalid key system: {0}")]
    InvalidKeySystem(String),

    /// A required parameter was not supplied.
    #[error("Required parameter missing: {0}")]
    ParameterNull(&'static str),

    /// A forced session id is already in use.
    #[error("Session identifier {0:?} already exists")]
    DuplicateSessionId(String),

    /// No live session has this identifier.
    #[error("Session identifier {0:?} not found")]
    SessionNotFound(String),

    /// No live session can serve the decrypt request.
    #[error("No session found for decrypt")]
    SessionNotFoundForDecrypt,

    /// The session id must be empty for this request.
    #[error("Session identifier {0:?} is not valid here")]
    InvalidSessionId(String),

    /// A key set id is required but empty.
    #[error("Key set identifier is empty")]
    EmptyKeySetId,

    /// No release session is mapped to this key set id.
    #[error("Key set identifier {0:?} not found")]
    KeySetIdNotFound(String),

    /// License response payload is empty.
    #[error("Key response data is empty")]
    EmptyKeyData,

    /// Invalid argument value.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Decrypt parameters are incomplete.
    #[error("Invalid decrypt parameters: {0}")]
    InvalidDecryptParameters(&'static str),

    /// Unknown status query token.
    #[error("Unknown query key: {0}")]
    InvalidQueryKey(String),

    /// The operation is not valid for the current key session.
    #[error("Invalid context: {0}")]
    InvalidContext(String),

    /// A crypto session operation was attempted before `open`.
    #[error("Crypto session is not open")]
    CryptoSessionNotOpen,

    /// Provisioning response payload is empty.
    #[error("Provisioning response is empty")]
    EmptyProvisioningResponse,

    /// Provisioning state was released and the device is not provisioned.
    #[error("No provisioning in progress and device is not provisioned")]
    EmptyProvisioningCertificate,

    /// Key id not present in any session.
    #[error("Key not found")]
    KeyNotFound,

    /// Two sessions disagree on the allowed usage of one key.
    #[error("Conflicting key usage across sessions")]
    KeyConflict,

    /// The trust boundary cannot take more sessions, keys or entries.
    #[error("Insufficient crypto resources")]
    InsufficientCryptoResources,

    /// The device needs a provisioned certificate.
    #[error("Device needs provisioning")]
    NeedProvisioning,

    /// Opening a session failed for lack of a certificate. The id is
    /// reserved so the caller can retry after provisioning.
    #[error("Session {0:?} needs provisioning")]
    SessionNeedsProvisioning(String),

    /// The boundary could not report its provisioning method.
    #[error("Unable to determine provisioning method")]
    GetProvisioningMethodError,

    /// The device system id could not be read.
    #[error("Unable to load system id")]
    LoadSystemIdError,

    /// Keys could not be loaded into the trust boundary.
    #[error("Failed to load keys")]
    LoadKeyError,

    /// A license renewal could not be applied.
    #[error("Failed to refresh keys")]
    RefreshKeysError,

    /// The selected key expired or is not usable yet.
    #[error("Key expired or not yet usable")]
    NeedKey,

    /// The boundary has no device key.
    #[error("No device key")]
    NoDeviceKey,

    /// The requested content key is not loaded.
    #[error("No content key")]
    NoContentKey,

    /// Key selection failed for an unclassified reason.
    #[error("Key selection failed: {0:?}")]
    SelectKeyError(BoundaryError),

    /// Output protection (HDCP) is insufficient for this key.
    #[error("Insufficient output protection")]
    InsufficientOutputProtection,

    /// Analog output is not permitted for this key.
    #[error("Analog output not permitted")]
    AnalogOutputError,

    /// Sample decryption failed.
    #[error("Decrypt failed")]
    DecryptError,

    /// A secure destination buffer was requested but is not available.
    #[error("Secure buffer required")]
    SecureBufferRequired,

    /// The boundary cannot switch to the requested cipher mode.
    #[error("Incorrect crypto mode")]
    IncorrectCryptoMode,

    /// The usage entry was already deactivated.
    #[error("Key canceled")]
    KeyCanceled,

    /// The trust boundary rejected the session handle.
    #[error("Invalid crypto session")]
    InvalidSession,

    /// The boundary API version could not be read.
    #[error("Unable to read API version for usage support")]
    UsageSupportGetApiFailed,

    /// Usage table support could not be determined.
    #[error("Unable to determine usage table support")]
    UsageInformationSupportFailed,

    #[error("Failed to create usage table header")]
    CreateUsageTableError,

    #[error("Failed to load usage table header: {0:?}")]
    LoadUsageHeader(UsageLoadFailure),

    #[error("Failed to create usage entry")]
    CreateUsageEntryError,

    #[error("Failed to load usage entry: {0:?}")]
    LoadUsageEntry(UsageLoadFailure),

    #[error("Failed to update usage entry")]
    UpdateUsageEntryError,

    #[error("Failed to shrink usage table header")]
    ShrinkUsageTableHeaderError,

    #[error("Failed to move usage entry")]
    MoveUsageEntryError,

    /// A boundary primitive failed with the given code.
    #[error("{operation} failed: {code:?}")]
    Boundary {
        operation: &'static str,
        code: BoundaryError,
    },

    /// Config parse error.
    #[error("Config error: {0}")]
    Config(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Unclassified failure.
    #[error("Unknown error")]
    UnknownError,

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidKeySystem(_)
            | Error::ParameterNull(_)
            | Error::DuplicateSessionId(_)
            | Error::SessionNotFound(_)
            | Error::SessionNotFoundForDecrypt
            | Error::InvalidSessionId(_)
            | Error::EmptyKeySetId
            | Error::KeySetIdNotFound(_)
            | Error::EmptyKeyData
            | Error::InvalidParameters(_)
            | Error::InvalidDecryptParameters(_)
            | Error::InvalidQueryKey(_)
            | Error::InvalidContext(_)
            | Error::CryptoSessionNotOpen
            | Error::EmptyProvisioningResponse
            | Error::EmptyProvisioningCertificate
            | Error::KeyNotFound
            | Error::KeyConflict => ErrorKind::CallerMisuse,
            Error::InsufficientCryptoResources => ErrorKind::ResourceExhausted,
            Error::NeedProvisioning
            | Error::SessionNeedsProvisioning(_)
            | Error::GetProvisioningMethodError => {
                ErrorKind::ProvisioningRequired
            }
            Error::LoadKeyError
            | Error::RefreshKeysError
            | Error::NeedKey
            | Error::NoDeviceKey
            | Error::NoContentKey
            | Error::SelectKeyError(_)
            | Error::InsufficientOutputProtection
            | Error::AnalogOutputError
            | Error::DecryptError
            | Error::SecureBufferRequired
            | Error::IncorrectCryptoMode
            | Error::KeyCanceled
            | Error::LoadUsageHeader(UsageLoadFailure::SignatureFailure)
            | Error::LoadUsageEntry(UsageLoadFailure::SignatureFailure) => ErrorKind::Integrity,
            _ => ErrorKind::Boundary,
        }
    }

    /// True when the caller should run provisioning and retry.
    pub fn needs_provisioning(&self) -> bool {
        self.kind() == ErrorKind::ProvisioningRequired
    }

    /// True when releasing sessions or keys may let a retry succeed.
    pub fn is_retryable_after_release(&self) -> bool {
        self.kind() == ErrorKind::ResourceExhausted
    }
}

/// Result type alias for rswvcdm operations.
pub type Result<T> = std::result::Result<T, Error>;
