//! Trust boundary interface.
//!
//! Raw key material lives behind [`CryptoBoundary`]. The engine only ever
//! holds opaque [`BoundaryHandle`]s and asks the boundary to load, select and
//! use keys on its behalf. Calls that return variable length data follow the
//! short buffer convention: when the output slice is too small the boundary
//! answers [`BoundaryError::ShortBuffer`] with the sizes it needs, and the
//! caller retries once with resized buffers (see [`probe_and_fill`]).

/// Result type for boundary primitives.
pub type BoundaryResult<T> = std::result::Result<T, BoundaryError>;

/// Buffer sizes required by a boundary call that rejected its output buffers.
///
/// Calls with a single output only use `primary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferSizes {
    pub primary: usize,
    pub secondary: usize,
}

impl BufferSizes {
    pub fn single(primary: usize) -> Self {
        Self {
            primary,
            secondary: 0,
        }
    }
}

/// Result codes reported by the trust boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryError {
    ShortBuffer(BufferSizes),
    TooManySessions,
    TooManyKeys,
    UsageTableUnrecoverable,
    BufferTooLarge,
    NotImplemented,
    KeyExpired,
    InvalidSession,
    NoDeviceKey,
    NoContentKey,
    InsufficientResources,
    InsufficientHdcp,
    AnalogOutput,
    DecryptFailed,
    ControlInvalid,
    KeyboxInvalid,
    InvalidContext,
    WarningGenerationSkew,
    GenerationSkew,
    SignatureFailure,
    BadMagic,
    UnknownFailure,
}

/// Opaque identifier of one session inside the trust boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoundaryHandle(pub u32);

/// Security level a session asks the boundary for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestedSecurityLevel {
    /// Highest level the device offers.
    #[default]
    Default,
    /// Force the software (L3) boundary.
    L3,
}

/// Security level reported by the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityLevel {
    Uninitialized,
    L1,
    L2,
    L3,
    Unknown,
}

impl SecurityLevel {
    /// Parse the boundary's `"L1"`/`"L2"`/`"L3"` string.
    pub fn from_boundary_str(level: &str) -> Self {
        match level {
            "L1" => SecurityLevel::L1,
            "L2" => SecurityLevel::L2,
            "L3" => SecurityLevel::L3,
            _ => SecurityLevel::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Uninitialized => "Uninitialized",
            SecurityLevel::L1 => "L1",
            SecurityLevel::L2 => "L2",
            SecurityLevel::L3 => "L3",
            SecurityLevel::Unknown => "Unknown",
        }
    }
}

/// Root of trust the device was provisioned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningMethod {
    Keybox,
    OemCertificate,
    DrmCertificate,
}

/// AES cipher mode a key is selected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherMode {
    #[default]
    Ctr,
    Cbc,
}

/// License type tag attached to a key load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseType {
    Content,
    Entitlement,
}

/// Algorithms understood by the boundary's generic crypto primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericAlgorithm {
    AesCbc128NoPadding,
    HmacSha256,
}

/// Output protection level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdcpCapability {
    None,
    V1,
    V2,
    V2_1,
    V2_2,
    NoDigitalOutput,
}

/// Status byte of a usage report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageEntryStatus {
    Unused,
    Active,
    Inactive,
    InactiveUsed,
    InactiveUnused,
    Unknown(u8),
}

impl From<u8> for UsageEntryStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => UsageEntryStatus::Unused,
            1 => UsageEntryStatus::Active,
            2 => UsageEntryStatus::Inactive,
            3 => UsageEntryStatus::InactiveUsed,
            4 => UsageEntryStatus::InactiveUnused,
            other => UsageEntryStatus::Unknown(other),
        }
    }
}

/// Bit flags returned by [`CryptoBoundary::supported_certificates`].
pub const SUPPORTS_RSA_2048: u32 = 0x1;
pub const SUPPORTS_RSA_3072: u32 = 0x2;
pub const SUPPORTS_RSA_CAST: u32 = 0x10;

/// Bit flags returned by [`CryptoBoundary::analog_output_flags`].
pub const ANALOG_OUTPUT_SUPPORTED: u32 = 0x1;
pub const ANALOG_OUTPUT_CGMS_A: u32 = 0x2;
pub const ANALOG_OUTPUT_CAN_DISABLE: u32 = 0x4;

/// Subsample flags.
pub const FIRST_SUBSAMPLE: u8 = 1;
pub const LAST_SUBSAMPLE: u8 = 2;

/// Where decrypted output goes.
///
/// The boundary may modify the descriptor it is given, so chunked calls
/// rebuild one per chunk.
#[derive(Debug)]
pub enum DestBufferDesc<'a> {
    /// Caller memory.
    Clear { buffer: &'a mut [u8] },
    /// Secure memory referenced by an opaque handle.
    Secure {
        handle: u64,
        offset: usize,
        max_length: usize,
    },
    /// Straight to the output pipeline.
    Direct { is_video: bool },
}

/// CENC pattern: `encrypt` encrypted blocks followed by `skip` clear blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatternDescriptor {
    pub encrypt: usize,
    pub skip: usize,
}

impl PatternDescriptor {
    /// Length of one pattern repetition in bytes, 0 when there is no pattern.
    /// Saturates at `usize::MAX`.
    pub fn length_in_bytes(&self) -> usize {
        self.checked_length_in_bytes().unwrap_or(usize::MAX)
    }

    /// Like [`Self::length_in_bytes`], `None` on overflow.
    pub fn checked_length_in_bytes(&self) -> Option<usize> {
        self.encrypt
            .checked_add(self.skip)?
            .checked_mul(crate::decrypt::AES_BLOCK_SIZE)
    }
}

/// One subsample handed to [`CryptoBoundary::decrypt_cenc`].
#[derive(Debug, Clone, Copy)]
pub struct CencSample<'a> {
    pub data: &'a [u8],
    pub is_encrypted: bool,
    pub iv: [u8; 16],
    pub block_offset: usize,
    pub subsample_flags: u8,
}

/// One key in a load request.
#[derive(Debug, Clone, Copy)]
pub struct KeyObject<'a> {
    pub key_id: &'a [u8],
    pub key_data_iv: &'a [u8],
    pub key_data: &'a [u8],
    /// Absent when the key carries no control block.
    pub key_control_iv: Option<&'a [u8]>,
    pub key_control: Option<&'a [u8]>,
    pub cipher_mode: CipherMode,
}

/// Arguments of [`CryptoBoundary::load_keys`].
#[derive(Debug, Clone, Copy)]
pub struct LoadKeysRequest<'a> {
    pub message: &'a [u8],
    pub signature: &'a [u8],
    /// Both are `None` when the license carries no MAC keys.
    pub enc_mac_key_iv: Option<&'a [u8]>,
    pub enc_mac_keys: Option<&'a [u8]>,
    pub keys: &'a [KeyObject<'a>],
    pub provider_session_token: Option<&'a [u8]>,
    pub srm_requirement: Option<&'a [u8]>,
    pub license_type: LicenseType,
}

/// One content key unlocked by an entitlement key.
#[derive(Debug, Clone, Copy)]
pub struct EntitledContentKey<'a> {
    pub entitlement_key_id: &'a [u8],
    pub content_key_id: &'a [u8],
    pub content_key_data_iv: &'a [u8],
    pub content_key_data: &'a [u8],
}

/// One key in a renewal.
#[derive(Debug, Clone, Copy)]
pub struct KeyRefreshObject<'a> {
    /// `None` refreshes every key in the session.
    pub key_id: Option<&'a [u8]>,
    pub key_control_iv: Option<&'a [u8]>,
    pub key_control: &'a [u8],
}

/// The hardware crypto engine.
///
/// Implementations are shared across threads; every method takes `&self`.
/// Methods addressing a `level` are device-wide, the others act on one open
/// session.
pub trait CryptoBoundary: Send + Sync {
    fn initialize(&self) -> BoundaryResult<()>;
    fn terminate(&self) -> BoundaryResult<()>;

    fn open_session(&self, level: RequestedSecurityLevel) -> BoundaryResult<BoundaryHandle>;
    fn close_session(&self, handle: BoundaryHandle) -> BoundaryResult<()>;

    fn provisioning_method(&self, level: RequestedSecurityLevel)
        -> BoundaryResult<ProvisioningMethod>;
    /// Keybox key data, written into `out`. Returns the length written.
    fn get_key_data(&self, level: RequestedSecurityLevel, out: &mut [u8]) -> BoundaryResult<usize>;
    /// DER encoded OEM certificate. Returns the length written.
    fn get_oem_public_certificate(
        &self,
        handle: BoundaryHandle,
        out: &mut [u8],
    ) -> BoundaryResult<usize>;
    fn get_device_id(&self, level: RequestedSecurityLevel, out: &mut [u8]) -> BoundaryResult<usize>;
    /// `"L1"`, `"L2"` or `"L3"`. `None` when the boundary cannot tell.
    fn security_level(&self, level: RequestedSecurityLevel) -> Option<String>;
    fn api_version(&self, level: RequestedSecurityLevel) -> BoundaryResult<u32>;
    fn security_patch_level(&self, level: RequestedSecurityLevel) -> u8;
    fn supports_usage_table(&self, level: RequestedSecurityLevel) -> bool;
    fn get_random(&self, out: &mut [u8]) -> BoundaryResult<()>;

    fn generate_derived_keys(
        &self,
        handle: BoundaryHandle,
        mac_context: &[u8],
        enc_context: &[u8],
    ) -> BoundaryResult<()>;
    fn derive_keys_from_session_key(
        &self,
        handle: BoundaryHandle,
        enc_session_key: &[u8],
        mac_context: &[u8],
        enc_context: &[u8],
    ) -> BoundaryResult<()>;
    fn load_keys(&self, handle: BoundaryHandle, request: &LoadKeysRequest<'_>)
        -> BoundaryResult<()>;
    fn load_entitled_content_keys(
        &self,
        handle: BoundaryHandle,
        keys: &[EntitledContentKey<'_>],
    ) -> BoundaryResult<()>;
    fn refresh_keys(
        &self,
        handle: BoundaryHandle,
        message: &[u8],
        signature: &[u8],
        keys: &[KeyRefreshObject<'_>],
    ) -> BoundaryResult<()>;
    fn select_key(&self, handle: BoundaryHandle, key_id: &[u8], mode: CipherMode)
        -> BoundaryResult<()>;
    fn load_device_rsa_key(&self, handle: BoundaryHandle, wrapped_key: &[u8])
        -> BoundaryResult<()>;
    fn generate_nonce(&self, handle: BoundaryHandle) -> BoundaryResult<u32>;

    fn decrypt_cenc(
        &self,
        handle: BoundaryHandle,
        sample: &CencSample<'_>,
        dest: &mut DestBufferDesc<'_>,
        pattern: &PatternDescriptor,
    ) -> BoundaryResult<()>;
    fn copy_buffer(
        &self,
        level: RequestedSecurityLevel,
        data: &[u8],
        dest: &mut DestBufferDesc<'_>,
        subsample_flags: u8,
    ) -> BoundaryResult<()>;

    fn generic_encrypt(
        &self,
        handle: BoundaryHandle,
        input: &[u8],
        iv: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> BoundaryResult<()>;
    fn generic_decrypt(
        &self,
        handle: BoundaryHandle,
        input: &[u8],
        iv: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> BoundaryResult<()>;
    fn generic_sign(
        &self,
        handle: BoundaryHandle,
        message: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> BoundaryResult<usize>;
    fn generic_verify(
        &self,
        handle: BoundaryHandle,
        message: &[u8],
        algorithm: GenericAlgorithm,
        signature: &[u8],
    ) -> BoundaryResult<()>;
    /// HMAC-SHA256 with the derived client MAC key.
    fn generate_signature(
        &self,
        handle: BoundaryHandle,
        message: &[u8],
        out: &mut [u8],
    ) -> BoundaryResult<usize>;
    /// RSA-PSS with the loaded device key.
    fn generate_rsa_signature(
        &self,
        handle: BoundaryHandle,
        message: &[u8],
        out: &mut [u8],
    ) -> BoundaryResult<usize>;

    /// Current and maximum output protection.
    fn hdcp_capability(
        &self,
        level: RequestedSecurityLevel,
    ) -> BoundaryResult<(HdcpCapability, HdcpCapability)>;
    fn supported_certificates(&self, level: RequestedSecurityLevel) -> u32;
    fn number_of_open_sessions(&self, level: RequestedSecurityLevel) -> BoundaryResult<usize>;
    fn max_number_of_sessions(&self, level: RequestedSecurityLevel) -> BoundaryResult<usize>;

    fn current_srm_version(&self) -> BoundaryResult<u16> {
        Err(BoundaryError::NotImplemented)
    }
    fn is_srm_update_supported(&self) -> bool {
        false
    }
    fn load_srm(&self, _srm: &[u8]) -> BoundaryResult<()> {
        Err(BoundaryError::NotImplemented)
    }
    fn analog_output_flags(&self, _level: RequestedSecurityLevel) -> u32 {
        0
    }
    fn is_anti_rollback_hw_present(&self, _level: RequestedSecurityLevel) -> bool {
        false
    }

    fn update_usage_table(&self) -> BoundaryResult<()>;
    fn deactivate_usage_entry(&self, handle: BoundaryHandle, pst: &[u8]) -> BoundaryResult<()>;
    fn report_usage(
        &self,
        handle: BoundaryHandle,
        pst: &[u8],
        out: &mut [u8],
    ) -> BoundaryResult<usize>;
    fn delete_usage_entry(
        &self,
        handle: BoundaryHandle,
        pst: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> BoundaryResult<()>;
    fn force_delete_usage_entry(&self, pst: &[u8]) -> BoundaryResult<()>;
    fn delete_old_usage_table(&self) -> BoundaryResult<()>;
    fn create_usage_table_header(
        &self,
        level: RequestedSecurityLevel,
        out: &mut [u8],
    ) -> BoundaryResult<usize>;
    fn load_usage_table_header(
        &self,
        level: RequestedSecurityLevel,
        header: &[u8],
    ) -> BoundaryResult<()>;
    fn create_new_usage_entry(&self, handle: BoundaryHandle) -> BoundaryResult<u32>;
    fn load_usage_entry(&self, handle: BoundaryHandle, index: u32, entry: &[u8])
        -> BoundaryResult<()>;
    /// Writes the new header and entry. Returns both lengths.
    fn update_usage_entry(
        &self,
        handle: BoundaryHandle,
        header_out: &mut [u8],
        entry_out: &mut [u8],
    ) -> BoundaryResult<BufferSizes>;
    fn shrink_usage_table_header(
        &self,
        level: RequestedSecurityLevel,
        new_entry_count: u32,
        out: &mut [u8],
    ) -> BoundaryResult<usize>;
    fn move_entry(&self, handle: BoundaryHandle, new_index: u32) -> BoundaryResult<()>;
}

/// Run a boundary call that may answer `ShortBuffer`.
///
/// `probe` runs against the caller's current buffers. If it reports a short
/// buffer, `fill` gets the required sizes, resizes and calls again. Any other
/// outcome of `probe` is returned unchanged.
pub fn probe_and_fill<B, T>(
    buffers: &mut B,
    probe: impl FnOnce(&mut B) -> BoundaryResult<T>,
    fill: impl FnOnce(&mut B, BufferSizes) -> BoundaryResult<T>,
) -> BoundaryResult<T> {
    match probe(buffers) {
        Err(BoundaryError::ShortBuffer(sizes)) => fill(buffers, sizes),
        other => other,
    }
}

/// Read a variable length value into a fresh vector.
///
/// The first call gets `initial_len` bytes of room (0 asks for the size
/// only); the result is truncated to the length the boundary reports.
pub fn read_into_vec(
    initial_len: usize,
    call: impl FnMut(&mut [u8]) -> BoundaryResult<usize>,
) -> BoundaryResult<Vec<u8>> {
    let mut state = (vec![0u8; initial_len], call);
    let len = probe_and_fill(
        &mut state,
        |(buf, call)| call(buf.as_mut_slice()),
        |(buf, call), sizes| {
            buf.resize(sizes.primary, 0);
            call(buf.as_mut_slice())
        },
    )?;
    let (mut buf, _) = state;
    buf.truncate(len);
    Ok(buf)
}
