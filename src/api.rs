use std::sync::Arc;

use zeroize::Zeroizing;

use crate::backend::bio::Bio;

/// log2 of the unit sector. All bio sector numbers are counted in these.
pub const SECTOR_SHIFT: u32 = 9;
/// The unit sector: 512 bytes, matching the lower block layer's addressing.
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;
/// Size of one pool page. Output clones for writes are built from these.
pub const PAGE_SIZE: usize = 4096;
/// Smallest supported crypto sector.
pub const MIN_SECTOR_SIZE: usize = 512;
/// Largest supported crypto sector. Must not exceed [`PAGE_SIZE`], because a
/// crypto sector is never allowed to straddle a page boundary.
pub const MAX_SECTOR_SIZE: usize = 4096;
/// Largest IV any supported mode produces (an AES block).
pub const MAX_IV_SIZE: usize = 16;

bitflags! {
    /// Mapping-wide state and feature bits. Immutable after construction
    /// except for SUSPENDED and KEY_VALID.
    pub struct CryptFlags: u32 {
        const SUSPENDED        = 0b0000_0001;
        const KEY_VALID        = 0b0000_0010;
        const SAME_CPU         = 0b0000_0100;
        const NO_OFFLOAD       = 0b0000_1000;
        const INTEGRITY_AEAD   = 0b0001_0000;
        const IV_LARGE_SECTORS = 0b0010_0000;
        const ALLOW_DISCARDS   = 0b0100_0000;
    }
}

/// Terminal status of one upper I/O. The first non-`Ok` status latched on an
/// I/O context sticks; later stages only short-circuit cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Ok,
    /// Generic failure: lower-device error or a non-integrity crypto error.
    IoError,
    /// An integrity tag failed verification.
    Protection,
    /// Allocation failure under a no-wait submission.
    Resource,
}

impl IoStatus {
    pub fn is_ok(&self) -> bool { *self == IoStatus::Ok }
}

/// Errors raised while parsing the table line or assembling the mapping.
/// Construction failures never leave a partial mapping behind.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid cipher spec: {0}")]
    CipherSpec(String),
    #[error("unsupported cipher or chainmode: {0}")]
    UnsupportedCipher(String),
    #[error("unsupported IV mode: {0}")]
    UnsupportedIvMode(String),
    #[error("IV mode {mode} requires sector size {required}, got {got}")]
    IvSectorSize { mode: &'static str, required: usize, got: usize },
    #[error("invalid sector size {0} (must be a power of two in 512..=4096)")]
    SectorSize(usize),
    #[error("invalid feature argument: {0}")]
    Feature(String),
    #[error("invalid device geometry: {0}")]
    Geometry(String),
    #[error("integrity tag space too small: {0}")]
    IntegritySpace(String),
    #[error("wrong number of table arguments")]
    ArgCount,
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Errors raised while decoding or installing key material. `KEY_VALID`
/// stays clear after any of these; in-flight I/O keeps the old key.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key size {0}")]
    Size(usize),
    #[error("key contains invalid hex")]
    Hex,
    #[error("malformed keyring reference: {0}")]
    KeyringRef(String),
    #[error("keyring lookup failed: {0}")]
    Lookup(String),
    #[error("keyring payload length {got} does not match key size {want}")]
    PayloadLength { got: usize, want: usize },
    #[error("no keyring service configured")]
    NoKeyring,
    #[error("operation requires a suspended mapping")]
    NotSuspended,
    #[error("key material is not valid")]
    NotValid,
    #[error("cipher rejected key: {0}")]
    Rejected(String),
}

/// Errors surfaced by a cipher engine while processing one sector.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("integrity tag mismatch")]
    BadTag,
    #[error("no key installed")]
    NoKey,
    #[error("engine failure: {0}")]
    Failed(&'static str),
}

/// Keyring key types the table syntax can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    User,
    Logon,
}

/// The external key-storage service, consumed by lookup only. Payload bytes
/// come back in a wipe-on-drop buffer.
pub trait KeyringService: Send + Sync {
    fn lookup(&self, ktype: KeyType, description: &str) -> Result<Zeroizing<Vec<u8>>, KeyError>;
}

/// The lower block device. `submit` consumes the descriptor and must
/// eventually fire its completion exactly once, on any thread.
///
/// Devices that carry per-sector integrity metadata implement the sideband:
/// on writes the descriptor's integrity buffer is persisted alongside the
/// data; on reads it is filled before completion.
pub trait BlockDevice: Send + Sync {
    /// Capacity in 512-byte sectors.
    fn sectors(&self) -> u64;
    /// Bytes of integrity metadata carried per 512-byte sector, 0 if none.
    fn integrity_bytes_per_sector(&self) -> usize { 0 }
    /// Name echoed in status output.
    fn name(&self) -> String;
    fn submit(&self, bio: Bio);
    /// Flush any volatile write cache.
    fn flush(&self) {}
}

/// Shared handle to a lower device.
pub type DeviceHandle = Arc<dyn BlockDevice>;
