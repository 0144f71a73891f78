use crate::errors::{NsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Recognized block-checksum kinds, as accepted at configuration time (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    Adler,
    Crc32,
    Crc32c,
    Crc64,
    Md5,
    Sha1,
    Sha256,
    Blake3,
    Xxhash64,
}

impl ChecksumKind {
    /// Width in bytes of one block's stored checksum (K in §3/§6).
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            ChecksumKind::Adler | ChecksumKind::Crc32 | ChecksumKind::Crc32c => 4,
            ChecksumKind::Crc64 | ChecksumKind::Xxhash64 => 8,
            ChecksumKind::Md5 => 16,
            ChecksumKind::Sha1 => 20,
            ChecksumKind::Sha256 | ChecksumKind::Blake3 => 32,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ChecksumKind::Adler => "adler",
            ChecksumKind::Crc32 => "crc32",
            ChecksumKind::Crc32c => "crc32c",
            ChecksumKind::Crc64 => "crc64",
            ChecksumKind::Md5 => "md5",
            ChecksumKind::Sha1 => "sha1",
            ChecksumKind::Sha256 => "sha256",
            ChecksumKind::Blake3 => "blake3",
            ChecksumKind::Xxhash64 => "xxhash64",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "adler" => ChecksumKind::Adler,
            "crc32" => ChecksumKind::Crc32,
            "crc32c" => ChecksumKind::Crc32c,
            "crc64" => ChecksumKind::Crc64,
            "md5" => ChecksumKind::Md5,
            "sha1" => ChecksumKind::Sha1,
            "sha256" => ChecksumKind::Sha256,
            "blake3" => ChecksumKind::Blake3,
            "xxhash64" => ChecksumKind::Xxhash64,
            other => return Err(NsError::Invalid(format!("unknown checksum kind: {other}"))),
        })
    }
}

/// Crate-wide configuration, parsed from a TOML file or built
/// programmatically. Mirrors the teacher's use of `toml` + `serde` for
/// configuration, but scoped to the namespace/block-xs/drainer knobs this
/// core actually has.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path of the change-log journal backing the container service.
    pub container_log_path: PathBuf,
    /// Path of the change-log journal backing the file service.
    pub file_log_path: PathBuf,
    /// Default checksum kind for newly created block-xs maps.
    #[serde(default = "default_checksum_kind")]
    pub checksum_kind: ChecksumKind,
    /// Block size, in bytes, for new block-xs maps. Must be a power of two.
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Drainer tuning knobs.
    #[serde(default)]
    pub drainer: DrainerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainerConfig {
    #[serde(default = "default_cache_expiry")]
    pub cache_expiry_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u16,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_batch_size")]
    pub fid_batch_size: usize,
}

const fn default_checksum_kind() -> ChecksumKind {
    ChecksumKind::Crc32c
}
const fn default_block_size() -> u64 {
    4 * 1024 * 1024
}
const fn default_cache_expiry() -> u64 {
    300
}
const fn default_max_retries() -> u16 {
    5
}
const fn default_retry_backoff() -> u64 {
    60
}
const fn default_max_in_flight() -> usize {
    1000
}
const fn default_batch_size() -> usize {
    1000
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            cache_expiry_secs: default_cache_expiry(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff(),
            max_in_flight: default_max_in_flight(),
            fid_batch_size: default_batch_size(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns `NsError::Invalid` if the file cannot be read or parsed, or if
    /// `block_size` is not a power of two.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| NsError::Invalid(format!("reading config {}: {e}", path.display())))?;
        let cfg: Config = toml::from_str(&text)
            .map_err(|e| NsError::Invalid(format!("parsing config {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(NsError::Invalid(format!(
                "block_size must be a power of two, got {}",
                self.block_size
            )));
        }
        if self.container_log_path.as_os_str().is_empty()
            || self.file_log_path.as_os_str().is_empty()
        {
            return Err(NsError::Invalid("changelog paths must be set".into()));
        }
        Ok(())
    }
}
