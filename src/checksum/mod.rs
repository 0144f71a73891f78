//! Per-block checksum computation, dispatching over the configured
//! `ChecksumKind` (§4.6, §6).

use crate::config::ChecksumKind;
use crc::{Crc, CRC_64_XZ};
use digest::Digest;
use twox_hash::XxHash64;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Compute the stored checksum value for one block's worth of bytes.
/// Output length always equals `kind.width()`.
#[must_use]
pub fn compute(kind: ChecksumKind, data: &[u8]) -> Vec<u8> {
    match kind {
        ChecksumKind::Adler => adler32::RollingAdler32::from_buffer(data).hash().to_be_bytes().to_vec(),
        ChecksumKind::Crc32 => crc32fast::hash(data).to_be_bytes().to_vec(),
        ChecksumKind::Crc32c => crc32c::crc32c(data).to_be_bytes().to_vec(),
        ChecksumKind::Crc64 => CRC64.checksum(data).to_be_bytes().to_vec(),
        ChecksumKind::Md5 => md5::Md5::digest(data).to_vec(),
        ChecksumKind::Sha1 => sha1::Sha1::digest(data).to_vec(),
        ChecksumKind::Sha256 => sha2::Sha256::digest(data).to_vec(),
        ChecksumKind::Blake3 => blake3::hash(data).as_bytes().to_vec(),
        ChecksumKind::Xxhash64 => {
            use std::hash::Hasher;
            let mut hasher = XxHash64::with_seed(0);
            hasher.write(data);
            hasher.finish().to_be_bytes().to_vec()
        }
    }
}

/// Verify `stored` against a freshly computed checksum of `data`.
#[must_use]
pub fn verify(kind: ChecksumKind, data: &[u8], stored: &[u8]) -> bool {
    compute(kind, data) == stored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_its_declared_width() {
        let data = b"the quick brown fox";
        for kind in [
            ChecksumKind::Adler,
            ChecksumKind::Crc32,
            ChecksumKind::Crc32c,
            ChecksumKind::Crc64,
            ChecksumKind::Md5,
            ChecksumKind::Sha1,
            ChecksumKind::Sha256,
            ChecksumKind::Blake3,
            ChecksumKind::Xxhash64,
        ] {
            let out = compute(kind, data);
            assert_eq!(out.len(), kind.width(), "{kind:?} width mismatch");
        }
    }

    #[test]
    fn verify_detects_tampering() {
        let data = b"payload block";
        let sum = compute(ChecksumKind::Crc32c, data);
        assert!(verify(ChecksumKind::Crc32c, data, &sum));
        assert!(!verify(ChecksumKind::Crc32c, b"payload Block", &sum));
    }
}
