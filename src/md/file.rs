use super::container::{NO_ID, Reader};
use crate::errors::{NsError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum length of the inline checksum value (§3: "a leading length
/// byte", so at most 255 bytes).
pub const MAX_CHECKSUM_LEN: usize = 255;

/// In-memory file record (§3).
///
/// `locations` is the ordered sequence of replica slot ids; `unlinked`
/// tracks locations scheduled for removal but still present. Both are
/// short by design — `has_location` is linear, deliberately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMD {
    pub id: u64,
    pub ctime_sec: u64,
    pub ctime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
    pub size: u64,
    pub container_id: u64,
    pub name: String,
    pub locations: Vec<u16>,
    pub unlinked: Vec<u16>,
    pub uid: u32,
    pub gid: u32,
    pub layout_id: u32,
    pub checksum: Vec<u8>,
}

impl FileMD {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ctime_sec: 0,
            ctime_nsec: 0,
            mtime_sec: 0,
            mtime_nsec: 0,
            size: 0,
            container_id: NO_ID,
            name: String::new(),
            locations: Vec::new(),
            unlinked: Vec::new(),
            uid: 0,
            gid: 0,
            layout_id: 0,
            checksum: Vec::new(),
        }
    }

    pub fn set_ctime_now(&mut self) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        self.ctime_sec = now.as_secs();
        self.ctime_nsec = u64::from(now.subsec_nanos());
        self.mtime_sec = self.ctime_sec;
        self.mtime_nsec = self.ctime_nsec;
    }

    pub fn touch_mtime_now(&mut self) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        self.mtime_sec = now.as_secs();
        self.mtime_nsec = u64::from(now.subsec_nanos());
    }

    /// The real modification time. The original implementation this core
    /// replaces aliased this accessor to the creation time; that was an
    /// unintended bug (see design notes) and is fixed here.
    #[must_use]
    pub fn mtime(&self) -> (u64, u64) {
        (self.mtime_sec, self.mtime_nsec)
    }

    /// Linear scan by design: the location list is short.
    #[must_use]
    pub fn has_location(&self, loc: u16) -> bool {
        self.locations.contains(&loc)
    }

    pub fn add_location(&mut self, loc: u16) {
        if !self.has_location(loc) {
            self.locations.push(loc);
        }
    }

    pub fn unlink_location(&mut self, loc: u16) {
        if let Some(pos) = self.locations.iter().position(|&l| l == loc) {
            self.locations.remove(pos);
            self.unlinked.push(loc);
        }
    }

    pub fn remove_unlinked_location(&mut self, loc: u16) {
        self.unlinked.retain(|&l| l != loc);
    }

    pub fn set_checksum(&mut self, value: Vec<u8>) -> Result<()> {
        if value.len() > MAX_CHECKSUM_LEN {
            return Err(NsError::Range(format!(
                "checksum length {} exceeds {MAX_CHECKSUM_LEN}",
                value.len()
            )));
        }
        self.checksum = value;
        Ok(())
    }

    /// Serialize to the on-disk payload shape of §6:
    /// `id(8) | ctime(16) | mtime(16) | size(8) | containerId(8) |
    /// nameLen(2) | name[nameLen] | locCount(2) | locations[locCount*2] |
    /// uid(4) | gid(4) | layoutId(4) | checksumLen(1) | checksum[checksumLen]`.
    /// Unlinked locations are transient scheduling state and are not part
    /// of this wire payload; they are re-derived by higher-level deletion
    /// workflows, not persisted across a rebuild.
    ///
    /// # Errors
    /// `NsError::Range` if `name` or `locations` would overflow their
    /// length fields.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.name.len() > u16::MAX as usize {
            return Err(NsError::Range("file name too long".into()));
        }
        if self.locations.len() > u16::MAX as usize {
            return Err(NsError::Range("too many locations".into()));
        }
        if self.checksum.len() > MAX_CHECKSUM_LEN {
            return Err(NsError::Range("checksum too long".into()));
        }
        let name_bytes = self.name.as_bytes();
        let mut buf = Vec::with_capacity(64 + name_bytes.len() + self.locations.len() * 2);
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.ctime_sec.to_le_bytes());
        buf.extend_from_slice(&self.ctime_nsec.to_le_bytes());
        buf.extend_from_slice(&self.mtime_sec.to_le_bytes());
        buf.extend_from_slice(&self.mtime_nsec.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.container_id.to_le_bytes());
        buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(name_bytes);
        buf.extend_from_slice(&(self.locations.len() as u16).to_le_bytes());
        for loc in &self.locations {
            buf.extend_from_slice(&loc.to_le_bytes());
        }
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.gid.to_le_bytes());
        buf.extend_from_slice(&self.layout_id.to_le_bytes());
        buf.push(self.checksum.len() as u8);
        buf.extend_from_slice(&self.checksum);
        Ok(buf)
    }

    /// # Errors
    /// `NsError::Corrupt` if the payload is shorter than its declared
    /// fields.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let id = r.u64()?;
        let ctime_sec = r.u64()?;
        let ctime_nsec = r.u64()?;
        let mtime_sec = r.u64()?;
        let mtime_nsec = r.u64()?;
        let size = r.u64()?;
        let container_id = r.u64()?;
        let name_len = r.u16()? as usize;
        let name = String::from_utf8_lossy(r.bytes(name_len)?).into_owned();
        let loc_count = r.u16()? as usize;
        let mut locations = Vec::with_capacity(loc_count);
        for _ in 0..loc_count {
            locations.push(r.u16()?);
        }
        let uid = r.u32()?;
        let gid = r.u32()?;
        let layout_id = r.u32()?;
        let checksum_len = r.u8()? as usize;
        let checksum = r.bytes(checksum_len)?.to_vec();
        Ok(Self {
            id,
            ctime_sec,
            ctime_nsec,
            mtime_sec,
            mtime_nsec,
            size,
            container_id,
            name,
            locations,
            unlinked: Vec::new(),
            uid,
            gid,
            layout_id,
            checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut f = FileMD::new(99);
        f.container_id = 1;
        f.name = "data.bin".into();
        f.size = 4096;
        f.add_location(3);
        f.add_location(7);
        f.set_checksum(vec![1, 2, 3, 4]).unwrap();
        f.set_ctime_now();
        let bytes = f.serialize().unwrap();
        let back = FileMD::deserialize(&bytes).unwrap();
        assert_eq!(back.id, 99);
        assert_eq!(back.name, "data.bin");
        assert_eq!(back.locations, vec![3, 7]);
        assert_eq!(back.checksum, vec![1, 2, 3, 4]);
    }

    #[test]
    fn has_location_and_unlink() {
        let mut f = FileMD::new(1);
        f.add_location(5);
        assert!(f.has_location(5));
        f.unlink_location(5);
        assert!(!f.has_location(5));
        assert_eq!(f.unlinked, vec![5]);
    }

    #[test]
    fn mtime_is_not_aliased_to_ctime() {
        let mut f = FileMD::new(1);
        f.set_ctime_now();
        let ctime = (f.ctime_sec, f.ctime_nsec);
        std::thread::sleep(std::time::Duration::from_millis(5));
        f.touch_mtime_now();
        assert_ne!(f.mtime(), ctime);
    }
}
