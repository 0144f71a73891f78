use crate::errors::{NsError, Result};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved id marking "no id"/tombstone/deletion, per §3.
pub const NO_ID: u64 = 0;
/// Reserved id of the root container; it is its own parent.
pub const ROOT_ID: u64 = 1;

/// In-memory container (directory) record (§3).
///
/// `containers` and `files` are name -> child-id maps: sets by key, keys
/// unique, insertion order irrelevant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMD {
    pub id: u64,
    pub parent_id: u64,
    pub ctime_sec: u64,
    pub ctime_nsec: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub acl_id: u32,
    pub name: String,
    pub containers: HashMap<String, u64>,
    pub files: HashMap<String, u64>,
}

impl ContainerMD {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            parent_id: NO_ID,
            ctime_sec: 0,
            ctime_nsec: 0,
            uid: 0,
            gid: 0,
            mode: 0o755,
            acl_id: 0,
            name: String::new(),
            containers: HashMap::new(),
            files: HashMap::new(),
        }
    }

    pub fn set_ctime_now(&mut self) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        self.ctime_sec = now.as_secs();
        self.ctime_nsec = u64::from(now.subsec_nanos());
    }

    #[must_use]
    pub fn find_container(&self, name: &str) -> Option<u64> {
        self.containers.get(name).copied()
    }

    pub fn add_container(&mut self, name: &str, id: u64) {
        self.containers.insert(name.to_string(), id);
    }

    pub fn remove_container(&mut self, name: &str) {
        self.containers.remove(name);
    }

    #[must_use]
    pub fn find_file(&self, name: &str) -> Option<u64> {
        self.files.get(name).copied()
    }

    pub fn add_file(&mut self, name: &str, id: u64) {
        self.files.insert(name.to_string(), id);
    }

    pub fn remove_file(&mut self, name: &str) {
        self.files.remove(name);
    }

    #[must_use]
    pub fn num_containers(&self) -> usize {
        self.containers.len()
    }

    #[must_use]
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.files.is_empty()
    }

    /// Serialize to the on-disk payload shape of §6:
    /// `id(8) | parentId(8) | ctime(sec:8,nsec:8) | uid(4) | gid(4) | mode(2)
    /// | aclId(4) | nameLen(2) | nameBytes[nameLen, NUL-terminated]`.
    /// The child maps are not part of the payload; they are rebuilt by the
    /// service during log replay (§4.3).
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let name_bytes = self.name.as_bytes();
        let name_len = (name_bytes.len() + 1) as u16;
        let mut buf = Vec::with_capacity(8 + 8 + 16 + 4 + 4 + 2 + 4 + 2 + name_len as usize);
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.parent_id.to_le_bytes());
        buf.extend_from_slice(&self.ctime_sec.to_le_bytes());
        buf.extend_from_slice(&self.ctime_nsec.to_le_bytes());
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.gid.to_le_bytes());
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.acl_id.to_le_bytes());
        buf.extend_from_slice(&name_len.to_le_bytes());
        buf.extend_from_slice(name_bytes);
        buf.push(0);
        buf
    }

    /// # Errors
    /// `NsError::Corrupt` if the payload is shorter than its declared
    /// fields.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let id = r.u64()?;
        let parent_id = r.u64()?;
        let ctime_sec = r.u64()?;
        let ctime_nsec = r.u64()?;
        let uid = r.u32()?;
        let gid = r.u32()?;
        let mode = r.u16()?;
        let acl_id = r.u32()?;
        let name_len = r.u16()? as usize;
        let name_bytes = r.bytes(name_len)?;
        let name = String::from_utf8_lossy(name_bytes.strip_suffix(&[0]).unwrap_or(name_bytes))
            .into_owned();
        Ok(Self {
            id,
            parent_id,
            ctime_sec,
            ctime_nsec,
            uid,
            gid,
            mode,
            acl_id,
            name,
            containers: HashMap::new(),
            files: HashMap::new(),
        })
    }
}

/// Minimal cursor over a byte slice used by the fixed-layout (de)serializers
/// in `md::container` and `md::file`.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(NsError::Corrupt(format!(
                "truncated record: need {n} bytes at offset {}, have {}",
                self.pos,
                self.data.len()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut c = ContainerMD::new(42);
        c.parent_id = ROOT_ID;
        c.name = "subdir".into();
        c.uid = 7;
        c.gid = 8;
        c.mode = 0o750;
        c.set_ctime_now();
        let bytes = c.serialize();
        let back = ContainerMD::deserialize(&bytes).unwrap();
        assert_eq!(back.id, 42);
        assert_eq!(back.parent_id, ROOT_ID);
        assert_eq!(back.name, "subdir");
        assert_eq!(back.uid, 7);
        assert_eq!(back.mode, 0o750);
    }
}
