use super::container_svc::ContainerMDSvc;
use super::file::FileMD;
use super::listener::{ChangeEvent, ChangeListener};
use crate::changelog::{ChangeLogFile, RecordType};
use crate::errors::{NsError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type Shared<T> = Arc<RwLock<T>>;

struct Entry {
    offset: u64,
    md: Shared<FileMD>,
}

/// ID allocation, in-memory index, and change-log-backed persistence for
/// file records (§4.3).
pub struct FileMDSvc {
    log: ChangeLogFile,
    entries: RwLock<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    listeners: RwLock<Vec<Box<dyn ChangeListener>>>,
}

impl FileMDSvc {
    /// # Errors
    /// Propagates `ChangeLogFile::open` errors.
    pub fn new(log_path: &Path) -> Result<Self> {
        Ok(Self {
            log: ChangeLogFile::open(log_path)?,
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn add_change_listener(&self, listener: Box<dyn ChangeListener>) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, event: ChangeEvent) {
        for l in self.listeners.read().iter() {
            l.on_change(event);
        }
    }

    /// Replay the file-record log into memory and link every live file
    /// into its parent container's file map. Requires `containers` to
    /// already be fully rebuilt (§4.3: files attach to a materialized
    /// container tree, never the reverse).
    ///
    /// # Errors
    /// Any replay error is fatal; `NsError::Corrupt` if a file names a
    /// container id that does not exist in `containers`.
    pub fn initialize(&self, containers: &ContainerMDSvc) -> Result<()> {
        let mut entries = self.entries.write();
        entries.clear();
        let mut max_seen = 0u64;

        self.log.scan_all_records(|offset, rtype, payload| {
            match rtype {
                RecordType::Update => {
                    let md = FileMD::deserialize(payload)?;
                    max_seen = max_seen.max(md.id);
                    entries.insert(md.id, Entry { offset, md: Arc::new(RwLock::new(md)) });
                }
                RecordType::Delete => {
                    if payload.len() != 8 {
                        return Err(NsError::Corrupt("malformed DELETE payload".into()));
                    }
                    let id = u64::from_le_bytes(payload.try_into().unwrap());
                    max_seen = max_seen.max(id);
                    entries.remove(&id);
                }
            }
            Ok(())
        })?;

        for entry in entries.values() {
            let md = entry.md.read();
            let container = containers.get_container_md(md.container_id)?;
            container.write().add_file(&md.name, md.id);
        }

        self.next_id.store(max_seen + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Allocate a fresh, empty file record. The caller fills in fields and
    /// then calls `update_store`.
    #[must_use]
    pub fn create_file(&self) -> Shared<FileMD> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let md = Arc::new(RwLock::new(FileMD::new(id)));
        self.entries.write().insert(id, Entry { offset: 0, md: md.clone() });
        md
    }

    /// # Errors
    /// Propagates change-log I/O and serialization errors.
    pub fn update_store(&self, file: &FileMD) -> Result<()> {
        let offset = self.log.store_record(RecordType::Update, &file.serialize()?)?;
        let mut entries = self.entries.write();
        match entries.get_mut(&file.id) {
            Some(entry) => entry.offset = offset,
            None => {
                entries.insert(file.id, Entry { offset, md: Arc::new(RwLock::new(file.clone())) });
            }
        }
        drop(entries);
        self.notify(ChangeEvent::Updated(file.id));
        Ok(())
    }

    /// # Errors
    /// `NsError::NotFound` if `id` is unknown; otherwise propagates
    /// change-log I/O errors.
    pub fn remove_file(&self, id: u64) -> Result<()> {
        {
            let entries = self.entries.read();
            if !entries.contains_key(&id) {
                return Err(NsError::NotFound(format!("file {id}")));
            }
        }
        self.log.store_record(RecordType::Delete, &id.to_le_bytes())?;
        self.entries.write().remove(&id);
        self.notify(ChangeEvent::Deleted(id));
        Ok(())
    }

    /// # Errors
    /// `NsError::NotFound` if `id` is unknown.
    pub fn get_file_md(&self, id: u64) -> Result<Shared<FileMD>> {
        self.entries
            .read()
            .get(&id)
            .map(|e| e.md.clone())
            .ok_or_else(|| NsError::NotFound(format!("file {id}")))
    }

    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Call `visitor` once per live file, in no particular order (§4.3
    /// `visit(fileVisitor)`).
    pub fn visit<F: FnMut(&FileMD)>(&self, mut visitor: F) {
        for entry in self.entries.read().values() {
            visitor(&entry.md.read());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::md::container::ROOT_ID;
    use tempfile::tempdir;

    #[test]
    fn rebuild_links_files_into_containers() {
        let dir = tempdir().unwrap();
        let container_log = dir.path().join("containers.clf");
        let file_log = dir.path().join("files.clf");

        {
            let containers = ContainerMDSvc::new(&container_log).unwrap();
            containers.initialize().unwrap();
            let files = FileMDSvc::new(&file_log).unwrap();
            files.initialize(&containers).unwrap();

            let f = files.create_file();
            {
                let mut f = f.write();
                f.container_id = ROOT_ID;
                f.name = "data.bin".into();
                f.size = 10;
            }
            files.update_store(&f.read()).unwrap();
        }

        let containers = ContainerMDSvc::new(&container_log).unwrap();
        containers.initialize().unwrap();
        let files = FileMDSvc::new(&file_log).unwrap();
        files.initialize(&containers).unwrap();

        let root = containers.root();
        let id = root.read().find_file("data.bin").unwrap();
        assert_eq!(files.get_file_md(id).unwrap().read().size, 10);
    }

    #[test]
    fn visit_calls_once_per_live_file() {
        let dir = tempdir().unwrap();
        let container_log = dir.path().join("containers.clf");
        let file_log = dir.path().join("files.clf");
        let containers = ContainerMDSvc::new(&container_log).unwrap();
        containers.initialize().unwrap();
        let files = FileMDSvc::new(&file_log).unwrap();
        files.initialize(&containers).unwrap();

        for name in ["a.bin", "b.bin", "c.bin"] {
            let f = files.create_file();
            {
                let mut f = f.write();
                f.container_id = ROOT_ID;
                f.name = name.into();
            }
            files.update_store(&f.read()).unwrap();
        }
        let removed = files.create_file();
        let removed_id = removed.read().id;
        files.update_store(&removed.read()).unwrap();
        files.remove_file(removed_id).unwrap();

        let mut seen = Vec::new();
        files.visit(|md| seen.push(md.name.clone()));
        seen.sort();
        assert_eq!(seen, vec!["a.bin", "b.bin", "c.bin"]);
    }
}
