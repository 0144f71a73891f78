use super::container::{ContainerMD, ROOT_ID};
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
    md: Option<Shared<ContainerMD>>,
}

/// ID allocation, in-memory index, and change-log-backed persistence for
/// container records (§4.3).
pub struct ContainerMDSvc {
    log: ChangeLogFile,
    entries: RwLock<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    listeners: RwLock<Vec<Box<dyn ChangeListener>>>,
}

impl ContainerMDSvc {
    /// Open (or create) the backing change log. Call `initialize` before
    /// any other operation.
    ///
    /// # Errors
    /// Propagates `ChangeLogFile::open` errors.
    pub fn new(log_path: &Path) -> Result<Self> {
        Ok(Self {
            log: ChangeLogFile::open(log_path)?,
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(ROOT_ID + 1),
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

    /// Replay the change log into memory (§4.3 rebuild algorithm). Creates
    /// the root container if the log is empty.
    ///
    /// # Errors
    /// Any error encountered while replaying the log is fatal, per §4.5:
    /// the log is assumed to be repaired out of band.
    pub fn initialize(&self) -> Result<()> {
        let mut entries = self.entries.write();
        entries.clear();
        let mut max_seen = ROOT_ID;

        self.log.scan_all_records(|offset, rtype, payload| {
            match rtype {
                RecordType::Update => {
                    let md = ContainerMD::deserialize(payload)?;
                    max_seen = max_seen.max(md.id);
                    entries.insert(md.id, Entry { offset, md: None });
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

        if !entries.contains_key(&ROOT_ID) {
            let mut root = ContainerMD::new(ROOT_ID);
            root.parent_id = ROOT_ID;
            root.set_ctime_now();
            let offset = self.log.store_record(RecordType::Update, &root.serialize())?;
            entries.insert(ROOT_ID, Entry { offset, md: Some(Arc::new(RwLock::new(root))) });
        }

        // Pass two: materialize every entry, linking containers into their
        // parent's child map. A container's parent may not yet be
        // materialized, so this recurses, tolerating any in-log ordering.
        let ids: Vec<u64> = entries.keys().copied().collect();
        for id in ids {
            materialize(&self.log, &mut entries, id)?;
        }

        self.next_id.store(max_seen + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Allocate a fresh, empty container. The caller fills in fields and
    /// then calls `update_store`.
    #[must_use]
    pub fn create_container(&self) -> Shared<ContainerMD> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let md = Arc::new(RwLock::new(ContainerMD::new(id)));
        self.entries.write().insert(id, Entry { offset: 0, md: Some(md.clone()) });
        md
    }

    /// Persist the current state of `container`: append an UPDATE record,
    /// remember the new offset, notify listeners.
    ///
    /// # Errors
    /// Propagates change-log I/O errors.
    pub fn update_store(&self, container: &ContainerMD) -> Result<()> {
        let offset = self.log.store_record(RecordType::Update, &container.serialize())?;
        let mut entries = self.entries.write();
        match entries.get_mut(&container.id) {
            Some(entry) => entry.offset = offset,
            None => {
                entries.insert(
                    container.id,
                    Entry { offset, md: Some(Arc::new(RwLock::new(container.clone()))) },
                );
            }
        }
        drop(entries);
        self.notify(ChangeEvent::Updated(container.id));
        Ok(())
    }

    /// Append a DELETE record, notify listeners, and drop in-memory state.
    ///
    /// # Errors
    /// `NsError::NotFound` if `id` is unknown; otherwise propagates
    /// change-log I/O errors.
    pub fn remove_container(&self, id: u64) -> Result<()> {
        if id == ROOT_ID {
            return Err(NsError::NotEmpty("the root container cannot be removed".into()));
        }
        {
            let entries = self.entries.read();
            if !entries.contains_key(&id) {
                return Err(NsError::NotFound(format!("container {id}")));
            }
        }
        self.log.store_record(RecordType::Delete, &id.to_le_bytes())?;
        self.entries.write().remove(&id);
        self.notify(ChangeEvent::Deleted(id));
        Ok(())
    }

    /// # Errors
    /// `NsError::NotFound` if `id` is unknown.
    pub fn get_container_md(&self, id: u64) -> Result<Shared<ContainerMD>> {
        self.entries
            .read()
            .get(&id)
            .and_then(|e| e.md.clone())
            .ok_or_else(|| NsError::NotFound(format!("container {id}")))
    }

    #[must_use]
    pub fn root(&self) -> Shared<ContainerMD> {
        self.get_container_md(ROOT_ID).expect("root container always exists after initialize")
    }

    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }
}

fn materialize(
    log: &ChangeLogFile,
    entries: &mut HashMap<u64, Entry>,
    id: u64,
) -> Result<Shared<ContainerMD>> {
    if let Some(entry) = entries.get(&id)
        && let Some(md) = &entry.md
    {
        return Ok(md.clone());
    }
    let offset = entries
        .get(&id)
        .ok_or_else(|| NsError::Corrupt(format!("container {id} referenced but never logged")))?
        .offset;
    let mut payload = Vec::new();
    log.read_record(offset, &mut payload)?;
    let md = ContainerMD::deserialize(&payload)?;
    let parent_id = md.parent_id;
    let name = md.name.clone();
    let shared = Arc::new(RwLock::new(md));
    entries.get_mut(&id).unwrap().md = Some(shared.clone());

    if id != ROOT_ID {
        let parent = materialize(log, entries, parent_id)?;
        parent.write().add_container(&name, id);
    }
    Ok(shared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn initialize_creates_root() {
        let dir = tempdir().unwrap();
        let svc = ContainerMDSvc::new(&dir.path().join("containers.clf")).unwrap();
        svc.initialize().unwrap();
        let root = svc.get_container_md(ROOT_ID).unwrap();
        assert_eq!(root.read().parent_id, ROOT_ID);
    }

    #[test]
    fn rebuild_links_out_of_order_children() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("containers.clf");
        {
            let svc = ContainerMDSvc::new(&log_path).unwrap();
            svc.initialize().unwrap();
            let root = svc.root();
            let a = svc.create_container();
            {
                let mut a = a.write();
                a.parent_id = ROOT_ID;
                a.name = "a".into();
            }
            let b = svc.create_container();
            {
                let mut b = b.write();
                b.parent_id = a.read().id;
                b.name = "b".into();
            }
            // Persist child before parent to exercise the two-pass rebuild.
            svc.update_store(&b.read()).unwrap();
            svc.update_store(&a.read()).unwrap();
            root.write().add_container("a", a.read().id);
            svc.update_store(&root.read()).unwrap();
        }

        let svc2 = ContainerMDSvc::new(&log_path).unwrap();
        svc2.initialize().unwrap();
        let root = svc2.root();
        let a_id = root.read().find_container("a").unwrap();
        let a = svc2.get_container_md(a_id).unwrap();
        let b_id = a.read().find_container("b").unwrap();
        assert_eq!(svc2.get_container_md(b_id).unwrap().read().name, "b");
    }
}
