//! Hierarchical path view over the container/file services (§4.4).
//!
//! Stateless: every operation walks from the root through the current
//! state of the two services. No uri is cached across calls.

use crate::errors::{NsError, Result};
use crate::md::{ContainerMD, ContainerMDSvc, FileMD, FileMDSvc, ROOT_ID};
use parking_lot::RwLock;
use std::sync::Arc;

type Shared<T> = Arc<RwLock<T>>;

/// A located container or file, together with the id of its parent
/// container (useful for unlink-on-remove).
enum Located {
    Container(Shared<ContainerMD>),
    File(Shared<FileMD>),
}

fn split_uri(uri: &str) -> Vec<&str> {
    uri.split('/').filter(|c| !c.is_empty()).collect()
}

/// Read-mostly facade combining a `ContainerMDSvc` and a `FileMDSvc` into
/// a single path-addressed namespace.
pub struct View<'a> {
    containers: &'a ContainerMDSvc,
    files: &'a FileMDSvc,
}

impl<'a> View<'a> {
    #[must_use]
    pub fn new(containers: &'a ContainerMDSvc, files: &'a FileMDSvc) -> Self {
        Self { containers, files }
    }

    /// # Errors
    /// `NsError::NotFound` if any path component is missing.
    pub fn get_container(&self, uri: &str) -> Result<Shared<ContainerMD>> {
        let mut current = self.containers.root();
        for part in split_uri(uri) {
            let next_id = current
                .read()
                .find_container(part)
                .ok_or_else(|| NsError::NotFound(format!("container path component {part:?}")))?;
            current = self.containers.get_container_md(next_id)?;
        }
        Ok(current)
    }

    /// # Errors
    /// `NsError::NotFound` if the parent directory or the file itself is
    /// missing.
    pub fn get_file(&self, uri: &str) -> Result<Shared<FileMD>> {
        let mut parts = split_uri(uri);
        let name = parts
            .pop()
            .ok_or_else(|| NsError::NotFound("empty file uri".into()))?;
        let parent = self.walk_containers(&parts)?;
        let id = parent
            .read()
            .find_file(name)
            .ok_or_else(|| NsError::NotFound(format!("file {name:?}")))?;
        self.files.get_file_md(id)
    }

    fn walk_containers(&self, parts: &[&str]) -> Result<Shared<ContainerMD>> {
        let mut current = self.containers.root();
        for part in parts {
            let next_id = current
                .read()
                .find_container(part)
                .ok_or_else(|| NsError::NotFound(format!("container path component {part:?}")))?;
            current = self.containers.get_container_md(next_id)?;
        }
        Ok(current)
    }

    /// Walk as far as possible; create missing intermediates only when
    /// `create_parents` is set. Fails with `Exists` if the final component
    /// is already present as either a container or a file.
    ///
    /// # Errors
    /// `NsError::NotFound` if an intermediate is missing and
    /// `create_parents` is false; `NsError::Exists` if the final
    /// component already exists.
    pub fn create_container(&self, uri: &str, create_parents: bool) -> Result<Shared<ContainerMD>> {
        let parts = split_uri(uri);
        let Some((&last, parents)) = parts.split_last() else {
            return Err(NsError::Invalid("empty container uri".into()));
        };

        let mut current = self.containers.root();
        for part in parents {
            let existing = current.read().find_container(part);
            current = match existing {
                Some(id) => self.containers.get_container_md(id)?,
                None => {
                    if !create_parents {
                        return Err(NsError::NotFound(format!("container path component {part:?}")));
                    }
                    self.create_child_container(&current, part)?
                }
            };
        }

        let already = {
            let parent = current.read();
            parent.find_container(last).is_some() || parent.find_file(last).is_some()
        };
        if already {
            return Err(NsError::Exists(format!("{uri} already exists")));
        }
        self.create_child_container(&current, last)
    }

    fn create_child_container(&self, parent: &Shared<ContainerMD>, name: &str) -> Result<Shared<ContainerMD>> {
        let child = self.containers.create_container();
        {
            let mut c = child.write();
            c.parent_id = parent.read().id;
            c.name = name.to_string();
            c.set_ctime_now();
        }
        self.containers.update_store(&child.read())?;
        parent.write().add_container(name, child.read().id);
        self.containers.update_store(&parent.read())?;
        Ok(child)
    }

    /// # Errors
    /// `NsError::NotFound` if the parent directory is missing;
    /// `NsError::Exists` if a child of that name already exists.
    pub fn create_file(&self, uri: &str, uid: u32, gid: u32) -> Result<Shared<FileMD>> {
        let mut parts = split_uri(uri);
        let name = parts
            .pop()
            .ok_or_else(|| NsError::Invalid("empty file uri".into()))?;
        let parent = self.walk_containers(&parts)?;
        {
            let p = parent.read();
            if p.find_container(name).is_some() || p.find_file(name).is_some() {
                return Err(NsError::Exists(format!("{uri} already exists")));
            }
        }
        let file = self.files.create_file();
        {
            let mut f = file.write();
            f.container_id = parent.read().id;
            f.name = name.to_string();
            f.uid = uid;
            f.gid = gid;
            f.set_ctime_now();
        }
        parent.write().add_file(name, file.read().id);
        self.files.update_store(&file.read())?;
        self.containers.update_store(&parent.read())?;
        Ok(file)
    }

    /// # Errors
    /// `NsError::NotFound` if the path does not resolve to a file.
    pub fn remove_file(&self, uri: &str) -> Result<()> {
        let mut parts = split_uri(uri);
        let name = parts
            .pop()
            .ok_or_else(|| NsError::NotFound("empty file uri".into()))?;
        let parent = self.walk_containers(&parts)?;
        let id = parent
            .read()
            .find_file(name)
            .ok_or_else(|| NsError::NotFound(format!("file {name:?}")))?;
        parent.write().remove_file(name);
        self.containers.update_store(&parent.read())?;
        self.files.remove_file(id)
    }

    /// # Errors
    /// `NsError::NotFound` if the path does not resolve; `NsError::NotEmpty`
    /// if the container has children and `recursive` is false. The root
    /// container can never be removed.
    pub fn remove_container(&self, uri: &str, recursive: bool) -> Result<()> {
        let target = self.get_container(uri)?;
        let target_id = target.read().id;
        if target_id == ROOT_ID {
            return Err(NsError::NotEmpty("the root container cannot be removed".into()));
        }
        if !recursive && !target.read().is_empty() {
            return Err(NsError::NotEmpty(format!("{uri} is not empty")));
        }
        if recursive {
            self.remove_tree(&target)?;
        }

        let parent_id = target.read().parent_id;
        let parent = self.containers.get_container_md(parent_id)?;
        let name = target.read().name.clone();
        parent.write().remove_container(&name);
        self.containers.update_store(&parent.read())?;
        self.containers.remove_container(target_id)
    }

    fn remove_tree(&self, container: &Shared<ContainerMD>) -> Result<()> {
        let (file_ids, container_ids): (Vec<(String, u64)>, Vec<(String, u64)>) = {
            let c = container.read();
            (
                c.files.iter().map(|(n, id)| (n.clone(), *id)).collect(),
                c.containers.iter().map(|(n, id)| (n.clone(), *id)).collect(),
            )
        };
        for (_, id) in &file_ids {
            self.files.remove_file(*id)?;
        }
        container.write().files.clear();

        for (name, id) in container_ids {
            let child = self.containers.get_container_md(id)?;
            self.remove_tree(&child)?;
            container.write().remove_container(&name);
            self.containers.remove_container(id)?;
        }
        Ok(())
    }

    /// # Errors
    /// Propagates change-log I/O errors.
    pub fn update_file_store(&self, file: &FileMD) -> Result<()> {
        self.files.update_store(file)
    }

    /// # Errors
    /// Propagates change-log I/O errors.
    pub fn update_container_store(&self, container: &ContainerMD) -> Result<()> {
        self.containers.update_store(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_svcs(dir: &std::path::Path) -> (ContainerMDSvc, FileMDSvc) {
        let containers = ContainerMDSvc::new(&dir.join("containers.clf")).unwrap();
        containers.initialize().unwrap();
        let files = FileMDSvc::new(&dir.join("files.clf")).unwrap();
        files.initialize(&containers).unwrap();
        (containers, files)
    }

    #[test]
    fn create_file_requires_existing_parent() {
        let dir = tempdir().unwrap();
        let (containers, files) = new_svcs(dir.path());
        let view = View::new(&containers, &files);
        let err = view.create_file("/missing/data.bin", 0, 0).unwrap_err();
        assert!(matches!(err, NsError::NotFound(_)));
    }

    #[test]
    fn create_container_with_parents_then_create_file() {
        let dir = tempdir().unwrap();
        let (containers, files) = new_svcs(dir.path());
        let view = View::new(&containers, &files);

        view.create_container("/a/b", true).unwrap();
        let file = view.create_file("/a/b/data.bin", 1, 1).unwrap();
        assert_eq!(file.read().name, "data.bin");

        let fetched = view.get_file("/a/b/data.bin").unwrap();
        assert_eq!(fetched.read().uid, 1);

        let err = view.create_container("/a/b", false).unwrap_err();
        assert!(matches!(err, NsError::Exists(_)));
    }

    #[test]
    fn remove_container_non_recursive_fails_when_not_empty() {
        let dir = tempdir().unwrap();
        let (containers, files) = new_svcs(dir.path());
        let view = View::new(&containers, &files);
        view.create_container("/a", true).unwrap();
        view.create_file("/a/data.bin", 0, 0).unwrap();

        let err = view.remove_container("/a", false).unwrap_err();
        assert!(matches!(err, NsError::NotEmpty(_)));

        view.remove_container("/a", true).unwrap();
        assert!(view.get_container("/a").is_err());
    }

    #[test]
    fn root_cannot_be_removed() {
        let dir = tempdir().unwrap();
        let (containers, files) = new_svcs(dir.path());
        let view = View::new(&containers, &files);
        let err = view.remove_container("/", false).unwrap_err();
        assert!(matches!(err, NsError::NotEmpty(_)));
    }
}
