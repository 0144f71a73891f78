//! Core metadata, integrity, and scheduling layer for a distributed
//! disk-storage system: a hierarchical namespace backed by an append-only
//! change log, a per-file block-checksum side store, and a geo-aware
//! scheduling tree used to place and balance replicas.

pub mod aio;
pub mod blockxs;
pub mod buffer;
pub mod changelog;
pub mod checksum;
pub mod config;
pub mod drainer;
pub mod errors;
pub mod geotree;
pub mod logger;
pub mod md;
pub mod oss;
pub mod view;

pub use buffer::Buffer;
pub use changelog::{ChangeLogFile, RecordType};
pub use config::{ChecksumKind, Config};
pub use errors::{NsError, Result};
pub use md::{ChangeEvent, ChangeListener, ContainerMD, ContainerMDSvc, FileMD, FileMDSvc, NO_ID, ROOT_ID};
pub use view::View;

/// Everything needed to serve one namespace: the two change-log-backed MD
/// services and the view built over them. Owns its services; construct
/// once at process start and share behind whatever concurrency wrapper
/// the caller needs (the services are internally synchronized).
pub struct Namespace {
    containers: ContainerMDSvc,
    files: FileMDSvc,
}

impl Namespace {
    /// Open (creating if absent) the container and file change logs named
    /// in `config`, replaying both into memory.
    ///
    /// # Errors
    /// Propagates I/O and corruption errors from either change log.
    pub fn open(config: &Config) -> Result<Self> {
        let containers = ContainerMDSvc::new(&config.container_log_path)?;
        containers.initialize()?;
        let files = FileMDSvc::new(&config.file_log_path)?;
        files.initialize(&containers)?;
        Ok(Self { containers, files })
    }

    #[must_use]
    pub fn containers(&self) -> &ContainerMDSvc {
        &self.containers
    }

    #[must_use]
    pub fn files(&self) -> &FileMDSvc {
        &self.files
    }

    #[must_use]
    pub fn view(&self) -> View<'_> {
        View::new(&self.containers, &self.files)
    }
}

/// Initialize the crate's logging backend. Call once at process start;
/// safe to skip if the embedding application configures `log` itself.
///
/// # Errors
/// Returns an error if the logger cannot be initialized.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    logger::init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn namespace_opens_and_views_root() {
        let dir = tempdir().unwrap();
        let config = Config {
            container_log_path: dir.path().join("containers.log"),
            file_log_path: dir.path().join("files.log"),
            checksum_kind: ChecksumKind::Crc32c,
            block_size: 4096,
            drainer: config::DrainerConfig::default(),
        };
        let ns = Namespace::open(&config).unwrap();
        let view = ns.view();
        assert!(view.get_container("/").is_ok());
    }
}
