//! Namespace metadata: container and file records, their change-log-backed
//! services, and change notification (§3, §4.3).

pub mod container;
pub mod container_svc;
pub mod file;
pub mod file_svc;
pub mod listener;

pub use container::{ContainerMD, NO_ID, ROOT_ID};
pub use container_svc::ContainerMDSvc;
pub use file::FileMD;
pub use file_svc::FileMDSvc;
pub use listener::{ChangeEvent, ChangeListener};
