//! Payload file wrapper layer: aligned, block-checksum-verified reads over
//! a process-wide map of open payload files (§4.7).

pub mod file;
pub mod layer;

pub use file::OssFile;
pub use layer::OssLayer;
