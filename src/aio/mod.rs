//! Async I/O core: per-file in-flight tracking, sticky write-failure
//! poisoning, and read-ahead prefetch, built on `tokio` (§4.8).

pub mod meta_handler;
pub mod prefetch;
pub mod transport;

pub use meta_handler::MetaHandler;
pub use prefetch::{PrefetchCache, PrefetchingFile};
pub use transport::{Transport, TransportOp};
