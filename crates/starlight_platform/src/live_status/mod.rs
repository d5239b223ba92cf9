#![forbid(unsafe_code)]

mod cache;
mod store;

pub use cache::{DEFAULT_CACHE_TTL, LiveStatusCache};
pub use store::{DEFAULT_CACHE_FILE_NAME, SnapshotStore, default_cache_path};
