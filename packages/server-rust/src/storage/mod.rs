//! Storage backends for the gateway.
//!
//! Two seams: [`MainStorage`] is the fast, disk-resident storage serving
//! live reads; [`ArchiveStorage`] is the slow storage (tape or equivalent)
//! reached only through restore/write/archive transitions. Both are used
//! as `Arc<dyn ...>` so deployments pick implementations at startup.

pub mod archive;
pub mod local_fs;
pub mod main;
pub mod memory;

pub use archive::ArchiveStorage;
pub use local_fs::{FsArchiveStorage, FsMainStorage};
pub use main::{ByteReader, MainStorage};
pub use memory::{MemoryArchiveStorage, MemoryMainStorage};
