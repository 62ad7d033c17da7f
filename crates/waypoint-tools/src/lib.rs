//! Content access for Waypoint sessions.
//!
//! Provides the `ContentStore` collaborator trait, the filesystem-backed
//! `LocalContentStore`, an in-memory store, glob filtering, and the
//! `FileScanner` that builds a session's initial file inventory.

pub mod globs;
pub mod local_store;
pub mod memory;
pub mod scanner;
pub mod store;

pub use globs::{build_glob_set, GlobFilter};
pub use local_store::LocalContentStore;
pub use memory::MemoryContentStore;
pub use scanner::{FileScanner, InventorySummary};
pub use store::{ContentStore, FileMeta};
