//! chaincommit-storage — durable checkpoint backends for chaincommit listeners.
//!
//! Backends:
//! - [`file`] — one JSON document per checkpoint, replaced atomically on every write
//! - [`directory`] — a directory of file checkpoints keyed by caller-chosen id

pub mod directory;
pub mod file;

pub use directory::DirectoryCheckpointStore;
pub use file::FileCheckpointer;
