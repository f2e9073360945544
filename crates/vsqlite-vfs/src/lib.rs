//! Virtual filesystem layer.
//!
//! The embedded engine performs all persistent I/O through a [`Vfs`] looked
//! up by name in the process-wide [`registry`]. Two implementations ship with
//! the runtime: the default OS-backed [`unix::UnixVfs`] with the full
//! five-level advisory locking protocol, and the sectored in-memory
//! [`memdb::MemVfs`].

pub mod memdb;
pub mod registry;
pub mod shm;
pub mod traits;
#[cfg(unix)]
pub mod unix;

pub use shm::{ShmLockFlags, ShmRegion};
pub use traits::{Vfs, VfsFile};
