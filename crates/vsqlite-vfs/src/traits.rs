//! The contracts every VFS implementation satisfies.

use vsqlite_error::Result;
use vsqlite_types::{AccessFlags, DeviceCharacteristics, LockLevel, OpenFlags, SyncFlags};

use crate::shm::{ShmLockFlags, ShmRegion};

/// A virtual filesystem implementation.
///
/// A VFS is a named, immutable strategy object: registering one hands the
/// engine a complete replacement for its storage layer. Names are plain
/// strings rather than paths because not every VFS is path-shaped (the
/// memory VFS addresses databases by registry name).
pub trait Vfs: Send + Sync {
    /// Open a file. `name` is empty for temporary files the VFS should
    /// auto-name. Returns the file together with the flags actually used
    /// (a VFS may add flags, e.g. `READWRITE` when `CREATE` is set).
    fn open(&self, name: &str, flags: OpenFlags) -> Result<(Box<dyn VfsFile>, OpenFlags)>;

    /// Delete a file. If `sync_dir` is set, also sync the containing
    /// directory so the removal is durable.
    fn delete(&self, name: &str, sync_dir: bool) -> Result<()>;

    /// Check whether `name` satisfies the access check described by `flags`.
    fn access(&self, name: &str, flags: AccessFlags) -> Result<bool>;

    /// Resolve a possibly relative name into an absolute one.
    fn full_pathname(&self, name: &str) -> Result<String>;
}

/// One open file inside a VFS.
///
/// Required methods cover positional I/O and the advisory locking protocol;
/// the defaulted methods are optional capabilities: lock-state
/// introspection, size hints, and the shared-memory interface needed for
/// write-ahead-log mode.
pub trait VfsFile: Send {
    /// Close the file. Only the engine releases files; the connection's
    /// file-table slot is nulled afterwards.
    fn close(&mut self) -> Result<()>;

    /// Read up to `buf.len()` bytes at `off`, returning the count actually
    /// read. Returning fewer bytes than requested signals end-of-file; the
    /// caller zero-fills the tail.
    fn read_at(&mut self, buf: &mut [u8], off: u64) -> Result<usize>;

    /// Write all of `buf` at `off`.
    fn write_at(&mut self, buf: &[u8], off: u64) -> Result<()>;

    /// Truncate the file to `size` bytes.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Flush to stable storage.
    fn sync(&mut self, flags: SyncFlags) -> Result<()>;

    /// Current file size in bytes.
    fn size(&self) -> Result<u64>;

    /// Acquire a lock at `level`, escalating through intermediate levels as
    /// the protocol requires. A no-op when already at or above `level`.
    fn lock(&mut self, level: LockLevel) -> Result<()>;

    /// Release down to `level`. A no-op when already at or below `level`.
    fn unlock(&mut self, level: LockLevel) -> Result<()>;

    /// Whether any handle (this process or another) holds `Reserved` or
    /// higher on this file.
    fn check_reserved_lock(&self) -> Result<bool>;

    /// The atomicity boundary the engine may assume for this file.
    fn sector_size(&self) -> u32 {
        4096
    }

    /// Capabilities of the underlying storage device.
    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::empty()
    }

    /// The lock level this handle currently holds (introspection).
    fn lock_state(&self) -> LockLevel {
        LockLevel::None
    }

    /// Advise the file of its eventual size. Implementations may
    /// preallocate; shrinking is never performed here.
    fn size_hint(&mut self, size: u64) -> Result<()> {
        let _ = size;
        Ok(())
    }

    /// Map the `region`-th shared-memory region of `size` bytes, creating it
    /// when `extend` is set. `Ok(None)` means the region does not exist and
    /// `extend` was not requested.
    fn shm_map(&mut self, region: u32, size: u32, extend: bool) -> Result<Option<ShmRegion>> {
        let _ = (region, size, extend);
        Err(vsqlite_error::Error::extended(
            vsqlite_types::ExtendedResultCode::IoErrShmMap,
        ))
    }

    /// Acquire or release shared-memory locks over `n` slots starting at
    /// `offset`.
    fn shm_lock(&mut self, offset: u32, n: u32, flags: ShmLockFlags) -> Result<()> {
        let _ = (offset, n, flags);
        Err(vsqlite_error::Error::extended(
            vsqlite_types::ExtendedResultCode::IoErrShmLock,
        ))
    }

    /// Memory barrier: prior shared-memory writes become visible before
    /// subsequent reads.
    fn shm_barrier(&self) {}

    /// Unmap all shared-memory regions; delete the backing store when
    /// `delete` is set and this was the last mapper.
    fn shm_unmap(&mut self, delete: bool) -> Result<()> {
        let _ = delete;
        Ok(())
    }
}

impl std::fmt::Debug for dyn VfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn VfsFile>")
    }
}

impl std::fmt::Debug for dyn Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn Vfs>")
    }
}
