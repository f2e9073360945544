//! OS-backed VFS with POSIX byte-range advisory locking.
//!
//! The lock-byte layout matches the engine's canonical one, so files this
//! VFS produces interoperate with any other process speaking the same
//! protocol:
//!
//! - `PENDING_BYTE`  = `0x4000_0000` (1 byte)
//! - `RESERVED_BYTE` = `0x4000_0001` (1 byte)
//! - `SHARED_FIRST`  = `0x4000_0002` (510 bytes)
//!
//! On Linux, locks are open-file-description (`F_OFD_*`) locks: each open
//! handle is an independent lock holder, so two connections in one process
//! observe each other exactly like two processes would. Elsewhere this
//! falls back to classic per-process POSIX locks, which are invisible
//! between handles of the same process.

use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use vsqlite_error::{Error, Result};
use vsqlite_types::{
    AccessFlags, DeviceCharacteristics, ExtendedResultCode, LockLevel, OpenFlags, ResultCode,
    SyncFlags,
};

use crate::shm::{ShmHandle, ShmLockFlags, ShmRegion};
use crate::traits::{Vfs, VfsFile};

/// Byte offset of the pending lock byte.
const PENDING_BYTE: u64 = 0x4000_0000;
/// Byte offset of the reserved lock byte.
const RESERVED_BYTE: u64 = PENDING_BYTE + 1;
/// Byte offset of the first shared lock byte.
const SHARED_FIRST: u64 = PENDING_BYTE + 2;
/// Number of bytes in the shared lock range.
const SHARED_SIZE: u64 = 510;

// ---------------------------------------------------------------------------
// fcntl helpers
// ---------------------------------------------------------------------------

#[allow(clippy::cast_possible_wrap)]
fn make_flock(lock_type: i32, start: u64, len: u64) -> libc::flock {
    let lock_type = i16::try_from(lock_type).expect("fcntl lock type must fit in i16");
    let whence = i16::try_from(libc::SEEK_SET).expect("SEEK_SET must fit in i16");
    libc::flock {
        l_type: lock_type,
        l_whence: whence,
        l_start: start as libc::off_t,
        l_len: len as libc::off_t,
        l_pid: 0,
    }
}

/// Attempt a non-blocking advisory lock.
///
/// Returns `Ok(true)` if acquired, `Ok(false)` if a conflicting lock is
/// held elsewhere, and `Err` for real I/O errors.
fn posix_lock(file: &impl AsFd, lock_type: i32, start: u64, len: u64) -> Result<bool> {
    let flock = make_flock(lock_type, start, len);

    #[cfg(target_os = "linux")]
    let arg = nix::fcntl::FcntlArg::F_OFD_SETLK(&flock);
    #[cfg(not(target_os = "linux"))]
    let arg = nix::fcntl::FcntlArg::F_SETLK(&flock);

    match nix::fcntl::fcntl(file.as_fd().as_raw_fd(), arg) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EACCES | nix::errno::Errno::EAGAIN) => Ok(false),
        Err(_) => Err(Error::extended(ExtendedResultCode::IoErrLock)),
    }
}

/// Release an advisory lock over a byte range.
fn posix_unlock(file: &impl AsFd, start: u64, len: u64) -> Result<()> {
    let ok = posix_lock(file, libc::F_UNLCK, start, len)?;
    debug_assert!(ok, "F_UNLCK never reports contention");
    Ok(())
}

// ---------------------------------------------------------------------------
// UnixVfs
// ---------------------------------------------------------------------------

/// The default filesystem-backed VFS, registered as `"unix"`.
#[derive(Debug, Default)]
pub struct UnixVfs;

impl UnixVfs {
    /// Create a new handle to the OS-file VFS.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Vfs for UnixVfs {
    fn open(&self, name: &str, flags: OpenFlags) -> Result<(Box<dyn VfsFile>, OpenFlags)> {
        let is_temp = name.is_empty();
        let path = if is_temp {
            let mut hex = String::with_capacity(32);
            for byte in random_bytes() {
                write!(hex, "{byte:02x}").expect("writing to a String cannot fail");
            }
            std::env::temp_dir().join(format!("vsqlite_{hex}"))
        } else {
            PathBuf::from(name)
        };

        let create = is_temp || flags.contains(OpenFlags::CREATE);
        let create_new =
            is_temp || (create && flags.contains(OpenFlags::EXCLUSIVE));
        let write = create || flags.contains(OpenFlags::READWRITE);

        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .create(create)
            .create_new(create_new)
            .mode(0o600)
            .open(&path)
            .map_err(|_| Error::new(ResultCode::CantOpen))?;

        let mut out_flags = flags;
        if create {
            out_flags |= OpenFlags::READWRITE;
        }

        let unix_file = UnixFile {
            file,
            path,
            lock: LockLevel::None,
            read_only: !write,
            delete_on_close: is_temp || flags.contains(OpenFlags::DELETEONCLOSE),
            shm: None,
        };
        Ok((Box::new(unix_file), out_flags))
    }

    fn delete(&self, name: &str, sync_dir: bool) -> Result<()> {
        let path = Path::new(name);
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(_) => return Err(Error::extended(ExtendedResultCode::IoErrDelete)),
        }
        if sync_dir {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            let synced = File::open(parent).and_then(|dir| dir.sync_all());
            if synced.is_err() {
                return Err(Error::extended(ExtendedResultCode::IoErrDelete));
            }
        }
        Ok(())
    }

    fn access(&self, name: &str, flags: AccessFlags) -> Result<bool> {
        let meta = match fs::metadata(name) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return Ok(false),
            Err(_) => return Err(Error::extended(ExtendedResultCode::IoErrAccess)),
        };

        if flags == AccessFlags::Exists {
            return Ok(true);
        }

        let mut want = 0o400;
        if flags == AccessFlags::ReadWrite {
            want |= 0o200;
        }
        if meta.is_dir() {
            want |= 0o100;
        }
        Ok(meta.permissions().mode() & want == want)
    }

    fn full_pathname(&self, name: &str) -> Result<String> {
        let path = Path::new(name);
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|_| Error::new(ResultCode::IoErr))?
                .join(path)
        };
        abs.into_os_string()
            .into_string()
            .map_err(|_| Error::new(ResultCode::IoErr))
    }
}

fn random_bytes() -> [u8; 16] {
    use rand::RngCore;
    let mut buf = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

// ---------------------------------------------------------------------------
// UnixFile
// ---------------------------------------------------------------------------

/// A file handle opened by [`UnixVfs`].
pub struct UnixFile {
    file: File,
    path: PathBuf,
    lock: LockLevel,
    read_only: bool,
    delete_on_close: bool,
    shm: Option<ShmHandle>,
}

impl VfsFile for UnixFile {
    fn close(&mut self) -> Result<()> {
        if let Some(mut shm) = self.shm.take() {
            shm.unmap(false)?;
        }
        if self.lock != LockLevel::None {
            self.unlock(LockLevel::None)?;
        }
        if self.delete_on_close {
            drop(fs::remove_file(&self.path));
        }
        Ok(())
    }

    fn read_at(&mut self, buf: &mut [u8], off: u64) -> Result<usize> {
        let mut total = 0_usize;
        while total < buf.len() {
            let n = self
                .file
                .read_at(&mut buf[total..], off + total as u64)
                .map_err(|_| Error::extended(ExtendedResultCode::IoErrRead))?;
            if n == 0 {
                break; // EOF
            }
            total += n;
        }
        Ok(total)
    }

    fn write_at(&mut self, buf: &[u8], off: u64) -> Result<()> {
        let mut total = 0_usize;
        while total < buf.len() {
            let n = self
                .file
                .write_at(&buf[total..], off + total as u64)
                .map_err(|_| Error::extended(ExtendedResultCode::IoErrWrite))?;
            if n == 0 {
                return Err(Error::extended(ExtendedResultCode::IoErrWrite));
            }
            total += n;
        }
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file
            .set_len(size)
            .map_err(|_| Error::extended(ExtendedResultCode::IoErrTruncate))
    }

    fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        let synced = if flags.contains(SyncFlags::DATAONLY) {
            self.file.sync_data()
        } else {
            self.file.sync_all()
        };
        synced.map_err(|_| Error::extended(ExtendedResultCode::IoErrFsync))
    }

    fn size(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|_| Error::extended(ExtendedResultCode::IoErrSeek))
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        if self.lock >= level {
            return Ok(());
        }
        if self.read_only && level >= LockLevel::Reserved {
            return Err(Error::extended(ExtendedResultCode::IoErrLock));
        }

        if level >= LockLevel::Shared && self.lock < LockLevel::Shared {
            // A shared read lock on the pending byte proves no writer is
            // mid-escalation, then the shared range is taken and the
            // pending byte released again.
            if !posix_lock(&self.file, libc::F_RDLCK, PENDING_BYTE, 1)? {
                return Err(Error::new(ResultCode::Busy));
            }
            let got = posix_lock(&self.file, libc::F_RDLCK, SHARED_FIRST, SHARED_SIZE)?;
            posix_unlock(&self.file, PENDING_BYTE, 1)?;
            if !got {
                return Err(Error::new(ResultCode::Busy));
            }
            self.lock = LockLevel::Shared;
        }

        if level >= LockLevel::Reserved && self.lock < LockLevel::Reserved {
            if !posix_lock(&self.file, libc::F_WRLCK, RESERVED_BYTE, 1)? {
                return Err(Error::new(ResultCode::Busy));
            }
            self.lock = LockLevel::Reserved;
        }

        if level >= LockLevel::Exclusive {
            if self.lock < LockLevel::Pending {
                if !posix_lock(&self.file, libc::F_WRLCK, PENDING_BYTE, 1)? {
                    return Err(Error::new(ResultCode::Busy));
                }
                self.lock = LockLevel::Pending;
            }
            // New readers are now blocked; existing ones still hold the
            // shared range, so this may fail until they drain.
            if !posix_lock(&self.file, libc::F_WRLCK, SHARED_FIRST, SHARED_SIZE)? {
                return Err(Error::new(ResultCode::Busy));
            }
            self.lock = LockLevel::Exclusive;
        }

        Ok(())
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        if self.lock <= level {
            return Ok(());
        }

        if level == LockLevel::Shared {
            // Downgrade the shared range first, then drop reserved, and
            // drop pending last so no writer sneaks in mid-downgrade.
            if self.lock == LockLevel::Exclusive
                && !posix_lock(&self.file, libc::F_RDLCK, SHARED_FIRST, SHARED_SIZE)?
            {
                return Err(Error::extended(ExtendedResultCode::IoErrRdLock));
            }
            posix_unlock(&self.file, RESERVED_BYTE, 1)?;
            posix_unlock(&self.file, PENDING_BYTE, 1)?;
        } else {
            posix_unlock(&self.file, SHARED_FIRST, SHARED_SIZE)?;
            posix_unlock(&self.file, RESERVED_BYTE, 1)?;
            posix_unlock(&self.file, PENDING_BYTE, 1)?;
        }

        self.lock = level;
        Ok(())
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        if self.lock >= LockLevel::Reserved {
            return Ok(true);
        }
        // Probe with a non-blocking exclusive; acquiring it proves nobody
        // holds reserved, and it is released immediately.
        let got = posix_lock(&self.file, libc::F_WRLCK, RESERVED_BYTE, 1)
            .map_err(|_| Error::extended(ExtendedResultCode::IoErrCheckReservedLock))?;
        if got {
            posix_unlock(&self.file, RESERVED_BYTE, 1)?;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::POWERSAFE_OVERWRITE
    }

    fn lock_state(&self) -> LockLevel {
        self.lock
    }

    fn size_hint(&mut self, size: u64) -> Result<()> {
        let current = self.size()?;
        if size > current {
            self.truncate(size)?;
        }
        Ok(())
    }

    fn shm_map(&mut self, region: u32, size: u32, extend: bool) -> Result<Option<ShmRegion>> {
        if self.shm.is_none() {
            let mut sidecar = self.path.clone().into_os_string();
            sidecar.push("-shm");
            self.shm = Some(ShmHandle::open(Path::new(&sidecar))?);
        }
        self.shm
            .as_mut()
            .expect("shm handle was just installed")
            .map(region, size, extend)
    }

    fn shm_lock(&mut self, offset: u32, n: u32, flags: ShmLockFlags) -> Result<()> {
        match self.shm.as_mut() {
            Some(shm) => shm.lock(offset, n, flags),
            None => Err(Error::extended(ExtendedResultCode::IoErrShmLock)),
        }
    }

    fn shm_barrier(&self) {
        crate::shm::barrier();
    }

    fn shm_unmap(&mut self, delete: bool) -> Result<()> {
        match self.shm.take() {
            Some(mut shm) => shm.unmap(delete),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_temp_path(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(name);
        (dir, path)
    }

    fn open_flags_create() -> OpenFlags {
        OpenFlags::MAIN_DB | OpenFlags::CREATE | OpenFlags::READWRITE
    }

    fn open(vfs: &UnixVfs, path: &Path, flags: OpenFlags) -> Box<dyn VfsFile> {
        let (file, _) = vfs.open(path.to_str().unwrap(), flags).unwrap();
        file
    }

    // -- Basic I/O --

    #[test]
    fn create_write_close_reopen_read() {
        let vfs = UnixVfs::new();
        let (_dir, path) = make_temp_path("rw.db");

        let mut file = open(&vfs, &path, open_flags_create());
        file.write_at(b"hello unix vfs", 0).unwrap();
        assert_eq!(file.size().unwrap(), 14);
        file.close().unwrap();

        let mut file = open(&vfs, &path, OpenFlags::MAIN_DB | OpenFlags::READWRITE);
        let mut buf = [0u8; 14];
        let n = file.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 14);
        assert_eq!(&buf, b"hello unix vfs");
        file.close().unwrap();
    }

    #[test]
    fn read_past_end_is_short() {
        let vfs = UnixVfs::new();
        let (_dir, path) = make_temp_path("short.db");

        let mut file = open(&vfs, &path, open_flags_create());
        file.write_at(b"hi", 0).unwrap();

        let mut buf = [0xFF_u8; 10];
        let n = file.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"hi");
        file.close().unwrap();
    }

    #[test]
    fn truncate_and_size() {
        let vfs = UnixVfs::new();
        let (_dir, path) = make_temp_path("trunc.db");

        let mut file = open(&vfs, &path, open_flags_create());
        file.write_at(b"hello world!!", 0).unwrap();
        file.truncate(5).unwrap();
        assert_eq!(file.size().unwrap(), 5);

        let mut buf = [0u8; 5];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello");
        file.close().unwrap();
    }

    #[test]
    fn open_nonexistent_without_create_fails() {
        let vfs = UnixVfs::new();
        let (_dir, path) = make_temp_path("missing.db");
        let err = vfs
            .open(
                path.to_str().unwrap(),
                OpenFlags::MAIN_DB | OpenFlags::READWRITE,
            )
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::CantOpen);
    }

    #[test]
    fn delete_missing_file_is_ok() {
        let vfs = UnixVfs::new();
        let (_dir, path) = make_temp_path("missing.db");
        Vfs::delete(&vfs, path.to_str().unwrap(), false).unwrap();
    }

    #[test]
    fn delete_with_dir_sync() {
        let vfs = UnixVfs::new();
        let (_dir, path) = make_temp_path("victim.db");

        let mut file = open(&vfs, &path, open_flags_create());
        file.write_at(b"data", 0).unwrap();
        file.close().unwrap();

        assert!(vfs.access(path.to_str().unwrap(), AccessFlags::Exists).unwrap());
        Vfs::delete(&vfs, path.to_str().unwrap(), true).unwrap();
        assert!(!vfs.access(path.to_str().unwrap(), AccessFlags::Exists).unwrap());
    }

    #[test]
    fn access_readwrite() {
        let vfs = UnixVfs::new();
        let (_dir, path) = make_temp_path("perm.db");

        let mut file = open(&vfs, &path, open_flags_create());
        file.close().unwrap();

        assert!(vfs
            .access(path.to_str().unwrap(), AccessFlags::ReadWrite)
            .unwrap());
        assert!(vfs.access(path.to_str().unwrap(), AccessFlags::Read).unwrap());
    }

    #[test]
    fn full_pathname_resolves_relative() {
        let vfs = UnixVfs::new();
        let abs = vfs.full_pathname("/tmp/x.db").unwrap();
        assert_eq!(abs, "/tmp/x.db");

        let rel = vfs.full_pathname("x.db").unwrap();
        assert!(Path::new(&rel).is_absolute());
    }

    #[test]
    fn temp_file_is_deleted_on_close() {
        let vfs = UnixVfs::new();
        let (file, out_flags) = vfs
            .open("", OpenFlags::TRANSIENT_DB | OpenFlags::CREATE)
            .unwrap();
        assert!(out_flags.contains(OpenFlags::READWRITE));
        let mut file = file;
        file.write_at(b"scratch", 0).unwrap();
        file.close().unwrap();
    }

    #[test]
    fn delete_on_close_flag() {
        let vfs = UnixVfs::new();
        let (_dir, path) = make_temp_path("auto.db");

        let flags = open_flags_create() | OpenFlags::DELETEONCLOSE;
        let mut file = open(&vfs, &path, flags);
        file.write_at(b"temp", 0).unwrap();
        assert!(path.exists());
        file.close().unwrap();
        assert!(!path.exists());
    }

    // -- Locking --

    #[test]
    fn lock_escalation_and_downgrade() {
        let vfs = UnixVfs::new();
        let (_dir, path) = make_temp_path("lock.db");
        let mut file = open(&vfs, &path, open_flags_create());

        file.lock(LockLevel::Shared).unwrap();
        assert_eq!(file.lock_state(), LockLevel::Shared);
        file.lock(LockLevel::Reserved).unwrap();
        assert_eq!(file.lock_state(), LockLevel::Reserved);
        file.lock(LockLevel::Exclusive).unwrap();
        assert_eq!(file.lock_state(), LockLevel::Exclusive);

        file.unlock(LockLevel::Shared).unwrap();
        assert_eq!(file.lock_state(), LockLevel::Shared);
        file.unlock(LockLevel::None).unwrap();
        assert_eq!(file.lock_state(), LockLevel::None);
        file.close().unwrap();
    }

    #[test]
    fn lock_is_idempotent() {
        let vfs = UnixVfs::new();
        let (_dir, path) = make_temp_path("idem.db");
        let mut file = open(&vfs, &path, open_flags_create());

        file.lock(LockLevel::Shared).unwrap();
        file.lock(LockLevel::Shared).unwrap();
        assert_eq!(file.lock_state(), LockLevel::Shared);
        file.unlock(LockLevel::None).unwrap();
        file.close().unwrap();
    }

    #[test]
    fn read_only_refused_reserved() {
        let vfs = UnixVfs::new();
        let (_dir, path) = make_temp_path("ro.db");

        let mut file = open(&vfs, &path, open_flags_create());
        file.write_at(b"data", 0).unwrap();
        file.close().unwrap();

        let mut file = open(&vfs, &path, OpenFlags::MAIN_DB | OpenFlags::READONLY);
        file.lock(LockLevel::Shared).unwrap();
        let err = file.lock(LockLevel::Reserved).unwrap_err();
        assert_eq!(err.extended_code(), ExtendedResultCode::IoErrLock as u32);
        file.unlock(LockLevel::None).unwrap();
        file.close().unwrap();
    }

    // OFD locks make separate handles in one process independent holders,
    // so the cross-connection protocol is observable in a single test
    // process only on Linux.
    #[cfg(target_os = "linux")]
    mod ofd {
        use super::*;

        #[test]
        fn exclusive_blocks_shared() {
            let vfs = UnixVfs::new();
            let (_dir, path) = make_temp_path("excl.db");

            let mut a = open(&vfs, &path, open_flags_create());
            let mut b = open(&vfs, &path, OpenFlags::MAIN_DB | OpenFlags::READWRITE);

            a.lock(LockLevel::Shared).unwrap();
            a.lock(LockLevel::Reserved).unwrap();
            a.lock(LockLevel::Exclusive).unwrap();

            let err = b.lock(LockLevel::Shared).unwrap_err();
            assert_eq!(err.code(), ResultCode::Busy);

            a.unlock(LockLevel::None).unwrap();
            b.lock(LockLevel::Shared).unwrap();

            b.unlock(LockLevel::None).unwrap();
            a.close().unwrap();
            b.close().unwrap();
        }

        #[test]
        fn reserved_excludes_reserved() {
            let vfs = UnixVfs::new();
            let (_dir, path) = make_temp_path("resv.db");

            let mut a = open(&vfs, &path, open_flags_create());
            let mut b = open(&vfs, &path, OpenFlags::MAIN_DB | OpenFlags::READWRITE);

            a.lock(LockLevel::Shared).unwrap();
            a.lock(LockLevel::Reserved).unwrap();

            b.lock(LockLevel::Shared).unwrap();
            let err = b.lock(LockLevel::Reserved).unwrap_err();
            assert_eq!(err.code(), ResultCode::Busy);

            assert!(b.check_reserved_lock().unwrap());

            a.unlock(LockLevel::None).unwrap();
            b.lock(LockLevel::Reserved).unwrap();

            a.close().unwrap();
            b.unlock(LockLevel::None).unwrap();
            b.close().unwrap();
        }

        #[test]
        fn shared_readers_coexist() {
            let vfs = UnixVfs::new();
            let (_dir, path) = make_temp_path("readers.db");

            let mut a = open(&vfs, &path, open_flags_create());
            let mut b = open(&vfs, &path, OpenFlags::MAIN_DB | OpenFlags::READWRITE);

            a.lock(LockLevel::Shared).unwrap();
            b.lock(LockLevel::Shared).unwrap();

            // A writer with readers present parks at pending.
            a.lock(LockLevel::Reserved).unwrap();
            let err = a.lock(LockLevel::Exclusive).unwrap_err();
            assert_eq!(err.code(), ResultCode::Busy);
            assert_eq!(a.lock_state(), LockLevel::Pending);

            b.unlock(LockLevel::None).unwrap();
            a.lock(LockLevel::Exclusive).unwrap();

            a.unlock(LockLevel::None).unwrap();
            a.close().unwrap();
            b.close().unwrap();
        }

        #[test]
        fn check_reserved_lock_probe() {
            let vfs = UnixVfs::new();
            let (_dir, path) = make_temp_path("probe.db");

            let mut a = open(&vfs, &path, open_flags_create());
            let b = open(&vfs, &path, OpenFlags::MAIN_DB | OpenFlags::READWRITE);

            assert!(!b.check_reserved_lock().unwrap());
            a.lock(LockLevel::Shared).unwrap();
            a.lock(LockLevel::Reserved).unwrap();
            assert!(b.check_reserved_lock().unwrap());
            assert!(a.check_reserved_lock().unwrap());

            a.unlock(LockLevel::None).unwrap();
            assert!(!b.check_reserved_lock().unwrap());
            a.close().unwrap();
        }
    }

    // -- WAL shared memory --

    #[test]
    fn shm_map_and_lock() {
        let vfs = UnixVfs::new();
        let (_dir, path) = make_temp_path("wal.db");
        let mut file = open(&vfs, &path, open_flags_create());

        assert!(file.shm_map(0, 32768, false).unwrap().is_none());
        let region = file.shm_map(0, 32768, true).unwrap().unwrap();
        assert_eq!(region.len(), 32768);

        file.shm_lock(0, 1, ShmLockFlags::LOCK | ShmLockFlags::EXCLUSIVE)
            .unwrap();
        file.shm_lock(0, 1, ShmLockFlags::UNLOCK).unwrap();

        let sidecar = path.with_extension("db-shm");
        assert!(sidecar.exists());

        file.shm_unmap(true).unwrap();
        assert!(!sidecar.exists());
        file.close().unwrap();
    }

    #[test]
    fn shm_shared_between_handles() {
        let vfs = UnixVfs::new();
        let (_dir, path) = make_temp_path("wal2.db");

        let mut a = open(&vfs, &path, open_flags_create());
        let mut b = open(&vfs, &path, OpenFlags::MAIN_DB | OpenFlags::READWRITE);

        let ra = a.shm_map(0, 32768, true).unwrap().unwrap();
        ra.write_u32_le(0, 0x1234_5678);

        let rb = b.shm_map(0, 32768, true).unwrap().unwrap();
        assert_eq!(rb.read_u32_le(0), 0x1234_5678);

        a.shm_unmap(false).unwrap();
        b.shm_unmap(true).unwrap();
        a.close().unwrap();
        b.close().unwrap();
    }
}
