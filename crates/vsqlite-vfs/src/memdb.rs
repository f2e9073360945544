//! In-memory VFS with a sectored store and the full advisory lock protocol.
//!
//! Each database is an ordered list of 64 KiB sectors. The sector size is
//! the engine's maximum page size, so every read and write the engine
//! issues is sector-aligned; I/O that spans a sector boundary is a protocol
//! violation, not a supported operation.
//!
//! Concurrency discipline: two locks per database. `data` (reader/writer)
//! protects the sector list and logical size; `lock` (exclusive) protects
//! the advisory lock state. They are never held nested, and readers never
//! touch the lock-state mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use vsqlite_error::{Error, Result};
use vsqlite_types::{
    AccessFlags, DeviceCharacteristics, ExtendedResultCode, LockLevel, OpenFlags, ResultCode,
    SyncFlags,
};

use crate::traits::{Vfs, VfsFile};

/// Must be a multiple of 64 KiB, the engine's largest page size.
const SECTOR_SIZE: usize = 65536;

/// Bounded spin budget while waiting for readers to drain on the way to
/// an exclusive lock.
const SPIN_WAIT: Duration = Duration::from_micros(25);

type Sector = Box<[u8; SECTOR_SIZE]>;

fn new_sector() -> Sector {
    // A boxed array this size would blow the stack if built by value.
    vec![0u8; SECTOR_SIZE]
        .into_boxed_slice()
        .try_into()
        .expect("sector allocation has exactly SECTOR_SIZE bytes")
}

#[derive(Default)]
struct Data {
    sectors: Vec<Sector>,
    size: u64,
}

#[derive(Default)]
struct LockState {
    pending: Option<u64>,
    reserved: Option<u64>,
    shared: u32,
}

#[derive(Default)]
struct MemDb {
    lock: Mutex<LockState>,
    data: RwLock<Data>,
}

fn shared_dbs() -> &'static Mutex<HashMap<String, Arc<MemDb>>> {
    static DBS: OnceLock<Mutex<HashMap<String, Arc<MemDb>>>> = OnceLock::new();
    DBS.get_or_init(Mutex::default)
}

fn next_file_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// The in-memory VFS, registered as `"memdb"`.
///
/// Names beginning with `/` resolve through a process-wide registry and are
/// shared between all openers; any other name is private to its opener.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemVfs;

impl MemVfs {
    /// Create a new handle to the memory VFS.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Create (or reuse) the shared database registered under `name` and
/// return whether it already existed. Useful for seeding test fixtures.
pub fn create(name: &str) -> bool {
    let mut dbs = shared_dbs().lock();
    let existed = dbs.contains_key(name);
    dbs.entry(name.to_owned()).or_default();
    existed
}

/// Drop the shared database registered under `name`. Open files keep their
/// reference; the name simply stops resolving.
pub fn delete(name: &str) {
    shared_dbs().lock().remove(name);
}

impl Vfs for MemVfs {
    fn open(&self, name: &str, flags: OpenFlags) -> Result<(Box<dyn VfsFile>, OpenFlags)> {
        // Only page-aligned file types are supported: databases, and the
        // temp journals the sorter uses the same way. Reporting MEMORY in
        // the out-flags keeps the engine from asking for anything else.
        let types = OpenFlags::MAIN_DB
            | OpenFlags::TEMP_DB
            | OpenFlags::TRANSIENT_DB
            | OpenFlags::TEMP_JOURNAL;
        if !flags.intersects(types) {
            return Err(Error::new(ResultCode::CantOpen));
        }

        let shared = name.starts_with('/');
        let db = if shared {
            let mut dbs = shared_dbs().lock();
            match dbs.get(&name[1..]) {
                Some(db) => Arc::clone(db),
                None => {
                    if !flags.contains(OpenFlags::CREATE) {
                        return Err(Error::new(ResultCode::CantOpen));
                    }
                    let db = Arc::<MemDb>::default();
                    dbs.insert(name[1..].to_owned(), Arc::clone(&db));
                    db
                }
            }
        } else {
            if !flags.contains(OpenFlags::CREATE) {
                return Err(Error::new(ResultCode::CantOpen));
            }
            Arc::default()
        };

        let file = MemFile {
            db,
            id: next_file_id(),
            lock: LockLevel::None,
            read_only: flags.contains(OpenFlags::READONLY),
        };
        Ok((Box::new(file), flags | OpenFlags::MEMORY))
    }

    fn delete(&self, _name: &str, _sync_dir: bool) -> Result<()> {
        Err(Error::extended(ExtendedResultCode::IoErrDelete))
    }

    fn access(&self, _name: &str, _flags: AccessFlags) -> Result<bool> {
        Ok(false)
    }

    fn full_pathname(&self, name: &str) -> Result<String> {
        Ok(name.to_owned())
    }
}

/// One open file in the memory VFS. All handles to a shared database refer
/// to the same [`MemDb`] and therefore the same lock state.
pub struct MemFile {
    db: Arc<MemDb>,
    id: u64,
    lock: LockLevel,
    read_only: bool,
}

impl VfsFile for MemFile {
    fn close(&mut self) -> Result<()> {
        self.unlock(LockLevel::None)
    }

    fn read_at(&mut self, buf: &mut [u8], off: u64) -> Result<usize> {
        let data = self.db.data.read();

        if off >= data.size {
            return Ok(0);
        }

        let base = (off / SECTOR_SIZE as u64) as usize;
        let rest = (off % SECTOR_SIZE as u64) as usize;
        let mut have = SECTOR_SIZE;
        if base == data.sectors.len() - 1 {
            have = mod_round_up(data.size, SECTOR_SIZE as u64) as usize;
        }

        let avail = have - rest;
        let n = buf.len().min(avail);
        buf[..n].copy_from_slice(&data.sectors[base][rest..rest + n]);
        Ok(n)
    }

    fn write_at(&mut self, buf: &[u8], off: u64) -> Result<()> {
        let mut data = self.db.data.write();

        let base = (off / SECTOR_SIZE as u64) as usize;
        let rest = (off % SECTOR_SIZE as u64) as usize;
        while base >= data.sectors.len() {
            data.sectors.push(new_sector());
        }
        let n = buf.len().min(SECTOR_SIZE - rest);
        data.sectors[base][rest..rest + n].copy_from_slice(&buf[..n]);
        if n < buf.len() {
            // Writes are contractually page-aligned and never span sectors.
            return Err(Error::extended(ExtendedResultCode::IoErrShortWrite));
        }
        let end = off + buf.len() as u64;
        if end > data.size {
            data.size = end;
        }
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        let mut data = self.db.data.write();
        truncate_locked(&mut data, size);
        Ok(())
    }

    fn sync(&mut self, _flags: SyncFlags) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.db.data.read().size)
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        if self.lock >= level {
            return Ok(());
        }

        if self.read_only && level >= LockLevel::Reserved {
            return Err(Error::extended(ExtendedResultCode::IoErrLock));
        }

        let mut state = self.db.lock.lock();

        match level {
            LockLevel::Shared => {
                if state.pending.is_some() {
                    return Err(Error::new(ResultCode::Busy));
                }
                state.shared += 1;
            }

            LockLevel::Reserved => {
                if state.reserved.is_some() {
                    return Err(Error::new(ResultCode::Busy));
                }
                state.reserved = Some(self.id);
            }

            LockLevel::Exclusive => {
                if self.lock < LockLevel::Pending {
                    if state.pending.is_some() {
                        return Err(Error::new(ResultCode::Busy));
                    }
                    self.lock = LockLevel::Pending;
                    state.pending = Some(self.id);
                }

                // Wait for other readers to drain, yielding between polls
                // so they get a chance to. The pending claim stays held on
                // expiry; the engine unwinds it through unlock.
                let before = Instant::now();
                while state.shared > 1 {
                    if before.elapsed() > SPIN_WAIT {
                        return Err(Error::new(ResultCode::Busy));
                    }
                    drop(state);
                    std::thread::yield_now();
                    state = self.db.lock.lock();
                }
            }

            LockLevel::None | LockLevel::Pending => {}
        }

        self.lock = level;
        Ok(())
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        if self.lock <= level {
            return Ok(());
        }

        let mut state = self.db.lock.lock();

        if state.pending == Some(self.id) {
            state.pending = None;
        }
        if state.reserved == Some(self.id) {
            state.reserved = None;
        }
        if level < LockLevel::Shared {
            state.shared -= 1;
        }
        self.lock = level;
        Ok(())
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        if self.lock >= LockLevel::Reserved {
            return Ok(true);
        }
        Ok(self.db.lock.lock().reserved.is_some())
    }

    fn sector_size(&self) -> u32 {
        SECTOR_SIZE as u32
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::ATOMIC
            | DeviceCharacteristics::SEQUENTIAL
            | DeviceCharacteristics::SAFE_APPEND
            | DeviceCharacteristics::POWERSAFE_OVERWRITE
    }

    fn lock_state(&self) -> LockLevel {
        self.lock
    }

    fn size_hint(&mut self, size: u64) -> Result<()> {
        let mut data = self.db.data.write();
        if size > data.size {
            truncate_locked(&mut data, size);
        }
        Ok(())
    }
}

fn truncate_locked(data: &mut Data, size: u64) {
    if size < data.size {
        // Zero the retained tail of the final sector so regrowth reads
        // zeros, not stale bytes.
        let base = (size / SECTOR_SIZE as u64) as usize;
        let rest = (size % SECTOR_SIZE as u64) as usize;
        if rest != 0 {
            data.sectors[base][rest..].fill(0);
        }
    }
    let sectors = div_round_up(size, SECTOR_SIZE as u64) as usize;
    while sectors > data.sectors.len() {
        data.sectors.push(new_sector());
    }
    data.sectors.truncate(sectors);
    data.size = size;
}

fn div_round_up(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

fn mod_round_up(a: u64, b: u64) -> u64 {
    b - (b - a % b) % b
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn open_rw(vfs: &MemVfs, name: &str) -> Box<dyn VfsFile> {
        let flags = OpenFlags::MAIN_DB | OpenFlags::CREATE | OpenFlags::READWRITE;
        let (file, out_flags) = vfs.open(name, flags).unwrap();
        assert!(out_flags.contains(OpenFlags::MEMORY));
        file
    }

    #[test]
    fn page_round_trip() {
        let vfs = MemVfs::new();
        let mut file = open_rw(&vfs, "private.db");

        let page = vec![0xAB_u8; 4096];
        file.write_at(&page, 0).unwrap();
        file.write_at(&page, 4096).unwrap();
        assert_eq!(file.size().unwrap(), 8192);

        let mut buf = vec![0u8; 4096];
        let n = file.read_at(&mut buf, 4096).unwrap();
        assert_eq!(n, 4096);
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn read_past_end_is_eof() {
        let vfs = MemVfs::new();
        let mut file = open_rw(&vfs, "eof.db");
        file.write_at(b"xy", 0).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(&mut buf, 2).unwrap(), 0);
        assert_eq!(file.read_at(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn short_read_at_tail() {
        let vfs = MemVfs::new();
        let mut file = open_rw(&vfs, "tail.db");
        file.write_at(b"hello", 0).unwrap();

        let mut buf = [0xFF_u8; 10];
        let n = file.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn sector_spanning_write_rejected() {
        let vfs = MemVfs::new();
        let mut file = open_rw(&vfs, "span.db");

        let buf = vec![1u8; 64];
        let off = SECTOR_SIZE as u64 - 32;
        let err = file.write_at(&buf, off).unwrap_err();
        assert_eq!(
            err.extended_code(),
            ExtendedResultCode::IoErrShortWrite as u32
        );
    }

    #[test]
    fn write_beyond_end_appends_zeroed_sectors() {
        let vfs = MemVfs::new();
        let mut file = open_rw(&vfs, "sparse.db");

        let off = 3 * SECTOR_SIZE as u64;
        file.write_at(b"mark", off).unwrap();
        assert_eq!(file.size().unwrap(), off + 4);

        let mut buf = [0xFF_u8; 4];
        let n = file.read_at(&mut buf, SECTOR_SIZE as u64).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn truncate_zeroes_retained_tail() {
        let vfs = MemVfs::new();
        let mut file = open_rw(&vfs, "trunc.db");

        file.write_at(&[0xEE; 4096], 0).unwrap();
        file.truncate(100).unwrap();
        assert_eq!(file.size().unwrap(), 100);

        // Growing back must read zeros where data was truncated away.
        file.truncate(4096).unwrap();
        let mut buf = [0xFF_u8; 8];
        file.read_at(&mut buf, 100).unwrap();
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn size_hint_only_grows() {
        let vfs = MemVfs::new();
        let mut file = open_rw(&vfs, "hint.db");
        file.write_at(b"data", 0).unwrap();

        file.size_hint(1 << 20).unwrap();
        assert_eq!(file.size().unwrap(), 1 << 20);

        file.size_hint(10).unwrap();
        assert_eq!(file.size().unwrap(), 1 << 20);
    }

    #[test]
    fn unsupported_file_types_cant_open() {
        let vfs = MemVfs::new();
        let flags = OpenFlags::MAIN_JOURNAL | OpenFlags::CREATE | OpenFlags::READWRITE;
        let err = vfs.open("j.db-journal", flags).unwrap_err();
        assert_eq!(err.code(), ResultCode::CantOpen);
    }

    #[test]
    fn delete_is_never_supported() {
        let vfs = MemVfs::new();
        let err = Vfs::delete(&vfs, "/anything", false).unwrap_err();
        assert_eq!(
            err.extended_code(),
            ExtendedResultCode::IoErrDelete as u32
        );
    }

    #[test]
    fn shared_databases_resolve_by_name() {
        let vfs = MemVfs::new();
        let mut f1 = open_rw(&vfs, "/shared-resolve");
        f1.write_at(b"visible", 0).unwrap();

        let flags = OpenFlags::MAIN_DB | OpenFlags::READWRITE;
        let (mut f2, _) = vfs.open("/shared-resolve", flags).unwrap();
        let mut buf = [0u8; 7];
        assert_eq!(f2.read_at(&mut buf, 0).unwrap(), 7);
        assert_eq!(&buf, b"visible");

        delete("shared-resolve");
    }

    #[test]
    fn private_databases_are_distinct() {
        let vfs = MemVfs::new();
        let mut f1 = open_rw(&vfs, "same-name.db");
        let mut f2 = open_rw(&vfs, "same-name.db");

        f1.write_at(b"one", 0).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(f2.read_at(&mut buf, 0).unwrap(), 0);
    }

    #[test]
    fn shared_db_requires_create_when_absent() {
        let vfs = MemVfs::new();
        let flags = OpenFlags::MAIN_DB | OpenFlags::READWRITE;
        let err = vfs.open("/never-created", flags).unwrap_err();
        assert_eq!(err.code(), ResultCode::CantOpen);
    }

    #[test]
    fn create_helper_registers_shared_db() {
        assert!(!create("seeded"));
        assert!(create("seeded"));

        let vfs = MemVfs::new();
        let flags = OpenFlags::MAIN_DB | OpenFlags::READWRITE;
        assert!(vfs.open("/seeded", flags).is_ok());
        delete("seeded");
    }

    // -- Lock protocol --

    #[test]
    fn reserved_excludes_reserved() {
        let vfs = MemVfs::new();
        let mut f1 = open_rw(&vfs, "/lock-reserved");
        let mut f2 = open_rw(&vfs, "/lock-reserved");

        f1.lock(LockLevel::Shared).unwrap();
        f1.lock(LockLevel::Reserved).unwrap();

        f2.lock(LockLevel::Shared).unwrap();
        let err = f2.lock(LockLevel::Reserved).unwrap_err();
        assert_eq!(err.code(), ResultCode::Busy);

        f1.unlock(LockLevel::Shared).unwrap();
        f2.lock(LockLevel::Reserved).unwrap();

        f1.unlock(LockLevel::None).unwrap();
        f2.unlock(LockLevel::None).unwrap();
        delete("lock-reserved");
    }

    #[test]
    fn pending_blocks_new_shared() {
        let vfs = MemVfs::new();
        let mut writer = open_rw(&vfs, "/lock-pending");
        let mut reader1 = open_rw(&vfs, "/lock-pending");
        let mut reader2 = open_rw(&vfs, "/lock-pending");

        reader1.lock(LockLevel::Shared).unwrap();
        writer.lock(LockLevel::Shared).unwrap();
        writer.lock(LockLevel::Reserved).unwrap();

        // Reader 1 still holds shared, so the exclusive attempt parks at
        // pending and reports busy after the spin budget.
        let err = writer.lock(LockLevel::Exclusive).unwrap_err();
        assert_eq!(err.code(), ResultCode::Busy);
        assert_eq!(writer.lock_state(), LockLevel::Pending);

        // Pending blocks any new shared lock.
        let err = reader2.lock(LockLevel::Shared).unwrap_err();
        assert_eq!(err.code(), ResultCode::Busy);

        // Once the reader drains, exclusive succeeds.
        reader1.unlock(LockLevel::None).unwrap();
        writer.lock(LockLevel::Exclusive).unwrap();
        assert_eq!(writer.lock_state(), LockLevel::Exclusive);

        writer.unlock(LockLevel::None).unwrap();
        delete("lock-pending");
    }

    #[test]
    fn exclusive_succeeds_as_sole_holder() {
        let vfs = MemVfs::new();
        let mut file = open_rw(&vfs, "solo.db");
        file.lock(LockLevel::Shared).unwrap();
        file.lock(LockLevel::Reserved).unwrap();
        file.lock(LockLevel::Exclusive).unwrap();
        assert!(file.check_reserved_lock().unwrap());
        file.unlock(LockLevel::None).unwrap();
        assert_eq!(file.lock_state(), LockLevel::None);
    }

    #[test]
    fn read_only_refused_reserved() {
        let vfs = MemVfs::new();
        create("ro-db");
        let flags = OpenFlags::MAIN_DB | OpenFlags::READONLY;
        let (mut file, _) = vfs.open("/ro-db", flags).unwrap();

        file.lock(LockLevel::Shared).unwrap();
        let err = file.lock(LockLevel::Reserved).unwrap_err();
        assert_eq!(err.extended_code(), ExtendedResultCode::IoErrLock as u32);

        file.unlock(LockLevel::None).unwrap();
        delete("ro-db");
    }

    #[test]
    fn check_reserved_sees_other_holder() {
        let vfs = MemVfs::new();
        let mut f1 = open_rw(&vfs, "/check-reserved");
        let f2 = open_rw(&vfs, "/check-reserved");

        assert!(!f2.check_reserved_lock().unwrap());
        f1.lock(LockLevel::Shared).unwrap();
        f1.lock(LockLevel::Reserved).unwrap();
        assert!(f2.check_reserved_lock().unwrap());

        f1.unlock(LockLevel::None).unwrap();
        delete("check-reserved");
    }

    #[test]
    fn unlock_below_shared_decrements_reader_count() {
        let vfs = MemVfs::new();
        let mut f1 = open_rw(&vfs, "/reader-count");
        let mut f2 = open_rw(&vfs, "/reader-count");

        f1.lock(LockLevel::Shared).unwrap();
        f2.lock(LockLevel::Shared).unwrap();
        f1.unlock(LockLevel::None).unwrap();

        // With one reader left, that reader can still escalate.
        f2.lock(LockLevel::Reserved).unwrap();
        f2.lock(LockLevel::Exclusive).unwrap();
        f2.unlock(LockLevel::None).unwrap();
        delete("reader-count");
    }

    proptest! {
        #[test]
        fn aligned_io_round_trips(
            pages in proptest::collection::vec((0u8..=255, 0usize..16), 1..12)
        ) {
            let vfs = MemVfs::new();
            let mut file = open_rw(&vfs, "prop.db");
            let page_size = 4096_usize;

            for &(fill, page_no) in &pages {
                let buf = vec![fill; page_size];
                file.write_at(&buf, (page_no * page_size) as u64).unwrap();
            }
            for &(fill, page_no) in pages.iter().rev() {
                // Later writes win; find the last write to this page.
                let expect = pages
                    .iter()
                    .rev()
                    .find(|&&(_, p)| p == page_no)
                    .map(|&(f, _)| f)
                    .unwrap_or(fill);
                let mut buf = vec![0u8; page_size];
                let n = file.read_at(&mut buf, (page_no * page_size) as u64).unwrap();
                prop_assert_eq!(n, page_size);
                prop_assert!(buf.iter().all(|&b| b == expect));
            }
        }

        #[test]
        fn truncate_then_size(size1 in 0u64..300_000, size2 in 0u64..300_000) {
            let vfs = MemVfs::new();
            let mut file = open_rw(&vfs, "prop-trunc.db");
            file.truncate(size1).unwrap();
            prop_assert_eq!(file.size().unwrap(), size1);
            file.truncate(size2).unwrap();
            prop_assert_eq!(file.size().unwrap(), size2);
        }
    }
}
