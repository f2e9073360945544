//! The host-import module: the callbacks the engine calls back into while a
//! call is in flight.
//!
//! All pointer arguments are offsets into the engine's linear memory, and
//! every return value is an engine result code. Host errors are mapped to
//! codes at this boundary and never unwind across it; the only exceptions
//! are the two fatal classes (out-of-memory and linear-memory range
//! violations), which panic because the engine is no longer trustworthy.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tracing::debug;

use vsqlite_types::{
    AccessFlags, ExtendedResultCode, LockLevel, OpenFlags, ResultCode, SyncFlags,
};
use vsqlite_vfs::Vfs;

use crate::mem::{Memory, MemoryMut};

/// Longest path name accepted from the engine.
const MAX_PATHNAME: u32 = 1024;

/// Size of the engine-side file header preceding the host's slot index.
const FILE_HEADER_SIZE: u32 = 4;

/// Unix epoch expressed in Julian days.
const JULIAN_UNIX_EPOCH_DAYS: f64 = 2_440_587.5;

/// Unix epoch expressed in Julian milliseconds.
const JULIAN_UNIX_EPOCH_MSEC: i64 = 210_866_760_000_000;

const OK: u32 = ResultCode::Ok as u32;

type BusyHandler = Box<dyn FnMut(i32) -> bool + Send>;

/// Dispatch state for one connection: the selected VFS, the table of open
/// files the engine refers to by slot index, and the optional busy handler.
pub struct HostDispatch {
    vfs: Arc<dyn Vfs>,
    files: Vec<Option<Box<dyn vsqlite_vfs::VfsFile>>>,
    busy_handler: Option<BusyHandler>,
}

impl HostDispatch {
    /// Create the dispatch state for a connection using `vfs`.
    #[must_use]
    pub fn new(vfs: Arc<dyn Vfs>) -> Self {
        Self {
            vfs,
            files: Vec::new(),
            busy_handler: None,
        }
    }

    /// Install (or clear) the busy handler consulted on `BUSY` lock
    /// transitions.
    pub fn set_busy_handler(&mut self, handler: Option<BusyHandler>) {
        self.busy_handler = handler;
    }

    /// Close any files the engine left open (connection teardown).
    pub fn close_all(&mut self) {
        for slot in &mut self.files {
            if let Some(mut file) = slot.take() {
                drop(file.close());
            }
        }
    }

    fn file_for(&mut self, mem: &[u8], p_file: u32) -> Option<&mut Box<dyn vsqlite_vfs::VfsFile>> {
        let id = Memory::new(mem).read_u32(p_file + FILE_HEADER_SIZE) as usize;
        self.files.get_mut(id).and_then(Option::as_mut)
    }

    // -- Environment imports ------------------------------------------------

    /// Fill `n` bytes at `z_out` from the OS randomness source; returns the
    /// number of bytes produced.
    pub fn randomness(&mut self, mem: &mut [u8], z_out: u32, n: u32) -> u32 {
        let mut view = MemoryMut::new(mem);
        rand::rngs::OsRng.fill_bytes(view.slice_mut(z_out, n));
        n
    }

    /// Block the calling engine thread for at least `micros` microseconds.
    pub fn sleep(&mut self, micros: u32) -> u32 {
        std::thread::sleep(Duration::from_micros(u64::from(micros)));
        OK
    }

    /// Write the current instant at `out` as a Julian day number.
    pub fn current_time(&mut self, mem: &mut [u8], out: u32) -> u32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let day = JULIAN_UNIX_EPOCH_DAYS + now.as_secs_f64() / 86_400.0;
        MemoryMut::new(mem).write_f64(out, day);
        OK
    }

    /// Write the current instant at `out` as Julian milliseconds.
    pub fn current_time_64(&mut self, mem: &mut [u8], out: u32) -> u32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let msec = JULIAN_UNIX_EPOCH_MSEC + i64::try_from(now.as_millis()).unwrap_or(i64::MAX);
        MemoryMut::new(mem).write_u64(out, msec as u64);
        OK
    }

    // -- Filesystem imports -------------------------------------------------

    /// Resolve `z_name` to an absolute path, writing it NUL-terminated at
    /// `z_out` (capacity `n_out`).
    pub fn full_pathname(&mut self, mem: &mut [u8], z_name: u32, n_out: u32, z_out: u32) -> u32 {
        let name = Memory::new(mem).read_string(z_name, MAX_PATHNAME);
        let resolved = match self.vfs.full_pathname(&name) {
            Ok(resolved) => resolved,
            Err(_) => return ResultCode::IoErr as u32,
        };
        let needed = resolved.len() as u32 + 1;
        if needed > n_out {
            return ResultCode::IoErr as u32;
        }
        MemoryMut::new(mem).write_string(z_out, &resolved);
        OK
    }

    /// Remove `z_name`; fsync the containing directory when `sync_dir` is
    /// set. A missing file is not an error.
    pub fn delete(&mut self, mem: &mut [u8], z_name: u32, sync_dir: u32) -> u32 {
        let name = Memory::new(mem).read_string(z_name, MAX_PATHNAME);
        match self.vfs.delete(&name, sync_dir != 0) {
            Ok(()) => OK,
            Err(err) => err.extended_code(),
        }
    }

    /// Write `1`/`0` at `p_res_out` according to the access check `flags`.
    pub fn access(&mut self, mem: &mut [u8], z_name: u32, flags: u32, p_res_out: u32) -> u32 {
        let name = Memory::new(mem).read_string(z_name, MAX_PATHNAME);
        let Some(flags) = AccessFlags::from_u32(flags) else {
            return ExtendedResultCode::IoErrAccess as u32;
        };
        match self.vfs.access(&name, flags) {
            Ok(res) => {
                MemoryMut::new(mem).write_u32(p_res_out, u32::from(res));
                OK
            }
            Err(err) => err.extended_code(),
        }
    }

    /// Open `z_name`, store the file in the next free slot of the file
    /// table, and write the slot index into the engine-side file object.
    pub fn open(
        &mut self,
        mem: &mut [u8],
        z_name: u32,
        p_file: u32,
        flags: u32,
        p_out_flags: u32,
    ) -> u32 {
        let name = if z_name == 0 {
            String::new()
        } else {
            Memory::new(mem).read_string(z_name, MAX_PATHNAME)
        };
        let flags = OpenFlags::from_bits_truncate(flags);

        let (file, out_flags) = match self.vfs.open(&name, flags) {
            Ok(opened) => opened,
            Err(err) => {
                debug!(name = %name, code = err.extended_code(), "vfs open failed");
                return ResultCode::CantOpen as u32;
            }
        };

        let id = match self.files.iter().position(Option::is_none) {
            Some(free) => {
                self.files[free] = Some(file);
                free
            }
            None => {
                self.files.push(Some(file));
                self.files.len() - 1
            }
        };

        let mut view = MemoryMut::new(mem);
        view.write_u32(p_file + FILE_HEADER_SIZE, id as u32);
        if p_out_flags != 0 {
            view.write_u32(p_out_flags, out_flags.bits());
        }
        OK
    }

    /// Close the file in the slot referenced by the engine-side file object
    /// and null the slot.
    pub fn close(&mut self, mem: &mut [u8], p_file: u32) -> u32 {
        let id = Memory::new(mem).read_u32(p_file + FILE_HEADER_SIZE) as usize;
        let Some(file) = self.files.get_mut(id).and_then(Option::take) else {
            return ExtendedResultCode::IoErrClose as u32;
        };
        let mut file = file;
        match file.close() {
            Ok(()) => OK,
            Err(_) => ExtendedResultCode::IoErrClose as u32,
        }
    }

    /// Positional read. An exact read returns `OK`; a short read zero-fills
    /// the tail and reports it; a hard error maps to the read family.
    pub fn read(&mut self, mem: &mut [u8], p_file: u32, buf: u32, amt: u32, ofst: u64) -> u32 {
        let Some(file) = self.file_for(mem, p_file) else {
            return ExtendedResultCode::IoErrRead as u32;
        };
        let mut view = MemoryMut::new(mem);
        let dst = view.slice_mut(buf, amt);
        match file.read_at(dst, ofst) {
            Ok(n) if n == dst.len() => OK,
            Ok(n) => {
                dst[n..].fill(0);
                ExtendedResultCode::IoErrShortRead as u32
            }
            Err(_) => ExtendedResultCode::IoErrRead as u32,
        }
    }

    /// Positional write.
    pub fn write(&mut self, mem: &mut [u8], p_file: u32, buf: u32, amt: u32, ofst: u64) -> u32 {
        let Some(file) = self.file_for(mem, p_file) else {
            return ExtendedResultCode::IoErrWrite as u32;
        };
        let src = Memory::new(mem).slice(buf, amt);
        match file.write_at(src, ofst) {
            Ok(()) => OK,
            Err(err) if err.code() == ResultCode::IoErr => err.extended_code(),
            Err(_) => ExtendedResultCode::IoErrWrite as u32,
        }
    }

    /// Truncate the file to `size` bytes.
    pub fn truncate(&mut self, mem: &mut [u8], p_file: u32, size: u64) -> u32 {
        let Some(file) = self.file_for(mem, p_file) else {
            return ExtendedResultCode::IoErrTruncate as u32;
        };
        match file.truncate(size) {
            Ok(()) => OK,
            Err(_) => ExtendedResultCode::IoErrTruncate as u32,
        }
    }

    /// Flush the file to stable storage.
    pub fn sync(&mut self, mem: &mut [u8], p_file: u32, flags: u32) -> u32 {
        let Some(file) = self.file_for(mem, p_file) else {
            return ExtendedResultCode::IoErrFsync as u32;
        };
        let flags = SyncFlags::from_bits_truncate(flags);
        match file.sync(flags) {
            Ok(()) => OK,
            Err(_) => ExtendedResultCode::IoErrFsync as u32,
        }
    }

    /// Write the current file size at `p_size`.
    pub fn file_size(&mut self, mem: &mut [u8], p_file: u32, p_size: u32) -> u32 {
        let Some(file) = self.file_for(mem, p_file) else {
            return ExtendedResultCode::IoErrSeek as u32;
        };
        match file.size() {
            Ok(size) => {
                MemoryMut::new(mem).write_u64(p_size, size);
                OK
            }
            Err(_) => ExtendedResultCode::IoErrSeek as u32,
        }
    }

    // -- Locking imports ----------------------------------------------------

    /// Acquire a lock at `level`, consulting the busy handler on
    /// contention.
    pub fn lock(&mut self, mem: &mut [u8], p_file: u32, level: u32) -> u32 {
        let Some(level) = LockLevel::from_u32(level) else {
            return ExtendedResultCode::IoErrLock as u32;
        };
        let id = Memory::new(mem).read_u32(p_file + FILE_HEADER_SIZE) as usize;

        let mut attempt = 0_i32;
        loop {
            let Some(file) = self.files.get_mut(id).and_then(Option::as_mut) else {
                return ExtendedResultCode::IoErrLock as u32;
            };
            match file.lock(level) {
                Ok(()) => return OK,
                Err(err) if err.code() == ResultCode::Busy => {
                    attempt += 1;
                    let retry = match self.busy_handler.as_mut() {
                        Some(handler) => handler(attempt),
                        None => false,
                    };
                    if !retry {
                        return err.extended_code();
                    }
                }
                Err(err) => return err.extended_code(),
            }
        }
    }

    /// Release down to `level`.
    pub fn unlock(&mut self, mem: &mut [u8], p_file: u32, level: u32) -> u32 {
        let Some(level) = LockLevel::from_u32(level) else {
            return ExtendedResultCode::IoErrUnlock as u32;
        };
        let Some(file) = self.file_for(mem, p_file) else {
            return ExtendedResultCode::IoErrUnlock as u32;
        };
        match file.unlock(level) {
            Ok(()) => OK,
            Err(err) => err.extended_code(),
        }
    }

    /// Write `1`/`0` at `p_res_out` according to whether any handle holds
    /// `Reserved` or higher.
    pub fn check_reserved_lock(&mut self, mem: &mut [u8], p_file: u32, p_res_out: u32) -> u32 {
        let Some(file) = self.file_for(mem, p_file) else {
            return ExtendedResultCode::IoErrCheckReservedLock as u32;
        };
        match file.check_reserved_lock() {
            Ok(reserved) => {
                MemoryMut::new(mem).write_u32(p_res_out, u32::from(reserved));
                OK
            }
            Err(err) => err.extended_code(),
        }
    }
}
