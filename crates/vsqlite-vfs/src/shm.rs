//! Shared-memory support for write-ahead-log mode.
//!
//! The engine coordinates WAL readers and writers through a small
//! shared-memory index split into fixed-size regions, plus eight advisory
//! lock slots. Region bytes live in a process-wide table keyed by the
//! sidecar path; the `-shm` sidecar file is still created and sized for
//! layout compatibility, but its contents are not the source of truth, so
//! coordination only spans connections within one process. Cross-process
//! WAL requires a real file mapping.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, OnceLock};

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};

use vsqlite_error::{Error, Result};
use vsqlite_types::ExtendedResultCode;

/// Number of shared-memory lock slots.
pub const SHM_NLOCK: usize = 8;

bitflags! {
    /// Flag bits for [`crate::traits::VfsFile::shm_lock`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShmLockFlags: u32 {
        const UNLOCK = 0x1;
        const LOCK = 0x2;
        const SHARED = 0x4;
        const EXCLUSIVE = 0x8;
    }
}

/// A handle to one mapped shared-memory region.
///
/// Clones share the same backing bytes; access is bounds-checked and
/// mutex-guarded rather than going through raw pointers.
#[derive(Debug, Clone)]
pub struct ShmRegion {
    len: usize,
    data: Arc<Mutex<Vec<u8>>>,
}

impl ShmRegion {
    /// Create a new zeroed region of `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            len: size,
            data: Arc::new(Mutex::new(vec![0; size])),
        }
    }

    /// The region size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is zero-length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the region bytes; the guard releases the lock on drop.
    #[must_use]
    pub fn lock(&self) -> ShmRegionGuard<'_> {
        ShmRegionGuard {
            guard: self.data.lock(),
        }
    }

    /// Read a little-endian `u32` at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4 > self.len()`.
    #[must_use]
    pub fn read_u32_le(&self, offset: usize) -> u32 {
        let guard = self.lock();
        let bytes: [u8; 4] = guard[offset..offset + 4]
            .try_into()
            .expect("slice is exactly 4 bytes");
        u32::from_le_bytes(bytes)
    }

    /// Write a little-endian `u32` at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4 > self.len()`.
    pub fn write_u32_le(&self, offset: usize, val: u32) {
        let mut guard = self.lock();
        guard[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
    }
}

/// Locked region access guard.
pub struct ShmRegionGuard<'a> {
    guard: MutexGuard<'a, Vec<u8>>,
}

impl Deref for ShmRegionGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.as_slice()
    }
}

impl DerefMut for ShmRegionGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.guard.as_mut_slice()
    }
}

/// Memory barrier between shared-memory writers and readers.
pub fn barrier() {
    fence(Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// Process-wide node table
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NodeState {
    regions: Vec<ShmRegion>,
    shared: [u32; SHM_NLOCK],
    exclusive: [bool; SHM_NLOCK],
    refs: u32,
}

#[derive(Default)]
struct ShmNode {
    state: Mutex<NodeState>,
}

fn nodes() -> &'static Mutex<HashMap<PathBuf, Arc<ShmNode>>> {
    static NODES: OnceLock<Mutex<HashMap<PathBuf, Arc<ShmNode>>>> = OnceLock::new();
    NODES.get_or_init(Mutex::default)
}

fn shm_err(code: ExtendedResultCode) -> Error {
    Error::extended(code)
}

/// Per-file view of a shared-memory node.
///
/// Tracks which lock slots this handle holds so that unmapping releases
/// exactly what it acquired.
pub(crate) struct ShmHandle {
    path: PathBuf,
    node: Arc<ShmNode>,
    shared_mask: u16,
    excl_mask: u16,
}

impl ShmHandle {
    /// Open (or join) the node for `sidecar`, creating the sidecar file so
    /// the on-disk layout matches a conventional WAL deployment.
    pub(crate) fn open(sidecar: &Path) -> Result<Self> {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(sidecar)
            .map_err(|_| shm_err(ExtendedResultCode::IoErrShmOpen))?;

        let node = {
            let mut map = nodes().lock();
            Arc::clone(map.entry(sidecar.to_path_buf()).or_default())
        };
        node.state.lock().refs += 1;

        Ok(Self {
            path: sidecar.to_path_buf(),
            node,
            shared_mask: 0,
            excl_mask: 0,
        })
    }

    pub(crate) fn map(&mut self, region: u32, size: u32, extend: bool) -> Result<Option<ShmRegion>> {
        let region = region as usize;
        let mut state = self.node.state.lock();
        while state.regions.len() <= region {
            if !extend {
                return Ok(None);
            }
            state.regions.push(ShmRegion::new(size as usize));
        }
        drop(state);

        if extend {
            // Keep the sidecar sized to the mapped extent.
            let want = (region as u64 + 1) * u64::from(size);
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(&self.path)
                .map_err(|_| shm_err(ExtendedResultCode::IoErrShmSize))?;
            let have = file
                .metadata()
                .map_err(|_| shm_err(ExtendedResultCode::IoErrShmSize))?
                .len();
            if have < want {
                file.set_len(want)
                    .map_err(|_| shm_err(ExtendedResultCode::IoErrShmSize))?;
            }
        }

        let state = self.node.state.lock();
        Ok(Some(state.regions[region].clone()))
    }

    pub(crate) fn lock(&mut self, offset: u32, n: u32, flags: ShmLockFlags) -> Result<()> {
        let (start, count) = (offset as usize, n as usize);
        if count == 0 || start + count > SHM_NLOCK {
            return Err(shm_err(ExtendedResultCode::IoErrShmLock));
        }

        let mut state = self.node.state.lock();

        if flags.contains(ShmLockFlags::UNLOCK) {
            for slot in start..start + count {
                let bit = 1u16 << slot;
                if self.excl_mask & bit != 0 {
                    state.exclusive[slot] = false;
                    self.excl_mask &= !bit;
                }
                if self.shared_mask & bit != 0 {
                    state.shared[slot] -= 1;
                    self.shared_mask &= !bit;
                }
            }
            return Ok(());
        }

        if flags.contains(ShmLockFlags::SHARED) {
            // All-or-nothing: probe every slot before taking any.
            for slot in start..start + count {
                let bit = 1u16 << slot;
                if state.exclusive[slot] && self.excl_mask & bit == 0 {
                    return Err(Error::new(vsqlite_types::ResultCode::Busy));
                }
            }
            for slot in start..start + count {
                let bit = 1u16 << slot;
                if self.shared_mask & bit == 0 && self.excl_mask & bit == 0 {
                    state.shared[slot] += 1;
                    self.shared_mask |= bit;
                }
            }
            return Ok(());
        }

        if flags.contains(ShmLockFlags::EXCLUSIVE) {
            for slot in start..start + count {
                let bit = 1u16 << slot;
                let foreign_shared =
                    state.shared[slot] > u32::from(self.shared_mask & bit != 0);
                if foreign_shared || (state.exclusive[slot] && self.excl_mask & bit == 0) {
                    return Err(Error::new(vsqlite_types::ResultCode::Busy));
                }
            }
            for slot in start..start + count {
                let bit = 1u16 << slot;
                if self.shared_mask & bit != 0 {
                    state.shared[slot] -= 1;
                    self.shared_mask &= !bit;
                }
                state.exclusive[slot] = true;
                self.excl_mask |= bit;
            }
            return Ok(());
        }

        Err(shm_err(ExtendedResultCode::IoErrShmLock))
    }

    pub(crate) fn unmap(&mut self, delete: bool) -> Result<()> {
        // Release anything this handle still holds.
        if self.shared_mask != 0 || self.excl_mask != 0 {
            let mut state = self.node.state.lock();
            for slot in 0..SHM_NLOCK {
                let bit = 1u16 << slot;
                if self.excl_mask & bit != 0 {
                    state.exclusive[slot] = false;
                }
                if self.shared_mask & bit != 0 {
                    state.shared[slot] -= 1;
                }
            }
            self.shared_mask = 0;
            self.excl_mask = 0;
        }

        let mut map = nodes().lock();
        let last = {
            let mut state = self.node.state.lock();
            state.refs = state.refs.saturating_sub(1);
            state.refs == 0
        };
        if last {
            map.remove(&self.path);
            if delete {
                drop(std::fs::remove_file(&self.path));
            }
        }
        Ok(())
    }
}
