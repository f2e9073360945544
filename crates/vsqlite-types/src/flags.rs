//! Flag sets crossing the host/engine boundary.

use bitflags::bitflags;

bitflags! {
    /// Flags accepted by `open`, both at the public API and in the VFS.
    ///
    /// The values are the engine's own; the low bits select the access mode,
    /// the `*_DB`/`*_JOURNAL`/`WAL` bits identify the file's role.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        const READONLY = 0x0000_0001;
        const READWRITE = 0x0000_0002;
        const CREATE = 0x0000_0004;
        const DELETEONCLOSE = 0x0000_0008;
        const EXCLUSIVE = 0x0000_0010;
        const AUTOPROXY = 0x0000_0020;
        const URI = 0x0000_0040;
        const MEMORY = 0x0000_0080;
        const MAIN_DB = 0x0000_0100;
        const TEMP_DB = 0x0000_0200;
        const TRANSIENT_DB = 0x0000_0400;
        const MAIN_JOURNAL = 0x0000_0800;
        const TEMP_JOURNAL = 0x0000_1000;
        const SUBJOURNAL = 0x0000_2000;
        const MASTER_JOURNAL = 0x0000_4000;
        const NOMUTEX = 0x0000_8000;
        const FULLMUTEX = 0x0001_0000;
        const SHAREDCACHE = 0x0002_0000;
        const PRIVATECACHE = 0x0004_0000;
        const WAL = 0x0008_0000;
    }
}

bitflags! {
    /// Flags for the `sync` operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const NORMAL = 0x0000_0002;
        const FULL = 0x0000_0003;
        const DATAONLY = 0x0000_0010;
    }
}

bitflags! {
    /// Device characteristics reported by a VFS file.
    ///
    /// The engine uses these to elide journal work it can prove unnecessary.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceCharacteristics: u32 {
        const ATOMIC = 0x0000_0001;
        const ATOMIC512 = 0x0000_0002;
        const ATOMIC1K = 0x0000_0004;
        const ATOMIC2K = 0x0000_0008;
        const ATOMIC4K = 0x0000_0010;
        const ATOMIC8K = 0x0000_0020;
        const ATOMIC16K = 0x0000_0040;
        const ATOMIC32K = 0x0000_0080;
        const ATOMIC64K = 0x0000_0100;
        const SAFE_APPEND = 0x0000_0200;
        const SEQUENTIAL = 0x0000_0400;
        const UNDELETABLE_WHEN_OPEN = 0x0000_0800;
        const POWERSAFE_OVERWRITE = 0x0000_1000;
        const IMMUTABLE = 0x0000_2000;
        const BATCH_ATOMIC = 0x0000_4000;
    }
}

/// Access checks performed by the `access` host import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AccessFlags {
    /// Does the file exist?
    Exists = 0,
    /// Is the file readable and writable?
    ReadWrite = 1,
    /// Is the file readable?
    Read = 2,
}

impl AccessFlags {
    /// Decode an access flag received from the engine.
    #[must_use]
    pub const fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Exists),
            1 => Some(Self::ReadWrite),
            2 => Some(Self::Read),
            _ => None,
        }
    }
}
