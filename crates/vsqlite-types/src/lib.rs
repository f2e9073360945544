//! Shared vocabulary types for the vsqlite host runtime.
//!
//! Everything here mirrors the embedded engine's own constants: the numeric
//! values of flags and result codes travel across the linear-memory boundary
//! unchanged, so they must match the engine bit for bit.

pub mod codes;
pub mod flags;

pub use codes::{ExtendedResultCode, ResultCode};
pub use flags::{AccessFlags, DeviceCharacteristics, OpenFlags, SyncFlags};

/// The five-level advisory lock hierarchy, totally ordered.
///
/// Within one database file, at most one holder may be at `Reserved` or
/// higher; any number may hold `Shared` while nobody is `Pending` or
/// `Exclusive`; `Exclusive` excludes everything else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum LockLevel {
    /// No lock held.
    #[default]
    None = 0,
    /// Shared lock (reading).
    Shared = 1,
    /// Reserved lock (intending to write).
    Reserved = 2,
    /// Pending lock (waiting for shared locks to clear).
    Pending = 3,
    /// Exclusive lock (writing).
    Exclusive = 4,
}

impl LockLevel {
    /// Decode a lock level received from the engine.
    #[must_use]
    pub const fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Shared),
            2 => Some(Self::Reserved),
            3 => Some(Self::Pending),
            4 => Some(Self::Exclusive),
            _ => None,
        }
    }
}
