//! Engine result codes.
//!
//! Primary codes occupy the low byte; extended codes refine a primary code in
//! the high bytes, so `(extended & 0xff) == primary` always holds. The
//! numeric values match the engine's ABI and must not be renumbered.

/// Primary result codes, the subset the host runtime surfaces to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResultCode {
    /// Successful result.
    Ok = 0,
    /// Generic SQL error.
    Error = 1,
    /// Internal logic error in the engine.
    Internal = 2,
    /// Access permission denied.
    Perm = 3,
    /// Callback routine requested an abort.
    Abort = 4,
    /// The database file is locked.
    Busy = 5,
    /// A table in the database is locked.
    Locked = 6,
    /// The engine's allocator failed.
    NoMem = 7,
    /// Attempt to write a readonly database.
    ReadOnly = 8,
    /// Operation terminated by an interrupt.
    Interrupt = 9,
    /// Some kind of disk I/O error occurred.
    IoErr = 10,
    /// The database disk image is malformed.
    Corrupt = 11,
    /// Unknown opcode in a file-control call.
    NotFound = 12,
    /// Insertion failed because the database is full.
    Full = 13,
    /// Unable to open the database file.
    CantOpen = 14,
    /// Database lock protocol error.
    Protocol = 15,
    /// The database schema changed.
    Schema = 17,
    /// String or BLOB exceeds size limit.
    TooBig = 18,
    /// Constraint violation.
    Constraint = 19,
    /// Data type mismatch.
    Mismatch = 20,
    /// Library used incorrectly.
    Misuse = 21,
    /// Authorization denied.
    Auth = 23,
    /// Bind parameter index out of range.
    Range = 25,
    /// File opened that is not a database file.
    NotADb = 26,
    /// Notification from the engine log.
    Notice = 27,
    /// Warning from the engine log.
    Warning = 28,
    /// A row of output is available.
    Row = 100,
    /// Execution has completed.
    Done = 101,
}

impl ResultCode {
    /// Extract the primary code from a raw (possibly extended) result code.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw & 0xff {
            0 => Self::Ok,
            1 => Self::Error,
            2 => Self::Internal,
            3 => Self::Perm,
            4 => Self::Abort,
            5 => Self::Busy,
            6 => Self::Locked,
            7 => Self::NoMem,
            8 => Self::ReadOnly,
            9 => Self::Interrupt,
            10 => Self::IoErr,
            11 => Self::Corrupt,
            12 => Self::NotFound,
            13 => Self::Full,
            14 => Self::CantOpen,
            15 => Self::Protocol,
            17 => Self::Schema,
            18 => Self::TooBig,
            19 => Self::Constraint,
            20 => Self::Mismatch,
            21 => Self::Misuse,
            23 => Self::Auth,
            25 => Self::Range,
            26 => Self::NotADb,
            27 => Self::Notice,
            28 => Self::Warning,
            100 => Self::Row,
            101 => Self::Done,
            _ => Self::Error,
        }
    }

    /// The canonical string for this code, as reported by the engine's
    /// `errstr` entry. Used to de-duplicate connection messages and to
    /// render errors raised host-side before the engine is consulted.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Ok => "not an error",
            Self::Error => "SQL logic error",
            Self::Internal => "internal logic error",
            Self::Perm => "access permission denied",
            Self::Abort => "query aborted",
            Self::Busy => "database is locked",
            Self::Locked => "database table is locked",
            Self::NoMem => "out of memory",
            Self::ReadOnly => "attempt to write a readonly database",
            Self::Interrupt => "interrupted",
            Self::IoErr => "disk I/O error",
            Self::Corrupt => "database disk image is malformed",
            Self::NotFound => "unknown operation",
            Self::Full => "database or disk is full",
            Self::CantOpen => "unable to open database file",
            Self::Protocol => "locking protocol",
            Self::Schema => "database schema has changed",
            Self::TooBig => "string or blob too big",
            Self::Constraint => "constraint failed",
            Self::Mismatch => "datatype mismatch",
            Self::Misuse => "bad parameter or other API misuse",
            Self::Auth => "authorization denied",
            Self::Range => "column index out of range",
            Self::NotADb => "file is not a database",
            Self::Notice => "notification message",
            Self::Warning => "warning message",
            Self::Row => "another row available",
            Self::Done => "no more rows available",
        }
    }
}

impl From<ResultCode> for u32 {
    fn from(code: ResultCode) -> Self {
        code as Self
    }
}

/// Extended result codes used by the host runtime.
///
/// The low byte of every value equals its primary code. `IoErrShortWrite`
/// is an embedder extension (slot 32 of the `IOERR` family) reporting a
/// sector-spanning write to the memory VFS; the engine never produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExtendedResultCode {
    IoErrRead = 10 | (1 << 8),
    IoErrShortRead = 10 | (2 << 8),
    IoErrWrite = 10 | (3 << 8),
    IoErrFsync = 10 | (4 << 8),
    IoErrTruncate = 10 | (6 << 8),
    IoErrUnlock = 10 | (8 << 8),
    IoErrRdLock = 10 | (9 << 8),
    IoErrDelete = 10 | (10 << 8),
    IoErrNoMem = 10 | (12 << 8),
    IoErrAccess = 10 | (13 << 8),
    IoErrCheckReservedLock = 10 | (14 << 8),
    IoErrLock = 10 | (15 << 8),
    IoErrClose = 10 | (16 << 8),
    IoErrShmOpen = 10 | (18 << 8),
    IoErrShmSize = 10 | (19 << 8),
    IoErrShmLock = 10 | (20 << 8),
    IoErrShmMap = 10 | (21 << 8),
    IoErrSeek = 10 | (22 << 8),
    IoErrShortWrite = 10 | (32 << 8),
    BusyRecovery = 5 | (1 << 8),
    BusySnapshot = 5 | (2 << 8),
    LockedSharedCache = 6 | (1 << 8),
    ReadOnlyCantLock = 8 | (2 << 8),
    CantOpenIsDir = 14 | (2 << 8),
    CantOpenFullPath = 14 | (3 << 8),
}

impl ExtendedResultCode {
    /// The primary code this extended code refines.
    #[must_use]
    pub const fn primary(self) -> ResultCode {
        ResultCode::from_raw(self as u32)
    }
}

impl From<ExtendedResultCode> for u32 {
    fn from(code: ExtendedResultCode) -> Self {
        code as Self
    }
}
