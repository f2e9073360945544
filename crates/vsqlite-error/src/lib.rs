//! Structured errors for the vsqlite host runtime.
//!
//! Engine result codes are translated into an immutable [`Error`] record:
//! primary code, extended code, the canonical code string, the
//! per-connection message, and (for SQL errors) a byte offset into the
//! offending statement. Two code families never become errors at all:
//! out-of-memory and linear-memory range violations leave the engine in an
//! unsound state, so they are raised as panics carrying a [`Fatal`] payload.

use std::fmt;

use vsqlite_types::{ExtendedResultCode, ResultCode};

/// Result alias used throughout the host runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse taxonomy over error codes, used by callers to pick a recovery
/// strategy without matching on individual codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Retry may succeed: `BUSY`, `LOCKED`, `INTERRUPT`.
    Transient,
    /// The caller misused the API: `MISUSE`, `RANGE`.
    CallerFault,
    /// The storage layer or OS failed: `IOERR*`, `CANTOPEN`, `READONLY`,
    /// `FULL`, `NOTFOUND`, `CORRUPT`, `PROTOCOL`.
    Storage,
    /// The engine rejected the SQL or reported some other logic error.
    EngineSyntax,
}

/// An error translated from an engine result code.
#[derive(Clone, PartialEq, Eq)]
pub struct Error {
    code: u32,
    code_str: String,
    message: String,
    sql_offset: Option<u32>,
}

impl Error {
    /// Build an error from a raw (possibly extended) result code, using the
    /// canonical code string. Panics via [`oom`] on the out-of-memory family;
    /// the engine must not be used again after that.
    #[must_use]
    pub fn from_raw(code: u32) -> Self {
        if ResultCode::from_raw(code) == ResultCode::NoMem
            || code == ExtendedResultCode::IoErrNoMem as u32
        {
            oom();
        }
        Self {
            code,
            code_str: ResultCode::from_raw(code).message().to_owned(),
            message: String::new(),
            sql_offset: None,
        }
    }

    /// Build an error from a primary result code.
    #[must_use]
    pub fn new(code: ResultCode) -> Self {
        Self::from_raw(code as u32)
    }

    /// Build an error from an extended result code.
    #[must_use]
    pub fn extended(code: ExtendedResultCode) -> Self {
        Self::from_raw(code as u32)
    }

    /// Replace the canonical code string (normally the engine's `errstr`).
    #[must_use]
    pub fn with_code_str(mut self, code_str: impl Into<String>) -> Self {
        self.code_str = code_str.into();
        self
    }

    /// Attach the per-connection message. The message is dropped when it
    /// duplicates the code string or is the "not an error" sentinel.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        if message != self.code_str && message != "not an error" {
            self.message = message;
        }
        self
    }

    /// Attach the byte offset into the SQL text that produced this error.
    #[must_use]
    pub fn with_sql_offset(mut self, offset: u32) -> Self {
        self.sql_offset = Some(offset);
        self
    }

    /// The primary result code.
    #[must_use]
    pub fn code(&self) -> ResultCode {
        ResultCode::from_raw(self.code)
    }

    /// The full (extended) result code as returned by the engine.
    #[must_use]
    pub fn extended_code(&self) -> u32 {
        self.code
    }

    /// The per-connection message, if any survived de-duplication.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Byte offset into the offending SQL, when known.
    #[must_use]
    pub fn sql_offset(&self) -> Option<u32> {
        self.sql_offset
    }

    /// Whether a retry of the same operation may succeed.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        matches!(self.code(), ResultCode::Busy | ResultCode::Locked)
    }

    /// Classify this error for recovery purposes.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self.code() {
            ResultCode::Busy | ResultCode::Locked | ResultCode::Interrupt => ErrorKind::Transient,
            ResultCode::Misuse | ResultCode::Range => ErrorKind::CallerFault,
            ResultCode::IoErr
            | ResultCode::CantOpen
            | ResultCode::ReadOnly
            | ResultCode::Full
            | ResultCode::NotFound
            | ResultCode::Corrupt
            | ResultCode::Protocol => ErrorKind::Storage,
            _ => ErrorKind::EngineSyntax,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.code_str)
        } else {
            write!(f, "{}: {}", self.code_str, self.message)
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("code", &self.code)
            .field("code_str", &self.code_str)
            .field("message", &self.message)
            .field("sql_offset", &self.sql_offset)
            .finish()
    }
}

impl std::error::Error for Error {}

/// Panic payload for the unrecoverable condition families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Fatal {
    /// The engine's allocator failed; its heap is no longer trustworthy.
    #[error("out of memory")]
    OutOfMemory,
    /// A linear-memory access fell outside the module's bounds; the engine
    /// handed the host a bad pointer and is no longer trustworthy.
    #[error("linear memory access out of range")]
    Range,
}

/// Raise the fatal out-of-memory condition.
pub fn oom() -> ! {
    std::panic::panic_any(Fatal::OutOfMemory)
}

/// Raise the fatal linear-memory range condition.
pub fn range() -> ! {
    std::panic::panic_any(Fatal::Range)
}
