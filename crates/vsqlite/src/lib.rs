//! Public API facade for the vsqlite host runtime.
//!
//! The embedded engine runs as a bytecode module inside an in-process VM;
//! this crate re-exports the connection surface, the error type, and the
//! VFS layer through which all persistent state flows.

pub use vsqlite_core::{
    register_module_loader, Connection, EngineModule, Entry, Interrupter, ModuleFault, Statement,
};
pub use vsqlite_error::{Error, ErrorKind, Fatal, Result};
pub use vsqlite_types::{
    AccessFlags, DeviceCharacteristics, ExtendedResultCode, LockLevel, OpenFlags, ResultCode,
    SyncFlags,
};
pub use vsqlite_vfs as vfs;
