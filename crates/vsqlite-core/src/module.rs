//! The contract between the host runtime and the embedded bytecode module.
//!
//! The engine ships as a portable bytecode module executed by an in-process
//! VM; which VM is the embedder's choice. The runtime only requires the
//! surface below: linear memory, the engine allocator, a fixed set of
//! exported entries, and an interrupt token that is safe to poke from
//! another thread. A VM binding implements [`EngineModule`] once and
//! registers a loader; everything else in this crate is VM-agnostic.

use std::sync::{Arc, OnceLock, RwLock};

use vsqlite_error::{Error, Result};
use vsqlite_types::ResultCode;

use crate::host::HostDispatch;

/// Exported entries of the engine module invoked by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entry {
    /// `(name_ptr, out_handle_ptr, flags) -> rc`
    Open,
    /// `(handle) -> rc`
    Close,
    /// `(handle, sql_ptr) -> rc`
    Exec,
    /// `(handle, sql_ptr, sql_len, flags, out_stmt_ptr, out_tail_ptr) -> rc`
    Prepare,
    /// `(stmt_handle) -> rc`
    Finalize,
    /// `(handle) -> count`
    Changes,
    /// `(rc) -> message_ptr`
    ErrStr,
    /// `(handle) -> message_ptr`
    ErrMsg,
    /// `(handle) -> byte_offset` (`u32::MAX` when unknown)
    ErrOff,
}

/// A fault that terminates the module instance.
///
/// Both variants leave the engine unusable; the connection surfaces them as
/// panics rather than errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModuleFault {
    /// The module called the `proc_exit` import.
    #[error("engine module exited with code {0}")]
    Exit(u32),
    /// The VM trapped (bad opcode, unreachable, stack overflow, ...).
    #[error("engine module trapped: {0}")]
    Trap(String),
}

/// Token asserting the engine's cancellation flag.
///
/// This is the one engine operation that may be invoked from a thread other
/// than the connection's; implementations must make it safe to call while
/// an [`EngineModule::call`] is in flight.
pub trait Interrupter: Send + Sync {
    /// Request that the engine abandon the current statement on `handle`
    /// at its next safe-point.
    fn interrupt(&self, handle: u32);
}

/// One instantiated engine module. Exactly one exists per connection.
pub trait EngineModule: Send {
    /// The module's linear memory.
    fn memory(&self) -> &[u8];

    /// The module's linear memory, mutably.
    fn memory_mut(&mut self) -> &mut [u8];

    /// Allocate `size` bytes from the engine's allocator. Returns 0 on
    /// exhaustion; never re-enters the host.
    fn malloc(&mut self, size: u32) -> u32;

    /// Return `ptr` to the engine's allocator. Never re-enters the host.
    fn free(&mut self, ptr: u32);

    /// Invoke an exported entry. The engine may call back into `host`
    /// (filesystem, clock, randomness, locking) while the call is in
    /// flight.
    fn call(
        &mut self,
        host: &mut HostDispatch,
        entry: Entry,
        args: &[u64],
    ) -> std::result::Result<u64, ModuleFault>;

    /// The interrupt token for this instance.
    fn interrupter(&self) -> Arc<dyn Interrupter>;

    /// Tear the instance down. Idempotent.
    fn close(&mut self);
}

type Loader = dyn Fn() -> Result<Box<dyn EngineModule>> + Send + Sync;

fn loader_slot() -> &'static RwLock<Option<Arc<Loader>>> {
    static SLOT: OnceLock<RwLock<Option<Arc<Loader>>>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(None))
}

/// Install the process-wide module loader used by `Connection::open`.
///
/// The loader instantiates one fresh module per connection. Embedders call
/// this once at startup with their VM binding.
pub fn register_module_loader<F>(loader: F)
where
    F: Fn() -> Result<Box<dyn EngineModule>> + Send + Sync + 'static,
{
    *loader_slot().write().expect("loader slot poisoned") = Some(Arc::new(loader));
}

/// Instantiate a module through the registered loader.
pub(crate) fn load_module() -> Result<Box<dyn EngineModule>> {
    let slot = loader_slot().read().expect("loader slot poisoned");
    match slot.as_ref() {
        Some(loader) => loader(),
        None => Err(Error::new(ResultCode::Misuse)
            .with_message("no engine module loader registered")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_display() {
        assert_eq!(
            ModuleFault::Exit(3).to_string(),
            "engine module exited with code 3"
        );
        assert_eq!(
            ModuleFault::Trap("unreachable".to_owned()).to_string(),
            "engine module trapped: unreachable"
        );
    }
}
