//! Host-side runtime core: the connection lifecycle and call gateway that
//! bridge idiomatic calls into the embedded bytecode engine.
//!
//! The engine lives in its own linear memory; [`mem`] provides the checked
//! view into it, [`arena`] the scratch allocator used to marshal call
//! arguments, [`host`] the import set the engine calls back into, and
//! [`conn`] the public connection surface including cooperative interrupts.

pub mod arena;
pub mod conn;
pub mod host;
pub mod mem;
pub mod module;

pub use conn::{Connection, Statement};
pub use host::HostDispatch;
pub use module::{register_module_loader, EngineModule, Entry, Interrupter, ModuleFault};
