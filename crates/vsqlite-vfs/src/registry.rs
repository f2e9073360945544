//! Process-wide registry of named VFS implementations.
//!
//! Registration and unregistration are rare and serialized coarsely; lookup
//! happens only on the connection-open path. Unregistering a VFS while a
//! connection still resolves by that name is the caller's error.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::memdb::MemVfs;
use crate::traits::Vfs;

#[cfg(unix)]
const DEFAULT_NAME: &str = "unix";
#[cfg(not(unix))]
const DEFAULT_NAME: &str = "memdb";

fn table() -> &'static RwLock<HashMap<String, Arc<dyn Vfs>>> {
    static TABLE: OnceLock<RwLock<HashMap<String, Arc<dyn Vfs>>>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut map: HashMap<String, Arc<dyn Vfs>> = HashMap::new();
        #[cfg(unix)]
        map.insert("unix".to_owned(), Arc::new(crate::unix::UnixVfs::new()));
        map.insert("memdb".to_owned(), Arc::new(MemVfs::new()));
        RwLock::new(map)
    })
}

/// Register `vfs` under `name`, replacing any previous registration.
pub fn register(name: &str, vfs: Arc<dyn Vfs>) {
    table().write().insert(name.to_owned(), vfs);
}

/// Remove the VFS registered under `name`.
pub fn unregister(name: &str) {
    table().write().remove(name);
}

/// Look up a VFS by name.
#[must_use]
pub fn find(name: &str) -> Option<Arc<dyn Vfs>> {
    table().read().get(name).cloned()
}

/// The default VFS used when a connection names none.
#[must_use]
pub fn default_vfs() -> Arc<dyn Vfs> {
    find(DEFAULT_NAME).expect("default VFS is always registered")
}
