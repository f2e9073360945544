//! Connection lifecycle, call gateway and cooperative interrupts.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use tracing::debug;

use vsqlite_error::{Error, Result};
use vsqlite_types::{OpenFlags, ResultCode};
use vsqlite_vfs::{registry, Vfs};

use crate::arena::{Arena, ARENA_SIZE};
use crate::host::HostDispatch;
use crate::mem::Memory;
use crate::module::{load_module, EngineModule, Entry, Interrupter};

/// Size of an engine-side pointer.
const PTR_LEN: u32 = 4;

/// Longest engine error string the host will read back.
const MAX_ERR_LEN: u32 = 512;

/// Cadence at which the interrupter re-asserts the engine's cancellation
/// flag. Repeating closes the race where an interrupt lands between
/// statements and is silently cleared by the engine.
const INTERRUPT_TICK: Duration = Duration::from_millis(100);

/// A prepared-statement handle. Stepping and column access belong to the
/// SQL driver layer; the core only tracks the handle so the statement can
/// be finalized through its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statement {
    handle: u32,
}

impl Statement {
    /// The engine's handle for this statement.
    #[must_use]
    pub fn handle(&self) -> u32 {
        self.handle
    }
}

struct Waiter {
    cancel: Sender<()>,
    thread: JoinHandle<()>,
}

/// A database connection: one engine module instance, its arena, the file
/// table the engine's VFS callbacks use, and the interrupt machinery.
///
/// A connection is single-threaded with respect to the engine; the methods
/// take `&mut self` so the compiler enforces it. The only cross-thread
/// operation is the interrupter token.
pub struct Connection {
    module: Box<dyn EngineModule>,
    host: HostDispatch,
    arena: Arena,
    handle: u32,
    interrupter: Arc<dyn Interrupter>,
    done: Option<Receiver<()>>,
    waiter: Option<Waiter>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open `filename` read-write, creating it if missing.
    pub fn open(filename: &str) -> Result<Self> {
        Self::open_flags(filename, OpenFlags::READWRITE | OpenFlags::CREATE)
    }

    /// Open `filename` with explicit flags, instantiating the module
    /// through the registered loader.
    ///
    /// A `file:` URI may carry a `vfs` query parameter selecting a
    /// registered VFS; anything else uses the default.
    pub fn open_flags(filename: &str, flags: OpenFlags) -> Result<Self> {
        let module = load_module()?;
        Self::open_with_module(module, filename, flags)
    }

    /// Open `filename` using an explicitly supplied module instance.
    pub fn open_with_module(
        module: Box<dyn EngineModule>,
        filename: &str,
        flags: OpenFlags,
    ) -> Result<Self> {
        let vfs = resolve_vfs(filename)?;

        let mut module = module;
        let arena = Arena::new(module.as_mut(), ARENA_SIZE);
        let interrupter = module.interrupter();
        let mut conn = Self {
            module,
            host: HostDispatch::new(vfs),
            arena,
            handle: 0,
            interrupter,
            done: None,
            waiter: None,
        };

        let opened = conn.open_handle(filename, flags);
        conn.arena_reset();
        match opened {
            Ok(()) => Ok(conn),
            Err(err) => {
                conn.handle = 0;
                conn.host.close_all();
                conn.module.close();
                Err(err)
            }
        }
    }

    fn open_handle(&mut self, filename: &str, flags: OpenFlags) -> Result<()> {
        let conn_ptr = self.arena_alloc(PTR_LEN);
        let name_ptr = self.arena_string(filename);

        let rc = self.raw_call(
            Entry::Open,
            &[u64::from(name_ptr), u64::from(conn_ptr), u64::from(flags.bits())],
        );

        self.handle = Memory::new(self.module.memory()).read_u32(conn_ptr);
        self.translate(rc as u32, None)?;
        debug!(filename, handle = self.handle, "connection opened");
        Ok(())
    }

    /// Close the connection.
    ///
    /// If unfinalized statements or other engine resources are still
    /// outstanding the engine reports `BUSY`; the close is then a no-op and
    /// the connection remains usable. Closing an already-closed connection
    /// is a no-op returning success.
    pub fn close(&mut self) -> Result<()> {
        self.set_interrupt(None);

        if self.handle == 0 {
            return Ok(());
        }

        let rc = self.raw_call(Entry::Close, &[u64::from(self.handle)]);
        self.translate(rc as u32, None)?;

        debug!(handle = self.handle, "connection closed");
        self.handle = 0;
        self.host.close_all();
        self.module.close();
        Ok(())
    }

    /// Run one or more SQL statements, discarding any result rows.
    pub fn exec(&mut self, sql: &str) -> Result<()> {
        let result = self.exec_inner(sql);
        self.arena_reset();
        result
    }

    fn exec_inner(&mut self, sql: &str) -> Result<()> {
        let sql_ptr = self.arena_string(sql);

        if self.interrupted() {
            return self.translate(ResultCode::Interrupt as u32, None);
        }
        let rc = self.raw_call(Entry::Exec, &[u64::from(self.handle), u64::from(sql_ptr)]);
        self.translate(rc as u32, Some(sql))
    }

    /// Compile the first statement in `sql`. See [`Self::prepare_flags`].
    pub fn prepare<'s>(&mut self, sql: &'s str) -> Result<(Option<Statement>, &'s str)> {
        self.prepare_flags(sql, 0)
    }

    /// Compile the first statement in `sql`; `tail` is the uncompiled
    /// remainder. Empty or comment-only input yields no statement and no
    /// error.
    pub fn prepare_flags<'s>(
        &mut self,
        sql: &'s str,
        flags: u32,
    ) -> Result<(Option<Statement>, &'s str)> {
        let result = self.prepare_inner(sql, flags);
        self.arena_reset();
        result
    }

    fn prepare_inner<'s>(
        &mut self,
        sql: &'s str,
        flags: u32,
    ) -> Result<(Option<Statement>, &'s str)> {
        let stmt_ptr = self.arena_alloc(PTR_LEN);
        let tail_ptr = self.arena_alloc(PTR_LEN);
        let sql_ptr = self.arena_string(sql);

        if self.interrupted() {
            return Err(self.translate_code(ResultCode::Interrupt as u32, None));
        }
        let sql_len = u64::try_from(sql.len() + 1).expect("sql length fits in 64 bits");
        let rc = self.raw_call(
            Entry::Prepare,
            &[
                u64::from(self.handle),
                u64::from(sql_ptr),
                sql_len,
                u64::from(flags),
                u64::from(stmt_ptr),
                u64::from(tail_ptr),
            ],
        );

        let view = Memory::new(self.module.memory());
        let stmt_handle = view.read_u32(stmt_ptr);
        let tail_at = view.read_u32(tail_ptr);
        let tail = &sql[(tail_at - sql_ptr) as usize..];

        self.translate(rc as u32, Some(sql))?;

        if stmt_handle == 0 {
            return Ok((None, tail));
        }
        Ok((
            Some(Statement {
                handle: stmt_handle,
            }),
            tail,
        ))
    }

    /// Finalize a prepared statement.
    pub fn finalize(&mut self, stmt: Statement) -> Result<()> {
        let rc = self.raw_call(Entry::Finalize, &[u64::from(stmt.handle)]);
        self.translate(rc as u32, None)
    }

    /// Rows changed by the most recent statement.
    #[must_use]
    pub fn changes(&mut self) -> u64 {
        self.raw_call(Entry::Changes, &[u64::from(self.handle)])
    }

    /// Install the callback consulted when a lock transition reports
    /// `BUSY`: it receives the attempt count and returns whether to retry.
    pub fn busy_handler<F>(&mut self, handler: F)
    where
        F: FnMut(i32) -> bool + Send + 'static,
    {
        self.host.set_busy_handler(Some(Box::new(handler)));
    }

    /// Replace the connection's cancellation signal, returning the
    /// previous one.
    ///
    /// When `done` fires (a message is sent, or every sender is dropped),
    /// a background interrupter asserts the engine's cancellation flag
    /// every 100 ms until disarmed, and public operations that observe the
    /// signal before entering the engine fail fast with `INTERRUPT`.
    ///
    /// A running interrupter from a previous call is cancelled and its
    /// shutdown acknowledged before this method returns; passing `None`
    /// disarms without starting a new one.
    pub fn set_interrupt(&mut self, done: Option<Receiver<()>>) -> Option<Receiver<()>> {
        if let Some(waiter) = self.waiter.take() {
            drop(waiter.cancel.send(()));
            drop(waiter.thread.join());
        }

        let old = self.done.take();
        self.done.clone_from(&done);
        let Some(done_rx) = done else {
            return old;
        };

        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let interrupter = Arc::clone(&self.interrupter);
        let handle = self.handle;
        let thread = std::thread::spawn(move || {
            select! {
                recv(cancel_rx) -> _ => {}
                recv(done_rx) -> _ => {
                    debug!(handle, "interrupt signal fired");
                    let ticker = crossbeam_channel::tick(INTERRUPT_TICK);
                    loop {
                        // The interrupt token is the one engine operation
                        // safe to invoke from this thread.
                        interrupter.interrupt(handle);
                        select! {
                            recv(cancel_rx) -> _ => return,
                            recv(ticker) -> _ => {}
                        }
                    }
                }
            }
        });
        self.waiter = Some(Waiter {
            cancel: cancel_tx,
            thread,
        });
        old
    }

    fn interrupted(&self) -> bool {
        match &self.done {
            Some(rx) => !matches!(rx.try_recv(), Err(TryRecvError::Empty)),
            None => false,
        }
    }

    // -- Internals ----------------------------------------------------------

    fn raw_call(&mut self, entry: Entry, args: &[u64]) -> u64 {
        match self.module.call(&mut self.host, entry, args) {
            Ok(value) => value,
            // Module faults (proc_exit, VM traps) are fatal: the engine's
            // state is gone and no further call can be made.
            Err(fault) => panic!("{fault}"),
        }
    }

    fn translate(&mut self, rc: u32, sql: Option<&str>) -> Result<()> {
        if rc == ResultCode::Ok as u32 {
            return Ok(());
        }
        Err(self.translate_code(rc, sql))
    }

    fn translate_code(&mut self, rc: u32, sql: Option<&str>) -> Error {
        let mut err = Error::from_raw(rc);

        let str_ptr = self.raw_call(Entry::ErrStr, &[u64::from(rc)]);
        if str_ptr != 0 {
            let code_str =
                Memory::new(self.module.memory()).read_string(str_ptr as u32, MAX_ERR_LEN);
            err = err.with_code_str(code_str);
        }

        let msg_ptr = self.raw_call(Entry::ErrMsg, &[u64::from(self.handle)]);
        if msg_ptr != 0 {
            let message =
                Memory::new(self.module.memory()).read_string(msg_ptr as u32, MAX_ERR_LEN);
            err = err.with_message(message);
        }

        if sql.is_some() {
            let offset = self.raw_call(Entry::ErrOff, &[u64::from(self.handle)]) as u32;
            if offset != u32::MAX {
                err = err.with_sql_offset(offset);
            }
        }

        err
    }

    fn arena_alloc(&mut self, size: u32) -> u32 {
        let Self { module, arena, .. } = self;
        arena.alloc(module.as_mut(), size)
    }

    fn arena_string(&mut self, s: &str) -> u32 {
        let Self { module, arena, .. } = self;
        arena.string(module.as_mut(), s)
    }

    fn arena_reset(&mut self) {
        let Self { module, arena, .. } = self;
        arena.reset(module.as_mut());
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        // Best effort: disarm the interrupter and release the engine. A
        // BUSY close leaves resources to the module teardown.
        self.set_interrupt(None);
        if self.handle != 0 {
            let rc = self.raw_call(Entry::Close, &[u64::from(self.handle)]);
            if rc == u64::from(ResultCode::Ok as u32) {
                self.handle = 0;
            }
            self.host.close_all();
            self.module.close();
        }
    }
}

/// Resolve the VFS a filename selects: the `vfs` query parameter of a
/// `file:` URI, or the process default.
fn resolve_vfs(filename: &str) -> Result<Arc<dyn Vfs>> {
    if let Some(query) = filename.strip_prefix("file:").and_then(|rest| {
        rest.split_once('?').map(|(_, query)| query)
    }) {
        for pair in query.split('&') {
            if let Some(name) = pair.strip_prefix("vfs=") {
                return registry::find(name).ok_or_else(|| {
                    Error::new(ResultCode::Error)
                        .with_message(format!("no such vfs: {name}"))
                });
            }
        }
    }
    Ok(registry::default_vfs())
}
