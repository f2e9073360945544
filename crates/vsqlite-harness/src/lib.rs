//! Test infrastructure for the vsqlite host runtime.
//!
//! The production engine is a bytecode module this repository does not
//! embed, so the test suite drives the host boundary with
//! [`ScriptedModule`]: a deterministic [`EngineModule`] that marshals
//! handles through linear memory exactly like a real engine, performs
//! page-aligned I/O through the host imports, honours the interrupt flag,
//! and lets tests queue canned failures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use vsqlite_core::mem::{Memory, MemoryMut};
use vsqlite_core::{EngineModule, Entry, HostDispatch, Interrupter, ModuleFault};
use vsqlite_types::{OpenFlags, ResultCode};

/// Scratch slot where `ErrStr` results are written.
const SCRATCH_ERRSTR: u32 = 0x200;
/// Scratch slot where `ErrMsg` results are written.
const SCRATCH_ERRMSG: u32 = 0x400;
/// Scratch slot for rewritten open names (URI scheme/query stripped).
const SCRATCH_NAME: u32 = 0x600;
/// The engine-side file object for the main database; the host stores its
/// file-table slot index just past the 4-byte header.
const FILE_OBJ: u32 = 0x900;
/// Page buffer used by the exec I/O exercise.
const PAGE_BUF: u32 = 0x2000;
/// Page size used by the exec I/O exercise.
const PAGE_SIZE: u32 = 4096;
/// First heap address handed out by `malloc`.
const HEAP_BASE: u32 = 0x1_0000;
/// Linear memory size.
const MEM_SIZE: usize = 1 << 20;

/// Database handle the module hands out (one database per instance).
const DB_HANDLE: u32 = 1;

/// How long a `slow_query()` statement spins waiting for an interrupt
/// before giving up and succeeding.
const SLOW_QUERY_BUDGET: Duration = Duration::from_secs(2);

/// A canned outcome for the next statement the module executes or
/// prepares.
#[derive(Debug, Clone)]
struct CannedResult {
    rc: u32,
    message: String,
    offset: u32,
}

/// Shared script a test holds on to while the module is owned by its
/// connection.
#[derive(Default)]
pub struct Script {
    results: Mutex<VecDeque<CannedResult>>,
}

impl Script {
    /// Create an empty script.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Queue a failure for the next statement.
    pub fn fail_next(&self, code: ResultCode, message: &str) {
        self.fail_next_at(code, message, u32::MAX);
    }

    /// Queue a failure carrying a SQL byte offset.
    pub fn fail_next_at(&self, code: ResultCode, message: &str, offset: u32) {
        self.results.lock().push_back(CannedResult {
            rc: code as u32,
            message: message.to_owned(),
            offset,
        });
    }

    fn pop(&self) -> Option<CannedResult> {
        self.results.lock().pop_front()
    }
}

struct InterruptFlag(AtomicBool);

impl Interrupter for InterruptFlag {
    fn interrupt(&self, _handle: u32) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Deterministic engine module for tests.
pub struct ScriptedModule {
    mem: Vec<u8>,
    brk: u32,
    script: Arc<Script>,
    interrupt: Arc<InterruptFlag>,
    file_open: bool,
    stmt_seq: u32,
    open_stmts: u32,
    changes: u64,
    errmsg: String,
    erroff: u32,
    next_page: u64,
    closed: bool,
}

impl ScriptedModule {
    /// Create a module with no canned results.
    #[must_use]
    pub fn new() -> Self {
        Self::with_script(Script::new())
    }

    /// Create a module driven by `script`.
    #[must_use]
    pub fn with_script(script: Arc<Script>) -> Self {
        Self {
            mem: vec![0; MEM_SIZE],
            brk: HEAP_BASE,
            script,
            interrupt: Arc::new(InterruptFlag(AtomicBool::new(false))),
            file_open: false,
            stmt_seq: 100,
            open_stmts: 0,
            changes: 0,
            errmsg: String::new(),
            erroff: u32::MAX,
            next_page: 0,
            closed: false,
        }
    }

    /// Box for [`vsqlite_core::Connection::open_with_module`].
    #[must_use]
    pub fn boxed() -> Box<dyn EngineModule> {
        Box::new(Self::new())
    }

    fn fail(&mut self, rc: u32, message: &str) -> u64 {
        self.errmsg = message.to_owned();
        u64::from(rc)
    }

    fn interrupted(&mut self) -> bool {
        // Like the real engine, observing the flag consumes it; that is
        // exactly why the host interrupter re-asserts it on a tick.
        self.interrupt.0.swap(false, Ordering::SeqCst)
    }

    fn entry_open(&mut self, host: &mut HostDispatch, args: &[u64]) -> u64 {
        let (name_ptr, conn_ptr, flags) = (args[0] as u32, args[1] as u32, args[2] as u32);
        let name = Memory::new(&self.mem).read_string(name_ptr, 1024);

        let target = strip_uri(&name);
        if !target.is_empty() && target != ":memory:" {
            let open_flags = OpenFlags::MAIN_DB
                | OpenFlags::from_bits_truncate(flags)
                    .intersection(
                        OpenFlags::READONLY | OpenFlags::READWRITE | OpenFlags::CREATE,
                    );
            MemoryMut::new(&mut self.mem).write_string(SCRATCH_NAME, target);
            let rc = host.open(&mut self.mem, SCRATCH_NAME, FILE_OBJ, open_flags.bits(), 0);
            if rc != ResultCode::Ok as u32 {
                return self.fail(rc, "unable to open database file");
            }
            self.file_open = true;
        }

        MemoryMut::new(&mut self.mem).write_u32(conn_ptr, DB_HANDLE);
        u64::from(ResultCode::Ok as u32)
    }

    fn entry_close(&mut self, host: &mut HostDispatch) -> u64 {
        if self.open_stmts > 0 {
            return self.fail(ResultCode::Busy as u32, "unable to close due to unfinalized statements or unfinished backups");
        }
        if self.file_open {
            self.file_open = false;
            let rc = host.close(&mut self.mem, FILE_OBJ);
            if rc != ResultCode::Ok as u32 {
                return u64::from(rc);
            }
        }
        u64::from(ResultCode::Ok as u32)
    }

    fn entry_exec(&mut self, host: &mut HostDispatch, args: &[u64]) -> u64 {
        let sql_ptr = args[1] as u32;
        let sql = Memory::new(&self.mem).read_string(sql_ptr, 1 << 20);

        // An interrupt that arrived while no statement was running is
        // lost, exactly like the real engine; the host interrupter's
        // 100 ms re-fire exists to close this race.
        self.interrupt.0.store(false, Ordering::SeqCst);

        let mut first = true;
        for stmt in sql.split(';') {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            if !first && self.interrupted() {
                return self.fail(ResultCode::Interrupt as u32, "interrupted");
            }
            first = false;
            if let Some(canned) = self.script.pop() {
                if canned.rc != ResultCode::Ok as u32 {
                    self.erroff = canned.offset;
                    return self.fail(canned.rc, &canned.message);
                }
            }

            let lower = stmt.to_ascii_lowercase();
            if lower.contains("slow_query") {
                let start = Instant::now();
                loop {
                    if self.interrupted() {
                        return self.fail(ResultCode::Interrupt as u32, "interrupted");
                    }
                    if start.elapsed() > SLOW_QUERY_BUDGET {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
            if lower.starts_with("insert") {
                self.changes = stmt.matches("),(").count() as u64 + 1;
            }
            if self.file_open {
                if let Some(rc) = self.exercise_io(host) {
                    return u64::from(rc);
                }
            }
        }
        u64::from(ResultCode::Ok as u32)
    }

    /// Write one page through the host imports and read it back, the way
    /// the engine's pager touches its database file on every statement.
    fn exercise_io(&mut self, host: &mut HostDispatch) -> Option<u32> {
        let page = self.next_page;
        self.next_page += 1;
        let fill = (page & 0xff) as u8;
        let off = page * u64::from(PAGE_SIZE);

        MemoryMut::new(&mut self.mem)
            .slice_mut(PAGE_BUF, PAGE_SIZE)
            .fill(fill);
        let rc = host.write(&mut self.mem, FILE_OBJ, PAGE_BUF, PAGE_SIZE, off);
        if rc != ResultCode::Ok as u32 {
            return Some(rc);
        }

        MemoryMut::new(&mut self.mem)
            .slice_mut(PAGE_BUF, PAGE_SIZE)
            .fill(0xFF);
        let rc = host.read(&mut self.mem, FILE_OBJ, PAGE_BUF, PAGE_SIZE, off);
        if rc != ResultCode::Ok as u32 {
            return Some(rc);
        }

        let ok = Memory::new(&self.mem)
            .slice(PAGE_BUF, PAGE_SIZE)
            .iter()
            .all(|&b| b == fill);
        if !ok {
            return Some(ResultCode::Corrupt as u32);
        }
        None
    }

    fn entry_prepare(&mut self, args: &[u64]) -> u64 {
        let sql_ptr = args[1] as u32;
        let stmt_ptr = args[4] as u32;
        let tail_ptr = args[5] as u32;
        let sql = Memory::new(&self.mem).read_string(sql_ptr, 1 << 20);

        // No statement is running during prepare; a pending interrupt is
        // lost here too.
        self.interrupt.0.store(false, Ordering::SeqCst);

        // The out-pointers are defined even on failure: no statement, and
        // the tail left at the start of the input.
        {
            let mut view = MemoryMut::new(&mut self.mem);
            view.write_u32(stmt_ptr, 0);
            view.write_u32(tail_ptr, sql_ptr);
        }

        let (consumed, tail_offset) = match sql.find(';') {
            Some(idx) => (&sql[..idx], idx + 1),
            None => (sql.as_str(), sql.len()),
        };

        if let Some(canned) = self.script.pop() {
            if canned.rc != ResultCode::Ok as u32 {
                self.erroff = canned.offset;
                return self.fail(canned.rc, &canned.message);
            }
        }

        let handle = if is_blank_sql(consumed) {
            0
        } else {
            self.stmt_seq += 1;
            self.open_stmts += 1;
            self.stmt_seq
        };

        let mut view = MemoryMut::new(&mut self.mem);
        view.write_u32(stmt_ptr, handle);
        view.write_u32(tail_ptr, sql_ptr + tail_offset as u32);
        u64::from(ResultCode::Ok as u32)
    }

    fn entry_errstr(&mut self, args: &[u64]) -> u64 {
        let code = ResultCode::from_raw(args[0] as u32);
        MemoryMut::new(&mut self.mem).write_string(SCRATCH_ERRSTR, code.message());
        u64::from(SCRATCH_ERRSTR)
    }

    fn entry_errmsg(&mut self) -> u64 {
        let message = if self.errmsg.is_empty() {
            "not an error"
        } else {
            &self.errmsg
        };
        let message = message.to_owned();
        MemoryMut::new(&mut self.mem).write_string(SCRATCH_ERRMSG, &message);
        u64::from(SCRATCH_ERRMSG)
    }
}

impl Default for ScriptedModule {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineModule for ScriptedModule {
    fn memory(&self) -> &[u8] {
        &self.mem
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }

    fn malloc(&mut self, size: u32) -> u32 {
        let ptr = self.brk;
        let next = ptr.saturating_add(size.max(8));
        if next as usize > self.mem.len() {
            return 0;
        }
        self.brk = next;
        ptr
    }

    fn free(&mut self, _ptr: u32) {}

    fn call(
        &mut self,
        host: &mut HostDispatch,
        entry: Entry,
        args: &[u64],
    ) -> Result<u64, ModuleFault> {
        if self.closed {
            return Err(ModuleFault::Trap("call on closed module".to_owned()));
        }
        if matches!(
            entry,
            Entry::Open | Entry::Close | Entry::Exec | Entry::Prepare | Entry::Finalize
        ) {
            // Error state describes the most recent statement-level call;
            // the err* entries must be able to read it back afterwards.
            self.errmsg.clear();
            self.erroff = u32::MAX;
        }
        Ok(match entry {
            Entry::Open => self.entry_open(host, args),
            Entry::Close => self.entry_close(host),
            Entry::Exec => self.entry_exec(host, args),
            Entry::Prepare => self.entry_prepare(args),
            Entry::Finalize => {
                self.open_stmts = self.open_stmts.saturating_sub(1);
                u64::from(ResultCode::Ok as u32)
            }
            Entry::Changes => self.changes,
            Entry::ErrStr => self.entry_errstr(args),
            Entry::ErrMsg => self.entry_errmsg(),
            Entry::ErrOff => u64::from(self.erroff),
        })
    }

    fn interrupter(&self) -> Arc<dyn Interrupter> {
        Arc::clone(&self.interrupt) as Arc<dyn Interrupter>
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Strip a `file:` scheme and query string down to the plain name the VFS
/// should see.
fn strip_uri(name: &str) -> &str {
    let rest = name.strip_prefix("file:").unwrap_or(name);
    match rest.split_once('?') {
        Some((path, _)) => path,
        None => rest,
    }
}

/// Whether `sql` contains no statement: only whitespace, line comments and
/// block comments.
fn is_blank_sql(sql: &str) -> bool {
    let mut rest = sql.trim_start();
    loop {
        if rest.is_empty() {
            return true;
        }
        if let Some(after) = rest.strip_prefix("--") {
            rest = match after.split_once('\n') {
                Some((_, tail)) => tail.trim_start(),
                None => "",
            };
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = match after.split_once("*/") {
                Some((_, tail)) => tail.trim_start(),
                None => "",
            };
        } else {
            return false;
        }
    }
}

/// Register a process-wide loader producing fresh scripted modules, so
/// `Connection::open` works in tests.
pub fn install_loader() {
    vsqlite_core::register_module_loader(|| Ok(ScriptedModule::boxed()));
}

/// Initialise tracing for tests, honouring `RUST_LOG`. Safe to call from
/// every test; only the first call installs the subscriber.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
