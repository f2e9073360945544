//! Connection lifecycle against the scripted engine module.

use vsqlite::{Connection, OpenFlags, ResultCode};
use vsqlite_harness::{init_tracing, install_loader, Script, ScriptedModule};

fn open_memory() -> Connection {
    init_tracing();
    Connection::open_with_module(ScriptedModule::boxed(), ":memory:", default_flags())
        .expect("open in-memory connection")
}

fn default_flags() -> OpenFlags {
    OpenFlags::READWRITE | OpenFlags::CREATE
}

#[test]
fn open_exec_close() {
    let mut conn = open_memory();
    conn.exec("CREATE TABLE users(id INT, name VARCHAR(10))")
        .unwrap();
    conn.close().unwrap();
}

#[test]
fn open_through_registered_loader() {
    init_tracing();
    install_loader();
    let mut conn = Connection::open(":memory:").unwrap();
    conn.exec("SELECT 1").unwrap();
    conn.close().unwrap();
}

#[test]
fn changes_counts_inserted_rows() {
    let mut conn = open_memory();
    conn.exec("CREATE TABLE users(id INT, name VARCHAR(10))")
        .unwrap();
    conn.exec("INSERT INTO users VALUES (0, 'go'),(1, 'zig'),(2, 'whatever')")
        .unwrap();
    assert_eq!(conn.changes(), 3);
    conn.close().unwrap();
}

#[test]
fn close_is_idempotent() {
    let mut conn = open_memory();
    conn.close().unwrap();
    conn.close().unwrap();
}

#[test]
fn close_with_outstanding_statement_is_busy_noop() {
    let mut conn = open_memory();
    let (stmt, _) = conn.prepare("SELECT 1").unwrap();
    let stmt = stmt.expect("statement compiled");

    let err = conn.close().unwrap_err();
    assert_eq!(err.code(), ResultCode::Busy);
    assert!(err.is_temporary());

    // The connection is still usable after a BUSY close.
    conn.exec("SELECT 2").unwrap();
    conn.finalize(stmt).unwrap();
    conn.close().unwrap();
}

#[test]
fn prepare_reports_tail() {
    let mut conn = open_memory();

    // A single statement leaves no tail.
    let (stmt, tail) = conn.prepare("SELECT 1").unwrap();
    assert!(stmt.is_some());
    assert_eq!(tail, "");
    conn.finalize(stmt.unwrap()).unwrap();

    // The tail begins at the first byte after the terminator.
    let (stmt, tail) = conn.prepare("SELECT 1; SELECT 2").unwrap();
    assert!(stmt.is_some());
    assert_eq!(tail, " SELECT 2");
    conn.finalize(stmt.unwrap()).unwrap();

    conn.close().unwrap();
}

#[test]
fn prepare_empty_and_comment_only() {
    let mut conn = open_memory();

    let (stmt, tail) = conn.prepare("").unwrap();
    assert!(stmt.is_none());
    assert_eq!(tail, "");

    let (stmt, tail) = conn.prepare("-- nothing here").unwrap();
    assert!(stmt.is_none());
    assert_eq!(tail, "");

    let (stmt, tail) = conn.prepare("/* still nothing */").unwrap();
    assert!(stmt.is_none());
    assert_eq!(tail, "");

    conn.close().unwrap();
}

#[test]
fn error_shape() {
    init_tracing();
    let script = Script::new();
    script.fail_next(ResultCode::Error, "incomplete input");
    let module = Box::new(ScriptedModule::with_script(script));

    let mut conn =
        Connection::open_with_module(module, ":memory:", default_flags()).unwrap();
    let err = conn.prepare("SELECT").unwrap_err();
    assert_eq!(err.to_string(), "SQL logic error: incomplete input");
    assert_eq!(err.code(), ResultCode::Error);
    assert_eq!(err.message(), "incomplete input");
    conn.close().unwrap();
}

#[test]
fn error_carries_sql_offset() {
    init_tracing();
    let script = Script::new();
    script.fail_next_at(ResultCode::Error, "near \"FROOM\": syntax error", 9);
    let module = Box::new(ScriptedModule::with_script(script));

    let mut conn =
        Connection::open_with_module(module, ":memory:", default_flags()).unwrap();
    let err = conn.exec("SELECT 1 FROOM t").unwrap_err();
    assert_eq!(err.sql_offset(), Some(9));
    conn.close().unwrap();
}

#[test]
fn exec_failure_resets_arena() {
    let script = Script::new();
    script.fail_next(ResultCode::Error, "boom");
    let module = Box::new(ScriptedModule::with_script(script));
    init_tracing();

    let mut conn =
        Connection::open_with_module(module, ":memory:", default_flags()).unwrap();
    assert!(conn.exec("SELECT 1").is_err());

    // The arena rewound on the failure path, so a long statement still
    // marshals fine afterwards.
    let long_sql = format!("SELECT '{}'", "x".repeat(2048));
    conn.exec(&long_sql).unwrap();
    conn.close().unwrap();
}

#[test]
fn busy_handler_is_consulted() {
    let mut conn = open_memory();
    conn.busy_handler(|_attempt| false);
    // No contention arises against a private memory database; installing
    // the handler must not disturb normal execution.
    conn.exec("SELECT 1").unwrap();
    conn.close().unwrap();
}

#[test]
fn open_missing_file_fails_translated() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.db");
    let err = Connection::open_with_module(
        ScriptedModule::boxed(),
        path.to_str().unwrap(),
        OpenFlags::READWRITE,
    )
    .unwrap_err();
    assert_eq!(err.code(), ResultCode::CantOpen);
}
