//! SQLite update, commit and rollback hooks on top of sqlx.
//!
//! [`connect`] opens a [`Connection`] that locates the engine's native handle
//! through the binding and lets one update, commit and rollback hook be
//! installed at a time. [`DeferredConnection`] runs async hooks as tasks on
//! the tokio runtime instead of inline on the engine's thread.
//!
//! With the `python` feature the crate builds the `_sqlite_hooks` extension
//! module exposing the same surface to asyncio code.

mod connection;
mod deferred;
mod errors;
mod handle;
mod hooks;
mod options;
mod trampoline;
mod utils;

#[cfg(feature = "python")]
mod exceptions;
#[cfg(feature = "python")]
mod python;

pub use connection::{connect, connect_as, Connection, ConnectionFactory};
pub use deferred::{
    async_hook, async_update_hook, AsyncHook, AsyncUpdateHook, DeferredConnection, HookFuture,
};
pub use errors::{BoxError, Error, HookError, HookKind, Result};
pub use hooks::{
    commit_hook, rollback_hook, update_hook, CommitHook, HookContext, HookFailures, HookResult,
    Operation, RollbackHook, UpdateEvent, UpdateHook,
};
pub use options::{ConnectOptions, IsolationLevel, DEFAULT_BUSY_TIMEOUT};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Python bindings for sqlite_hooks - SQLite hooks for asyncio.
#[cfg(feature = "python")]
#[pymodule]
fn _sqlite_hooks(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = m.py();
    m.add_class::<python::PyConnection>()?;
    m.add_class::<python::UpdateHookOps>()?;
    m.add_function(wrap_pyfunction!(python::connect, m)?)?;

    m.add("Error", py.get_type::<exceptions::Error>())?;
    m.add("DatabaseError", py.get_type::<exceptions::DatabaseError>())?;
    m.add("OperationalError", py.get_type::<exceptions::OperationalError>())?;
    m.add("ProgrammingError", py.get_type::<exceptions::ProgrammingError>())?;
    m.add("IntegrityError", py.get_type::<exceptions::IntegrityError>())?;
    m.add("HookPanicError", py.get_type::<exceptions::HookPanicError>())?;
    Ok(())
}
