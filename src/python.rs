//! Python bindings: the `Connection` class, `connect()` and `UpdateHookOps`.

#![allow(non_local_definitions)] // False positive from pyo3 macros

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as StdMutex;
use pyo3::exceptions::{PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyWeakrefMethods, PyWeakrefReference};
use pyo3::{PyTraverseError, PyVisit};
use pyo3_async_runtimes::tokio::future_into_py;
use tokio::sync::Mutex;

use crate::connection::{connect as open_connection, Connection};
use crate::errors::{to_py_err, BoxError, HookError};
use crate::exceptions::{HookPanicError, OperationalError};
use crate::hooks::{
    commit_hook, rollback_hook, update_hook, CommitHook, HookContext, HookFailures, HookResult,
    Operation, RollbackHook, UpdateEvent, UpdateHook,
};
use crate::options::ConnectOptions;

/// Row operation passed to update hooks.
#[pyclass(name = "UpdateHookOps", eq, eq_int)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateHookOps {
    #[pyo3(name = "SQLITE_DELETE")]
    Delete = 9,
    #[pyo3(name = "SQLITE_INSERT")]
    Insert = 18,
    #[pyo3(name = "SQLITE_UPDATE")]
    Update = 23,
}

#[pymethods]
impl UpdateHookOps {
    /// Native SQLite operation code.
    #[getter]
    fn value(&self) -> i32 {
        *self as i32
    }
}

impl From<Operation> for UpdateHookOps {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Delete => UpdateHookOps::Delete,
            Operation::Insert => UpdateHookOps::Insert,
            Operation::Update => UpdateHookOps::Update,
        }
    }
}

type PyHookSlot = Arc<StdMutex<Option<Py<PyAny>>>>;

fn closed_error() -> PyErr {
    OperationalError::new_err("Cannot operate on a closed database.")
}

fn ensure_callable(py: Python<'_>, hook: &Option<Py<PyAny>>) -> PyResult<()> {
    match hook {
        Some(hook) if !hook.bind(py).is_callable() => {
            Err(PyTypeError::new_err("hook must be callable or None"))
        }
        _ => Ok(()),
    }
}

/// The callable currently stored in `slot`.
fn current_hook(py: Python<'_>, slot: &PyHookSlot) -> Option<Py<PyAny>> {
    slot.lock().as_ref().map(|hook| hook.clone_ref(py))
}

/// The connection a hook belongs to, or `None` once it has been collected.
fn owner(py: Python<'_>, conn: &Py<PyWeakrefReference>) -> Py<PyAny> {
    conn.bind(py)
        .upgrade()
        .map(Bound::unbind)
        .unwrap_or_else(|| py.None())
}

// Native hooks hold the connection weakly and look the callable up in the
// mirror slot on every call, so the only strong references to Python objects
// live in `PyConnection` where the garbage collector can see them.

/// Call `hook(conn, op, db_name, table_name, rowid)`.
fn python_update_hook(conn: Py<PyWeakrefReference>, slot: PyHookSlot) -> UpdateHook {
    update_hook(move |_ctx: &HookContext, event: &UpdateEvent| {
        Python::attach(|py| {
            let Some(hook) = current_hook(py, &slot) else {
                return Ok(());
            };
            hook.bind(py)
                .call1((
                    owner(py, &conn),
                    UpdateHookOps::from(event.operation),
                    event.database.as_str(),
                    event.table.as_str(),
                    event.rowid,
                ))
                .map(|_| ())
                .map_err(BoxError::from)
        })
    })
}

/// Call `hook(conn)`; shared by commit and rollback hooks.
fn call_python_hook(conn: &Py<PyWeakrefReference>, slot: &PyHookSlot) -> HookResult {
    Python::attach(|py| {
        let Some(hook) = current_hook(py, slot) else {
            return Ok(());
        };
        hook.bind(py)
            .call1((owner(py, conn),))
            .map(|_| ())
            .map_err(BoxError::from)
    })
}

fn python_commit_hook(conn: Py<PyWeakrefReference>, slot: PyHookSlot) -> CommitHook {
    commit_hook(move |_ctx: &HookContext| call_python_hook(&conn, &slot))
}

fn python_rollback_hook(conn: Py<PyWeakrefReference>, slot: PyHookSlot) -> RollbackHook {
    rollback_hook(move |_ctx: &HookContext| call_python_hook(&conn, &slot))
}

/// The Python object for a captured failure: the exact exception the hook
/// raised, or a `HookPanicError` if the hook panicked.
fn hook_error_to_py(py: Python<'_>, failure: &HookError) -> Py<PyAny> {
    match failure.downcast_ref::<PyErr>() {
        Some(err) => err.value(py).clone().into_any().unbind(),
        None => HookPanicError::new_err(failure.to_string())
            .value(py)
            .clone()
            .into_any()
            .unbind(),
    }
}

#[derive(Debug, Clone, Copy)]
enum SlotKind {
    Update,
    Commit,
    Rollback,
}

enum Statement {
    Sql(String),
    Begin,
    Commit,
    Rollback,
}

/// SQLite connection with update, commit and rollback hooks.
///
/// Call `close()` (or use `async with`) to unregister hooks from the engine;
/// a connection collected while hooks are installed keeps its native hook
/// state alive for the rest of the process.
#[pyclass(name = "Connection", weakref)]
pub(crate) struct PyConnection {
    database: String,
    inner: Arc<Mutex<Option<Connection>>>,
    failures: HookFailures,
    update_hook: PyHookSlot,
    commit_hook: PyHookSlot,
    rollback_hook: PyHookSlot,
}

impl PyConnection {
    fn new(database: String, conn: Connection) -> Self {
        let failures = conn.hook_failures();
        PyConnection {
            database,
            inner: Arc::new(Mutex::new(Some(conn))),
            failures,
            update_hook: Arc::new(StdMutex::new(None)),
            commit_hook: Arc::new(StdMutex::new(None)),
            rollback_hook: Arc::new(StdMutex::new(None)),
        }
    }

    fn run(&self, py: Python<'_>, statement: Statement) -> PyResult<Py<PyAny>> {
        let inner = Arc::clone(&self.inner);
        let database = self.database.clone();
        let future = async move {
            let mut guard = inner.lock().await;
            let conn = guard.as_mut().ok_or_else(closed_error)?;
            let rows = match statement {
                Statement::Sql(sql) => conn.execute(&sql).await,
                Statement::Begin => conn.begin().await.map(|_| 0),
                Statement::Commit => conn.commit().await.map(|_| 0),
                Statement::Rollback => conn.rollback().await.map(|_| 0),
            };
            rows.map_err(|e| to_py_err(e, &database))
        };
        future_into_py(py, future).map(|bound| bound.unbind())
    }

    fn slot(&self, kind: SlotKind) -> &PyHookSlot {
        match kind {
            SlotKind::Update => &self.update_hook,
            SlotKind::Commit => &self.commit_hook,
            SlotKind::Rollback => &self.rollback_hook,
        }
    }

    /// Register `hook` with the engine, then store it in the mirror slot and
    /// resolve to the callable it replaced. A failed registration leaves the
    /// previous hook in place.
    fn replace_hook(
        slf: &Bound<'_, Self>,
        kind: SlotKind,
        hook: Option<Py<PyAny>>,
    ) -> PyResult<Py<PyAny>> {
        let py = slf.py();
        ensure_callable(py, &hook)?;
        let this = slf.borrow();
        let slot = Arc::clone(this.slot(kind));
        let conn_ref = PyWeakrefReference::new(slf.as_any())?.unbind();
        let inner = Arc::clone(&this.inner);
        let database = this.database.clone();

        let future = async move {
            let mut guard = inner.lock().await;
            let conn = guard.as_mut().ok_or_else(closed_error)?;
            let install = hook.is_some();
            let registered = match kind {
                SlotKind::Update => {
                    let native = install.then(|| python_update_hook(conn_ref, Arc::clone(&slot)));
                    conn.set_update_hook(native).await.map(|_| ())
                }
                SlotKind::Commit => {
                    let native = install.then(|| python_commit_hook(conn_ref, Arc::clone(&slot)));
                    conn.set_commit_hook(native).await.map(|_| ())
                }
                SlotKind::Rollback => {
                    let native =
                        install.then(|| python_rollback_hook(conn_ref, Arc::clone(&slot)));
                    conn.set_rollback_hook(native).await.map(|_| ())
                }
            };
            registered.map_err(|e| to_py_err(e, &database))?;
            // Statements need `guard`, so no hook can fire before the swap.
            let previous = std::mem::replace(&mut *slot.lock(), hook);
            Ok::<_, PyErr>(previous)
        };
        future_into_py(py, future).map(|bound| bound.unbind())
    }

    fn shutdown(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        // Dropping the mirrors here releases the Python references while the GIL is held.
        self.update_hook.lock().take();
        self.commit_hook.lock().take();
        self.rollback_hook.lock().take();

        let inner = Arc::clone(&self.inner);
        let database = self.database.clone();
        let future = async move {
            let conn = inner.lock().await.take();
            if let Some(conn) = conn {
                conn.close().await.map_err(|e| to_py_err(e, &database))?;
            }
            Ok::<_, PyErr>(())
        };
        future_into_py(py, future).map(|bound| bound.unbind())
    }
}

#[pymethods]
impl PyConnection {
    /// Execute SQL; resolves to the number of rows affected.
    fn execute(&self, py: Python<'_>, sql: String) -> PyResult<Py<PyAny>> {
        self.run(py, Statement::Sql(sql))
    }

    /// Begin a transaction.
    fn begin(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        self.run(py, Statement::Begin)
    }

    /// Commit the current transaction.
    fn commit(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        self.run(py, Statement::Commit)
    }

    /// Rollback the current transaction.
    fn rollback(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        self.run(py, Statement::Rollback)
    }

    /// Sets an update hook overwriting a previous one.
    ///
    /// The hook is called as `hook(conn, op, db_name, table_name, rowid)` and
    /// MUST NOT perform any database operations. Resolves to the previous
    /// hook or `None`. Errors raised by the hook are available from
    /// `last_hook_error()`.
    #[pyo3(signature = (hook = None))]
    fn set_update_hook(slf: &Bound<'_, Self>, hook: Option<Py<PyAny>>) -> PyResult<Py<PyAny>> {
        Self::replace_hook(slf, SlotKind::Update, hook)
    }

    /// Sets a commit hook overwriting a previous one.
    ///
    /// The hook is called as `hook(conn)`. Raising does not abort the commit.
    #[pyo3(signature = (hook = None))]
    fn set_commit_hook(slf: &Bound<'_, Self>, hook: Option<Py<PyAny>>) -> PyResult<Py<PyAny>> {
        Self::replace_hook(slf, SlotKind::Commit, hook)
    }

    /// Sets a rollback hook overwriting a previous one.
    ///
    /// The hook is called as `hook(conn)`.
    #[pyo3(signature = (hook = None))]
    fn set_rollback_hook(slf: &Bound<'_, Self>, hook: Option<Py<PyAny>>) -> PyResult<Py<PyAny>> {
        Self::replace_hook(slf, SlotKind::Rollback, hook)
    }

    fn __traverse__(&self, visit: PyVisit<'_>) -> Result<(), PyTraverseError> {
        for slot in [&self.update_hook, &self.commit_hook, &self.rollback_hook] {
            // Never block inside the collector.
            if let Some(hook) = slot.try_lock() {
                if let Some(hook) = hook.as_ref() {
                    visit.call(hook)?;
                }
            }
        }
        Ok(())
    }

    fn __clear__(&mut self) {
        self.update_hook.lock().take();
        self.commit_hook.lock().take();
        self.rollback_hook.lock().take();
    }

    /// Returns the last error raised inside any hook, or `None`.
    fn last_hook_error(&self, py: Python<'_>) -> Option<Py<PyAny>> {
        self.failures
            .last()
            .map(|failure| hook_error_to_py(py, &failure))
    }

    /// Close the connection, removing all hooks first.
    fn close(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        self.shutdown(py)
    }

    /// Async context manager entry.
    fn __aenter__(slf: PyRef<Self>) -> PyResult<Py<PyAny>> {
        let slf: Py<Self> = slf.into();
        Python::attach(|py| {
            let future = async move { Ok(slf) };
            future_into_py(py, future).map(|bound| bound.unbind())
        })
    }

    /// Async context manager exit.
    fn __aexit__(
        &self,
        py: Python<'_>,
        _exc_type: &Bound<'_, PyAny>,
        _exc_val: &Bound<'_, PyAny>,
        _exc_tb: &Bound<'_, PyAny>,
    ) -> PyResult<Py<PyAny>> {
        self.shutdown(py)
    }
}

/// Open a hook-aware connection; resolves to a `Connection`.
///
/// * `database` - path, `":memory:"`, or `file:` URI.
/// * `pragmas` - optional dict of PRAGMA settings applied on open.
/// * `timeout` - busy timeout in seconds.
#[pyfunction]
#[pyo3(signature = (database, *, pragmas = None, timeout = 5.0))]
pub(crate) fn connect(
    py: Python<'_>,
    database: String,
    pragmas: Option<&Bound<'_, PyDict>>,
    timeout: f64,
) -> PyResult<Py<PyAny>> {
    if !timeout.is_finite() || timeout < 0.0 {
        return Err(PyValueError::new_err("timeout must be a non-negative number"));
    }

    let mut options =
        ConnectOptions::new(database.clone()).busy_timeout(Duration::from_secs_f64(timeout));
    if let Some(pragmas) = pragmas {
        for (name, value) in pragmas.iter() {
            let name: String = name.extract()?;
            let value = value.str()?.to_string();
            options = options.pragma(name, value);
        }
    }

    let future = async move {
        let conn = open_connection(options)
            .await
            .map_err(|e| to_py_err(e, &database))?;
        Ok::<_, PyErr>(PyConnection::new(database, conn))
    };
    future_into_py(py, future).map(|bound| bound.unbind())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hooks_hold_their_connection_weakly() {
        Python::initialize();
        let conn = open_connection(":memory:").await.unwrap();
        Python::attach(|py| {
            let globals = PyDict::new(py);
            let seen = pyo3::types::PyList::empty(py);
            globals.set_item("seen", &seen).unwrap();
            let callable = py
                .eval(c"lambda conn: seen.append(conn is not None)", Some(&globals), None)
                .unwrap();

            let py_conn = Bound::new(py, PyConnection::new(":memory:".to_string(), conn)).unwrap();
            let conn_ref = PyWeakrefReference::new(py_conn.as_any()).unwrap().unbind();
            let slot: PyHookSlot = Arc::new(StdMutex::new(Some(callable.unbind())));
            let mut hook = python_commit_hook(conn_ref, Arc::clone(&slot));
            let ctx = HookContext::new(":memory:");

            hook(&ctx).unwrap();
            drop(py_conn);
            hook(&ctx).unwrap();
            let seen_values: Vec<bool> = seen.extract().unwrap();
            assert_eq!(seen_values, vec![true, false]);

            // An emptied slot turns the native hook into a no-op.
            slot.lock().take();
            hook(&ctx).unwrap();
            assert_eq!(seen.len(), 2);
        });
    }
}
