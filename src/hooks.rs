//! Hook registry: one replaceable slot per hook kind plus the shared failure slot.
//!
//! A registry is shared between the owning [`Connection`](crate::Connection)
//! and the engine, which receives a raw pointer to it as the callback user
//! data. Slots are only replaced while the engine's handle lock is held, so
//! replacement never races a dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use libsqlite3_sys::{SQLITE_DELETE, SQLITE_INSERT, SQLITE_UPDATE};
use parking_lot::Mutex;

use crate::errors::{BoxError, Error, HookError, HookKind, Result};

/// Outcome of a user hook invocation.
pub type HookResult = std::result::Result<(), BoxError>;

/// Row-change hook: `(connection, event)`.
pub type UpdateHook = Box<dyn FnMut(&HookContext, &UpdateEvent) -> HookResult + Send + 'static>;

/// Commit hook: `(connection)`. Observes only; it cannot veto the commit.
pub type CommitHook = Box<dyn FnMut(&HookContext) -> HookResult + Send + 'static>;

/// Rollback hook: `(connection)`.
pub type RollbackHook = Box<dyn FnMut(&HookContext) -> HookResult + Send + 'static>;

/// Box a closure as an [`UpdateHook`].
pub fn update_hook<F>(f: F) -> UpdateHook
where
    F: FnMut(&HookContext, &UpdateEvent) -> HookResult + Send + 'static,
{
    Box::new(f)
}

/// Box a closure as a [`CommitHook`].
pub fn commit_hook<F>(f: F) -> CommitHook
where
    F: FnMut(&HookContext) -> HookResult + Send + 'static,
{
    Box::new(f)
}

/// Box a closure as a [`RollbackHook`].
pub fn rollback_hook<F>(f: F) -> RollbackHook
where
    F: FnMut(&HookContext) -> HookResult + Send + 'static,
{
    Box::new(f)
}

/// Row operation reported to an update hook, tagged with SQLite's native code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Operation {
    Delete = SQLITE_DELETE,
    Insert = SQLITE_INSERT,
    Update = SQLITE_UPDATE,
}

impl Operation {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            SQLITE_DELETE => Ok(Operation::Delete),
            SQLITE_INSERT => Ok(Operation::Insert),
            SQLITE_UPDATE => Ok(Operation::Update),
            other => Err(Error::UnknownOperation(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Delete => "DELETE",
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
        }
    }
}

impl TryFrom<i32> for Operation {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        Operation::from_code(code)
    }
}

/// A single row change, decoded from the engine's callback arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEvent {
    pub operation: Operation,
    /// `"main"`, `"temp"`, or the alias of an attached database.
    pub database: String,
    pub table: String,
    pub rowid: i64,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of the connection a hook fired on.
///
/// Hooks receive this in place of the connection itself: the engine is in
/// the middle of executing a statement on that connection while the hook
/// runs, so the hook must not issue database operations on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookContext {
    id: u64,
    database: Arc<str>,
}

impl HookContext {
    pub(crate) fn new(database: &str) -> Self {
        HookContext {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            database: Arc::from(database),
        }
    }

    /// Process-unique id of the connection.
    pub fn connection_id(&self) -> u64 {
        self.id
    }

    /// Database locator the connection was opened with.
    pub fn database(&self) -> &str {
        &self.database
    }
}

/// A single replaceable hook.
pub(crate) struct HookSlot<H> {
    hook: Mutex<Option<H>>,
}

impl<H> HookSlot<H> {
    pub(crate) fn new() -> Self {
        HookSlot {
            hook: Mutex::new(None),
        }
    }

    pub(crate) fn replace(&self, hook: Option<H>) -> Option<H> {
        std::mem::replace(&mut *self.hook.lock(), hook)
    }

    pub(crate) fn is_set(&self) -> bool {
        self.hook.lock().is_some()
    }

    /// Run `f` against the active hook, if any.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut H) -> R) -> Option<R> {
        self.hook.lock().as_mut().map(f)
    }
}

/// Read-only view of a connection's failure slot.
#[derive(Clone)]
pub struct HookFailures {
    registry: Arc<HookRegistry>,
}

impl HookFailures {
    /// The failure raised by the most recent hook invocation, if it failed.
    pub fn last(&self) -> Option<Arc<HookError>> {
        self.registry.last_error()
    }
}

impl std::fmt::Debug for HookFailures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookFailures")
            .field("last", &self.last())
            .finish()
    }
}

/// Per-connection hook state.
pub(crate) struct HookRegistry {
    context: HookContext,
    pub(crate) update: HookSlot<UpdateHook>,
    pub(crate) commit: HookSlot<CommitHook>,
    pub(crate) rollback: HookSlot<RollbackHook>,
    failure: Mutex<Option<Arc<HookError>>>,
}

impl HookRegistry {
    pub(crate) fn new(context: HookContext) -> Self {
        HookRegistry {
            context,
            update: HookSlot::new(),
            commit: HookSlot::new(),
            rollback: HookSlot::new(),
            failure: Mutex::new(None),
        }
    }

    pub(crate) fn context(&self) -> &HookContext {
        &self.context
    }

    pub(crate) fn failures(self: &Arc<Self>) -> HookFailures {
        HookFailures {
            registry: Arc::clone(self),
        }
    }

    pub(crate) fn last_error(&self) -> Option<Arc<HookError>> {
        self.failure.lock().clone()
    }

    pub(crate) fn clear_error(&self) {
        *self.failure.lock() = None;
    }

    pub(crate) fn any_installed(&self) -> bool {
        self.update.is_set() || self.commit.is_set() || self.rollback.is_set()
    }

    pub(crate) fn dispatch_update(&self, event: &UpdateEvent) {
        tracing::trace!(
            connection = self.context.id,
            operation = event.operation.as_str(),
            database = %event.database,
            table = %event.table,
            rowid = event.rowid,
            "dispatching update hook"
        );
        let context = &self.context;
        self.invoke(HookKind::Update, &self.update, |hook| hook(context, event));
    }

    pub(crate) fn dispatch_commit(&self) {
        tracing::trace!(connection = self.context.id, "dispatching commit hook");
        let context = &self.context;
        self.invoke(HookKind::Commit, &self.commit, |hook| hook(context));
    }

    pub(crate) fn dispatch_rollback(&self) {
        tracing::trace!(connection = self.context.id, "dispatching rollback hook");
        let context = &self.context;
        self.invoke(HookKind::Rollback, &self.rollback, |hook| hook(context));
    }

    /// Clear the failure slot, run the hook, and capture whatever it raised.
    fn invoke<H>(&self, kind: HookKind, slot: &HookSlot<H>, call: impl FnOnce(&mut H) -> HookResult) {
        self.clear_error();

        let outcome = catch_unwind(AssertUnwindSafe(|| slot.with(call)));
        let failure = match outcome {
            Ok(None) | Ok(Some(Ok(()))) => return,
            Ok(Some(Err(source))) => HookError::Failed { kind, source },
            Err(payload) => HookError::from_panic(kind, payload),
        };

        tracing::warn!(connection = self.context.id, error = %failure, "hook failed");
        *self.failure.lock() = Some(Arc::new(failure));
    }
}
