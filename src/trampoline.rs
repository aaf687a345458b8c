//! C-ABI adapters installed with the engine, one per hook kind.
//!
//! Nothing may unwind out of these functions: user failures are captured by
//! the registry, and anything else is fatal.

use std::ffi::{c_char, c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use libsqlite3_sys::{
    sqlite3, sqlite3_commit_hook, sqlite3_int64, sqlite3_rollback_hook, sqlite3_update_hook,
};

use crate::errors::{Error, HookKind};
use crate::hooks::{
    CommitHook, HookRegistry, HookSlot, Operation, RollbackHook, UpdateEvent, UpdateHook,
};
use crate::utils::cstr_to_str;

/// Log and abort. Used where returning into the engine is not an option.
fn fatal(kind: HookKind, message: &str) -> ! {
    tracing::error!(hook = %kind, "{message}; aborting");
    std::process::abort()
}

/// A hook kind together with its native registration entry point.
pub(crate) trait NativeHook {
    const KIND: HookKind;
    type Hook;

    fn slot(registry: &HookRegistry) -> &HookSlot<Self::Hook>;

    /// Point the engine at this kind's adapter with `registry` as user data.
    ///
    /// # Safety
    ///
    /// `db` must be a live handle whose owner holds the handle lock, and
    /// `registry` must outlive the registration.
    unsafe fn register(db: *mut sqlite3, registry: *const HookRegistry);

    /// # Safety
    ///
    /// `db` must be a live handle whose owner holds the handle lock.
    unsafe fn unregister(db: *mut sqlite3);
}

pub(crate) struct Update;
pub(crate) struct Commit;
pub(crate) struct Rollback;

impl NativeHook for Update {
    const KIND: HookKind = HookKind::Update;
    type Hook = UpdateHook;

    fn slot(registry: &HookRegistry) -> &HookSlot<UpdateHook> {
        &registry.update
    }

    unsafe fn register(db: *mut sqlite3, registry: *const HookRegistry) {
        // Safety: upheld by the caller. The previous callback pointer is ignored.
        unsafe { sqlite3_update_hook(db, Some(update_adapter), registry as *mut c_void) };
    }

    unsafe fn unregister(db: *mut sqlite3) {
        unsafe { sqlite3_update_hook(db, None, ptr::null_mut()) };
    }
}

impl NativeHook for Commit {
    const KIND: HookKind = HookKind::Commit;
    type Hook = CommitHook;

    fn slot(registry: &HookRegistry) -> &HookSlot<CommitHook> {
        &registry.commit
    }

    unsafe fn register(db: *mut sqlite3, registry: *const HookRegistry) {
        unsafe { sqlite3_commit_hook(db, Some(commit_adapter), registry as *mut c_void) };
    }

    unsafe fn unregister(db: *mut sqlite3) {
        unsafe { sqlite3_commit_hook(db, None, ptr::null_mut()) };
    }
}

impl NativeHook for Rollback {
    const KIND: HookKind = HookKind::Rollback;
    type Hook = RollbackHook;

    fn slot(registry: &HookRegistry) -> &HookSlot<RollbackHook> {
        &registry.rollback
    }

    unsafe fn register(db: *mut sqlite3, registry: *const HookRegistry) {
        unsafe { sqlite3_rollback_hook(db, Some(rollback_adapter), registry as *mut c_void) };
    }

    unsafe fn unregister(db: *mut sqlite3) {
        unsafe { sqlite3_rollback_hook(db, None, ptr::null_mut()) };
    }
}

/// Decode the raw update-hook arguments.
///
/// # Safety
///
/// Both name pointers must be null or NUL-terminated strings valid for the call.
pub(crate) unsafe fn decode_update(
    op: c_int,
    db_name: *const c_char,
    table_name: *const c_char,
    rowid: sqlite3_int64,
) -> Result<UpdateEvent, String> {
    let operation = Operation::from_code(op).map_err(|e| match e {
        Error::UnknownOperation(code) => format!("engine delivered unknown operation code {code}"),
        other => other.to_string(),
    })?;
    // Safety: pointer validity is the caller's contract.
    let database = unsafe { cstr_to_str(db_name) }
        .ok_or_else(|| "engine delivered a null or non-UTF-8 database name".to_string())?;
    let table = unsafe { cstr_to_str(table_name) }
        .ok_or_else(|| "engine delivered a null or non-UTF-8 table name".to_string())?;

    Ok(UpdateEvent {
        operation,
        database: database.to_owned(),
        table: table.to_owned(),
        rowid,
    })
}

/// Adapter for `sqlite3_update_hook`.
///
/// # Safety
///
/// `user_data` must point to the `HookRegistry` passed at registration, which
/// the owning connection keeps alive until the hook is unregistered.
unsafe extern "C" fn update_adapter(
    user_data: *mut c_void,
    op: c_int,
    db_name: *const c_char,
    table_name: *const c_char,
    rowid: sqlite3_int64,
) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        // Safety: see the function contract.
        let registry = unsafe { &*(user_data as *const HookRegistry) };
        match unsafe { decode_update(op, db_name, table_name, rowid) } {
            Ok(event) => registry.dispatch_update(&event),
            Err(message) => fatal(HookKind::Update, &message),
        }
    }));
    if result.is_err() {
        fatal(HookKind::Update, "panic escaped the update adapter");
    }
}

/// Adapter for `sqlite3_commit_hook`. Always returns 0 so the commit proceeds.
///
/// # Safety
///
/// Same contract as [`update_adapter`].
unsafe extern "C" fn commit_adapter(user_data: *mut c_void) -> c_int {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let registry = unsafe { &*(user_data as *const HookRegistry) };
        registry.dispatch_commit();
    }));
    if result.is_err() {
        fatal(HookKind::Commit, "panic escaped the commit adapter");
    }
    0
}

/// Adapter for `sqlite3_rollback_hook`.
///
/// # Safety
///
/// Same contract as [`update_adapter`].
unsafe extern "C" fn rollback_adapter(user_data: *mut c_void) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let registry = unsafe { &*(user_data as *const HookRegistry) };
        registry.dispatch_rollback();
    }));
    if result.is_err() {
        fatal(HookKind::Rollback, "panic escaped the rollback adapter");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{commit_hook, update_hook, HookContext, HookResult};
    use std::ffi::CString;
    use std::sync::Arc;

    fn registry() -> Arc<HookRegistry> {
        Arc::new(HookRegistry::new(HookContext::new(":memory:")))
    }

    #[test]
    fn test_decode_update() {
        let db = CString::new("main").unwrap();
        let table = CString::new("a").unwrap();
        let event = unsafe { decode_update(18, db.as_ptr(), table.as_ptr(), 1) }.unwrap();
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.database, "main");
        assert_eq!(event.table, "a");
        assert_eq!(event.rowid, 1);
    }

    #[test]
    fn test_decode_update_rejects_unknown_code() {
        let db = CString::new("main").unwrap();
        let table = CString::new("a").unwrap();
        let err = unsafe { decode_update(42, db.as_ptr(), table.as_ptr(), 1) }.unwrap_err();
        assert!(err.contains("42"));
    }

    #[test]
    fn test_decode_update_rejects_null_names() {
        let table = CString::new("a").unwrap();
        assert!(unsafe { decode_update(9, ptr::null(), table.as_ptr(), 1) }.is_err());
    }

    #[test]
    fn test_update_adapter_dispatches_through_user_data() {
        let registry = registry();
        let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        registry.update.replace(Some(update_hook(
            move |_ctx: &HookContext, event: &UpdateEvent| {
                sink.lock().push((event.operation, event.rowid));
                Ok(())
            },
        )));

        let db = CString::new("main").unwrap();
        let table = CString::new("a").unwrap();
        unsafe {
            update_adapter(
                Arc::as_ptr(&registry) as *mut c_void,
                23,
                db.as_ptr(),
                table.as_ptr(),
                5,
            );
        }
        assert_eq!(*calls.lock(), vec![(Operation::Update, 5)]);
    }

    #[test]
    fn test_commit_adapter_never_vetoes() {
        let registry = registry();
        registry.commit.replace(Some(commit_hook(|_ctx: &HookContext| -> HookResult {
            Err("veto attempt".into())
        })));

        let status = unsafe { commit_adapter(Arc::as_ptr(&registry) as *mut c_void) };

        assert_eq!(status, 0);
        assert_eq!(
            registry.last_error().map(|e| e.kind()),
            Some(HookKind::Commit)
        );
    }

    #[test]
    fn test_rollback_adapter_with_empty_slot_is_noop() {
        let registry = registry();
        unsafe { rollback_adapter(Arc::as_ptr(&registry) as *mut c_void) };
        assert!(registry.last_error().is_none());
    }
}
