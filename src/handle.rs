//! Native handle locator.
//!
//! The binding exposes the engine handle through `lock_handle()`, so the
//! handle is read from there once per connection and never inferred from
//! memory layout. [`NativeHandle::verify`] is an optional self-test that
//! proves registrations made through the handle actually reach the engine.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libsqlite3_sys::sqlite3;
use sqlx::sqlite::SqliteConnection;

use crate::errors::{Error, Result};
use crate::hooks::{update_hook, HookContext, HookRegistry, UpdateEvent};
use crate::trampoline::{NativeHook, Update};

const PROBE_TABLE: &str = "__sqlite_hooks_probe";

const PROBE_SQL: &str = "SAVEPOINT __sqlite_hooks_probe; \
     CREATE TEMP TABLE __sqlite_hooks_probe (x); \
     INSERT INTO __sqlite_hooks_probe VALUES (1); \
     ROLLBACK TO __sqlite_hooks_probe; \
     RELEASE __sqlite_hooks_probe;";

/// The engine's `sqlite3*` for one connection.
#[derive(Debug)]
pub(crate) struct NativeHandle(NonNull<sqlite3>);

// Safety: the pointer is only handed to the engine while the owning
// connection's handle lock is held, which serializes it with the binding's
// worker thread.
unsafe impl Send for NativeHandle {}
unsafe impl Sync for NativeHandle {}

impl NativeHandle {
    /// Resolve the handle of a freshly constructed connection.
    pub(crate) async fn locate(conn: &mut SqliteConnection) -> Result<Self> {
        let mut locked = conn.lock_handle().await?;
        let raw = locked.as_raw_handle();
        tracing::debug!(handle = ?raw, "located native handle");
        Ok(NativeHandle(raw))
    }

    pub(crate) fn as_ptr(&self) -> *mut sqlite3 {
        self.0.as_ptr()
    }

    /// Run `f` against the handle while the binding's handle lock is held.
    pub(crate) async fn with_locked<R>(
        &self,
        conn: &mut SqliteConnection,
        f: impl FnOnce(*mut sqlite3) -> R,
    ) -> Result<R> {
        let mut locked = conn.lock_handle().await?;
        if locked.as_raw_handle() != self.0 {
            return Err(Error::HandleMismatch);
        }
        Ok(f(self.as_ptr()))
    }

    /// Register a probe update hook, mutate a throwaway TEMP table inside a
    /// savepoint that is rolled back, and require that the probe fired.
    pub(crate) async fn verify(&self, conn: &mut SqliteConnection) -> Result<()> {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let probe = Arc::new(HookRegistry::new(HookContext::new(PROBE_TABLE)));
        probe.update.replace(Some(update_hook(
            move |_ctx: &HookContext, event: &UpdateEvent| {
                if event.table == PROBE_TABLE {
                    flag.store(true, Ordering::SeqCst);
                }
                Ok(())
            },
        )));

        // Safety: the lock is held for the call and `probe` stays alive until
        // the registration is removed below (or is leaked if removal fails).
        self.with_locked(conn, |db| unsafe { Update::register(db, Arc::as_ptr(&probe)) })
            .await?;

        let outcome = sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(PROBE_SQL)).await;

        let cleared = self
            .with_locked(conn, |db| unsafe { Update::unregister(db) })
            .await;
        if cleared.is_err() {
            // The engine may still point at the probe registry.
            std::mem::forget(Arc::clone(&probe));
        }
        cleared?;
        outcome?;

        if fired.load(Ordering::SeqCst) {
            tracing::debug!(handle = ?self.0, "native handle verified");
            Ok(())
        } else {
            Err(Error::HandleVerification(
                "probe update hook did not fire".to_string(),
            ))
        }
    }
}
