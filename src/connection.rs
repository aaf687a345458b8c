//! `Connection`: a SQLite connection with update, commit and rollback hooks.

use std::future::Future;
use std::sync::Arc;

use sqlx::sqlite::SqliteConnection;
use sqlx::ConnectOptions as _;
use sqlx::Connection as SqlxConnection;

use crate::errors::{HookError, Result};
use crate::handle::NativeHandle;
use crate::hooks::{
    CommitHook, HookContext, HookFailures, HookRegistry, RollbackHook, UpdateHook,
};
use crate::options::{ConnectOptions, IsolationLevel};
use crate::trampoline::{Commit, NativeHook, Rollback, Update};

/// Builds a connection type from a freshly opened binding connection.
///
/// [`connect`] produces a hook-aware [`Connection`]; [`connect_as`] lets the
/// caller pick another implementation, including the plain
/// [`SqliteConnection`] when hooks are not wanted.
pub trait ConnectionFactory: Sized + Send {
    fn from_sqlite(
        conn: SqliteConnection,
        options: &ConnectOptions,
    ) -> impl Future<Output = Result<Self>> + Send;
}

impl ConnectionFactory for SqliteConnection {
    async fn from_sqlite(conn: SqliteConnection, _options: &ConnectOptions) -> Result<Self> {
        Ok(conn)
    }
}

/// Open a hook-aware connection.
///
/// ```no_run
/// # async fn demo() -> sqlite_hooks::Result<()> {
/// let mut conn = sqlite_hooks::connect(":memory:").await?;
/// conn.set_update_hook(Some(sqlite_hooks::update_hook(|_ctx, event| {
///     println!("{:?} {}.{} rowid={}", event.operation, event.database, event.table, event.rowid);
///     Ok(())
/// })))
/// .await?;
/// conn.execute("CREATE TABLE a (id)").await?;
/// conn.execute("INSERT INTO a VALUES (1)").await?;
/// conn.close().await
/// # }
/// ```
pub async fn connect(options: impl Into<ConnectOptions>) -> Result<Connection> {
    connect_as::<Connection>(options).await
}

/// Open a connection of any [`ConnectionFactory`] type.
pub async fn connect_as<C: ConnectionFactory>(options: impl Into<ConnectOptions>) -> Result<C> {
    let options = options.into();
    let conn = options.to_sqlx()?.connect().await?;
    C::from_sqlite(conn, &options).await
}

/// Keeps the registry alive for the engine if the connection is dropped
/// without [`Connection::close`].
struct RegistryGuard(Arc<HookRegistry>);

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        if self.0.any_installed() {
            tracing::warn!(
                connection = self.0.context().connection_id(),
                "connection dropped with hooks installed; call close() to unregister them"
            );
            // The engine still holds a pointer to the registry.
            std::mem::forget(Arc::clone(&self.0));
        }
    }
}

/// A SQLite connection that can carry one update, commit and rollback hook.
///
/// Hooks run synchronously on the engine's thread while a statement executes.
/// A hook must not run queries on the connection it is attached to. Failures
/// raised by a hook never reach the statement that triggered it; read them
/// with [`Connection::last_hook_error`].
pub struct Connection {
    inner: SqliteConnection,
    handle: NativeHandle,
    registry: RegistryGuard,
    isolation_level: Option<IsolationLevel>,
}

impl ConnectionFactory for Connection {
    async fn from_sqlite(mut conn: SqliteConnection, options: &ConnectOptions) -> Result<Self> {
        let handle = NativeHandle::locate(&mut conn).await?;
        if options.should_verify_handle() {
            handle.verify(&mut conn).await?;
        }

        let context = HookContext::new(options.database());
        tracing::debug!(
            connection = context.connection_id(),
            database = %context.database(),
            "opened hook-aware connection"
        );
        Ok(Connection {
            inner: conn,
            handle,
            registry: RegistryGuard(Arc::new(HookRegistry::new(context))),
            isolation_level: options.get_isolation_level(),
        })
    }
}

impl Connection {
    /// Set the row-change hook, returning the one it replaces.
    ///
    /// `None` removes the hook. Either way the failure slot is cleared.
    ///
    /// A `DELETE` without a `WHERE` clause takes SQLite's truncate path and
    /// reports no row events. Changes to `WITHOUT ROWID` tables are not
    /// reported either.
    pub async fn set_update_hook(&mut self, hook: Option<UpdateHook>) -> Result<Option<UpdateHook>> {
        self.replace_hook::<Update>(hook).await
    }

    /// Set the commit hook, returning the one it replaces.
    ///
    /// The engine is always told to go ahead with the commit, even when the
    /// hook fails.
    pub async fn set_commit_hook(&mut self, hook: Option<CommitHook>) -> Result<Option<CommitHook>> {
        self.replace_hook::<Commit>(hook).await
    }

    /// Set the rollback hook, returning the one it replaces.
    pub async fn set_rollback_hook(
        &mut self,
        hook: Option<RollbackHook>,
    ) -> Result<Option<RollbackHook>> {
        self.replace_hook::<Rollback>(hook).await
    }

    /// The failure raised by the most recent hook invocation, of any kind.
    pub fn last_hook_error(&self) -> Option<Arc<HookError>> {
        self.registry.0.last_error()
    }

    /// A handle on the failure slot that can be read without borrowing the connection.
    pub fn hook_failures(&self) -> HookFailures {
        self.registry.0.failures()
    }

    /// The context passed to this connection's hooks.
    pub fn context(&self) -> &HookContext {
        self.registry.0.context()
    }

    /// Execute one or more SQL statements, returning the number of rows affected.
    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        let result = sqlx::Executor::execute(&mut self.inner, sqlx::raw_sql(sql)).await?;
        Ok(result.rows_affected())
    }

    /// Begin a transaction using the configured isolation level.
    pub async fn begin(&mut self) -> Result<()> {
        self.execute(IsolationLevel::begin_statement(self.isolation_level))
            .await
            .map(|_| ())
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT").await.map(|_| ())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK").await.map(|_| ())
    }

    /// The underlying binding connection, for queries beyond [`Connection::execute`].
    pub fn sqlite_mut(&mut self) -> &mut SqliteConnection {
        &mut self.inner
    }

    /// Remove every hook from the engine, then close the connection.
    pub async fn close(mut self) -> Result<()> {
        self.clear_hooks().await?;
        let Connection { inner, .. } = self;
        inner.close().await?;
        Ok(())
    }

    pub(crate) async fn clear_hooks(&mut self) -> Result<()> {
        self.replace_hook::<Update>(None).await?;
        self.replace_hook::<Commit>(None).await?;
        self.replace_hook::<Rollback>(None).await?;
        Ok(())
    }

    async fn replace_hook<K: NativeHook>(&mut self, hook: Option<K::Hook>) -> Result<Option<K::Hook>> {
        let registry = Arc::clone(&self.registry.0);
        let installed = K::slot(&registry).is_set();
        let setting = hook.is_some();

        let previous = match hook {
            Some(hook) => {
                self.handle
                    .with_locked(&mut self.inner, |db| {
                        let previous = K::slot(&registry).replace(Some(hook));
                        // Safety: the handle lock is held and the registry
                        // lives as long as this connection (or is leaked by
                        // `RegistryGuard` if the connection is dropped first).
                        unsafe { K::register(db, Arc::as_ptr(&registry)) };
                        previous
                    })
                    .await?
            }
            None if installed => {
                self.handle
                    .with_locked(&mut self.inner, |db| {
                        // Safety: the handle lock is held.
                        unsafe { K::unregister(db) };
                        K::slot(&registry).replace(None)
                    })
                    .await?
            }
            // Already clear: nothing to tell the engine.
            None => None,
        };

        registry.clear_error();
        let action = if setting { "set" } else { "cleared" };
        tracing::debug!(
            connection = registry.context().connection_id(),
            hook = K::KIND.as_str(),
            action,
            replaced = previous.is_some(),
            "hook registration changed"
        );
        Ok(previous)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = &self.registry.0;
        f.debug_struct("Connection")
            .field("context", registry.context())
            .field("update_hook", &registry.update.is_set())
            .field("commit_hook", &registry.commit.is_set())
            .field("rollback_hook", &registry.rollback.is_set())
            .field("isolation_level", &self.isolation_level)
            .finish()
    }
}
