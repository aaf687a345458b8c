//! `DeferredConnection`: hooks that run as tasks on the tokio runtime.
//!
//! The engine invokes hooks on the binding's worker thread. Here the adapter
//! installed on that thread only forwards the event through a channel to a
//! dispatcher task and blocks until the dispatcher reports the outcome. The
//! dispatcher runs each hook future as its own task and finishes it before
//! taking the next event, so hooks observe events in the order the engine
//! produced them, while the engine is still paused at the triggering event.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use sqlx::sqlite::SqliteConnection;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionFactory};
use crate::errors::{Error, HookError, Result};
use crate::hooks::{
    commit_hook, rollback_hook, update_hook, HookContext, HookFailures, HookResult, UpdateEvent,
};
use crate::options::ConnectOptions;

/// Future returned by an async hook.
pub type HookFuture = Pin<Box<dyn Future<Output = HookResult> + Send + 'static>>;

/// Async row-change hook.
pub type AsyncUpdateHook = Box<dyn FnMut(HookContext, UpdateEvent) -> HookFuture + Send + 'static>;

/// Async commit or rollback hook.
pub type AsyncHook = Box<dyn FnMut(HookContext) -> HookFuture + Send + 'static>;

/// Box an async closure as an [`AsyncUpdateHook`].
pub fn async_update_hook<F, Fut>(mut f: F) -> AsyncUpdateHook
where
    F: FnMut(HookContext, UpdateEvent) -> Fut + Send + 'static,
    Fut: Future<Output = HookResult> + Send + 'static,
{
    Box::new(move |ctx, event| Box::pin(f(ctx, event)))
}

/// Box an async closure as an [`AsyncHook`].
pub fn async_hook<F, Fut>(mut f: F) -> AsyncHook
where
    F: FnMut(HookContext) -> Fut + Send + 'static,
    Fut: Future<Output = HookResult> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(f(ctx)))
}

enum Pending {
    Update(UpdateEvent),
    Commit,
    Rollback,
}

struct Job {
    context: HookContext,
    pending: Pending,
    done: oneshot::Sender<HookResult>,
}

#[derive(Default)]
struct AsyncHooks {
    update: Mutex<Option<AsyncUpdateHook>>,
    commit: Mutex<Option<AsyncHook>>,
    rollback: Mutex<Option<AsyncHook>>,
}

impl AsyncHooks {
    /// Start the hook for `pending`, if one is set. No lock is held once this returns.
    fn start(&self, context: HookContext, pending: Pending) -> Option<HookFuture> {
        match pending {
            Pending::Update(event) => self.update.lock().as_mut().map(|hook| hook(context, event)),
            Pending::Commit => self.commit.lock().as_mut().map(|hook| hook(context)),
            Pending::Rollback => self.rollback.lock().as_mut().map(|hook| hook(context)),
        }
    }
}

async fn run_dispatcher(mut jobs: mpsc::UnboundedReceiver<Job>, hooks: Arc<AsyncHooks>) {
    while let Some(job) = jobs.recv().await {
        let outcome = match hooks.start(job.context, job.pending) {
            Some(future) => match tokio::spawn(future).await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(join_error.into()),
            },
            None => Ok(()),
        };
        // The forwarder may have given up; nothing to report then.
        let _ = job.done.send(outcome);
    }
    tracing::debug!("hook dispatcher stopped");
}

/// Hand `pending` to the dispatcher and wait for the hook to finish.
///
/// Runs on the binding's worker thread, never on the runtime.
fn forward(jobs: &mpsc::UnboundedSender<Job>, context: &HookContext, pending: Pending) -> HookResult {
    let (done, outcome) = oneshot::channel();
    jobs.send(Job {
        context: context.clone(),
        pending,
        done,
    })
    .map_err(|_| Error::DispatcherClosed)?;
    outcome.blocking_recv().map_err(|_| Error::DispatcherClosed)?
}

/// Aborts the dispatcher task unless it was handed back for a clean shutdown.
struct Dispatcher(Option<JoinHandle<()>>);

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

/// A [`Connection`] whose hooks are async and run on the tokio runtime.
///
/// Select it at construction with `connect_as::<DeferredConnection>(..)`.
/// Hook failures, panics, and a stopped dispatcher all end up in the same
/// failure slot as on a plain [`Connection`].
///
/// Dropping it without [`DeferredConnection::close`] aborts the dispatcher;
/// the leaked forwarders then report [`Error::DispatcherClosed`].
pub struct DeferredConnection {
    conn: Connection,
    hooks: Arc<AsyncHooks>,
    jobs: mpsc::UnboundedSender<Job>,
    dispatcher: Dispatcher,
}

impl ConnectionFactory for DeferredConnection {
    async fn from_sqlite(conn: SqliteConnection, options: &ConnectOptions) -> Result<Self> {
        let conn = Connection::from_sqlite(conn, options).await?;
        let hooks = Arc::new(AsyncHooks::default());
        let (jobs, receiver) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(run_dispatcher(receiver, Arc::clone(&hooks)));
        Ok(DeferredConnection {
            conn,
            hooks,
            jobs,
            dispatcher: Dispatcher(Some(dispatcher)),
        })
    }
}

impl DeferredConnection {
    pub async fn set_update_hook(
        &mut self,
        hook: Option<AsyncUpdateHook>,
    ) -> Result<Option<AsyncUpdateHook>> {
        let forwarder = hook.is_some().then(|| {
            let jobs = self.jobs.clone();
            update_hook(move |ctx: &HookContext, event: &UpdateEvent| {
                forward(&jobs, ctx, Pending::Update(event.clone()))
            })
        });
        self.conn.set_update_hook(forwarder).await?;
        Ok(std::mem::replace(&mut *self.hooks.update.lock(), hook))
    }

    pub async fn set_commit_hook(&mut self, hook: Option<AsyncHook>) -> Result<Option<AsyncHook>> {
        let forwarder = hook.is_some().then(|| {
            let jobs = self.jobs.clone();
            commit_hook(move |ctx: &HookContext| forward(&jobs, ctx, Pending::Commit))
        });
        self.conn.set_commit_hook(forwarder).await?;
        Ok(std::mem::replace(&mut *self.hooks.commit.lock(), hook))
    }

    pub async fn set_rollback_hook(&mut self, hook: Option<AsyncHook>) -> Result<Option<AsyncHook>> {
        let forwarder = hook.is_some().then(|| {
            let jobs = self.jobs.clone();
            rollback_hook(move |ctx: &HookContext| forward(&jobs, ctx, Pending::Rollback))
        });
        self.conn.set_rollback_hook(forwarder).await?;
        Ok(std::mem::replace(&mut *self.hooks.rollback.lock(), hook))
    }

    pub fn last_hook_error(&self) -> Option<Arc<HookError>> {
        self.conn.last_hook_error()
    }

    pub fn hook_failures(&self) -> HookFailures {
        self.conn.hook_failures()
    }

    pub fn context(&self) -> &HookContext {
        self.conn.context()
    }

    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.conn.execute(sql).await
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.conn.begin().await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.conn.commit().await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.conn.rollback().await
    }

    pub fn sqlite_mut(&mut self) -> &mut SqliteConnection {
        self.conn.sqlite_mut()
    }

    /// Remove every hook, close the connection, and stop the dispatcher.
    pub async fn close(self) -> Result<()> {
        let DeferredConnection {
            conn,
            jobs,
            mut dispatcher,
            ..
        } = self;
        let closed = conn.close().await;
        drop(jobs);
        // After a failed close the leaked forwarders still hold senders, so
        // the guard aborts the dispatcher instead of waiting for it.
        if closed.is_ok() {
            if let Some(task) = dispatcher.0.take() {
                if let Err(join_error) = task.await {
                    tracing::warn!(error = %join_error, "hook dispatcher ended abnormally");
                }
            }
        }
        closed
    }
}

impl std::fmt::Debug for DeferredConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect_as;
    use crate::errors::HookKind;
    use crate::errors::BoxError;
    use crate::hooks::Operation;

    type Seen = Arc<Mutex<Vec<(Operation, i64)>>>;

    async fn record(sink: Seen, event: UpdateEvent) -> HookResult {
        // Yield so a reordering dispatcher would be caught.
        tokio::task::yield_now().await;
        sink.lock().push((event.operation, event.rowid));
        Ok(())
    }

    async fn succeed(_ctx: HookContext) -> HookResult {
        Ok(())
    }

    async fn fail(_ctx: HookContext) -> HookResult {
        let error: BoxError = "deferred boom".into();
        Err(error)
    }

    async fn explode(_ctx: HookContext) -> HookResult {
        panic!("deferred panic")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_update_hooks_run_in_mutation_order() {
        let mut conn: DeferredConnection = connect_as(":memory:").await.unwrap();
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        conn.set_update_hook(Some(async_update_hook(move |_ctx, event| {
            record(Arc::clone(&sink), event)
        })))
        .await
        .unwrap();

        conn.execute("CREATE TABLE a (id)").await.unwrap();
        conn.begin().await.unwrap();
        conn.execute("INSERT INTO a VALUES (1); INSERT INTO a VALUES (2); UPDATE a SET id = 3 WHERE rowid = 1; DELETE FROM a WHERE rowid = 2")
            .await
            .unwrap();
        conn.commit().await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                (Operation::Insert, 1),
                (Operation::Insert, 2),
                (Operation::Update, 1),
                (Operation::Delete, 2),
            ]
        );
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_async_hook_failure_lands_in_failure_slot() {
        let mut conn: DeferredConnection = connect_as(":memory:").await.unwrap();
        conn.set_commit_hook(Some(async_hook(fail)))
            .await
            .unwrap();

        conn.execute("CREATE TABLE a (id)").await.unwrap();

        let failure = conn.last_hook_error().expect("commit hook failed");
        assert_eq!(failure.kind(), HookKind::Commit);
        assert!(failure.to_string().contains("deferred boom"));

        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM sqlite_master WHERE name = 'a'")
            .fetch_one(conn.sqlite_mut())
            .await
            .unwrap();
        assert_eq!(count, 1);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_async_hook_panic_is_captured() {
        let mut conn: DeferredConnection = connect_as(":memory:").await.unwrap();
        conn.set_rollback_hook(Some(async_hook(explode)))
            .await
            .unwrap();

        conn.execute("CREATE TABLE a (id)").await.unwrap();
        conn.begin().await.unwrap();
        conn.execute("INSERT INTO a VALUES (1)").await.unwrap();
        conn.rollback().await.unwrap();

        let failure = conn.last_hook_error().expect("panic captured");
        assert_eq!(failure.kind(), HookKind::Rollback);
        conn.close().await.unwrap();
    }

    fn tagged(tag: &'static str, seen: Arc<Mutex<Vec<&'static str>>>) -> AsyncUpdateHook {
        async_update_hook(move |_ctx, _event| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push(tag);
                Ok::<_, BoxError>(())
            }
        })
    }

    #[tokio::test]
    async fn test_failed_registration_keeps_previous_hook() {
        let mut conn: DeferredConnection = connect_as(":memory:").await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        conn.set_update_hook(Some(tagged("first", Arc::clone(&seen))))
            .await
            .unwrap();

        // Swap in a different binding connection so the located handle no longer matches.
        let mut other: SqliteConnection = connect_as(":memory:").await.unwrap();
        std::mem::swap(conn.sqlite_mut(), &mut other);
        let result = conn
            .set_update_hook(Some(tagged("second", Arc::clone(&seen))))
            .await;
        assert!(matches!(result, Err(Error::HandleMismatch)));
        std::mem::swap(conn.sqlite_mut(), &mut other);

        conn.execute("CREATE TABLE a (id); INSERT INTO a VALUES (1)")
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec!["first"]);

        let mut previous = conn
            .set_update_hook(None)
            .await
            .unwrap()
            .expect("first hook still installed");
        let event = UpdateEvent {
            operation: Operation::Insert,
            database: "main".to_string(),
            table: "a".to_string(),
            rowid: 2,
        };
        previous(conn.context().clone(), event).await.unwrap();
        assert_eq!(*seen.lock(), vec!["first", "first"]);

        conn.close().await.unwrap();
        sqlx::Connection::close(other).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_without_close_stops_dispatcher() {
        let mut conn: DeferredConnection = connect_as(":memory:").await.unwrap();
        conn.set_commit_hook(Some(async_hook(succeed)))
            .await
            .unwrap();
        let hooks = Arc::downgrade(&conn.hooks);

        drop(conn);

        for _ in 0..100 {
            if hooks.upgrade().is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(hooks.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_replacing_async_hooks_returns_previous() {
        let mut conn: DeferredConnection = connect_as(":memory:").await.unwrap();
        assert!(conn
            .set_commit_hook(Some(async_hook(succeed)))
            .await
            .unwrap()
            .is_none());
        assert!(conn.set_commit_hook(None).await.unwrap().is_some());
        assert!(conn.set_commit_hook(None).await.unwrap().is_none());
        assert!(conn.last_hook_error().is_none());
        conn.close().await.unwrap();
    }
}
