//! Connection configuration.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::SqliteConnectOptions;

use crate::errors::{Error, Result};
use crate::utils::{parse_connection_string, validate_path};

/// Default busy timeout, matching the `sqlite3` module default of 5 seconds.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Locking mode used by [`Connection::begin`](crate::Connection::begin).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    Deferred,
    Immediate,
    Exclusive,
}

impl IsolationLevel {
    pub(crate) fn begin_statement(level: Option<Self>) -> &'static str {
        match level {
            None => "BEGIN",
            Some(IsolationLevel::Deferred) => "BEGIN DEFERRED",
            Some(IsolationLevel::Immediate) => "BEGIN IMMEDIATE",
            Some(IsolationLevel::Exclusive) => "BEGIN EXCLUSIVE",
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "" | "DEFERRED" => Ok(IsolationLevel::Deferred),
            "IMMEDIATE" => Ok(IsolationLevel::Immediate),
            "EXCLUSIVE" => Ok(IsolationLevel::Exclusive),
            _ => Err(Error::InvalidIsolationLevel(s.to_string())),
        }
    }
}

/// Options accepted by [`connect`](crate::connect) and [`connect_as`](crate::connect_as).
///
/// The database locator can be a file path, `":memory:"`, or a URI of the form
/// `file:path?param=value`. Recognised URI parameters are `mode`
/// (`ro`, `rw`, `rwc`, `memory`), `cache` (`shared`, `private`) and `immutable`.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    database: String,
    pragmas: Vec<(String, String)>,
    busy_timeout: Duration,
    isolation_level: Option<IsolationLevel>,
    create_if_missing: bool,
    verify_handle: bool,
}

impl ConnectOptions {
    pub fn new(database: impl Into<String>) -> Self {
        ConnectOptions {
            database: database.into(),
            pragmas: Vec::new(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            isolation_level: Some(IsolationLevel::Deferred),
            create_if_missing: true,
            verify_handle: false,
        }
    }

    /// Apply `PRAGMA name = value` when the connection is opened.
    pub fn pragma(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.pragmas.push((name.into(), value.into()));
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// `None` makes [`Connection::begin`](crate::Connection::begin) issue a plain `BEGIN`.
    pub fn isolation_level(mut self, level: Option<IsolationLevel>) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Run the native handle self-test while the connection is constructed.
    pub fn verify_handle(mut self, verify: bool) -> Self {
        self.verify_handle = verify;
        self
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn get_isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation_level
    }

    pub(crate) fn should_verify_handle(&self) -> bool {
        self.verify_handle
    }

    /// Translate into the binding's connect options.
    pub(crate) fn to_sqlx(&self) -> Result<SqliteConnectOptions> {
        validate_path(&self.database)?;
        let (path, params) = parse_connection_string(&self.database);

        let named_memory = params
            .iter()
            .any(|(key, value)| key == "mode" && value == "memory");

        // A named in-memory database can be shared through `cache=shared`;
        // an anonymous one is always private to its connection.
        let mut options = if path == ":memory:" || (named_memory && path.is_empty()) {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else if named_memory {
            SqliteConnectOptions::new().filename(&path).in_memory(true)
        } else {
            SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(self.create_if_missing)
        };

        for (key, value) in &params {
            options = match (key.as_str(), value.as_str()) {
                ("mode", "ro") => options.read_only(true),
                ("mode", "rw") => options.create_if_missing(false),
                ("mode", "rwc") => options.create_if_missing(true),
                ("mode", "memory") => options,
                ("cache", "shared") => options.shared_cache(true),
                ("cache", "private") => options.shared_cache(false),
                ("immutable", "1" | "true") => options.immutable(true),
                ("immutable", "0" | "false") => options.immutable(false),
                _ => {
                    tracing::warn!(key = %key, value = %value, "ignoring unsupported URI parameter");
                    options
                }
            };
        }

        options = options.busy_timeout(self.busy_timeout);
        for (name, value) in &self.pragmas {
            options = options.pragma(name.clone(), value.clone());
        }
        Ok(options)
    }
}

impl From<&str> for ConnectOptions {
    fn from(database: &str) -> Self {
        ConnectOptions::new(database)
    }
}

impl From<String> for ConnectOptions {
    fn from(database: String) -> Self {
        ConnectOptions::new(database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConnectOptions::new(":memory:");
        assert_eq!(options.database(), ":memory:");
        assert_eq!(
            options.get_isolation_level(),
            Some(IsolationLevel::Deferred)
        );
        assert!(!options.should_verify_handle());
        assert_eq!(options.busy_timeout, DEFAULT_BUSY_TIMEOUT);
    }

    #[test]
    fn test_begin_statement() {
        assert_eq!(IsolationLevel::begin_statement(None), "BEGIN");
        assert_eq!(
            IsolationLevel::begin_statement(Some(IsolationLevel::Immediate)),
            "BEGIN IMMEDIATE"
        );
        assert_eq!(
            IsolationLevel::begin_statement(Some(IsolationLevel::Exclusive)),
            "BEGIN EXCLUSIVE"
        );
    }

    #[test]
    fn test_isolation_level_from_str() {
        assert_eq!(
            "immediate".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Immediate
        );
        assert_eq!(
            "".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Deferred
        );
        let err = "SERIALIZABLE".parse::<IsolationLevel>().unwrap_err();
        assert!(matches!(&err, Error::InvalidIsolationLevel(level) if level == "SERIALIZABLE"));
        assert_eq!(err.to_string(), "unknown isolation level \"SERIALIZABLE\"");
    }

    #[test]
    fn test_invalid_locator_is_rejected() {
        assert!(matches!(
            ConnectOptions::new("").to_sqlx(),
            Err(Error::InvalidDatabase(_))
        ));
    }

    #[test]
    fn test_to_sqlx_accepts_uris() {
        assert!(ConnectOptions::new(":memory:").to_sqlx().is_ok());
        assert!(ConnectOptions::new("file:db.sqlite?mode=ro&cache=shared&foo=bar")
            .pragma("foreign_keys", "ON")
            .to_sqlx()
            .is_ok());
        assert!(ConnectOptions::new("file:?mode=memory").to_sqlx().is_ok());
    }

    #[tokio::test]
    async fn test_named_memory_uri_is_shared_between_connections() {
        let uri = "file:options_shared_memory?mode=memory&cache=shared";
        let mut first = crate::connect(uri).await.unwrap();
        let mut second = crate::connect(uri).await.unwrap();

        first.execute("CREATE TABLE a (id)").await.unwrap();
        assert_eq!(second.execute("INSERT INTO a VALUES (1)").await.unwrap(), 1);

        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM a")
            .fetch_one(first.sqlite_mut())
            .await
            .unwrap();
        assert_eq!(count, 1);

        second.close().await.unwrap();
        first.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_named_memory_uri_without_shared_cache_is_private() {
        let uri = "file:options_private_memory?mode=memory";
        let mut first = crate::connect(uri).await.unwrap();
        let mut second = crate::connect(uri).await.unwrap();

        first.execute("CREATE TABLE a (id)").await.unwrap();
        assert!(second.execute("INSERT INTO a VALUES (1)").await.is_err());

        second.close().await.unwrap();
        first.close().await.unwrap();
    }
}
