//! Error types: connection-level failures and captured hook failures.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;

/// Boxed error returned by user hooks.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by connection construction and hook registration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("invalid database locator: {0}")]
    InvalidDatabase(String),

    #[error("unknown isolation level {0:?}")]
    InvalidIsolationLevel(String),

    /// The engine reported an update operation outside DELETE/INSERT/UPDATE.
    #[error("unknown update operation code {0}")]
    UnknownOperation(i32),

    #[error("native handle verification failed: {0}")]
    HandleVerification(String),

    /// The handle locked for registration is not the one located at construction.
    #[error("native handle changed since the connection was opened")]
    HandleMismatch,

    #[error("hook dispatcher is no longer running")]
    DispatcherClosed,
}

/// The hook a captured failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Update,
    Commit,
    Rollback,
}

impl HookKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HookKind::Update => "update",
            HookKind::Commit => "commit",
            HookKind::Rollback => "rollback",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure raised inside a user hook, held in the connection's failure slot.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("{kind} hook failed: {source}")]
    Failed {
        kind: HookKind,
        #[source]
        source: BoxError,
    },

    #[error("{kind} hook panicked: {message}")]
    Panicked { kind: HookKind, message: String },
}

impl HookError {
    pub(crate) fn from_panic(kind: HookKind, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        HookError::Panicked { kind, message }
    }

    pub fn kind(&self) -> HookKind {
        match self {
            HookError::Failed { kind, .. } | HookError::Panicked { kind, .. } => *kind,
        }
    }

    /// The error value the hook returned, if it returned one rather than panicking.
    pub fn hook_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            HookError::Failed { source, .. } => Some(source.as_ref()),
            HookError::Panicked { .. } => None,
        }
    }

    /// Downcast the error the hook returned to its concrete type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.hook_error().and_then(|e| e.downcast_ref::<E>())
    }
}

/// Map a crate error to the matching Python exception.
#[cfg(feature = "python")]
pub(crate) fn to_py_err(e: Error, path: &str) -> pyo3::PyErr {
    use crate::exceptions::{DatabaseError, IntegrityError, OperationalError, ProgrammingError};
    use sqlx::Error as SqlxError;

    let error_msg = format!("Operation failed on database {path}: {e}");

    match e {
        Error::Sqlx(SqlxError::Database(db_err)) => {
            let msg = db_err.message();
            if msg.contains("SQLITE_CONSTRAINT")
                || msg.contains("UNIQUE constraint")
                || msg.contains("NOT NULL constraint")
                || msg.contains("FOREIGN KEY constraint")
            {
                IntegrityError::new_err(error_msg)
            } else if msg.contains("SQLITE_BUSY") || msg.contains("database is locked") {
                OperationalError::new_err(error_msg)
            } else {
                DatabaseError::new_err(error_msg)
            }
        }
        Error::Sqlx(SqlxError::Protocol(_) | SqlxError::Io(_)) => OperationalError::new_err(error_msg),
        Error::Sqlx(
            SqlxError::ColumnNotFound(_)
            | SqlxError::ColumnIndexOutOfBounds { .. }
            | SqlxError::Decode(_),
        ) => ProgrammingError::new_err(error_msg),
        Error::Sqlx(_) => DatabaseError::new_err(error_msg),
        Error::InvalidDatabase(_) | Error::InvalidIsolationLevel(_) => {
            ProgrammingError::new_err(error_msg)
        }
        Error::UnknownOperation(_)
        | Error::HandleVerification(_)
        | Error::HandleMismatch
        | Error::DispatcherClosed => OperationalError::new_err(error_msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("hook goes boom ({0})")]
    struct Boom(u32);

    #[test]
    fn test_failed_hook_error_downcasts_to_original() {
        let err = HookError::Failed {
            kind: HookKind::Update,
            source: Box::new(Boom(7)),
        };
        assert_eq!(err.kind(), HookKind::Update);
        assert_eq!(err.downcast_ref::<Boom>().map(|b| b.0), Some(7));
        assert_eq!(err.to_string(), "update hook failed: hook goes boom (7)");
    }

    #[test]
    fn test_panic_payloads_become_messages() {
        let err = HookError::from_panic(HookKind::Commit, Box::new("static message"));
        assert_eq!(err.to_string(), "commit hook panicked: static message");

        let err = HookError::from_panic(HookKind::Rollback, Box::new(String::from("owned")));
        assert!(matches!(err, HookError::Panicked { ref message, .. } if message == "owned"));
        assert!(err.hook_error().is_none());

        let err = HookError::from_panic(HookKind::Update, Box::new(42_u8));
        assert!(err.to_string().ends_with("non-string panic payload"));
    }
}
