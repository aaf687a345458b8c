//! Python exception types exposed by the extension module.

use pyo3::create_exception;
use pyo3::exceptions::PyException;

// DB-API style hierarchy, flat like the sqlite3 module's leaf classes.
create_exception!(_sqlite_hooks, Error, PyException);
create_exception!(_sqlite_hooks, DatabaseError, Error);
create_exception!(_sqlite_hooks, OperationalError, DatabaseError);
create_exception!(_sqlite_hooks, ProgrammingError, DatabaseError);
create_exception!(_sqlite_hooks, IntegrityError, DatabaseError);

// Raised in place of a hook that panicked rather than raising.
create_exception!(_sqlite_hooks, HookPanicError, Error);
