//! Miscellaneous internal helpers (locator parsing, C string decoding).

use std::ffi::{c_char, CStr};

use crate::errors::{Error, Result};

/// Validate a database locator for correctness.
pub(crate) fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::InvalidDatabase(
            "database path cannot be empty".to_string(),
        ));
    }
    if path.contains('\0') {
        return Err(Error::InvalidDatabase(
            "database path cannot contain null bytes".to_string(),
        ));
    }
    Ok(())
}

/// Parse SQLite connection string (URI format: file:path?param=value&param2=value2).
/// Returns (database_path, vec of (param_name, param_value)).
pub(crate) fn parse_connection_string(uri: &str) -> (String, Vec<(String, String)>) {
    if uri == ":memory:" {
        return (":memory:".to_string(), Vec::new());
    }

    let Some(uri_part) = uri.strip_prefix("file:") else {
        return (uri.to_string(), Vec::new());
    };

    let (path_part, query_part) = match uri_part.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (uri_part, None),
    };

    let params = query_part
        .map(|query| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let path = if path_part.starts_with("///") {
        // file:///abs/path
        path_part[2..].to_string()
    } else {
        path_part.to_string()
    };

    (path, params)
}

/// Decode a NUL-terminated engine string as UTF-8.
///
/// # Safety
///
/// `ptr` must be non-null and point to a NUL-terminated string that stays
/// valid for `'a`.
pub(crate) unsafe fn cstr_to_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // Safety: non-null and NUL-terminated per the caller's contract.
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_validate_path() {
        assert!(validate_path(":memory:").is_ok());
        assert!(validate_path("db.sqlite").is_ok());
        assert!(matches!(validate_path(""), Err(Error::InvalidDatabase(_))));
        assert!(matches!(
            validate_path("db\0.sqlite"),
            Err(Error::InvalidDatabase(_))
        ));
    }

    #[test]
    fn test_parse_connection_string_memory() {
        let (path, params) = parse_connection_string(":memory:");
        assert_eq!(path, ":memory:");
        assert!(params.is_empty());
    }

    #[test]
    fn test_parse_connection_string_non_uri_path() {
        let (path, params) = parse_connection_string("db.sqlite");
        assert_eq!(path, "db.sqlite");
        assert!(params.is_empty());
    }

    #[test]
    fn test_parse_connection_string_uri_relative() {
        let (path, params) = parse_connection_string("file:db.sqlite?mode=ro&cache=shared");
        assert_eq!(path, "db.sqlite");
        assert_eq!(
            params,
            vec![
                ("mode".to_string(), "ro".to_string()),
                ("cache".to_string(), "shared".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_connection_string_uri_absolute_like() {
        let (path, params) = parse_connection_string("file:///tmp/test.db?mode=ro");
        assert_eq!(path, "/tmp/test.db");
        assert_eq!(params, vec![("mode".to_string(), "ro".to_string())]);
    }

    #[test]
    fn test_cstr_to_str() {
        let name = CString::new("main").unwrap();
        assert_eq!(unsafe { cstr_to_str(name.as_ptr()) }, Some("main"));
        assert_eq!(unsafe { cstr_to_str(std::ptr::null()) }, None);

        let invalid = CString::new(vec![0xff_u8, 0xfe]).unwrap();
        assert_eq!(unsafe { cstr_to_str(invalid.as_ptr()) }, None);
    }
}
