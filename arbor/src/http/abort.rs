//! Companions to [`abort`](fn@crate::http::abort): predicates and guards over abort-like
//! errors.
//!
//! An error is *abort-like* when it is one of the typed HTTP errors (redirects included)
//! or a cancellation; those are safe to surface to the client as-is.

use log::debug;

use crate::error::{Error, Result};
use crate::http::abort_with;
use hyper::StatusCode;

/// A `404 Not Found` abort with the default payload.
pub fn not_found() -> Error {
    Error::not_found()
}

/// True when the error is abort-like: a typed HTTP error or a cancellation.
pub fn is(err: &Error) -> bool {
    err.is_http() || err.is_aborted()
}

/// Fails with a `400` abort carrying `message` unless `condition` holds.
pub fn assert(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(abort_with(message, StatusCode::BAD_REQUEST))
    }
}

/// Fails with a `400` abort carrying `message` when `condition` holds.
pub fn assert_not(condition: bool, message: &str) -> Result<()> {
    assert(!condition, message)
}

/// Re-throws abort-like errors and swallows everything else.
///
/// Useful in recovery code that wants client-facing errors to keep propagating while
/// internal failures are logged and absorbed.
pub fn rethrow(err: Error) -> Result<()> {
    if is(&err) {
        Err(err)
    } else {
        debug!("swallowing non-abort error: {}", err);
        Ok(())
    }
}
