//! The typed errors produced and consumed by the request pipeline.
//!
//! Handlers and hooks surface failures by returning an [`Error`]; the pipeline routes it
//! through the error-hook chain and, if unhandled, renders it with the default renderer.
//! Anything that is not one of the typed HTTP variants is treated as opaque and renders as a
//! `500` without leaking the underlying cause to the client.

use hyper::header::HeaderMap;
use hyper::StatusCode;
use serde_json::{json, Value};
use thiserror::Error as ThisError;

/// The message rendered for errors that must not leak to the client.
pub(crate) const OPAQUE_MESSAGE: &str = "Unable to process request";

/// An error raised while servicing a request or booting the plugin tree.
#[derive(Debug, ThisError)]
pub enum Error {
    /// An HTTP error with a declared status, a payload and optional extra response headers.
    ///
    /// The payload is emitted through the regular serializer: object payloads verbatim as
    /// JSON, string payloads as plain text.
    #[error("http error {status}: {payload}")]
    Http {
        /// Status in the `400..=599` range.
        status: StatusCode,
        /// Response payload; objects render verbatim, strings as plain text.
        payload: Value,
        /// Extra headers merged into the response.
        headers: Option<HeaderMap>,
    },

    /// A redirect, rendered as `301` (permanent) or `302` with a `Location` header.
    #[error("redirect to {location}")]
    Redirect {
        /// Redirect target, set as the `Location` header.
        location: String,
        /// `301` when set, `302` otherwise.
        permanent: bool,
        /// Extra headers merged into the response.
        headers: Option<HeaderMap>,
    },

    /// The request was cancelled by the client or aborted explicitly.
    ///
    /// Terminal: the default renderer produces no response body for it.
    #[error("request cancelled")]
    Cancelled,

    /// An ambient-context accessor was used outside a request.
    #[error("no request context is active")]
    NoContext,

    /// Any other failure. Logged server-side, rendered as an opaque `500`.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Creates an HTTP error with the given status and payload.
    ///
    /// Statuses outside `400..=599` are coerced to `500`; a typed HTTP error is always an
    /// error status.
    pub fn http(status: StatusCode, payload: Value) -> Self {
        let status = if status.is_client_error() || status.is_server_error() {
            status
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Error::Http {
            status,
            payload,
            headers: None,
        }
    }

    /// An HTTP error carrying extra response headers.
    pub fn http_with_headers(status: StatusCode, payload: Value, headers: HeaderMap) -> Self {
        match Error::http(status, payload) {
            Error::Http {
                status, payload, ..
            } => Error::Http {
                status,
                payload,
                headers: Some(headers),
            },
            other => other,
        }
    }

    /// A `422 Unprocessable Entity` validation error.
    pub fn validation(payload: Value) -> Self {
        Error::http(StatusCode::UNPROCESSABLE_ENTITY, payload)
    }

    /// A `404 Not Found` with the default payload.
    pub fn not_found() -> Self {
        Error::http(StatusCode::NOT_FOUND, Value::String("Page not found".into()))
    }

    /// A `404 Not Found` with a custom payload.
    pub fn not_found_with(payload: Value) -> Self {
        Error::http(StatusCode::NOT_FOUND, payload)
    }

    /// A `403 Forbidden` with the default payload.
    pub fn forbidden() -> Self {
        Error::http(StatusCode::FORBIDDEN, Value::String("Forbidden".into()))
    }

    /// A redirect to `location`, permanent (`301`) or temporary (`302`).
    pub fn redirect(location: impl Into<String>, permanent: bool) -> Self {
        Error::Redirect {
            location: location.into(),
            permanent,
            headers: None,
        }
    }

    /// An opaque internal error from any displayable cause.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        Error::Internal(anyhow::anyhow!("{}", cause))
    }

    /// True for the typed HTTP errors, including redirects.
    pub fn is_http(&self) -> bool {
        matches!(self, Error::Http { .. } | Error::Redirect { .. })
    }

    /// True when the error represents a cancelled request.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// The status the default renderer will use for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Http { status, .. } => *status,
            Error::Redirect { permanent, .. } => {
                if *permanent {
                    StatusCode::MOVED_PERMANENTLY
                } else {
                    StatusCode::FOUND
                }
            }
            Error::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Error::NoContext | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The payload the default renderer emits for opaque errors.
    pub(crate) fn opaque_payload() -> Value {
        json!({ "message": OPAQUE_MESSAGE })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_statuses_outside_the_error_range_are_coerced() {
        let err = Error::http(StatusCode::OK, json!("nope"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn default_constructors_carry_their_statuses() {
        assert_eq!(Error::not_found().status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::forbidden().status(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::validation(json!({"field": "name"})).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn redirects_are_http_but_never_500() {
        let permanent = Error::redirect("/new", true);
        let temporary = Error::redirect("/new", false);
        assert!(permanent.is_http());
        assert_eq!(permanent.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(temporary.status(), StatusCode::FOUND);
    }

    #[test]
    fn opaque_errors_are_not_http() {
        let err = Error::internal("database exploded");
        assert!(!err.is_http());
        assert!(!err.is_aborted());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn cancellation_is_aborted() {
        assert!(Error::Cancelled.is_aborted());
        assert!(!Error::Cancelled.is_http());
    }
}
