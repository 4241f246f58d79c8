//! Public accessors reading and writing through the current request context.
//!
//! Every function here resolves the ambient [`Context`](crate::context::Context) of the
//! request being serviced; outside a request they fail with an error that renders as an
//! opaque `500`.

pub mod abort;

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode, Uri};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use crate::context::{self, Context};
use crate::error::{Error, Result};
use crate::helpers::http::form_url_decode;
use crate::helpers::http::status::status_from_name;
use crate::response::{IntoPayload, Payload};

/// A view over the current request.
pub struct RequestView {
    ctx: Context,
}

/// The trusted client address recorded in the request locals by a proxy plugin.
pub struct ForwardedIp(pub IpAddr);

impl RequestView {
    /// The request method.
    pub fn method(&self) -> &Method {
        self.ctx.method()
    }

    /// The request URI, parsed once when the request was accepted.
    pub fn uri(&self) -> &Uri {
        self.ctx.uri()
    }

    /// The request correlation id.
    pub fn id(&self) -> &str {
        self.ctx.id()
    }

    /// The first value of a request header, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<String> {
        self.ctx
            .request_headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }

    /// The transport peer address, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.ctx.remote_addr()
    }

    /// The trusted client address.
    ///
    /// Requires a proxy plugin to have recorded a [`ForwardedIp`] in the request locals;
    /// fails with a descriptive error otherwise.
    pub fn ip(&self) -> Result<IpAddr> {
        match self.ctx.with_locals(|l| l.get::<ForwardedIp>()) {
            Some(forwarded) => Ok(forwarded.0),
            None => Err(Error::internal(
                "request.ip() requires a trusted proxy plugin to be registered",
            )),
        }
    }
}

/// The current request.
pub fn request() -> Result<RequestView> {
    Ok(RequestView {
        ctx: context::current()?,
    })
}

/// Reads the raw request body to completion. Consumable once.
pub async fn raw_body() -> Result<Bytes> {
    let ctx = context::current()?;
    let body = ctx
        .take_body()
        .ok_or_else(|| Error::internal("request body already consumed"))?;
    hyper::body::to_bytes(body)
        .await
        .map_err(|e| Error::Internal(e.into()))
}

/// The parsed request body recorded in the request locals by a body-parser plugin.
pub struct ParsedBody(pub Value);

/// Deserializes the parsed request body.
///
/// A body-parser plugin must have run for this request; without one the accessor fails
/// with an error that renders as `500 Unable to process request`.
pub fn body<T: DeserializeOwned>() -> Result<T> {
    let ctx = context::current()?;
    let parsed = ctx
        .with_locals(|l| l.get::<ParsedBody>())
        .ok_or_else(|| Error::internal("no body parser has run for this request"))?;
    serde_json::from_value(parsed.0.clone())
        .map_err(|e| Error::validation(json!({ "message": e.to_string() })))
}

/// Read access to request headers and write access to response headers.
pub struct Headers {
    ctx: Context,
}

impl Headers {
    /// All request headers.
    pub fn all(&self) -> HeaderMap {
        self.ctx.request_headers().clone()
    }

    /// The first value of a request header.
    pub fn get(&self, name: &str) -> Option<String> {
        self.ctx
            .request_headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }

    /// The first value of a request header, parsed.
    pub fn get_as<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                Error::validation(json!({ "message": format!("invalid header `{}`", name) }))
            }),
        }
    }

    /// All values of a request header.
    ///
    /// Multi-valued headers are comma-split, except `set-cookie` whose values may
    /// themselves contain commas.
    pub fn get_all(&self, name: &str) -> Vec<String> {
        let split = !name.eq_ignore_ascii_case("set-cookie");
        self.ctx
            .request_headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| {
                if split {
                    v.split(',').map(|s| s.trim().to_owned()).collect::<Vec<_>>()
                } else {
                    vec![v.to_owned()]
                }
            })
            .collect()
    }

    /// Sets a response header, replacing any existing values.
    pub fn set(&self, name: &str, value: &str) -> Result<()> {
        let (name, value) = valid_header(name, value)?;
        self.ctx.with_response(|r| {
            r.headers.insert(name, value);
        });
        Ok(())
    }

    /// Appends a response header value.
    pub fn append(&self, name: &str, value: &str) -> Result<()> {
        let (name, value) = valid_header(name, value)?;
        self.ctx.with_response(|r| {
            r.headers.append(name, value);
        });
        Ok(())
    }
}

fn valid_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_str(name)
        .map_err(|_| Error::internal(format!("invalid header name `{}`", name)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| Error::internal(format!("invalid value for header `{}`", name)))?;
    Ok((name, value))
}

/// The current request's headers.
pub fn headers() -> Result<Headers> {
    Ok(Headers {
        ctx: context::current()?,
    })
}

/// Access to the captured path parameters.
pub struct PathParams {
    ctx: Context,
}

impl PathParams {
    /// A required parameter; absent parameters fail as `404`.
    pub fn get(&self, name: &str) -> Result<String> {
        self.ctx
            .params()
            .get(name)
            .map(str::to_owned)
            .ok_or_else(Error::not_found)
    }

    /// A required parameter, parsed; absent or unparseable parameters fail as `404`.
    pub fn get_as<T: FromStr>(&self, name: &str) -> Result<T> {
        self.get(name)?.parse().map_err(|_| Error::not_found())
    }

    /// An optional parameter.
    pub fn optional(&self, name: &str) -> Option<String> {
        self.ctx.params().get(name).map(str::to_owned)
    }

    /// An optional parameter, parsed; present but unparseable values fail as `404`.
    pub fn optional_as<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        match self.optional(name) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| Error::not_found()),
        }
    }
}

/// The current request's path parameters.
pub fn params() -> Result<PathParams> {
    Ok(PathParams {
        ctx: context::current()?,
    })
}

/// The decoded query pairs, memoized per request.
struct QueryPairs(Vec<(String, String)>);

/// Access to the decoded query string.
pub struct SearchParams {
    pairs: Arc<QueryPairs>,
}

impl SearchParams {
    /// The first value for a key.
    pub fn get(&self, name: &str) -> Option<String> {
        self.pairs
            .0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    /// The first value for a key, parsed.
    pub fn get_as<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                Error::validation(json!({ "message": format!("invalid query parameter `{}`", name) }))
            }),
        }
    }

    /// All values for a key, in order of appearance.
    pub fn get_all(&self, name: &str) -> Vec<String> {
        self.pairs
            .0
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Deserializes the whole query string; repeated keys become arrays.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let mut map = Map::new();
        for (key, value) in &self.pairs.0 {
            match map.get_mut(key) {
                None => {
                    map.insert(key.clone(), Value::String(value.clone()));
                }
                Some(Value::Array(values)) => values.push(Value::String(value.clone())),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, Value::String(value.clone())]);
                }
            }
        }
        serde_json::from_value(Value::Object(map))
            .map_err(|e| Error::validation(json!({ "message": e.to_string() })))
    }
}

/// The current request's query parameters.
pub fn search_params() -> Result<SearchParams> {
    let ctx = context::current()?;

    if let Some(pairs) = ctx.with_locals(|l| l.get::<QueryPairs>()) {
        return Ok(SearchParams { pairs });
    }

    let mut decoded = Vec::new();
    if let Some(query) = ctx.uri().query() {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match (form_url_decode(key), form_url_decode(value)) {
                (Ok(key), Ok(value)) => decoded.push((key, value)),
                _ => continue,
            }
        }
    }

    ctx.with_locals(|l| l.put(QueryPairs(decoded)));
    let pairs = ctx
        .with_locals(|l| l.get::<QueryPairs>())
        .ok_or(Error::NoContext)?;
    Ok(SearchParams { pairs })
}

/// A status code given numerically or by well-known name.
pub trait IntoStatus {
    /// Resolves to a `StatusCode`.
    fn into_status(self) -> Result<StatusCode>;
}

impl IntoStatus for StatusCode {
    fn into_status(self) -> Result<StatusCode> {
        Ok(self)
    }
}

impl IntoStatus for u16 {
    fn into_status(self) -> Result<StatusCode> {
        StatusCode::from_u16(self)
            .map_err(|_| Error::internal(format!("invalid status code {}", self)))
    }
}

impl IntoStatus for &str {
    fn into_status(self) -> Result<StatusCode> {
        status_from_name(self)
            .ok_or_else(|| Error::internal(format!("unknown status name `{}`", self)))
    }
}

/// Records the response status for the current request.
pub fn set_status(code: impl IntoStatus) -> Result<()> {
    let ctx = context::current()?;
    ctx.set_status(code.into_status()?);
    Ok(())
}

/// A response value with an optional status, built by [`response`].
pub struct ResponseBuilder {
    payload: Result<Payload>,
    status_err: Option<Error>,
}

impl ResponseBuilder {
    /// Records the response status, numerically or by name.
    pub fn status(mut self, code: impl IntoStatus) -> Self {
        if let Err(e) = set_status(code) {
            self.status_err = Some(e);
        }
        self
    }
}

impl IntoPayload for ResponseBuilder {
    fn into_payload(self) -> Result<Payload> {
        if let Some(e) = self.status_err {
            return Err(e);
        }
        self.payload
    }
}

/// Wraps a body into a response value; chain [`ResponseBuilder::status`] to set the
/// status.
pub fn response<T: IntoPayload>(body: T) -> ResponseBuilder {
    ResponseBuilder {
        payload: body.into_payload(),
        status_err: None,
    }
}

/// A temporary (`302`) redirect to `path`, for the caller to propagate.
pub fn redirect(path: impl Into<String>) -> Error {
    Error::redirect(path, false)
}

/// A permanent (`301`) redirect to `path`, for the caller to propagate.
pub fn redirect_permanent(path: impl Into<String>) -> Error {
    Error::redirect(path, true)
}

/// A client error with the given message and a `400` status, for the caller to
/// propagate. See [`abort_with`] for other statuses and [`abort`](mod@crate::http::abort)
/// for the companion helpers.
pub fn abort(message: impl Into<String>) -> Error {
    abort_with(message, StatusCode::BAD_REQUEST)
}

/// A client error with the given message and status.
pub fn abort_with(message: impl Into<String>, status: StatusCode) -> Error {
    Error::http(status, Value::String(message.into()))
}

/// Appends a callback to the current request's defer queue.
///
/// Deferred callbacks run after the response is sealed, in registration order; their
/// errors are logged and never surface.
pub fn defer<F, Fut>(f: F) -> Result<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let ctx = context::current()?;
    ctx.push_defer(Box::new(move || Box::pin(f())));
    Ok(())
}

/// Appends an observer invoked with the error before the error-hook chain runs.
///
/// Observers cannot handle the error; they only see it.
pub fn on_error<F>(f: F) -> Result<()>
where
    F: FnOnce(&Error) + Send + 'static,
{
    let ctx = context::current()?;
    ctx.push_observer(Box::new(f));
    Ok(())
}
