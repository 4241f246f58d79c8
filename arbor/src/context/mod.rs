//! The per-request ambient context.
//!
//! Every request is serviced inside a task-local scope holding its [`Context`]; any code
//! running within the request pipeline — hooks, the handler, code they await — observes the
//! same context through [`current`] without explicit parameter passing. Concurrent requests
//! run as separate tasks and never observe each other's slot.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use hyper::header::HeaderMap;
use hyper::{Body, Method, Request, StatusCode, Uri};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hooks::BoxFuture;
use crate::router::{Params, RouteRecord};
use crate::scope::bag::Bag;
use crate::scope::ScopeId;

tokio::task_local! {
    static CURRENT: Context;
}

/// Yields the context of the request currently being serviced.
///
/// Fails with [`Error::NoContext`] outside a request, which the default renderer turns
/// into an opaque `500`.
pub fn current() -> Result<Context> {
    CURRENT.try_with(Context::clone).map_err(|_| Error::NoContext)
}

/// Like [`current`], but yields `None` instead of failing outside a request.
pub fn maybe() -> Option<Context> {
    CURRENT.try_with(Context::clone).ok()
}

/// Runs `fut` with `ctx` installed as the current context.
///
/// The prior context is restored on every exit path, including cancellation of `fut`.
pub async fn enter<F>(ctx: Context, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(ctx, fut).await
}

/// The header consulted before generating a fresh request id.
const X_REQUEST_ID: &str = "x-request-id";

pub(crate) type DeferFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

pub(crate) type ErrorObserver = Box<dyn FnOnce(&Error) + Send>;

/// Response status and headers accumulated while the request is serviced.
pub struct ResponseState {
    /// The status the response will carry; starts at `200`.
    pub status: StatusCode,
    /// Headers to emit with the response.
    pub headers: HeaderMap,
}

impl ResponseState {
    fn new() -> ResponseState {
        ResponseState {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }
}

/// The matched route and everything resolved alongside it.
pub(crate) struct RouteBinding {
    pub(crate) route: Arc<RouteRecord>,
    pub(crate) params: Params,
    pub(crate) scope: ScopeId,
}

struct ContextInner {
    id: String,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    remote_addr: Option<SocketAddr>,
    body: Mutex<Option<Body>>,
    response: Mutex<ResponseState>,
    locals: Mutex<Bag>,
    binding: OnceLock<RouteBinding>,
    scope_state: Mutex<Bag>,
    defers: Mutex<Vec<DeferFn>>,
    observers: Mutex<Vec<ErrorObserver>>,
    cancel: CancellationToken,
    failed: AtomicBool,
}

/// A cheap-clone handle over one request's state.
///
/// The request record and route binding are immutable; response state, locals, the defer
/// queue and the error observers sit behind mutexes that are never held across a
/// suspension point.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub(crate) fn from_request(
        req: Request<Body>,
        remote_addr: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> Context {
        let (parts, body) = req.into_parts();

        // Reuse an externally supplied correlation id when the proxy in front provides one.
        let id = parts
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().as_hyphenated().to_string());

        Context {
            inner: Arc::new(ContextInner {
                id,
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                remote_addr,
                body: Mutex::new(Some(body)),
                response: Mutex::new(ResponseState::new()),
                locals: Mutex::new(Bag::new()),
                binding: OnceLock::new(),
                scope_state: Mutex::new(Bag::new()),
                defers: Mutex::new(Vec::new()),
                observers: Mutex::new(Vec::new()),
                cancel,
                failed: AtomicBool::new(false),
            }),
        }
    }

    /// The correlation id for this request.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    /// The parsed request URI.
    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    /// The request headers.
    pub fn request_headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    /// The peer address, when the transport knows it.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Takes the raw body stream out of the context. Yields `None` once consumed.
    pub fn take_body(&self) -> Option<Body> {
        self.inner.body.lock().expect("body lock poisoned").take()
    }

    /// Runs `f` with mutable access to the response state.
    pub fn with_response<R>(&self, f: impl FnOnce(&mut ResponseState) -> R) -> R {
        let mut state = self.inner.response.lock().expect("response lock poisoned");
        f(&mut state)
    }

    /// The status currently recorded on the response state.
    pub fn status(&self) -> StatusCode {
        self.with_response(|r| r.status)
    }

    /// Records a response status.
    pub fn set_status(&self, status: StatusCode) {
        self.with_response(|r| r.status = status);
    }

    /// Runs `f` with mutable access to the request-local storage.
    pub fn with_locals<R>(&self, f: impl FnOnce(&mut Bag) -> R) -> R {
        let mut locals = self.inner.locals.lock().expect("locals lock poisoned");
        f(&mut locals)
    }

    pub(crate) fn bind_route(&self, route: Arc<RouteRecord>, params: Params, scope: ScopeId) {
        let _ = self.inner.binding.set(RouteBinding {
            route,
            params,
            scope,
        });
    }

    pub(crate) fn binding(&self) -> Option<&RouteBinding> {
        self.inner.binding.get()
    }

    /// The matched route, once routing has occurred.
    pub fn route(&self) -> Option<Arc<RouteRecord>> {
        self.binding().map(|b| b.route.clone())
    }

    /// The captured path parameters; empty before routing.
    pub fn params(&self) -> Params {
        self.binding()
            .map(|b| b.params.clone())
            .unwrap_or_default()
    }

    /// The scope owning the matched route, or the root scope before routing.
    pub(crate) fn scope_id(&self) -> ScopeId {
        self.binding().map(|b| b.scope).unwrap_or(ScopeId::ROOT)
    }

    /// The user-state bag of the scope currently servicing the request.
    ///
    /// Values are `Arc`-shared with the scope, so the clone is cheap.
    pub fn scope_state(&self) -> Bag {
        self.inner
            .scope_state
            .lock()
            .expect("scope state lock poisoned")
            .clone()
    }

    pub(crate) fn set_scope_state(&self, bag: Bag) {
        *self
            .inner
            .scope_state
            .lock()
            .expect("scope state lock poisoned") = bag;
    }

    /// A token that trips when the client disconnects or the request is aborted.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Trips the cancellation signal.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// True once the cancellation signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn push_defer(&self, f: DeferFn) {
        self.inner.defers.lock().expect("defer lock poisoned").push(f);
    }

    pub(crate) fn take_defers(&self) -> Vec<DeferFn> {
        std::mem::take(&mut *self.inner.defers.lock().expect("defer lock poisoned"))
    }

    pub(crate) fn push_observer(&self, f: ErrorObserver) {
        self.inner
            .observers
            .lock()
            .expect("observer lock poisoned")
            .push(f);
    }

    pub(crate) fn take_observers(&self) -> Vec<ErrorObserver> {
        std::mem::take(&mut *self.inner.observers.lock().expect("observer lock poisoned"))
    }

    pub(crate) fn mark_failed(&self) {
        self.inner.failed.store(true, Ordering::Relaxed);
    }

    /// True once the request has gone through default error rendering; `sent` hooks use
    /// this to distinguish their terminal (error) invocation.
    pub fn failed(&self) -> bool {
        self.inner.failed.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn test_fixture() -> Context {
        let req = Request::builder()
            .method(Method::GET)
            .uri("http://localhost/test")
            .body(Body::empty())
            .expect("test request");
        Context::from_request(req, None, CancellationToken::new())
    }
}
