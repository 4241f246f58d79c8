//! Ordered lifecycle callback lists, one per hook kind.
//!
//! Every scope owns a [`HookStore`]; deriving a scope clones the store so that appending to
//! the derived copy never mutates the source. The request pipeline reads these lists in the
//! documented orders: `request` parent→child in append order, everything else child→parent
//! in reverse append order.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::response::Payload;

/// Boxed future alias used by hook and handler seams.
pub type BoxFuture<'a, T> = futures_util::future::BoxFuture<'a, T>;

/// Outcome of a `request` hook.
pub enum Flow {
    /// Keep going through the remaining hooks and the handler.
    Continue,
    /// Respond with this payload, skipping the handler and the transform hooks.
    Respond(Payload),
}

/// Outcome of an `error` hook.
///
/// Ownership of the in-flight error threads through the chain: a hook that does not handle
/// it hands it back with [`ErrorFlow::Pass`], or substitutes its own with
/// [`ErrorFlow::Replace`].
pub enum ErrorFlow {
    /// The hook produced a response body; the pipeline resumes at the transform hooks and
    /// the status resets to `200`.
    Handled(Payload),
    /// Not handled; the next hook receives the same error.
    Pass(Error),
    /// The error is replaced; the next hook receives the new one.
    Replace(Error),
}

pub(crate) type RequestHook =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<Flow>> + Send + Sync>;

pub(crate) type TransformHook =
    Arc<dyn Fn(Payload, Context) -> BoxFuture<'static, Result<Payload>> + Send + Sync>;

pub(crate) type SendHook = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub(crate) type ErrorHook =
    Arc<dyn Fn(Error, Context) -> BoxFuture<'static, ErrorFlow> + Send + Sync>;

pub(crate) type LifecycleHook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub(crate) type ListenHook = Arc<dyn Fn(SocketAddr) -> BoxFuture<'static, ()> + Send + Sync>;

/// The per-scope ordered hook lists.
///
/// Cloning copies each list; the callbacks themselves are shared.
#[derive(Clone, Default)]
pub(crate) struct HookStore {
    pub(crate) ready: Vec<LifecycleHook>,
    pub(crate) close: Vec<LifecycleHook>,
    pub(crate) request: Vec<RequestHook>,
    pub(crate) transform: Vec<TransformHook>,
    pub(crate) send: Vec<SendHook>,
    pub(crate) sent: Vec<SendHook>,
    pub(crate) error: Vec<ErrorHook>,
    pub(crate) listen: Vec<ListenHook>,
}

impl HookStore {
    pub(crate) fn new() -> Self {
        HookStore::default()
    }
}
