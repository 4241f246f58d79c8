//! The handler seam between routes and user code.
//!
//! A function returning a future of `Result<impl IntoPayload, Error>` can be used directly
//! as a handler; the trait can also be implemented by hand for greater control.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::response::{IntoPayload, Payload};

/// A type alias for the futures returned by a [`Handler`].
pub type HandlerFuture = dyn Future<Output = Result<Payload>> + Send;

/// Receives requests routed to a single path and produces the provisional response body.
///
/// A `Handler` is invoked with the request's [`Context`]; the same context is also
/// installed as the ambient current context, so the accessors in [`crate::http`] work
/// without threading it through.
pub trait Handler: Send + Sync + 'static {
    /// Handles the request, returning a future that resolves to the response payload.
    fn call(&self, ctx: Context) -> Pin<Box<HandlerFuture>>;
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
    R: IntoPayload,
{
    fn call(&self, ctx: Context) -> Pin<Box<HandlerFuture>> {
        let fut = (self)(ctx);
        Box::pin(async move { fut.await?.into_payload() })
    }
}

impl Handler for Arc<dyn Handler> {
    fn call(&self, ctx: Context) -> Pin<Box<HandlerFuture>> {
        (**self).call(ctx)
    }
}
