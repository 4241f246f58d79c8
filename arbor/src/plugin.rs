//! Plugins: composable units of registration against a scope.
//!
//! Plugins come in two shapes. An *encapsulated* (async) plugin runs against a freshly
//! derived child scope, so hooks and state it registers stay invisible to its siblings. A
//! *synchronous* plugin runs inline against the scope of its caller and everything it
//! registers attaches there.

use std::sync::Arc;

use crate::app::App;
use crate::error::Result;
use crate::hooks::BoxFuture;

/// A unit of registration scheduled by [`App::register`](crate::app::App::register).
///
/// Registration is deferred: the plugin body runs while the application boots, against
/// either a derived child scope (the default) or the caller's scope when
/// [`synchronous`](Plugin::synchronous) is set.
pub trait Plugin: Send + Sync + 'static {
    /// A name used in boot logging.
    fn name(&self) -> &str {
        "<anonymous>"
    }

    /// Synchronous plugins run inline with the parent's scope instead of deriving their
    /// own.
    fn synchronous(&self) -> bool {
        false
    }

    /// A composed plugin exposes its parts here; the registration engine unrolls them in
    /// order instead of invoking [`register`](Plugin::register).
    fn parts(&self) -> Option<&[Arc<dyn Plugin>]> {
        None
    }

    /// Performs the registration against the scope the engine selected.
    fn register<'a>(&'a self, app: &'a mut App) -> BoxFuture<'a, Result<()>>;
}

/// Options accepted by [`App::register_with`](crate::app::App::register_with).
#[derive(Clone, Default)]
pub struct RegisterOptions {
    /// A path prefix applied to the derived scope, composed onto any inherited prefix.
    pub prefix: Option<String>,
}

/// A queued plugin registration.
#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) plugin: Arc<dyn Plugin>,
    pub(crate) opts: RegisterOptions,
}

/// An encapsulated plugin built from a plain function.
///
/// The function receives the application with a freshly derived child scope active, so
/// everything it registers stays invisible to sibling plugins.
pub struct ScopedFn<F> {
    f: F,
}

/// Builds an encapsulated plugin from a plain function.
pub fn scoped<F>(f: F) -> ScopedFn<F>
where
    F: Fn(&mut App) -> Result<()> + Send + Sync + 'static,
{
    ScopedFn { f }
}

impl<F> Plugin for ScopedFn<F>
where
    F: Fn(&mut App) -> Result<()> + Send + Sync + 'static,
{
    fn register<'a>(&'a self, app: &'a mut App) -> BoxFuture<'a, Result<()>> {
        let res = (self.f)(app);
        Box::pin(async move { res })
    }
}

/// An encapsulated plugin whose registration body awaits.
pub struct ScopedAsyncFn<F> {
    f: F,
}

/// Builds an encapsulated plugin from a function returning a boxed registration future.
///
/// For registration bodies that suspend (opening connections, reading configuration).
/// Annotate the argument as `|app: &mut App| …` so the closure is inferred
/// higher-ranked.
pub fn scoped_async<F>(f: F) -> ScopedAsyncFn<F>
where
    F: for<'a> Fn(&'a mut App) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    ScopedAsyncFn { f }
}

impl<F> Plugin for ScopedAsyncFn<F>
where
    F: for<'a> Fn(&'a mut App) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    fn register<'a>(&'a self, app: &'a mut App) -> BoxFuture<'a, Result<()>> {
        (self.f)(app)
    }
}

/// A synchronous plugin built from a function.
pub struct InlineFn<F> {
    f: F,
}

/// Builds a synchronous plugin from a plain function; it runs inline with the caller's
/// scope.
pub fn inline<F>(f: F) -> InlineFn<F>
where
    F: Fn(&mut App) -> Result<()> + Send + Sync + 'static,
{
    InlineFn { f }
}

impl<F> Plugin for InlineFn<F>
where
    F: Fn(&mut App) -> Result<()> + Send + Sync + 'static,
{
    fn synchronous(&self) -> bool {
        true
    }

    fn register<'a>(&'a self, app: &'a mut App) -> BoxFuture<'a, Result<()>> {
        let res = (self.f)(app);
        Box::pin(async move { res })
    }
}

/// A sequence of plugins registered as one unit.
///
/// Built by [`compose`]; the registration engine recognizes it through
/// [`Plugin::parts`] and unrolls the parts in order, each deriving its own sibling child
/// scope unless synchronous.
pub struct Composed {
    parts: Vec<Arc<dyn Plugin>>,
}

/// Starts a composed plugin; chain parts with [`Composed::and`].
pub fn compose() -> Composed {
    Composed { parts: vec![] }
}

impl Composed {
    /// Appends a part.
    pub fn and<P: Plugin>(mut self, plugin: P) -> Self {
        self.parts.push(Arc::new(plugin));
        self
    }
}

impl Plugin for Composed {
    fn name(&self) -> &str {
        "<composed>"
    }

    fn parts(&self) -> Option<&[Arc<dyn Plugin>]> {
        Some(&self.parts)
    }

    fn register<'a>(&'a self, _app: &'a mut App) -> BoxFuture<'a, Result<()>> {
        // Unrolled by the registration engine; never invoked directly.
        Box::pin(async { Ok(()) })
    }
}
