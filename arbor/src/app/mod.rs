//! The application builder and registration engine.
//!
//! An [`App`] collects routes, hooks and plugins against a tree of scopes, boots the
//! plugin tree on [`App::ready`], and then services requests through [`App::handle`] or a
//! bound transport via [`App::listen`].

pub mod meta;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use log::{debug, error, info};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::meta::{Meta, RouteConfig};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::hooks::{
    BoxFuture, ErrorFlow, ErrorHook, Flow, LifecycleHook, ListenHook, RequestHook, SendHook,
    TransformHook,
};
use crate::pipeline;
use crate::plugin::{Plugin, RegisterOptions, Registration};
use crate::response::{Decorator, Payload, Serializer};
use crate::router::{MethodSpec, RouteRecord, Router, RouterOptions};
use crate::scope::bag::Bag;
use crate::scope::{Next, RootMiddleware, Scope, ScopeId};
use crate::service;

/// Options accepted by [`App::with_options`].
#[derive(Clone, Default)]
pub struct AppOptions {
    /// Emit one access-log line per request.
    pub logger: bool,
    /// A path prefix applied to every route registered on the root scope.
    pub prefix: Option<String>,
    /// Path matching configuration.
    pub router: RouterOptions,
}

/// Options accepted by [`App::listen`].
#[derive(Clone, Debug, Default)]
pub struct ListenOptions {
    /// The port to bind; `0` picks a free port.
    pub port: u16,
    /// The interface to bind; defaults to `127.0.0.1`.
    pub host: Option<String>,
}

/// The bound transport address returned by [`App::listen`].
#[derive(Clone, Debug)]
pub struct Bound {
    /// The bound socket address.
    pub address: SocketAddr,
    /// The bound port.
    pub port: u16,
    /// The hostname the listener was bound with.
    pub hostname: String,
}

/// The frozen application state shared by all in-flight requests after boot.
pub(crate) struct Core {
    pub(crate) scopes: Vec<Scope>,
    pub(crate) router: Router,
    pub(crate) options: AppOptions,
}

impl Core {
    /// The root→owner scope chain for the given scope.
    pub(crate) fn chain(&self, scope: ScopeId) -> &[ScopeId] {
        &self.scopes[scope.0].chain
    }

    pub(crate) fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }
}

struct Transport {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// A minimalist HTTP application.
///
/// # Examples
///
/// ```no_run
/// use arbor::{App, ListenOptions};
/// use serde_json::json;
///
/// # async fn run() -> Result<(), arbor::Error> {
/// let mut app = App::new();
/// app.get("/health", |_ctx| async { Ok(json!({"ok": true})) });
/// app.listen(ListenOptions { port: 3000, host: None }).await?;
/// # Ok(())
/// # }
/// ```
pub struct App {
    scopes: Vec<Scope>,
    router: Router,
    current: ScopeId,
    options: AppOptions,
    core: Option<Arc<Core>>,
    transport: Option<Transport>,
}

impl Default for App {
    fn default() -> Self {
        App::new()
    }
}

impl App {
    /// Creates an application with default options.
    pub fn new() -> App {
        App::with_options(AppOptions::default())
    }

    /// Creates an application with the given options.
    pub fn with_options(options: AppOptions) -> App {
        let mut root = Scope::root();
        if let Some(prefix) = &options.prefix {
            root.prefix.path = prefix.clone();
        }

        App {
            scopes: vec![root],
            router: Router::new(options.router.clone()),
            current: ScopeId::ROOT,
            options,
            core: None,
            transport: None,
        }
    }

    fn assert_registering(&self) {
        if self.core.is_some() {
            panic!("registration is not allowed after ready()");
        }
    }

    fn current_scope_mut(&mut self) -> &mut Scope {
        &mut self.scopes[self.current.0]
    }

    /// Registers a route with explicit methods and meta descriptors.
    ///
    /// The scope-level descriptors of the current scope apply first, then `meta`, so
    /// route-level values win on key collision.
    pub fn route<H>(
        &mut self,
        methods: MethodSpec,
        path: &str,
        meta: Vec<Meta>,
        handler: H,
    ) -> &mut Self
    where
        H: Handler,
    {
        self.assert_registering();

        let scope = &self.scopes[self.current.0];
        let mut config = RouteConfig {
            methods,
            path: scope.prefix.apply(path),
            metadata: Default::default(),
        };
        meta::apply_all(&scope.meta, &meta, &mut config);

        debug!(" route {} registered in scope {:?}", config.path, self.current);

        let record = Arc::new(RouteRecord {
            methods: config.methods,
            path: config.path,
            handler: Arc::new(handler),
            scope: self.current,
            metadata: config.metadata,
        });
        self.router.add(record);
        self
    }

    /// Registers a `GET` handler.
    pub fn get<H: Handler>(&mut self, path: &str, handler: H) -> &mut Self {
        self.route(MethodSpec::Methods(vec![Method::GET]), path, vec![], handler)
    }

    /// Registers a `POST` handler.
    pub fn post<H: Handler>(&mut self, path: &str, handler: H) -> &mut Self {
        self.route(MethodSpec::Methods(vec![Method::POST]), path, vec![], handler)
    }

    /// Registers a `PUT` handler.
    pub fn put<H: Handler>(&mut self, path: &str, handler: H) -> &mut Self {
        self.route(MethodSpec::Methods(vec![Method::PUT]), path, vec![], handler)
    }

    /// Registers a `DELETE` handler.
    pub fn delete<H: Handler>(&mut self, path: &str, handler: H) -> &mut Self {
        self.route(
            MethodSpec::Methods(vec![Method::DELETE]),
            path,
            vec![],
            handler,
        )
    }

    /// Registers a `PATCH` handler.
    pub fn patch<H: Handler>(&mut self, path: &str, handler: H) -> &mut Self {
        self.route(
            MethodSpec::Methods(vec![Method::PATCH]),
            path,
            vec![],
            handler,
        )
    }

    /// Registers a `HEAD` handler.
    pub fn head<H: Handler>(&mut self, path: &str, handler: H) -> &mut Self {
        self.route(MethodSpec::Methods(vec![Method::HEAD]), path, vec![], handler)
    }

    /// Registers an `OPTIONS` handler.
    pub fn options<H: Handler>(&mut self, path: &str, handler: H) -> &mut Self {
        self.route(
            MethodSpec::Methods(vec![Method::OPTIONS]),
            path,
            vec![],
            handler,
        )
    }

    /// Registers a handler servicing any method; explicit methods on the same path win.
    pub fn all<H: Handler>(&mut self, path: &str, handler: H) -> &mut Self {
        self.route(MethodSpec::Any, path, vec![], handler)
    }

    /// Sets a path prefix for routes registered in the current scope afterwards,
    /// composing onto any prefix inherited from ancestors.
    ///
    /// Paths matching an exclusion — exactly, or by leading path segments — skip the
    /// prefix entirely.
    pub fn prefix(&mut self, path: &str, exclude: &[&str]) -> &mut Self {
        self.assert_registering();
        let rule = &mut self.current_scope_mut().prefix;
        let composed = format!("{}{}", rule.path.trim_end_matches('/'), path);
        rule.path = composed;
        rule.exclude.extend(exclude.iter().map(|e| (*e).to_owned()));
        self
    }

    /// Attaches a scope-level meta descriptor, applied to every route registered in the
    /// current scope afterwards.
    pub fn scope_meta(&mut self, meta: Meta) -> &mut Self {
        self.assert_registering();
        self.current_scope_mut().meta.push(meta);
        self
    }

    /// Mutable access to the current scope's user-state bag.
    pub fn state_mut(&mut self) -> &mut Bag {
        self.assert_registering();
        &mut self.current_scope_mut().bag
    }

    /// Queues a plugin for registration against the current scope.
    pub fn register<P: Plugin>(&mut self, plugin: P) -> &mut Self {
        self.register_with(plugin, RegisterOptions::default())
    }

    /// Queues a plugin for registration with options.
    pub fn register_with<P: Plugin>(&mut self, plugin: P, opts: RegisterOptions) -> &mut Self {
        self.assert_registering();
        self.current_scope_mut().pending.push_back(Registration {
            plugin: Arc::new(plugin),
            opts,
        });
        self
    }

    /// Appends a `ready` hook to the current scope.
    pub fn on_ready<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.assert_registering();
        let wrapped: LifecycleHook = Arc::new(move || Box::pin(hook()));
        self.current_scope_mut().hooks.ready.push(wrapped);
        self
    }

    /// Appends a `close` hook to the current scope.
    pub fn on_close<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.assert_registering();
        let wrapped: LifecycleHook = Arc::new(move || Box::pin(hook()));
        self.current_scope_mut().hooks.close.push(wrapped);
        self
    }

    /// Appends a `request` hook to the current scope.
    ///
    /// Request hooks run parent→child before the handler; returning
    /// [`Flow::Respond`] short-circuits the handler and the transform hooks.
    pub fn on_request<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Flow>> + Send + 'static,
    {
        self.assert_registering();
        let wrapped: RequestHook = Arc::new(move |ctx| Box::pin(hook(ctx)));
        self.current_scope_mut().hooks.request.push(wrapped);
        self
    }

    /// Appends a `transform` hook to the current scope.
    ///
    /// Transform hooks run child→parent after the handler; each receives the body and
    /// returns the (possibly replaced) body.
    pub fn on_transform<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(Payload, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.assert_registering();
        let wrapped: TransformHook = Arc::new(move |payload, ctx| Box::pin(hook(payload, ctx)));
        self.current_scope_mut().hooks.transform.push(wrapped);
        self
    }

    /// Appends a `send` hook to the current scope; runs child→parent after serialization
    /// and may mutate response status and headers, never the body bytes.
    pub fn on_send<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.assert_registering();
        let wrapped: SendHook = Arc::new(move |ctx| Box::pin(hook(ctx)));
        self.current_scope_mut().hooks.send.push(wrapped);
        self
    }

    /// Appends a `sent` hook to the current scope; observes completion, errors are logged
    /// and never surfaced.
    pub fn on_sent<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.assert_registering();
        let wrapped: SendHook = Arc::new(move |ctx| Box::pin(hook(ctx)));
        self.current_scope_mut().hooks.sent.push(wrapped);
        self
    }

    /// Appends an `error` hook to the current scope.
    ///
    /// Error hooks are consulted child→parent, most recently appended first.
    pub fn on_error<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(Error, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ErrorFlow> + Send + 'static,
    {
        self.assert_registering();
        let wrapped: ErrorHook = Arc::new(move |err, ctx| Box::pin(hook(err, ctx)));
        self.current_scope_mut().hooks.error.push(wrapped);
        self
    }

    /// Appends a `listen` hook, invoked with the bound address once the transport is up.
    pub fn on_listen<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.assert_registering();
        let wrapped: ListenHook = Arc::new(move |addr| Box::pin(hook(addr)));
        self.current_scope_mut().hooks.listen.push(wrapped);
        self
    }

    /// Sets the current scope's payload decorator, replacing any previous one.
    pub fn decorate<F, Fut>(&mut self, decorator: F) -> &mut Self
    where
        F: Fn(Payload, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.assert_registering();
        let wrapped: Decorator = Arc::new(move |payload, ctx| Box::pin(decorator(payload, ctx)));
        self.current_scope_mut().decorator = Some(wrapped);
        self
    }

    /// Replaces the current scope's serializer.
    pub fn set_serializer<S: Serializer + 'static>(&mut self, serializer: S) -> &mut Self {
        self.assert_registering();
        self.current_scope_mut().serializer = Some(Arc::new(serializer));
        self
    }

    /// Sets the top-level wrapper invoked once per request around match→send.
    pub fn root_middleware<F, Fut>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<Body>>> + Send + 'static,
    {
        self.assert_registering();
        let middleware: RootMiddleware = Arc::new(move |ctx, next| Box::pin(middleware(ctx, next)));
        self.scopes[ScopeId::ROOT.0].root_middleware = Some(middleware);
        self
    }

    fn derive_scope(&mut self, parent: ScopeId, opts: &RegisterOptions) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        let mut child = self.scopes[parent.0].derive(id);
        if let Some(prefix) = &opts.prefix {
            child.prefix.path = format!("{}{}", child.prefix.path.trim_end_matches('/'), prefix);
        }
        self.scopes.push(child);
        self.scopes[parent.0].children.push(id);
        id
    }

    /// Drains the pending plugin queue of `scope`, depth-first: plugins a registration
    /// enqueues against its own scope run before the next sibling.
    fn boot(&mut self, scope: ScopeId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            while let Some(registration) = self.scopes[scope.0].pending.pop_front() {
                self.run_registration(scope, registration).await?;
            }
            Ok(())
        })
    }

    fn run_registration(
        &mut self,
        parent: ScopeId,
        registration: Registration,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let plugin = registration.plugin.clone();

            if let Some(parts) = plugin.parts() {
                for part in parts {
                    self.run_registration(
                        parent,
                        Registration {
                            plugin: part.clone(),
                            opts: registration.opts.clone(),
                        },
                    )
                    .await?;
                }
                return Ok(());
            }

            debug!(" registering plugin `{}`", plugin.name());

            if plugin.synchronous() {
                let prev = self.current;
                self.current = parent;
                let res = plugin.register(self).await;
                self.current = prev;
                res?;
            } else {
                let child = self.derive_scope(parent, &registration.opts);
                let prev = self.current;
                self.current = child;
                let res = plugin.register(self).await;
                self.current = prev;
                res?;
                self.boot(child).await?;
            }

            Ok(())
        })
    }

    /// Boots the plugin tree, finalizes routing and runs `ready` hooks parent→child.
    ///
    /// Idempotent; a failing plugin or `ready` hook propagates its error, while routes
    /// registered before the failure remain registered.
    pub async fn ready(&mut self) -> Result<()> {
        if self.core.is_some() {
            return Ok(());
        }

        self.boot(ScopeId::ROOT).await?;
        self.router.finalize();

        let scopes = std::mem::take(&mut self.scopes);
        let router = std::mem::replace(&mut self.router, Router::new(self.options.router.clone()));
        let core = Arc::new(Core {
            scopes,
            router,
            options: self.options.clone(),
        });
        self.core = Some(core.clone());

        for id in pre_order(&core.scopes) {
            for hook in &core.scope(id).hooks.ready {
                hook().await?;
            }
        }

        Ok(())
    }

    /// Services one request; the entry point for transports.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        match &self.core {
            Some(core) => {
                pipeline::dispatch(core.clone(), req, None, CancellationToken::new()).await
            }
            None => {
                error!("handle() invoked before ready()");
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }

    /// Binds the transport, runs `listen` hooks and starts serving.
    pub async fn listen(&mut self, opts: ListenOptions) -> Result<Bound> {
        self.ready().await?;
        let core = self
            .core
            .clone()
            .ok_or_else(|| Error::internal("application failed to become ready"))?;

        let hostname = opts.host.clone().unwrap_or_else(|| "127.0.0.1".to_owned());
        let listener = TcpListener::bind((hostname.as_str(), opts.port))
            .await
            .map_err(|e| Error::Internal(e.into()))?;
        let address = listener
            .local_addr()
            .map_err(|e| Error::Internal(e.into()))?;

        let (shutdown, signal) = watch::channel(false);
        let handle = tokio::spawn(service::serve(listener, core.clone(), signal));
        self.transport = Some(Transport { shutdown, handle });

        info!(target: "arbor::start", " listening on http://{}", address);

        for id in pre_order(&core.scopes) {
            for hook in &core.scope(id).hooks.listen {
                hook(address).await;
            }
        }

        Ok(Bound {
            address,
            port: address.port(),
            hostname,
        })
    }

    /// Runs `close` hooks child→parent, then tears down the transport.
    ///
    /// Errors from close hooks are logged and do not interrupt shutdown.
    pub async fn close(&mut self) -> Result<()> {
        let scopes: Vec<ScopeId> = match &self.core {
            Some(core) => pre_order(&core.scopes),
            None => pre_order(&self.scopes),
        };

        for id in scopes.into_iter().rev() {
            let hooks = match &self.core {
                Some(core) => core.scope(id).hooks.close.clone(),
                None => self.scopes[id.0].hooks.close.clone(),
            };
            for hook in hooks.iter().rev() {
                if let Err(e) = hook().await {
                    error!("close hook failed: {}", e);
                }
            }
        }

        if let Some(transport) = self.transport.take() {
            let _ = transport.shutdown.send(true);
            let _ = transport.handle.await;
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> Option<Arc<Core>> {
        self.core.clone()
    }
}

/// Scope ids in DFS pre-order: every parent strictly before its children.
pub(crate) fn pre_order(scopes: &[Scope]) -> Vec<ScopeId> {
    fn visit(scopes: &[Scope], id: ScopeId, out: &mut Vec<ScopeId>) {
        out.push(id);
        for child in &scopes[id.0].children {
            visit(scopes, *child, out);
        }
    }

    let mut out = Vec::with_capacity(scopes.len());
    if !scopes.is_empty() {
        visit(scopes, ScopeId::ROOT, &mut out);
    }
    out
}
