//! Drives a single request from match to response.
//!
//! The canonical order: root middleware wraps match → `request` hooks → handler →
//! `transform` hooks → serialization → `send` hooks; once the response is sealed, `sent`
//! hooks observe it and the defer queue drains. Failures anywhere up to serialization are
//! routed into the error-hook chain, consulted child→parent.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{HeaderValue, LOCATION};
use hyper::{Body, Request, Response, StatusCode};
use log::{debug, error, info, trace};
use tokio_util::sync::CancellationToken;

use crate::app::Core;
use crate::context::{self, Context};
use crate::error::{Error, Result};
use crate::hooks::{ErrorFlow, Flow};
use crate::response::{self, JsonSerializer, Payload, Serializer};
use crate::scope::{Next, ScopeId};

/// Services one request end to end. The context is installed as the task-local current
/// context for the whole pipeline, so every suspension point below observes it.
pub(crate) async fn dispatch(
    core: Arc<Core>,
    req: Request<Body>,
    remote: Option<SocketAddr>,
    cancel: CancellationToken,
) -> Response<Body> {
    let ctx = Context::from_request(req, remote, cancel);
    ctx.set_scope_state(core.scope(ScopeId::ROOT).bag.clone());

    let fut = run(core, ctx.clone());
    context::enter(ctx, fut).await
}

async fn run(core: Arc<Core>, ctx: Context) -> Response<Body> {
    trace!("[{}] starting", ctx.id());

    let root_middleware = core.scope(ScopeId::ROOT).root_middleware.clone();
    let mut response = match root_middleware {
        Some(middleware) => {
            let inner = core.clone();
            let next: Next = Box::new(move |ctx| Box::pin(process(inner, ctx)));
            match middleware(ctx.clone(), next).await {
                Ok(response) => response,
                Err(err) => fail(&core, &ctx, err).await,
            }
        }
        None => process(core.clone(), ctx.clone()).await,
    };

    if ctx.is_cancelled() {
        debug!("[{}] cancelled, skipping transport write", ctx.id());
        ctx.mark_failed();
        response = empty_response(client_closed());
    }

    // `sent` fires for both completions and default-rendered errors; the context's
    // failed flag tells the two apart.
    run_sent_hooks(&core, &ctx).await;
    drain_defers(&ctx).await;

    if core.options.logger {
        info!(
            "[{}] {} {} -> {}",
            ctx.id(),
            ctx.method(),
            ctx.uri().path(),
            response.status()
        );
    }

    trace!("[{}] complete", ctx.id());
    response
}

async fn process(core: Arc<Core>, ctx: Context) -> Response<Body> {
    match attempt(&core, &ctx).await {
        Ok(payload) => match finish(&core, &ctx, payload).await {
            Ok(response) => response,
            Err(err) => fail(&core, &ctx, err).await,
        },
        Err(err) => fail(&core, &ctx, err).await,
    }
}

/// Steps match → transform: everything whose failure enters the error-hook chain.
async fn attempt(core: &Core, ctx: &Context) -> Result<Payload> {
    if ctx.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let matched = core
        .router
        .find(ctx.method(), ctx.uri().path())
        .ok_or_else(Error::not_found)?;

    let owning = matched.route.scope;
    ctx.bind_route(matched.route.clone(), matched.params, owning);
    ctx.set_scope_state(core.scope(owning).bag.clone());

    trace!("[{}] dispatching to `{}`", ctx.id(), matched.route.path());

    // `request` hooks: parent→child, append order within a scope.
    for id in core.chain(owning) {
        for hook in &core.scope(*id).hooks.request {
            match hook(ctx.clone()).await? {
                Flow::Continue => {}
                Flow::Respond(payload) => {
                    trace!("[{}] request hook short-circuited", ctx.id());
                    return Ok(payload);
                }
            }
        }
    }

    let payload = matched.route.handler.call(ctx.clone()).await?;
    transforms(core, ctx, payload).await
}

/// `transform` hooks: child→parent, reverse append order within a scope.
async fn transforms(core: &Core, ctx: &Context, mut payload: Payload) -> Result<Payload> {
    for id in core.chain(ctx.scope_id()).iter().rev() {
        for hook in core.scope(*id).hooks.transform.iter().rev() {
            payload = hook(payload, ctx.clone()).await?;
        }
    }
    Ok(payload)
}

/// Steps decorate → serialize → `send` hooks → assembly.
async fn finish(core: &Core, ctx: &Context, mut payload: Payload) -> Result<Response<Body>> {
    let chain = core.chain(ctx.scope_id());

    // One optional decorator per scope, resolved root-down.
    for id in chain {
        if let Some(decorator) = &core.scope(*id).decorator {
            payload = decorator(payload, ctx.clone()).await?;
        }
    }

    let built = response::build_body(payload, resolve_serializer(core, ctx))?;

    // `send` hooks see status and headers, never the serialized bytes.
    run_send_hooks(core, ctx).await;

    let (status, headers) = ctx.with_response(|r| (r.status, r.headers.clone()));
    Ok(response::assemble(status, headers, built))
}

/// The nearest serializer override along the chain, child-first; JSON by default.
fn resolve_serializer<'a>(core: &'a Core, ctx: &Context) -> &'a dyn Serializer {
    for id in core.chain(ctx.scope_id()).iter().rev() {
        if let Some(serializer) = &core.scope(*id).serializer {
            return serializer.as_ref();
        }
    }
    &JsonSerializer
}

/// Routes a failure through the observers and the error-hook chain.
async fn fail(core: &Core, ctx: &Context, mut err: Error) -> Response<Body> {
    for observer in ctx.take_observers() {
        observer(&err);
    }

    let chain = core.chain(ctx.scope_id()).to_vec();
    for id in chain.iter().rev() {
        for hook in core.scope(*id).hooks.error.iter().rev() {
            match hook(err, ctx.clone()).await {
                ErrorFlow::Handled(payload) => {
                    trace!("[{}] error handled by hook", ctx.id());
                    ctx.set_status(StatusCode::OK);
                    return resume(core, ctx, payload).await;
                }
                ErrorFlow::Pass(same) => err = same,
                ErrorFlow::Replace(next) => {
                    debug!("[{}] error replaced by hook", ctx.id());
                    err = next;
                }
            }
        }
    }

    render_default(core, ctx, err).await
}

/// Resumes a handled error at the transform hooks. A second failure here goes straight
/// to default rendering; the chain is never re-entered for its own recovery.
async fn resume(core: &Core, ctx: &Context, payload: Payload) -> Response<Body> {
    let sealed = async {
        let payload = transforms(core, ctx, payload).await?;
        finish(core, ctx, payload).await
    }
    .await;

    match sealed {
        Ok(response) => response,
        Err(err) => render_default(core, ctx, err).await,
    }
}

/// The default error renderer: typed HTTP errors keep their status, headers and payload;
/// redirects render a `Location`; cancellations end without a body; anything else is an
/// opaque `500` with the original logged, never leaked.
async fn render_default(core: &Core, ctx: &Context, err: Error) -> Response<Body> {
    ctx.mark_failed();

    match err {
        Error::Cancelled => {
            debug!("[{}] cancelled, no response write", ctx.id());
            ctx.cancel();
            empty_response(client_closed())
        }
        Error::Http {
            status,
            payload,
            headers,
        } => {
            ctx.set_status(status);
            if let Some(extra) = headers {
                ctx.with_response(|r| r.headers.extend(extra));
            }
            render_error_body(core, ctx, Payload::from_error_payload(&payload))
        }
        Error::Redirect {
            location,
            permanent,
            headers,
        } => {
            ctx.set_status(if permanent {
                StatusCode::MOVED_PERMANENTLY
            } else {
                StatusCode::FOUND
            });
            ctx.with_response(|r| {
                if let Ok(value) = HeaderValue::from_str(&location) {
                    r.headers.insert(LOCATION, value);
                }
                if let Some(extra) = headers {
                    r.headers.extend(extra);
                }
            });
            render_error_body(core, ctx, Payload::Empty)
        }
        Error::NoContext | Error::Internal(_) => {
            error!("[{}] unable to process request: {}", ctx.id(), err);
            ctx.set_status(StatusCode::INTERNAL_SERVER_ERROR);
            render_error_body(core, ctx, Payload::Json(Error::opaque_payload()))
        }
    }
}

fn render_error_body(core: &Core, ctx: &Context, payload: Payload) -> Response<Body> {
    let built = match response::build_body(payload, resolve_serializer(core, ctx)) {
        Ok(built) => built,
        Err(err) => {
            error!("[{}] failed to render error body: {}", ctx.id(), err);
            ctx.set_status(StatusCode::INTERNAL_SERVER_ERROR);
            return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let (status, headers) = ctx.with_response(|r| (r.status, r.headers.clone()));
    response::assemble(status, headers, built)
}

async fn run_send_hooks(core: &Core, ctx: &Context) {
    for id in core.chain(ctx.scope_id()).iter().rev() {
        for hook in core.scope(*id).hooks.send.iter().rev() {
            if let Err(err) = hook(ctx.clone()).await {
                error!("[{}] send hook failed: {}", ctx.id(), err);
            }
        }
    }
}

async fn run_sent_hooks(core: &Core, ctx: &Context) {
    for id in core.chain(ctx.scope_id()).iter().rev() {
        for hook in core.scope(*id).hooks.sent.iter().rev() {
            if let Err(err) = hook(ctx.clone()).await {
                error!("[{}] sent hook failed: {}", ctx.id(), err);
            }
        }
    }
}

async fn drain_defers(ctx: &Context) {
    for deferred in ctx.take_defers() {
        if let Err(err) = deferred().await {
            error!("[{}] deferred task failed: {}", ctx.id(), err);
        }
    }
}

fn client_closed() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use futures_util::stream;
    use hyper::header::CONTENT_TYPE;
    use hyper::Method;
    use serde_json::{json, Value};

    use crate::app::App;
    use crate::http;
    use crate::plugin;

    type Log = Arc<Mutex<Vec<String>>>;

    fn log_entry(log: &Log, entry: &str) {
        log.lock().unwrap().push(entry.to_owned());
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(format!("http://localhost{}", path))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_bytes(response: Response<Body>) -> Vec<u8> {
        hyper::body::to_bytes(response.into_body())
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(response: Response<Body>) -> Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn happy_json() {
        let mut app = App::new();
        app.get("/health", |_ctx| async { Ok(json!({"ok": true})) });
        app.ready().await.unwrap();

        let response = app.handle(get("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json; charset=utf-8"
        );
        assert_eq!(body_json(response).await, json!({"ok": true}));
    }

    #[tokio::test]
    async fn path_params() {
        let mut app = App::new();
        app.get("/users/:id", |_ctx| async {
            let id = http::params()?.get("id")?;
            Ok(json!({ "id": id }))
        });
        app.ready().await.unwrap();

        let response = app.handle(get("/users/42")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"id": "42"}));
    }

    #[tokio::test]
    async fn hook_scoping() {
        let log: Log = Default::default();

        let mut app = App::new();
        let root_log = log.clone();
        app.on_request(move |_ctx| {
            let log = root_log.clone();
            async move {
                log_entry(&log, "A");
                Ok(Flow::Continue)
            }
        });
        app.get("/a", |_ctx| async { Ok("a") });

        let child_log = log.clone();
        app.register(plugin::scoped(move |app: &mut App| {
            let log = child_log.clone();
            app.on_request(move |_ctx| {
                let log = log.clone();
                async move {
                    log_entry(&log, "B");
                    Ok(Flow::Continue)
                }
            });
            app.get("/b", |_ctx| async { Ok("b") });
            Ok(())
        }));
        app.ready().await.unwrap();

        app.handle(get("/a")).await;
        assert_eq!(*log.lock().unwrap(), vec!["A"]);

        log.lock().unwrap().clear();
        app.handle(get("/b")).await;
        assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn error_chain_consults_hooks_in_reverse_and_resumes() {
        let log: Log = Default::default();

        let mut app = App::new();

        // Registered H1, H2, H3; consulted H3, H2, H1.
        let l1 = log.clone();
        app.on_error(move |err, _ctx| {
            let log = l1.clone();
            async move {
                log_entry(&log, &format!("H1:{}", err));
                ErrorFlow::Handled(Payload::Json(json!({"handled": true})))
            }
        });
        let l2 = log.clone();
        app.on_error(move |_err, _ctx| {
            let log = l2.clone();
            async move {
                log_entry(&log, "H2");
                ErrorFlow::Replace(Error::internal("E-prime"))
            }
        });
        let l3 = log.clone();
        app.on_error(move |err, _ctx| {
            let log = l3.clone();
            async move {
                log_entry(&log, "H3");
                ErrorFlow::Pass(err)
            }
        });

        app.get("/boom", |_ctx| async {
            Err::<Payload, _>(Error::internal("original"))
        });
        app.ready().await.unwrap();

        let response = app.handle(get("/boom")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"handled": true}));

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries[0], "H3");
        assert_eq!(entries[1], "H2");
        // H1 received the replacement error, not the original.
        assert!(entries[2].contains("E-prime"), "got {:?}", entries[2]);
        assert!(!entries[2].contains("original"));
    }

    #[tokio::test]
    async fn defer_runs_after_the_response_in_order() {
        let log: Log = Default::default();

        let mut app = App::new();
        let handler_log = log.clone();
        app.get("/work", move |_ctx| {
            let log = handler_log.clone();
            async move {
                let l1 = log.clone();
                http::defer(move || async move {
                    log_entry(&l1, "D1");
                    Ok(())
                })?;
                let l2 = log.clone();
                http::defer(move || async move {
                    log_entry(&l2, "D2");
                    Ok(())
                })?;
                log_entry(&log, "handler");
                Ok("ok")
            }
        });
        app.ready().await.unwrap();

        let response = app.handle(get("/work")).await;
        assert_eq!(body_bytes(response).await, b"ok");
        assert_eq!(*log.lock().unwrap(), vec!["handler", "D1", "D2"]);
    }

    #[tokio::test]
    async fn prefix_exclusion() {
        let mut app = App::new();
        app.prefix("/api", &["/health"]);
        app.get("/users", |_ctx| async { Ok("users") });
        app.get("/health", |_ctx| async { Ok("healthy") });
        app.ready().await.unwrap();

        assert_eq!(app.handle(get("/api/users")).await.status(), StatusCode::OK);
        assert_eq!(app.handle(get("/health")).await.status(), StatusCode::OK);
        assert_eq!(
            app.handle(get("/api/health")).await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            app.handle(get("/users")).await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn unknown_routes_render_the_default_404() {
        let mut app = App::new();
        app.ready().await.unwrap();

        let response = app.handle(get("/nowhere")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_bytes(response).await, b"Page not found");
    }

    #[tokio::test]
    async fn method_mismatch_is_a_404_unless_any_is_registered() {
        let mut app = App::new();
        app.post("/submit", |_ctx| async { Ok("posted") });
        app.all("/anything", |_ctx| async { Ok("any") });
        app.ready().await.unwrap();

        assert_eq!(
            app.handle(get("/submit")).await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(app.handle(get("/anything")).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn request_hooks_short_circuit_past_handler_and_transforms() {
        let log: Log = Default::default();

        let mut app = App::new();
        app.on_request(|_ctx| async {
            Ok(Flow::Respond(Payload::Text("intercepted".into())))
        });
        let transform_log = log.clone();
        app.on_transform(move |payload, _ctx| {
            let log = transform_log.clone();
            async move {
                log_entry(&log, "transform");
                Ok(payload)
            }
        });
        let handler_log = log.clone();
        app.get("/guarded", move |_ctx| {
            let log = handler_log.clone();
            async move {
                log_entry(&log, "handler");
                Ok("handled")
            }
        });
        app.ready().await.unwrap();

        let response = app.handle(get("/guarded")).await;
        assert_eq!(body_bytes(response).await, b"intercepted");
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transforms_run_lifo_and_may_replace_the_body() {
        let mut app = App::new();
        app.on_transform(|payload, _ctx| async move {
            match payload {
                Payload::Text(s) => Ok(Payload::Text(format!("{}+first", s))),
                other => Ok(other),
            }
        });
        app.on_transform(|payload, _ctx| async move {
            match payload {
                Payload::Text(s) => Ok(Payload::Text(format!("{}+second", s))),
                other => Ok(other),
            }
        });
        app.get("/t", |_ctx| async { Ok("base") });
        app.ready().await.unwrap();

        let response = app.handle(get("/t")).await;
        // Reverse append order: the second transform runs first.
        assert_eq!(body_bytes(response).await, b"base+second+first");
    }

    #[tokio::test]
    async fn send_hooks_mutate_headers_and_status() {
        let mut app = App::new();
        app.on_send(|ctx| async move {
            ctx.with_response(|r| {
                r.headers
                    .insert("x-powered-by", HeaderValue::from_static("arbor"));
                r.status = StatusCode::ACCEPTED;
            });
            Ok(())
        });
        app.get("/s", |_ctx| async { Ok("sent") });
        app.ready().await.unwrap();

        let response = app.handle(get("/s")).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers().get("x-powered-by").unwrap(), "arbor");
        assert_eq!(body_bytes(response).await, b"sent");
    }

    #[tokio::test]
    async fn sent_hooks_observe_success_and_failure() {
        let log: Log = Default::default();

        let mut app = App::new();
        let sent_log = log.clone();
        app.on_sent(move |ctx| {
            let log = sent_log.clone();
            async move {
                log_entry(&log, if ctx.failed() { "errorSent" } else { "sent" });
                Ok(())
            }
        });
        app.get("/ok", |_ctx| async { Ok("fine") });
        app.get("/bad", |_ctx| async {
            Err::<Payload, _>(Error::internal("boom"))
        });
        app.ready().await.unwrap();

        app.handle(get("/ok")).await;
        app.handle(get("/bad")).await;
        assert_eq!(*log.lock().unwrap(), vec!["sent", "errorSent"]);
    }

    #[tokio::test]
    async fn on_error_observers_run_before_the_chain() {
        let log: Log = Default::default();

        let mut app = App::new();
        let hook_log = log.clone();
        app.on_error(move |err, _ctx| {
            let log = hook_log.clone();
            async move {
                log_entry(&log, "hook");
                ErrorFlow::Pass(err)
            }
        });
        let observer_log = log.clone();
        app.get("/fails", move |_ctx| {
            let log = observer_log.clone();
            async move {
                http::on_error(move |_err| log_entry(&log, "observer"))?;
                Err::<Payload, _>(Error::internal("boom"))
            }
        });
        app.ready().await.unwrap();

        let response = app.handle(get("/fails")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(*log.lock().unwrap(), vec!["observer", "hook"]);
    }

    #[tokio::test]
    async fn opaque_errors_never_leak() {
        let mut app = App::new();
        app.get("/leak", |_ctx| async {
            Err::<Payload, _>(Error::internal("secret database details"))
        });
        app.ready().await.unwrap();

        let response = app.handle(get("/leak")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body, json!({"message": "Unable to process request"}));
    }

    #[tokio::test]
    async fn http_errors_keep_status_headers_and_payload() {
        let mut app = App::new();
        app.get("/teapot", |_ctx| async {
            let mut headers = hyper::HeaderMap::new();
            headers.insert("x-kettle", HeaderValue::from_static("on"));
            Err::<Payload, _>(Error::http_with_headers(
                StatusCode::IM_A_TEAPOT,
                json!({"brew": "oolong"}),
                headers,
            ))
        });
        app.ready().await.unwrap();

        let response = app.handle(get("/teapot")).await;
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(response.headers().get("x-kettle").unwrap(), "on");
        assert_eq!(body_json(response).await, json!({"brew": "oolong"}));
    }

    #[tokio::test]
    async fn redirects_render_a_location() {
        let mut app = App::new();
        app.get("/old", |_ctx| async {
            Err::<Payload, _>(http::redirect("/new"))
        });
        app.get("/moved", |_ctx| async {
            Err::<Payload, _>(http::redirect_permanent("/new"))
        });
        app.ready().await.unwrap();

        let response = app.handle(get("/old")).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "/new");

        let response = app.handle(get("/moved")).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    }

    #[tokio::test]
    async fn root_middleware_may_short_circuit() {
        let mut app = App::new();
        app.root_middleware(|_ctx, _next| async {
            let mut response = Response::new(Body::from("from the top"));
            *response.status_mut() = StatusCode::OK;
            Ok(response)
        });
        app.get("/never", |_ctx| async { Ok("handler") });
        app.ready().await.unwrap();

        let response = app.handle(get("/never")).await;
        assert_eq!(body_bytes(response).await, b"from the top");
    }

    #[tokio::test]
    async fn root_middleware_passes_through_by_default() {
        let mut app = App::new();
        app.root_middleware(|ctx, next| async move { Ok(next(ctx).await) });
        app.get("/through", |_ctx| async { Ok("reached") });
        app.ready().await.unwrap();

        let response = app.handle(get("/through")).await;
        assert_eq!(body_bytes(response).await, b"reached");
    }

    #[tokio::test]
    async fn decorators_apply_root_down_before_serialization() {
        let mut app = App::new();
        app.decorate(|payload, _ctx| async move {
            match payload {
                Payload::Text(s) => Ok(Payload::Text(format!("[{}]", s))),
                other => Ok(other),
            }
        });
        app.register(plugin::scoped(|app: &mut App| {
            app.decorate(|payload, _ctx| async move {
                match payload {
                    Payload::Text(s) => Ok(Payload::Text(format!("{}!", s))),
                    other => Ok(other),
                }
            });
            app.get("/d", |_ctx| async { Ok("x") });
            Ok(())
        }));
        app.ready().await.unwrap();

        let response = app.handle(get("/d")).await;
        // Root decorator first, then the owning scope's.
        assert_eq!(body_bytes(response).await, b"[x]!");
    }

    #[tokio::test]
    async fn streaming_payloads_chunk_through() {
        let mut app = App::new();
        app.get("/stream", |_ctx| async {
            let chunks = stream::iter(vec![
                Ok(bytes::Bytes::from_static(b"one,")),
                Ok(bytes::Bytes::from_static(b"two")),
            ]);
            Ok(Payload::Stream(Box::pin(chunks)))
        });
        app.ready().await.unwrap();

        let response = app.handle(get("/stream")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"one,two");
    }

    #[tokio::test]
    async fn ambient_context_is_stable_across_hooks_and_handler() {
        let ids: Log = Default::default();

        let mut app = App::new();
        let hook_ids = ids.clone();
        app.on_request(move |_ctx| {
            let ids = hook_ids.clone();
            async move {
                tokio::task::yield_now().await;
                log_entry(&ids, context::current()?.id());
                Ok(Flow::Continue)
            }
        });
        let handler_ids = ids.clone();
        app.get("/ctx", move |ctx: Context| {
            let ids = handler_ids.clone();
            async move {
                tokio::task::yield_now().await;
                log_entry(&ids, context::current()?.id());
                log_entry(&ids, ctx.id());
                Ok("done")
            }
        });
        app.ready().await.unwrap();

        app.handle(get("/ctx")).await;
        let seen = ids.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|id| id == &seen[0]));
    }

    #[tokio::test]
    async fn concurrent_requests_keep_their_own_context() {
        let mut app = App::new();
        app.get("/echo/:name", |_ctx| async {
            tokio::task::yield_now().await;
            let name = http::params()?.get("name")?;
            tokio::task::yield_now().await;
            Ok(json!({ "name": name }))
        });
        app.ready().await.unwrap();
        let app = Arc::new(app);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let app = app.clone();
            tasks.push(tokio::spawn(async move {
                let response = app.handle(get(&format!("/echo/task{}", i))).await;
                let body: Value =
                    serde_json::from_slice(&hyper::body::to_bytes(response.into_body()).await.unwrap())
                        .unwrap();
                assert_eq!(body, json!({ "name": format!("task{}", i) }));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn cancelled_requests_still_observe_sent_and_defer() {
        let log: Log = Default::default();

        let mut app = App::new();
        let sent_log = log.clone();
        app.on_sent(move |_ctx| {
            let log = sent_log.clone();
            async move {
                log_entry(&log, "sent");
                Ok(())
            }
        });
        let handler_log = log.clone();
        app.get("/slow", move |ctx: Context| {
            let log = handler_log.clone();
            async move {
                let l = log.clone();
                http::defer(move || async move {
                    log_entry(&l, "defer");
                    Ok(())
                })?;
                ctx.cancel();
                Ok("unreachable body")
            }
        });
        app.ready().await.unwrap();

        let response = app.handle(get("/slow")).await;
        assert_eq!(response.status().as_u16(), 499);
        assert_eq!(*log.lock().unwrap(), vec!["sent", "defer"]);
    }

    #[tokio::test]
    async fn scope_serializer_overrides_the_default() {
        struct CsvSerializer;
        impl Serializer for CsvSerializer {
            fn serialize(&self, value: &Value) -> Result<(bytes::Bytes, mime::Mime)> {
                let line = match value {
                    Value::Array(items) => items
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                    other => other.to_string(),
                };
                Ok((bytes::Bytes::from(line), mime::TEXT_CSV))
            }
        }

        let mut app = App::new();
        app.register(plugin::scoped(|app: &mut App| {
            app.set_serializer(CsvSerializer);
            app.get("/csv", |_ctx| async { Ok(json!([1, 2, 3])) });
            Ok(())
        }));
        app.get("/json", |_ctx| async { Ok(json!([1, 2, 3])) });
        app.ready().await.unwrap();

        let response = app.handle(get("/csv")).await;
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/csv");
        assert_eq!(body_bytes(response).await, b"1,2,3");

        let response = app.handle(get("/json")).await;
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn sibling_scopes_never_observe_each_other() {
        let log: Log = Default::default();

        let mut app = App::new();
        for name in ["alpha", "beta"] {
            let log = log.clone();
            app.register(plugin::scoped(move |app: &mut App| {
                let hook_log = log.clone();
                let tag = name;
                app.on_request(move |_ctx| {
                    let log = hook_log.clone();
                    async move {
                        log_entry(&log, tag);
                        Ok(Flow::Continue)
                    }
                });
                app.get(&format!("/{}", name), |_ctx| async { Ok("ok") });
                Ok(())
            }));
        }
        app.ready().await.unwrap();

        app.handle(get("/alpha")).await;
        assert_eq!(*log.lock().unwrap(), vec!["alpha"]);

        log.lock().unwrap().clear();
        app.handle(get("/beta")).await;
        assert_eq!(*log.lock().unwrap(), vec!["beta"]);
    }
}
