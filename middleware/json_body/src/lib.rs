//! JSON body parsing for Arbor applications.
//!
//! Registering [`JsonBody`] installs a `request` hook that reads `application/json`
//! request bodies and records the parsed value in the request locals, which is what
//! [`arbor::http::body`] deserializes from. The plugin is synchronous, so it attaches to
//! the scope that registers it: register it at the root to parse bodies everywhere, or
//! inside an encapsulated plugin to parse them for that subtree only.

use log::trace;
use serde_json::json;

use arbor::hooks::BoxFuture;
use arbor::http::ParsedBody;
use arbor::{App, Error, Flow, Plugin, Result};

/// Parses `application/json` request bodies into the request locals.
///
/// Requests with another content type, or with an empty body, pass through untouched.
/// Malformed JSON fails the request with a `422`.
pub struct JsonBody;

impl Plugin for JsonBody {
    fn name(&self) -> &str {
        "json-body"
    }

    fn synchronous(&self) -> bool {
        true
    }

    fn register<'a>(&'a self, app: &'a mut App) -> BoxFuture<'a, Result<()>> {
        app.on_request(|ctx| async move {
            let is_json = ctx
                .request_headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_start().starts_with("application/json"))
                .unwrap_or(false);
            if !is_json {
                return Ok(Flow::Continue);
            }

            let raw = arbor::http::raw_body().await?;
            if raw.is_empty() {
                return Ok(Flow::Continue);
            }

            let value: serde_json::Value = serde_json::from_slice(&raw).map_err(|e| {
                Error::validation(json!({ "message": format!("invalid JSON body: {}", e) }))
            })?;

            trace!("[{}] request body parsed as JSON", ctx.id());
            ctx.with_locals(|locals| locals.put(ParsedBody(value)));
            Ok(Flow::Continue)
        });

        Box::pin(async { Ok(()) })
    }
}
