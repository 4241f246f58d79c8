//! Arbor — a minimalist HTTP application runtime.
//!
//! Arbor composes three tightly coupled pieces into a single request pipeline:
//!
//! * a path-trie [`router`] mapping `(method, path)` to registered handlers,
//! * a hierarchically scoped [`plugin`] and hook engine: registering an encapsulated
//!   plugin derives a child [`scope`], so sibling modules never observe each other's
//!   hooks while children inherit from their parents,
//! * a per-request ambient [`context`], available to handler code through the accessors
//!   in [`http`] without explicit parameter passing, and isolated between concurrent
//!   in-flight requests.
//!
//! The transport is pluggable: [`App::handle`] accepts a request value and returns a
//! response value, and [`App::listen`] binds the built-in hyper adapter.
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod app;
pub mod context;
pub mod error;
pub mod handler;
pub mod helpers;
pub mod hooks;
pub mod http;
pub mod plugin;
pub mod response;
pub mod router;
pub mod scope;

mod pipeline;
mod service;

pub use crate::app::meta::Meta;
pub use crate::app::{App, AppOptions, Bound, ListenOptions};
pub use crate::context::Context;
pub use crate::error::{Error, Result};
pub use crate::handler::Handler;
pub use crate::hooks::{ErrorFlow, Flow};
pub use crate::plugin::Plugin;
pub use crate::response::{json, IntoPayload, Payload, Serializer};
pub use crate::router::{MethodSpec, Params, RouterOptions};
