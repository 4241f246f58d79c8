//! The per-plugin-instance container of hooks, route descriptors and user state.
//!
//! Scopes form a tree rooted at the application scope. Registering an encapsulated plugin
//! derives a child scope by cloning the parent, so hooks appended by the plugin are
//! invisible to siblings while everything inherited from ancestors stays in place.

pub mod bag;

use std::collections::VecDeque;
use std::sync::Arc;

use hyper::{Body, Response};
use log::trace;

use crate::app::meta::Meta;
use crate::context::Context;
use crate::error::Result;
use crate::hooks::{BoxFuture, HookStore};
use crate::plugin::Registration;
use crate::response::{Decorator, Serializer};
use crate::scope::bag::Bag;

/// Identifies a scope within the application's scope arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId(pub(crate) usize);

impl ScopeId {
    /// The root scope id.
    pub(crate) const ROOT: ScopeId = ScopeId(0);
}

/// Continuation handed to the root middleware; drives the wrapped pipeline steps.
pub type Next = Box<dyn FnOnce(Context) -> BoxFuture<'static, Response<Body>> + Send>;

/// A top-level wrapper invoked once per request around match→send.
pub type RootMiddleware = Arc<
    dyn Fn(Context, Next) -> BoxFuture<'static, Result<Response<Body>>> + Send + Sync,
>;

/// The prefix applied to routes registered in a scope, with its exclusions.
#[derive(Clone, Default)]
pub(crate) struct PrefixRule {
    pub(crate) path: String,
    pub(crate) exclude: Vec<String>,
}

impl PrefixRule {
    /// Applies the prefix to a route path unless the path matches an exclusion, exactly or
    /// by path-segment prefix.
    pub(crate) fn apply(&self, path: &str) -> String {
        if self.path.is_empty() {
            return path.to_owned();
        }

        let excluded = self.exclude.iter().any(|e| {
            path == e || path.starts_with(&format!("{}/", e.trim_end_matches('/')))
        });
        if excluded {
            return path.to_owned();
        }

        let mut prefixed = self.path.trim_end_matches('/').to_owned();
        if !path.starts_with('/') {
            prefixed.push('/');
        }
        prefixed.push_str(path);
        if prefixed.is_empty() {
            prefixed.push('/');
        }
        prefixed
    }
}

/// A node of the scope tree.
pub(crate) struct Scope {
    pub(crate) id: ScopeId,
    pub(crate) parent: Option<ScopeId>,
    pub(crate) children: Vec<ScopeId>,

    /// The root→self path used to resolve which hooks fire for a request.
    pub(crate) chain: Vec<ScopeId>,

    pub(crate) hooks: HookStore,

    /// Scope-level meta descriptors, applied to every route registered here.
    pub(crate) meta: Vec<Meta>,

    /// Opaque user state, shared by reference with derived scopes.
    pub(crate) bag: Bag,

    pub(crate) prefix: PrefixRule,

    pub(crate) decorator: Option<Decorator>,
    pub(crate) serializer: Option<Arc<dyn Serializer>>,
    pub(crate) root_middleware: Option<RootMiddleware>,

    /// Plugins registered against this scope, waiting for `ready()`.
    pub(crate) pending: VecDeque<Registration>,
}

impl Scope {
    /// Creates the root scope.
    pub(crate) fn root() -> Scope {
        Scope {
            id: ScopeId::ROOT,
            parent: None,
            children: vec![],
            chain: vec![ScopeId::ROOT],
            hooks: HookStore::new(),
            meta: vec![],
            bag: Bag::new(),
            prefix: PrefixRule::default(),
            decorator: None,
            serializer: None,
            root_middleware: None,
            pending: VecDeque::new(),
        }
    }

    /// Derives a child scope by cloning this one.
    ///
    /// Hook stores are cloned by value, bag values are shared by reference, and the modules
    /// chain is extended by appending the new id. The pending plugin queue is never
    /// inherited.
    pub(crate) fn derive(&self, id: ScopeId) -> Scope {
        trace!(" deriving scope {:?} from {:?}", id, self.id);

        let mut chain = self.chain.clone();
        chain.push(id);

        Scope {
            id,
            parent: Some(self.id),
            children: vec![],
            chain,
            hooks: self.hooks.clone(),
            meta: self.meta.clone(),
            bag: self.bag.clone(),
            prefix: self.prefix.clone(),
            decorator: self.decorator.clone(),
            serializer: self.serializer.clone(),
            root_middleware: self.root_middleware.clone(),
            pending: VecDeque::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Flow, RequestHook};

    fn noop_hook() -> RequestHook {
        Arc::new(|_ctx| Box::pin(async { Ok(Flow::Continue) }))
    }

    #[test]
    fn derive_extends_the_chain() {
        let root = Scope::root();
        let child = root.derive(ScopeId(1));
        let grandchild = child.derive(ScopeId(2));

        assert_eq!(root.chain, vec![ScopeId(0)]);
        assert_eq!(child.chain, vec![ScopeId(0), ScopeId(1)]);
        assert_eq!(grandchild.chain, vec![ScopeId(0), ScopeId(1), ScopeId(2)]);
        assert_eq!(grandchild.parent, Some(ScopeId(1)));
    }

    #[test]
    fn mutating_a_derived_hook_store_never_changes_the_parent() {
        let mut root = Scope::root();
        root.hooks.request.push(noop_hook());

        let mut child = root.derive(ScopeId(1));
        child.hooks.request.push(noop_hook());

        assert_eq!(root.hooks.request.len(), 1);
        assert_eq!(child.hooks.request.len(), 2);
    }

    #[test]
    fn siblings_do_not_share_hook_stores() {
        let mut root = Scope::root();
        let mut a = root.derive(ScopeId(1));
        let mut b = root.derive(ScopeId(2));
        root.children.extend([ScopeId(1), ScopeId(2)]);

        a.hooks.request.push(noop_hook());

        assert_eq!(a.hooks.request.len(), 1);
        assert_eq!(b.hooks.request.len(), 0);
        b.hooks.request.push(noop_hook());
        assert_eq!(root.hooks.request.len(), 0);
    }

    #[test]
    fn prefix_rule_applies_unless_excluded() {
        let rule = PrefixRule {
            path: "/api".into(),
            exclude: vec!["/health".into()],
        };

        assert_eq!(rule.apply("/users"), "/api/users");
        assert_eq!(rule.apply("/health"), "/health");
        assert_eq!(rule.apply("/health/live"), "/health/live");
        assert_eq!(rule.apply("/healthz"), "/api/healthz");
    }

    #[test]
    fn empty_prefix_is_identity() {
        let rule = PrefixRule::default();
        assert_eq!(rule.apply("/users"), "/users");
    }
}
