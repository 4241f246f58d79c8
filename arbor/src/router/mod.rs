//! Maps `(method, path)` pairs to registered route records.

pub(crate) mod tree;

use std::collections::HashMap;
use std::sync::Arc;

use hyper::Method;
use log::trace;
use serde_json::Value;

use crate::handler::Handler;
use crate::helpers::http::path::RequestPathSegments;
use crate::router::tree::{PatternSegment, SegmentMapping, Tree};
use crate::scope::ScopeId;

/// Configuration for path matching.
#[derive(Clone, Debug)]
pub struct RouterOptions {
    /// When set (the default), `/health` and `/health/` resolve to the same route.
    pub ignore_trailing_slash: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        RouterOptions {
            ignore_trailing_slash: true,
        }
    }
}

/// The methods a route services.
#[derive(Clone, Debug)]
pub enum MethodSpec {
    /// Matches any method; explicit methods on the same path win.
    Any,
    /// Matches the listed methods exactly.
    Methods(Vec<Method>),
}

impl MethodSpec {
    pub(crate) fn is_any(&self) -> bool {
        matches!(self, MethodSpec::Any)
    }

    pub(crate) fn matches_explicit(&self, method: &Method) -> bool {
        match self {
            MethodSpec::Any => false,
            MethodSpec::Methods(methods) => methods.contains(method),
        }
    }
}

/// Metadata recorded on a route by meta descriptors.
pub type MetaMap = HashMap<String, Value>;

/// An immutable registered route.
///
/// The owning scope is the scope that was active when registration occurred; it determines
/// which hooks fire for requests matched to this route.
pub struct RouteRecord {
    pub(crate) methods: MethodSpec,
    pub(crate) path: String,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) scope: ScopeId,
    pub(crate) metadata: MetaMap,
}

impl RouteRecord {
    /// The methods this route services.
    pub fn methods(&self) -> &MethodSpec {
        &self.methods
    }

    /// The full registered path pattern, prefix included.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Metadata recorded by meta descriptors at registration time.
    pub fn metadata(&self) -> &MetaMap {
        &self.metadata
    }

    #[cfg(test)]
    pub(crate) fn test_fixture(methods: MethodSpec, path: &str) -> Arc<RouteRecord> {
        use crate::context::Context;
        use crate::response::Payload;

        Arc::new(RouteRecord {
            methods,
            path: path.to_owned(),
            handler: Arc::new(|_ctx: Context| async { Ok(Payload::Empty) }),
            scope: ScopeId::ROOT,
            metadata: MetaMap::new(),
        })
    }
}

/// Path parameters captured while matching a request.
#[derive(Clone, Debug, Default)]
pub struct Params {
    map: HashMap<String, String>,
}

impl Params {
    pub(crate) fn from_mapping(mapping: SegmentMapping<'_>) -> Params {
        let map = mapping
            .into_iter()
            .map(|(name, values)| {
                let joined = values
                    .iter()
                    .map(|v| v.as_ref())
                    .collect::<Vec<_>>()
                    .join("/");
                (name.to_owned(), joined)
            })
            .collect();
        Params { map }
    }

    /// The captured value for a parameter, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    /// Iterates over all captured parameters.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[cfg(test)]
    pub(crate) fn from_pairs(pairs: &[(&str, &str)]) -> Params {
        Params {
            map: pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }
}

/// Splits a registered path pattern into its typed segments.
///
/// `/:name` segments capture a single request segment; `*name` (or a bare `*`) captures the
/// remainder of the path.
pub(crate) fn parse_pattern(path: &str, keep_trailing_slash: bool) -> Vec<PatternSegment> {
    let mut segments: Vec<PatternSegment> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            if let Some(name) = s.strip_prefix(':') {
                PatternSegment::Param(name.to_owned())
            } else if let Some(name) = s.strip_prefix('*') {
                let name = if name.is_empty() { "*" } else { name };
                PatternSegment::Glob(name.to_owned())
            } else {
                PatternSegment::Literal(s.to_owned())
            }
        })
        .collect();

    if keep_trailing_slash && path.len() > 1 && path.ends_with('/') {
        segments.push(PatternSegment::Literal(String::new()));
    }

    segments
}

/// A successful route match.
pub(crate) struct RouteMatch {
    pub(crate) route: Arc<RouteRecord>,
    pub(crate) params: Params,
}

/// Dispatches request paths to route records via the segment tree.
pub(crate) struct Router {
    tree: Tree,
    options: RouterOptions,
}

impl Router {
    pub(crate) fn new(options: RouterOptions) -> Router {
        Router {
            tree: Tree::new(),
            options,
        }
    }

    /// Registers a route under its full (already prefixed) path.
    pub(crate) fn add(&mut self, route: Arc<RouteRecord>) {
        let pattern = parse_pattern(&route.path, !self.options.ignore_trailing_slash);
        self.tree.add_route(&pattern, route);
    }

    /// Sorts the tree into priority order; no mutation is valid afterwards.
    pub(crate) fn finalize(&mut self) {
        self.tree.finalize();
    }

    /// Finds the route servicing `(method, path)`, if any.
    ///
    /// Routes registered for an explicit method win over `*` routes on the same path; a
    /// path that matches with no servicing method is a miss, not a `405`.
    pub(crate) fn find(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let rps = RequestPathSegments::new(path, !self.options.ignore_trailing_slash);

        let (node, mapping) = self.tree.traverse(rps.segments())?;

        let route = node
            .routes()
            .iter()
            .find(|r| r.methods.matches_explicit(method))
            .or_else(|| node.routes().iter().find(|r| r.methods.is_any()))?;

        trace!(" matched route `{}` for {} {}", route.path, method, path);

        Some(RouteMatch {
            route: route.clone(),
            params: Params::from_mapping(mapping),
        })
    }
}
