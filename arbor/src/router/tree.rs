//! A hierarchical tree of path segments with backtracking traversal.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use log::trace;

use crate::helpers::http::PercentDecoded;
use crate::router::RouteRecord;

/// Mapping of parameter segment names into the request segments they consumed.
pub(crate) type SegmentMapping<'r> = HashMap<&'r str, Vec<&'r PercentDecoded>>;

/// Indicates the type of segment represented by a [`Node`].
///
/// The derived ordering is the traversal priority: literal segments are tried before
/// parameters, parameters before globs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SegmentType {
    /// Matched exactly (string equality) against the corresponding request segment.
    Static,

    /// Matches any single request segment; the consumed value is captured under the
    /// segment's name.
    Dynamic,

    /// Matches one or more segments until the end of the request path or until a more
    /// specific child matches.
    Glob,
}

/// One segment of a registered route pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PatternSegment {
    Literal(String),
    Param(String),
    Glob(String),
}

/// A recursive member of [`Tree`], representing one segment of a routable path.
pub(crate) struct Node {
    segment: String,
    segment_type: SegmentType,
    routes: Vec<Arc<RouteRecord>>,
    children: Vec<Node>,
}

impl Node {
    pub(crate) fn new(segment: impl Into<String>, segment_type: SegmentType) -> Node {
        Node {
            segment: segment.into(),
            segment_type,
            routes: vec![],
            children: vec![],
        }
    }

    pub(crate) fn segment(&self) -> &str {
        &self.segment
    }

    pub(crate) fn routes(&self) -> &[Arc<RouteRecord>] {
        &self.routes
    }

    fn is_routable(&self) -> bool {
        !self.routes.is_empty()
    }

    fn matches(&self, req_segment: &PercentDecoded) -> bool {
        match self.segment_type {
            SegmentType::Static => self.segment == req_segment.val(),
            SegmentType::Dynamic | SegmentType::Glob => true,
        }
    }

    /// Recursively searches for the first fully matching path through the tree.
    ///
    /// Children are tried in most-to-least specific order of their segment type; a `Glob`
    /// node keeps consuming segments when no child can continue the match.
    fn search<'r>(
        &'r self,
        segments: &'r [PercentDecoded],
        mut consumed: Vec<&'r PercentDecoded>,
    ) -> Option<(&'r Node, SegmentMapping<'r>)> {
        let (x, xs) = segments.split_first()?;

        if !self.matches(x) {
            return None;
        }

        if xs.is_empty() && self.is_routable() {
            trace!(" found leaf node `{}`", self.segment);
            let mut mapping = SegmentMapping::new();
            if self.segment_type != SegmentType::Static {
                consumed.push(x);
                mapping.insert(self.segment.as_str(), consumed);
            }
            return Some((self, mapping));
        }

        let descended = self
            .children
            .iter()
            .filter_map(|c| c.search(xs, vec![]))
            .next();

        match descended {
            Some((leaf, mut mapping)) => {
                if self.segment_type != SegmentType::Static {
                    consumed.push(x);
                    mapping.insert(self.segment.as_str(), consumed);
                }
                Some((leaf, mapping))
            }
            // A glob consumes the segment and carries on; anything else is a dead end.
            None if self.segment_type == SegmentType::Glob => {
                trace!(" continuing glob match for segment `{}`", self.segment);
                consumed.push(x);
                self.search(xs, consumed)
            }
            None => None,
        }
    }

    fn add_route(&mut self, route: Arc<RouteRecord>) {
        trace!(" adding route to `{}`", self.segment);
        self.routes.push(route);
    }

    fn child_mut(&mut self, segment: &str, segment_type: &SegmentType) -> Option<usize> {
        self.children
            .iter()
            .position(|n| n.segment_type == *segment_type && n.segment == segment)
    }

    fn sort(&mut self) {
        self.children.sort();
        for child in &mut self.children {
            child.sort();
        }
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Node) -> Ordering {
        (&self.segment_type, &self.segment).cmp(&(&other.segment_type, &other.segment))
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Node) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Node) -> bool {
        (&self.segment_type, &self.segment) == (&other.segment_type, &other.segment)
    }
}

impl Eq for Node {}

/// A tree of linked [`Node`]s representing every registered route path.
///
/// Mutated only while the plugin tree boots; [`Tree::finalize`] sorts children into
/// priority order, after which the tree is read-only.
pub(crate) struct Tree {
    root: Node,
}

impl Tree {
    pub(crate) fn new() -> Tree {
        trace!(" creating new tree");
        Tree {
            root: Node::new("/", SegmentType::Static),
        }
    }

    /// Inserts a route at the node identified by the pattern, creating intermediate nodes
    /// as needed.
    pub(crate) fn add_route(&mut self, pattern: &[PatternSegment], route: Arc<RouteRecord>) {
        let mut node = &mut self.root;

        for segment in pattern {
            let (name, segment_type) = match segment {
                PatternSegment::Literal(s) => (s.as_str(), SegmentType::Static),
                PatternSegment::Param(s) => (s.as_str(), SegmentType::Dynamic),
                PatternSegment::Glob(s) => (s.as_str(), SegmentType::Glob),
            };

            let idx = match node.child_mut(name, &segment_type) {
                Some(idx) => idx,
                None => {
                    node.children.push(Node::new(name, segment_type.clone()));
                    node.children.len() - 1
                }
            };
            node = &mut node.children[idx];
        }

        node.add_route(route);
    }

    /// Sorts all children into priority order. Called once when the application becomes
    /// ready.
    pub(crate) fn finalize(&mut self) {
        self.root.sort();
    }

    /// Attempts to acquire the routable node matching the request path segments.
    pub(crate) fn traverse<'r>(
        &'r self,
        segments: &'r [PercentDecoded],
    ) -> Option<(&'r Node, SegmentMapping<'r>)> {
        trace!(" starting tree traversal");
        if segments.is_empty() {
            if self.root.is_routable() {
                return Some((&self.root, SegmentMapping::new()));
            }
            return None;
        }

        self.root
            .children
            .iter()
            .filter_map(|c| c.search(segments, vec![]))
            .next()
    }
}
