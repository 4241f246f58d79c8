//! Helper functions for processing the request path.

use crate::helpers::http::PercentDecoded;

/// Holder for `Request` URI path segments that have been split into individual segments.
///
/// Used internally by the router when traversing its tree.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestPathSegments {
    segments: Vec<PercentDecoded>,
}

impl RequestPathSegments {
    /// Creates a new `RequestPathSegments` instance by splitting a `Request` URI path.
    ///
    /// Empty segments are skipped, so a request path of `/some/path/to//my/handler` is split
    /// into:
    ///
    /// ```plain
    /// ["some", "path", "to", "my", "handler"]
    /// ```
    ///
    /// When `keep_trailing_slash` is set a trailing `/` is retained as a final empty segment so
    /// that `/health` and `/health/` resolve differently.
    pub(crate) fn new(path: &str, keep_trailing_slash: bool) -> Self {
        let mut segments: Vec<PercentDecoded> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .filter_map(PercentDecoded::new)
            .collect();

        if keep_trailing_slash && path.len() > 1 && path.ends_with('/') {
            if let Some(marker) = PercentDecoded::new("") {
                segments.push(marker);
            }
        }

        RequestPathSegments { segments }
    }

    /// Provides the segments to be processed by tree traversal.
    pub(crate) fn segments(&self) -> &[PercentDecoded] {
        &self.segments
    }
}
