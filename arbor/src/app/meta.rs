//! Route meta descriptors.
//!
//! Descriptors attach opaque metadata to routes at registration time; collaborating
//! subsystems (schema validation, documentation emitters) read it back from
//! [`RouteRecord::metadata`](crate::router::RouteRecord::metadata).

use std::sync::Arc;

use serde_json::Value;

use crate::router::{MetaMap, MethodSpec};

/// The mutable route configuration handed to descriptor functions before the route record
/// is frozen.
pub struct RouteConfig {
    /// The methods the route will service.
    pub methods: MethodSpec,
    /// The full route path, prefix already applied.
    pub path: String,
    /// Metadata accumulated so far.
    pub metadata: MetaMap,
}

/// A descriptor applied to a route at registration.
///
/// Scope-level descriptors apply to every route registered in their scope; route-level
/// descriptors apply after them, so a route-level value wins on key collision.
#[derive(Clone)]
pub enum Meta {
    /// Records `value` on the route's metadata at `key`.
    Pair(String, Value),
    /// Invoked with the route configuration; may mutate metadata or the config itself.
    With(Arc<dyn Fn(&mut RouteConfig) + Send + Sync>),
}

impl Meta {
    /// A keyed metadata value.
    pub fn pair(key: impl Into<String>, value: impl Into<Value>) -> Meta {
        Meta::Pair(key.into(), value.into())
    }

    /// A descriptor function receiving the route configuration.
    pub fn with(f: impl Fn(&mut RouteConfig) + Send + Sync + 'static) -> Meta {
        Meta::With(Arc::new(f))
    }

    pub(crate) fn apply(&self, config: &mut RouteConfig) {
        match self {
            Meta::Pair(key, value) => {
                config.metadata.insert(key.clone(), value.clone());
            }
            Meta::With(f) => f(config),
        }
    }
}

/// Applies scope-level descriptors, then route-level ones; later assignments win.
pub(crate) fn apply_all(scope_meta: &[Meta], route_meta: &[Meta], config: &mut RouteConfig) {
    for meta in scope_meta.iter().chain(route_meta) {
        meta.apply(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> RouteConfig {
        RouteConfig {
            methods: MethodSpec::Any,
            path: "/".into(),
            metadata: MetaMap::new(),
        }
    }

    #[test]
    fn pairs_record_keyed_values() {
        let mut config = config();
        Meta::pair("auth", json!({"role": "admin"})).apply(&mut config);
        assert_eq!(config.metadata["auth"], json!({"role": "admin"}));
    }

    #[test]
    fn descriptor_functions_see_the_route_config() {
        let mut config = config();
        config.path = "/users/:id".into();
        Meta::with(|c| {
            let key = format!("doc:{}", c.path);
            c.metadata.insert(key, json!(true));
        })
        .apply(&mut config);
        assert_eq!(config.metadata["doc:/users/:id"], json!(true));
    }

    #[test]
    fn route_level_wins_over_scope_level_on_collision() {
        let mut config = config();
        apply_all(
            &[Meta::pair("tag", "scope"), Meta::pair("shared", 1)],
            &[Meta::pair("tag", "route")],
            &mut config,
        );
        assert_eq!(config.metadata["tag"], json!("route"));
        assert_eq!(config.metadata["shared"], json!(1));
    }
}
