//! Dynamic router - matches requests against plugin controller bindings.
//!
//! Bindings are read from the registry on every request, so enabling,
//! disabling or editing a controller takes effect on the next request.
//! Among the patterns matching a path, the most specific wins; two equally
//! specific matches are a configuration error and are never resolved by
//! registration order.

pub mod pattern;

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::debug;

use crate::host::CallerIdentity;
use crate::models::{Plugin, SourceFragment};
use crate::plugin::{ExtensionPoint, InvocationError, PluginRuntime};
use crate::report::{FailureCause, FailureKind, FailureReport};
use crate::script::RESPONSE_TAG;

pub use pattern::{PatternError, RoutePattern};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no route for {method} {path}")]
    NotFound { method: String, path: String },

    #[error("ambiguous route for {method} {path}: {}", candidates.join(", "))]
    Ambiguous {
        method: String,
        path: String,
        candidates: Vec<String>,
    },

    #[error("route lookup failed")]
    Registry(#[from] anyhow::Error),
}

/// An inbound request addressed to a plugin.
#[derive(Debug, Clone)]
pub struct PluginRequest {
    /// Plugin id or slug.
    pub plugin: String,
    pub method: String,
    /// Path below the plugin prefix, percent-encoded as received.
    pub path: String,
    pub body: Value,
    pub caller: CallerIdentity,
}

/// What the host sends back for a handled request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginResponse {
    pub status: u16,
    pub body: Value,
}

/// The controller chosen for a request.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub plugin: Plugin,
    pub controller: SourceFragment,
    pub pattern: RoutePattern,
    pub params: BTreeMap<String, String>,
}

/// One controller registration, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct RouteBinding {
    pub method: String,
    pub path: String,
    pub controller: String,
    pub priority: i32,
}

/// Registrations that would make a request shape ambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteConflict {
    pub method: String,
    pub shape: String,
    pub controllers: Vec<String>,
}

struct Binding {
    method: String,
    pattern: RoutePattern,
    fragment: SourceFragment,
}

#[derive(Clone)]
pub struct DynamicRouter {
    runtime: Arc<PluginRuntime>,
}

impl DynamicRouter {
    pub fn new(runtime: Arc<PluginRuntime>) -> Self {
        Self { runtime }
    }

    async fn bindings_of(&self, plugin: &Plugin) -> anyhow::Result<Vec<Binding>> {
        let controllers = self
            .runtime
            .registry()
            .list_enabled_controllers(plugin.id)
            .await?;

        let mut bindings = Vec::with_capacity(controllers.len());
        for fragment in controllers {
            let Some((method, path)) = fragment.route() else {
                self.report_unroutable(plugin, &fragment, "controller has no method/path".into());
                continue;
            };
            match RoutePattern::parse(path) {
                Ok(pattern) => bindings.push(Binding {
                    method,
                    pattern,
                    fragment,
                }),
                Err(e) => self.report_unroutable(plugin, &fragment, e.to_string()),
            }
        }
        Ok(bindings)
    }

    /// A controller that cannot be bound is skipped, and reported like a
    /// compile failure.
    fn report_unroutable(&self, plugin: &Plugin, fragment: &SourceFragment, message: String) {
        self.runtime.reporter().report(FailureReport {
            plugin_id: Some(fragment.plugin_id),
            fragment: Some(fragment.name.clone()),
            ..FailureReport::new(FailureKind::Controller, FailureCause::Compile, &plugin.slug)
                .with_message(message)
        });
    }

    /// Find the controller for `method` + `path` on a live plugin.
    pub async fn route(
        &self,
        plugin: &str,
        method: &str,
        path: &str,
    ) -> Result<ResolvedRoute, RouteError> {
        let not_found = || RouteError::NotFound {
            method: method.to_string(),
            path: path.to_string(),
        };

        let Some(plugin) = self.runtime.find_live_plugin(plugin).await? else {
            return Err(not_found());
        };

        let mut matched: Vec<(Binding, BTreeMap<String, String>)> = self
            .bindings_of(&plugin)
            .await?
            .into_iter()
            .filter(|b| b.method == method)
            .filter_map(|b| b.pattern.matches(path).map(|params| (b, params)))
            .collect();

        matched.sort_by(|(a, _), (b, _)| b.pattern.specificity_cmp(&a.pattern));

        let tied = matched
            .iter()
            .take_while(|(b, _)| {
                matched
                    .first()
                    .is_some_and(|(best, _)| b.pattern.specificity_cmp(&best.pattern) == Ordering::Equal)
            })
            .count();

        if tied > 1 {
            let candidates = matched
                .iter()
                .take(tied)
                .map(|(b, _)| format!("{} ({})", b.fragment.name, b.pattern))
                .collect();
            return Err(RouteError::Ambiguous {
                method: method.to_string(),
                path: path.to_string(),
                candidates,
            });
        }

        let (binding, params) = matched.into_iter().next().ok_or_else(not_found)?;
        debug!(
            plugin = %plugin.slug,
            controller = %binding.fragment.name,
            pattern = %binding.pattern,
            "route resolved"
        );
        Ok(ResolvedRoute {
            plugin,
            controller: binding.fragment,
            pattern: binding.pattern,
            params,
        })
    }

    /// Resolve and run the controller, mapping its result to a response.
    ///
    /// Controller failures never propagate: they become a generic `500`, or
    /// `504` when the controller timed out.
    pub async fn handle(&self, request: PluginRequest) -> Result<PluginResponse, RouteError> {
        let route = self
            .route(&request.plugin, &request.method, &request.path)
            .await?;

        let params: Map<String, Value> = route
            .params
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        let args = vec![request.body, Value::Object(params), request.caller.to_value()];

        let context = format!("{} {}", request.method, route.pattern);
        match self
            .runtime
            .invoke(&route.controller, ExtensionPoint::Controller, args)
            .await
        {
            Ok(value) => Ok(into_response(value)),
            Err(err) => {
                self.runtime
                    .report(FailureKind::Controller, &context, &route.controller, &err);
                Ok(match err {
                    InvocationError::TimedOut(_) => PluginResponse {
                        status: 504,
                        body: json!({ "error": "plugin timed out" }),
                    },
                    _ => PluginResponse {
                        status: 500,
                        body: json!({ "error": "plugin error" }),
                    },
                })
            }
        }
    }

    /// Every live controller registration of a plugin.
    pub async fn bindings(&self, plugin: &Plugin) -> anyhow::Result<Vec<RouteBinding>> {
        Ok(self
            .bindings_of(plugin)
            .await?
            .into_iter()
            .map(|b| RouteBinding {
                method: b.method,
                path: b.pattern.as_str().to_string(),
                controller: b.fragment.name,
                priority: b.fragment.priority,
            })
            .collect())
    }

    /// Groups of registrations sharing a method and path shape.
    pub async fn conflicts(&self, plugin: &Plugin) -> anyhow::Result<Vec<RouteConflict>> {
        let mut groups: HashMap<(String, String), Vec<String>> = HashMap::new();
        for binding in self.bindings_of(plugin).await? {
            groups
                .entry((binding.method, binding.pattern.shape()))
                .or_default()
                .push(binding.fragment.name);
        }

        let mut conflicts: Vec<RouteConflict> = groups
            .into_iter()
            .filter(|(_, controllers)| controllers.len() > 1)
            .map(|((method, shape), mut controllers)| {
                controllers.sort();
                RouteConflict {
                    method,
                    shape,
                    controllers,
                }
            })
            .collect();
        conflicts.sort_by(|a, b| (&a.shape, &a.method).cmp(&(&b.shape, &b.method)));
        Ok(conflicts)
    }
}

/// `respond(status, body)` results set both; anything else is a `200`.
fn into_response(value: Value) -> PluginResponse {
    if let Value::Object(map) = &value {
        if map.len() == 1 {
            if let Some(Value::Object(tagged)) = map.get(RESPONSE_TAG) {
                let status = tagged
                    .get("status")
                    .and_then(Value::as_u64)
                    .and_then(|s| u16::try_from(s).ok())
                    .unwrap_or(200);
                let body = tagged.get("body").cloned().unwrap_or(Value::Null);
                return PluginResponse { status, body };
            }
        }
    }
    PluginResponse {
        status: 200,
        body: value,
    }
}
