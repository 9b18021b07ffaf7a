//! Bazaar plugin runtime library.
//!
//! Compiles stored plugin source fragments into sandboxed callables and
//! dispatches them from four extension points: lifecycle events, filter
//! hooks, HTTP controllers and layout widgets. The `bazaar` binary serves
//! the HTTP surface built by [`app`].

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod host;
pub mod metrics;
pub mod models;
pub mod plugin;
pub mod registry;
pub mod report;
pub mod router;
pub mod routes;
pub mod script;
pub mod state;
pub mod widget;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// The HTTP application without transport-level layers such as CORS.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::metrics::router())
        .merge(routes::navigation::router())
        .merge(routes::widget::router())
        .merge(routes::plugin_endpoint::router())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            metrics::track_http,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
