//! HTTP route handlers.

pub mod health;
pub mod metrics;
pub mod navigation;
pub mod plugin_endpoint;
pub mod widget;
