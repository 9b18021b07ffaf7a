//! Bazaar test utilities.
//!
//! Fixture builders for plugins and source fragments, and an in-memory
//! stack wiring the runtime over `MemoryRegistry`/`MemoryDataStore` for
//! integration tests.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use uuid::Uuid;

use bazaar_runtime::config::RuntimeConfig;
use bazaar_runtime::host::{MemoryDataStore, OutboundHttp, OutboundRequest, OutboundResponse};
use bazaar_runtime::models::{
    FragmentKind, NavigationEntry, Plugin, PluginManifest, PluginStatus, SourceFragment,
};
use bazaar_runtime::registry::MemoryRegistry;
use bazaar_runtime::report::FailureReport;
use bazaar_runtime::state::AppState;

/// Create an active, enabled plugin with the given slug.
pub fn test_plugin(slug: &str) -> TestPlugin {
    TestPlugin {
        plugin: Plugin {
            id: Uuid::now_v7(),
            name: slug.replace(['-', '_'], " "),
            slug: slug.to_string(),
            manifest: PluginManifest::default(),
            status: PluginStatus::Active,
            is_enabled: true,
        },
    }
}

/// A plugin builder for creating test fixtures.
#[derive(Debug, Clone)]
pub struct TestPlugin {
    pub plugin: Plugin,
}

impl TestPlugin {
    pub fn id(&self) -> Uuid {
        self.plugin.id
    }

    /// Set a custom ID.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.plugin.id = id;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.plugin.status = PluginStatus::Inactive;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.plugin.is_enabled = false;
        self
    }

    /// Add a navigation entry to the manifest.
    pub fn with_navigation(mut self, title: &str, path: &str, weight: i32) -> Self {
        self.plugin.manifest.navigation.push(NavigationEntry {
            title: title.to_string(),
            path: path.to_string(),
            weight,
        });
        self
    }

    pub fn build(self) -> Plugin {
        self.plugin
    }
}

/// A source fragment builder.
#[derive(Debug, Clone)]
pub struct TestFragment {
    pub fragment: SourceFragment,
}

impl TestFragment {
    pub fn new(plugin_id: Uuid, kind: FragmentKind, name: &str, body: &str, extra: Value) -> Self {
        Self {
            fragment: SourceFragment {
                id: Uuid::now_v7(),
                plugin_id,
                kind,
                name: name.to_string(),
                body: body.to_string(),
                is_enabled: true,
                priority: 0,
                extra,
                updated_at: Utc::now(),
            },
        }
    }

    pub fn script(plugin_id: Uuid, name: &str, body: &str) -> Self {
        Self::new(plugin_id, FragmentKind::Script, name, body, json!({}))
    }

    /// A `script` fragment registered as a handler for `hook`.
    pub fn hook(plugin_id: Uuid, name: &str, hook: &str, body: &str) -> Self {
        Self::new(plugin_id, FragmentKind::Script, name, body, json!({ "hook": hook }))
    }

    pub fn listener(plugin_id: Uuid, name: &str, event: &str, body: &str) -> Self {
        Self::new(
            plugin_id,
            FragmentKind::EventListener,
            name,
            body,
            json!({ "event_name": event }),
        )
    }

    pub fn controller(plugin_id: Uuid, name: &str, method: &str, path: &str, body: &str) -> Self {
        Self::new(
            plugin_id,
            FragmentKind::Controller,
            name,
            body,
            json!({ "method": method, "path": path }),
        )
    }

    pub fn widget(plugin_id: Uuid, name: &str, body: &str) -> Self {
        Self::new(plugin_id, FragmentKind::Widget, name, body, json!({}))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.fragment.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.fragment.is_enabled = false;
        self
    }

    /// Place a widget in a layout slot.
    pub fn in_slot(self, slot: &str) -> Self {
        self.with_extra("slot", json!(slot))
    }

    pub fn with_default_config(self, config: Value) -> Self {
        self.with_extra("default_config", config)
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        if let Some(extra) = self.fragment.extra.as_object_mut() {
            extra.insert(key.to_string(), value);
        }
        self
    }

    pub fn build(self) -> SourceFragment {
        self.fragment
    }
}

/// Outbound HTTP double: records requests and answers with a fixed response.
#[derive(Debug)]
pub struct StubHttp {
    response: OutboundResponse,
    sent: Mutex<Vec<OutboundRequest>>,
}

impl StubHttp {
    pub fn responding(status: u16, body: Value) -> Self {
        Self {
            response: OutboundResponse { status, body },
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().clone()
    }
}

impl Default for StubHttp {
    fn default() -> Self {
        Self::responding(200, Value::Null)
    }
}

#[async_trait]
impl OutboundHttp for StubHttp {
    async fn send(&self, request: OutboundRequest) -> anyhow::Result<OutboundResponse> {
        self.sent.lock().push(request);
        Ok(self.response.clone())
    }
}

/// The runtime wired over in-memory backends.
pub struct TestStack {
    pub registry: Arc<MemoryRegistry>,
    pub data: Arc<MemoryDataStore>,
    pub http: Arc<StubHttp>,
    pub state: AppState,
}

impl TestStack {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let registry = Arc::new(MemoryRegistry::new());
        let data = Arc::new(MemoryDataStore::new());
        let http = Arc::new(StubHttp::default());
        let state = AppState::with_backends(
            registry.clone(),
            data.clone(),
            http.clone(),
            config,
            None,
        );
        Self {
            registry,
            data,
            http,
            state,
        }
    }

    /// Install a plugin; returns its id.
    pub fn install(&self, plugin: TestPlugin) -> Uuid {
        let id = plugin.id();
        self.registry.upsert_plugin(plugin.build());
        id
    }

    /// Store a fragment; returns its id.
    pub fn add(&self, fragment: TestFragment) -> Uuid {
        self.registry.upsert_fragment(fragment.build())
    }

    /// Documents a plugin stored in `collection`, as JSON objects.
    pub fn documents(&self, plugin_id: Uuid, collection: &str) -> Vec<Value> {
        self.data
            .snapshot(plugin_id, collection)
            .into_iter()
            .map(|doc| doc.into_value())
            .collect()
    }

    pub fn failures(&self) -> broadcast::Receiver<FailureReport> {
        self.state.runtime().reporter().subscribe()
    }

    pub fn app(&self) -> Router {
        bazaar_runtime::app(self.state.clone())
    }
}

impl Default for TestStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain every report currently buffered on a subscription.
pub fn drain(rx: &mut broadcast::Receiver<FailureReport>) -> Vec<FailureReport> {
    let mut reports = Vec::new();
    while let Ok(report) = rx.try_recv() {
        reports.push(report);
    }
    reports
}

/// Assertion helpers for JSON values.
pub mod assert {
    use serde_json::Value;

    /// Assert that a JSON value has a specific key.
    pub fn has_key(value: &Value, key: &str) {
        assert!(
            value.get(key).is_some(),
            "Expected JSON to have key '{key}', got: {value}"
        );
    }

    /// Assert that a string contains a substring.
    pub fn contains(haystack: &str, needle: &str) {
        assert!(
            haystack.contains(needle),
            "Expected string to contain '{needle}'\nActual: {haystack}"
        );
    }
}
