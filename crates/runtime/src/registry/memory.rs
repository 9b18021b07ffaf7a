//! In-memory registry for embedding and tests.
//!
//! Besides the read interface it exposes the write operations that external
//! tooling performs against the real store (install, edit, toggle), so the
//! runtime can be exercised against live edits.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::Registry;
use crate::models::{FragmentKind, Plugin, PluginStatus, SourceFragment, sort_bindings};

#[derive(Default)]
struct Store {
    plugins: HashMap<Uuid, Plugin>,
    fragments: HashMap<Uuid, SourceFragment>,
}

impl Store {
    fn is_live(&self, fragment: &SourceFragment) -> bool {
        fragment.is_enabled
            && self
                .plugins
                .get(&fragment.plugin_id)
                .is_some_and(Plugin::is_live)
    }

    fn live(&self, predicate: impl Fn(&SourceFragment) -> bool) -> Vec<SourceFragment> {
        let mut out: Vec<SourceFragment> = self
            .fragments
            .values()
            .filter(|f| self.is_live(f) && predicate(f))
            .cloned()
            .collect();
        sort_bindings(&mut out);
        out
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    store: RwLock<Store>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a plugin.
    pub fn upsert_plugin(&self, plugin: Plugin) {
        self.store.write().plugins.insert(plugin.id, plugin);
    }

    /// Insert a fragment, replacing any fragment with the same
    /// (plugin, kind, name). Returns the stored fragment id.
    pub fn upsert_fragment(&self, mut fragment: SourceFragment) -> Uuid {
        let mut store = self.store.write();
        let existing = store
            .fragments
            .values()
            .find(|f| {
                f.plugin_id == fragment.plugin_id
                    && f.kind == fragment.kind
                    && f.name == fragment.name
            })
            .map(|f| f.id);
        if let Some(id) = existing {
            fragment.id = id;
        }
        let id = fragment.id;
        store.fragments.insert(id, fragment);
        id
    }

    /// Replace a fragment body, as an editor would.
    pub fn set_fragment_body(&self, id: Uuid, body: impl Into<String>) -> bool {
        self.update_fragment(id, |f| f.body = body.into())
    }

    pub fn set_fragment_enabled(&self, id: Uuid, enabled: bool) -> bool {
        self.update_fragment(id, |f| f.is_enabled = enabled)
    }

    pub fn set_fragment_priority(&self, id: Uuid, priority: i32) -> bool {
        self.update_fragment(id, |f| f.priority = priority)
    }

    pub fn remove_fragment(&self, id: Uuid) -> Option<SourceFragment> {
        self.store.write().fragments.remove(&id)
    }

    pub fn set_plugin_enabled(&self, id: Uuid, enabled: bool) -> bool {
        self.update_plugin(id, |p| p.is_enabled = enabled)
    }

    pub fn set_plugin_status(&self, id: Uuid, status: PluginStatus) -> bool {
        self.update_plugin(id, |p| p.status = status)
    }

    fn update_fragment(&self, id: Uuid, apply: impl FnOnce(&mut SourceFragment)) -> bool {
        match self.store.write().fragments.get_mut(&id) {
            Some(fragment) => {
                apply(fragment);
                fragment.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    fn update_plugin(&self, id: Uuid, apply: impl FnOnce(&mut Plugin)) -> bool {
        match self.store.write().plugins.get_mut(&id) {
            Some(plugin) => {
                apply(plugin);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get_plugin(&self, id: Uuid) -> Result<Option<Plugin>> {
        Ok(self.store.read().plugins.get(&id).cloned())
    }

    async fn find_plugin(&self, id_or_slug: &str) -> Result<Option<Plugin>> {
        Ok(self
            .store
            .read()
            .plugins
            .values()
            .find(|p| p.matches(id_or_slug))
            .cloned())
    }

    async fn list_plugins(&self) -> Result<Vec<Plugin>> {
        let mut plugins: Vec<Plugin> = self.store.read().plugins.values().cloned().collect();
        plugins.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(plugins)
    }

    async fn list_fragments(
        &self,
        plugin_id: Uuid,
        kind: Option<FragmentKind>,
    ) -> Result<Vec<SourceFragment>> {
        let mut fragments: Vec<SourceFragment> = self
            .store
            .read()
            .fragments
            .values()
            .filter(|f| f.plugin_id == plugin_id && kind.is_none_or(|k| f.kind == k))
            .cloned()
            .collect();
        fragments.sort_by(|a, b| (a.kind.as_str(), &a.name).cmp(&(b.kind.as_str(), &b.name)));
        Ok(fragments)
    }

    async fn get_live_fragment(
        &self,
        plugin_id: Uuid,
        kind: FragmentKind,
        name: &str,
    ) -> Result<Option<SourceFragment>> {
        let store = self.store.read();
        Ok(store
            .fragments
            .values()
            .find(|f| {
                f.plugin_id == plugin_id && f.kind == kind && f.name == name && store.is_live(f)
            })
            .cloned())
    }

    async fn list_enabled_listeners(&self, event_name: &str) -> Result<Vec<SourceFragment>> {
        Ok(self.store.read().live(|f| {
            f.kind == FragmentKind::EventListener && f.event_name() == Some(event_name)
        }))
    }

    async fn list_enabled_hook_handlers(&self, hook_name: &str) -> Result<Vec<SourceFragment>> {
        Ok(self
            .store
            .read()
            .live(|f| f.kind == FragmentKind::Script && f.hook() == Some(hook_name)))
    }

    async fn list_enabled_controllers(&self, plugin_id: Uuid) -> Result<Vec<SourceFragment>> {
        Ok(self
            .store
            .read()
            .live(|f| f.kind == FragmentKind::Controller && f.plugin_id == plugin_id))
    }

    async fn list_enabled_widgets(&self, name: &str) -> Result<Vec<SourceFragment>> {
        Ok(self
            .store
            .read()
            .live(|f| f.kind == FragmentKind::Widget && f.name == name))
    }

    async fn list_enabled_slot_widgets(&self, slot: &str) -> Result<Vec<SourceFragment>> {
        Ok(self
            .store
            .read()
            .live(|f| f.kind == FragmentKind::Widget && f.slot() == Some(slot)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::PluginManifest;
    use serde_json::json;

    fn plugin(slug: &str) -> Plugin {
        Plugin {
            id: Uuid::now_v7(),
            name: slug.to_string(),
            slug: slug.to_string(),
            manifest: PluginManifest::default(),
            status: PluginStatus::Active,
            is_enabled: true,
        }
    }

    fn listener(plugin_id: Uuid, name: &str, priority: i32) -> SourceFragment {
        SourceFragment {
            id: Uuid::now_v7(),
            plugin_id,
            kind: FragmentKind::EventListener,
            name: name.to_string(),
            body: "fn(payload) {}".to_string(),
            is_enabled: true,
            priority,
            extra: json!({"event_name": "cart.viewed"}),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn listeners_are_live_and_ordered() {
        let registry = MemoryRegistry::new();
        let p = plugin("carts");
        registry.upsert_plugin(p.clone());
        registry.upsert_fragment(listener(p.id, "late", 10));
        registry.upsert_fragment(listener(p.id, "early", 5));
        let disabled = registry.upsert_fragment(listener(p.id, "off", 1));
        registry.set_fragment_enabled(disabled, false);

        let names: Vec<_> = registry
            .list_enabled_listeners("cart.viewed")
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, ["early", "late"]);
        assert!(registry.list_enabled_listeners("order.placed").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inactive_or_disabled_plugins_hide_fragments() {
        let registry = MemoryRegistry::new();
        let p = plugin("carts");
        registry.upsert_plugin(p.clone());
        registry.upsert_fragment(listener(p.id, "a", 0));

        registry.set_plugin_status(p.id, PluginStatus::Inactive);
        assert!(registry.list_enabled_listeners("cart.viewed").await.unwrap().is_empty());

        registry.set_plugin_status(p.id, PluginStatus::Active);
        registry.set_plugin_enabled(p.id, false);
        assert!(registry.list_enabled_listeners("cart.viewed").await.unwrap().is_empty());

        // Still visible to tooling.
        assert_eq!(registry.list_fragments(p.id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_replaces_by_plugin_kind_and_name() {
        let registry = MemoryRegistry::new();
        let p = plugin("carts");
        registry.upsert_plugin(p.clone());
        let first = registry.upsert_fragment(listener(p.id, "a", 0));
        let second = registry.upsert_fragment(listener(p.id, "a", 3));
        assert_eq!(first, second);

        let fragments = registry
            .list_fragments(p.id, Some(FragmentKind::EventListener))
            .await
            .unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].priority, 3);
    }

    #[tokio::test]
    async fn find_plugin_by_slug_or_id() {
        let registry = MemoryRegistry::new();
        let p = plugin("carts");
        registry.upsert_plugin(p.clone());
        assert_eq!(registry.find_plugin("carts").await.unwrap().unwrap().id, p.id);
        assert!(registry.find_plugin(&p.id.to_string()).await.unwrap().is_some());
        assert!(registry.find_plugin("missing").await.unwrap().is_none());
    }
}
