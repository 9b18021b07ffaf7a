//! Read access to plugin metadata and stored source fragments.
//!
//! The runtime never writes plugins or fragments: they are edited by external
//! tooling and picked up on the next lookup. Every `list_enabled_*` query
//! returns only *live* fragments (fragment enabled, plugin enabled, plugin
//! status active), sorted by (priority, plugin_id, name).

mod memory;
mod postgres;

use async_trait::async_trait;
use anyhow::Result;
use uuid::Uuid;

use crate::models::{FragmentKind, Plugin, SourceFragment};

pub use memory::MemoryRegistry;
pub use postgres::PgRegistry;

#[async_trait]
pub trait Registry: Send + Sync {
    async fn get_plugin(&self, id: Uuid) -> Result<Option<Plugin>>;

    /// Look a plugin up by UUID or slug.
    async fn find_plugin(&self, id_or_slug: &str) -> Result<Option<Plugin>>;

    /// All installed plugins, ordered by slug.
    async fn list_plugins(&self) -> Result<Vec<Plugin>>;

    /// Every fragment of a plugin regardless of liveness, optionally of one
    /// kind, ordered by kind then name.
    async fn list_fragments(
        &self,
        plugin_id: Uuid,
        kind: Option<FragmentKind>,
    ) -> Result<Vec<SourceFragment>>;

    /// A single live fragment.
    async fn get_live_fragment(
        &self,
        plugin_id: Uuid,
        kind: FragmentKind,
        name: &str,
    ) -> Result<Option<SourceFragment>>;

    async fn list_enabled_listeners(&self, event_name: &str) -> Result<Vec<SourceFragment>>;

    /// Live `script` fragments whose `extra.hook` equals `hook_name`.
    async fn list_enabled_hook_handlers(&self, hook_name: &str) -> Result<Vec<SourceFragment>>;

    async fn list_enabled_controllers(&self, plugin_id: Uuid) -> Result<Vec<SourceFragment>>;

    /// Live widgets with the given name, across plugins.
    async fn list_enabled_widgets(&self, name: &str) -> Result<Vec<SourceFragment>>;

    /// Live widgets placed in a layout slot.
    async fn list_enabled_slot_widgets(&self, slot: &str) -> Result<Vec<SourceFragment>>;
}
