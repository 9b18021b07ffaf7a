//! PostgreSQL-backed registry over the `plugin` and `plugin_source` tables.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use super::Registry;
use crate::models::{FragmentKind, Plugin, PluginManifest, SourceFragment};

const PLUGIN_COLUMNS: &str = "id, name, slug, manifest, status, is_enabled";

const FRAGMENT_COLUMNS: &str =
    "s.id, s.plugin_id, s.kind, s.name, s.body, s.is_enabled, s.priority, s.extra, s.updated_at";

/// Join and filter shared by every live-fragment query.
const LIVE_FROM: &str = "FROM plugin_source s JOIN plugin p ON p.id = s.plugin_id \
     WHERE s.is_enabled AND p.is_enabled AND p.status = 'active'";

/// Binding order: byte-wise name collation so the result matches in-memory sorting.
const LIVE_ORDER: &str = "ORDER BY s.priority, s.plugin_id, s.name COLLATE \"C\"";

#[derive(sqlx::FromRow)]
struct PluginRow {
    id: Uuid,
    name: String,
    slug: String,
    manifest: Json<PluginManifest>,
    status: String,
    is_enabled: bool,
}

impl TryFrom<PluginRow> for Plugin {
    type Error = anyhow::Error;

    fn try_from(row: PluginRow) -> Result<Self> {
        let status = row
            .status
            .parse()
            .with_context(|| format!("plugin '{}' has an invalid status", row.slug))?;
        Ok(Plugin {
            id: row.id,
            name: row.name,
            slug: row.slug,
            manifest: row.manifest.0,
            status,
            is_enabled: row.is_enabled,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FragmentRow {
    id: Uuid,
    plugin_id: Uuid,
    kind: String,
    name: String,
    body: String,
    is_enabled: bool,
    priority: i32,
    extra: serde_json::Value,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FragmentRow> for SourceFragment {
    type Error = anyhow::Error;

    fn try_from(row: FragmentRow) -> Result<Self> {
        Ok(SourceFragment {
            id: row.id,
            plugin_id: row.plugin_id,
            kind: row
                .kind
                .parse()
                .with_context(|| format!("fragment '{}' has an invalid kind", row.name))?,
            name: row.name,
            body: row.body,
            is_enabled: row.is_enabled,
            priority: row.priority,
            extra: row.extra,
            updated_at: row.updated_at,
        })
    }
}

fn into_fragments(rows: Vec<FragmentRow>) -> Result<Vec<SourceFragment>> {
    rows.into_iter().map(SourceFragment::try_from).collect()
}

/// Registry reading plugin rows straight from PostgreSQL on every lookup.
#[derive(Clone)]
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn live_where(&self, condition: &str, bind: &str) -> Result<Vec<SourceFragment>> {
        let sql = format!("SELECT {FRAGMENT_COLUMNS} {LIVE_FROM} AND {condition} {LIVE_ORDER}");
        let rows = sqlx::query_as::<_, FragmentRow>(&sql)
            .bind(bind)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to list live fragments ({condition})"))?;
        into_fragments(rows)
    }
}

#[async_trait]
impl Registry for PgRegistry {
    async fn get_plugin(&self, id: Uuid) -> Result<Option<Plugin>> {
        let row = sqlx::query_as::<_, PluginRow>(&format!(
            "SELECT {PLUGIN_COLUMNS} FROM plugin WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load plugin")?;

        row.map(Plugin::try_from).transpose()
    }

    async fn find_plugin(&self, id_or_slug: &str) -> Result<Option<Plugin>> {
        let id = Uuid::parse_str(id_or_slug).ok();
        let row = sqlx::query_as::<_, PluginRow>(&format!(
            "SELECT {PLUGIN_COLUMNS} FROM plugin WHERE slug = $1 OR id = $2 LIMIT 1"
        ))
        .bind(id_or_slug)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to find plugin")?;

        row.map(Plugin::try_from).transpose()
    }

    async fn list_plugins(&self) -> Result<Vec<Plugin>> {
        let rows = sqlx::query_as::<_, PluginRow>(&format!(
            "SELECT {PLUGIN_COLUMNS} FROM plugin ORDER BY slug"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to list plugins")?;

        rows.into_iter().map(Plugin::try_from).collect()
    }

    async fn list_fragments(
        &self,
        plugin_id: Uuid,
        kind: Option<FragmentKind>,
    ) -> Result<Vec<SourceFragment>> {
        let rows = sqlx::query_as::<_, FragmentRow>(&format!(
            "SELECT {FRAGMENT_COLUMNS} FROM plugin_source s \
             WHERE s.plugin_id = $1 AND ($2::text IS NULL OR s.kind = $2) \
             ORDER BY s.kind, s.name COLLATE \"C\""
        ))
        .bind(plugin_id)
        .bind(kind.map(FragmentKind::as_str))
        .fetch_all(&self.pool)
        .await
        .context("failed to list plugin fragments")?;

        into_fragments(rows)
    }

    async fn get_live_fragment(
        &self,
        plugin_id: Uuid,
        kind: FragmentKind,
        name: &str,
    ) -> Result<Option<SourceFragment>> {
        let row = sqlx::query_as::<_, FragmentRow>(&format!(
            "SELECT {FRAGMENT_COLUMNS} {LIVE_FROM} \
             AND s.plugin_id = $1 AND s.kind = $2 AND s.name = $3"
        ))
        .bind(plugin_id)
        .bind(kind.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load fragment")?;

        row.map(SourceFragment::try_from).transpose()
    }

    async fn list_enabled_listeners(&self, event_name: &str) -> Result<Vec<SourceFragment>> {
        self.live_where("s.kind = 'event_listener' AND s.extra->>'event_name' = $1", event_name)
            .await
    }

    async fn list_enabled_hook_handlers(&self, hook_name: &str) -> Result<Vec<SourceFragment>> {
        self.live_where("s.kind = 'script' AND s.extra->>'hook' = $1", hook_name)
            .await
    }

    async fn list_enabled_controllers(&self, plugin_id: Uuid) -> Result<Vec<SourceFragment>> {
        let rows = sqlx::query_as::<_, FragmentRow>(&format!(
            "SELECT {FRAGMENT_COLUMNS} {LIVE_FROM} \
             AND s.kind = 'controller' AND s.plugin_id = $1 {LIVE_ORDER}"
        ))
        .bind(plugin_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list controllers")?;

        into_fragments(rows)
    }

    async fn list_enabled_widgets(&self, name: &str) -> Result<Vec<SourceFragment>> {
        self.live_where("s.kind = 'widget' AND s.name = $1", name)
            .await
    }

    async fn list_enabled_slot_widgets(&self, slot: &str) -> Result<Vec<SourceFragment>> {
        self.live_where("s.kind = 'widget' AND s.extra->>'slot' = $1", slot)
            .await
    }
}
