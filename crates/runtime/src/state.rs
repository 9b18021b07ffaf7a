//! Application state shared across all handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

use crate::config::{Config, RuntimeConfig};
use crate::db;
use crate::events::{EventBus, HookChain};
use crate::host::{DataStore, HostAllowlist, HostServices, OutboundHttp, PgDataStore, ReqwestHttp};
use crate::metrics::Metrics;
use crate::plugin::PluginRuntime;
use crate::registry::{PgRegistry, Registry};
use crate::router::DynamicRouter;
use crate::widget::WidgetMount;

/// Shared application state.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// PostgreSQL connection pool; absent when running on in-memory backends.
    db: Option<PgPool>,

    metrics: Arc<Metrics>,
    runtime: Arc<PluginRuntime>,
    bus: EventBus,
    hooks: HookChain,
    router: DynamicRouter,
    widgets: WidgetMount,
}

impl AppState {
    /// Connect to PostgreSQL, apply the schema and wire the runtime over it.
    pub async fn new(config: &Config) -> Result<Self> {
        let pool = db::create_pool(config)
            .await
            .context("failed to create database pool")?;
        db::ensure_schema(&pool).await?;
        info!("Database schema ready");

        let http = ReqwestHttp::new(config.runtime.http_timeout)
            .context("failed to build outbound HTTP client")?;

        Ok(Self::with_backends(
            Arc::new(PgRegistry::new(pool.clone())),
            Arc::new(PgDataStore::new(pool.clone())),
            Arc::new(http),
            config.runtime.clone(),
            Some(pool),
        ))
    }

    /// Wire the runtime over arbitrary backends.
    pub fn with_backends(
        registry: Arc<dyn Registry>,
        data: Arc<dyn DataStore>,
        http: Arc<dyn OutboundHttp>,
        config: RuntimeConfig,
        db: Option<PgPool>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let allowlist = HostAllowlist::new(config.http_allowed_hosts.iter());
        let services = HostServices::new(data, http, allowlist);
        let runtime = Arc::new(PluginRuntime::new(
            registry,
            services,
            config,
            metrics.clone(),
        ));

        Self {
            inner: Arc::new(AppStateInner {
                db,
                metrics,
                bus: EventBus::new(runtime.clone()),
                hooks: HookChain::new(runtime.clone()),
                router: DynamicRouter::new(runtime.clone()),
                widgets: WidgetMount::new(runtime.clone()),
                runtime,
            }),
        }
    }

    pub fn db(&self) -> Option<&PgPool> {
        self.inner.db.as_ref()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn runtime(&self) -> &Arc<PluginRuntime> {
        &self.inner.runtime
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn hooks(&self) -> &HookChain {
        &self.inner.hooks
    }

    pub fn router(&self) -> &DynamicRouter {
        &self.inner.router
    }

    pub fn widgets(&self) -> &WidgetMount {
        &self.inner.widgets
    }

    /// `None` when there is no database to check.
    pub async fn postgres_healthy(&self) -> Option<bool> {
        match &self.inner.db {
            Some(pool) => Some(db::check_health(pool).await),
            None => None,
        }
    }
}
