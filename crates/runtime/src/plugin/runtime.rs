//! Plugin runtime: the shared core every extension point dispatches through.
//!
//! Owns the registry handle, the compiler cache, the capability backends and
//! the failure reporter. The event bus, hook chain, router and widget mount
//! are thin layers over [`PluginRuntime::invoke`].

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::compiler::{Compiler, FragmentState};
use super::error::{CompileError, InvocationError};
use super::unit::{CompiledUnit, Limits};
use crate::config::RuntimeConfig;
use crate::host::HostServices;
use crate::metrics::Metrics;
use crate::models::{FragmentKind, Plugin, SourceFragment};
use crate::registry::Registry;
use crate::report::{FailureKind, FailureReport, FailureReporter};

/// Call site a fragment is invoked from. Determines the timeout applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionPoint {
    Script,
    Listener,
    Hook,
    Controller,
    Widget,
}

impl ExtensionPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Listener => "event_listener",
            Self::Hook => "hook",
            Self::Controller => "controller",
            Self::Widget => "widget",
        }
    }
}

/// Compile diagnostics for one fragment.
#[derive(Debug, Clone, Serialize)]
pub struct FragmentDiagnostic {
    pub kind: FragmentKind,
    pub name: String,
    pub priority: i32,
    pub state: FragmentState,
    pub error: Option<CompileError>,
}

/// Result of compiling every fragment of a plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginCheck {
    pub plugin: Plugin,
    pub fragments: Vec<FragmentDiagnostic>,
}

impl PluginCheck {
    pub fn broken(&self) -> usize {
        self.fragments.iter().filter(|f| f.error.is_some()).count()
    }
}

/// Navigation entry contributed by a live plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavigationItem {
    pub plugin: String,
    pub title: String,
    pub path: String,
    pub weight: i32,
}

pub struct PluginRuntime {
    registry: Arc<dyn Registry>,
    compiler: Compiler,
    services: HostServices,
    reporter: FailureReporter,
    metrics: Arc<Metrics>,
    config: RuntimeConfig,
}

impl PluginRuntime {
    pub fn new(
        registry: Arc<dyn Registry>,
        services: HostServices,
        config: RuntimeConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            compiler: Compiler::new(config.max_source_bytes, metrics.clone()),
            services,
            reporter: FailureReporter::new(metrics.clone()),
            metrics,
            config,
        }
    }

    pub fn registry(&self) -> &dyn Registry {
        self.registry.as_ref()
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn reporter(&self) -> &FailureReporter {
        &self.reporter
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn limits(&self, point: ExtensionPoint) -> Limits {
        let timeout = match point {
            ExtensionPoint::Listener => self.config.listener_timeout,
            ExtensionPoint::Hook => self.config.hook_timeout,
            ExtensionPoint::Widget => self.config.widget_timeout,
            ExtensionPoint::Script | ExtensionPoint::Controller => self.config.controller_timeout,
        };
        Limits {
            step_budget: self.config.step_budget,
            max_value_size: self.config.max_value_size,
            timeout,
        }
    }

    /// Compile (or fetch from cache) and run a fragment.
    pub async fn invoke(
        &self,
        fragment: &SourceFragment,
        point: ExtensionPoint,
        args: Vec<Value>,
    ) -> Result<Value, InvocationError> {
        let unit = self.compiler.compile(fragment)?;
        self.run(&unit, point, args).await
    }

    /// Run an already compiled unit.
    pub async fn run(
        &self,
        unit: &CompiledUnit,
        point: ExtensionPoint,
        args: Vec<Value>,
    ) -> Result<Value, InvocationError> {
        let start = Instant::now();
        let result = unit
            .call_with_limits(args, &self.services, self.limits(point))
            .await;
        self.metrics.record_invocation(
            point.as_str(),
            result.is_ok(),
            start.elapsed().as_secs_f64(),
        );
        result
    }

    /// Report a contained invocation failure.
    pub fn report(
        &self,
        kind: FailureKind,
        context: &str,
        fragment: &SourceFragment,
        err: &InvocationError,
    ) {
        self.reporter.report(FailureReport::invocation(
            kind,
            context,
            fragment.plugin_id,
            &fragment.name,
            err,
        ));
    }

    /// Resolve a plugin by id or slug, only if it is live.
    pub async fn find_live_plugin(&self, id_or_slug: &str) -> Result<Option<Plugin>> {
        Ok(self
            .registry
            .find_plugin(id_or_slug)
            .await?
            .filter(Plugin::is_live))
    }

    /// Invoke a plugin's named `script` fragment directly with one input.
    pub async fn invoke_script(
        &self,
        plugin: &str,
        name: &str,
        input: Value,
    ) -> Result<Value, InvocationError> {
        let context = format!("{plugin}/{name}");
        let fragment = match self.lookup_script(plugin, name).await {
            Ok(Some(fragment)) => fragment,
            Ok(None) => return Err(InvocationError::NotFound(format!("script '{context}'"))),
            Err(e) => {
                let err = InvocationError::Registry(format!("{e:#}"));
                self.reporter.report(
                    FailureReport::new(
                        FailureKind::Script,
                        crate::report::FailureCause::Registry,
                        &context,
                    )
                    .with_message(err.to_string()),
                );
                return Err(err);
            }
        };

        let result = self
            .invoke(&fragment, ExtensionPoint::Script, vec![input])
            .await;
        if let Err(err) = &result {
            self.report(FailureKind::Script, &context, &fragment, err);
        }
        result
    }

    async fn lookup_script(&self, plugin: &str, name: &str) -> Result<Option<SourceFragment>> {
        let Some(plugin) = self.find_live_plugin(plugin).await? else {
            return Ok(None);
        };
        self.registry
            .get_live_fragment(plugin.id, FragmentKind::Script, name)
            .await
    }

    /// Compile every fragment of a plugin, enabled or not, and report the
    /// resulting states.
    pub async fn check_plugin(&self, id_or_slug: &str) -> Result<Option<PluginCheck>> {
        let Some(plugin) = self
            .registry
            .find_plugin(id_or_slug)
            .await
            .context("failed to look up plugin")?
        else {
            return Ok(None);
        };

        let fragments = self
            .registry
            .list_fragments(plugin.id, None)
            .await
            .context("failed to list plugin fragments")?;

        let diagnostics = fragments
            .iter()
            .map(|fragment| {
                let error = self.compiler.compile(fragment).err();
                FragmentDiagnostic {
                    kind: fragment.kind,
                    name: fragment.name.clone(),
                    priority: fragment.priority,
                    state: self.compiler.state_of(fragment),
                    error,
                }
            })
            .collect();

        debug!(plugin = %plugin.slug, "checked plugin fragments");
        Ok(Some(PluginCheck {
            plugin,
            fragments: diagnostics,
        }))
    }

    /// Navigation entries from live plugin manifests, by weight then title.
    pub async fn navigation(&self) -> Result<Vec<NavigationItem>> {
        let plugins = self
            .registry
            .list_plugins()
            .await
            .context("failed to list plugins")?;

        let mut items: Vec<NavigationItem> = plugins
            .into_iter()
            .filter(Plugin::is_live)
            .flat_map(|plugin| {
                let slug = plugin.slug;
                plugin
                    .manifest
                    .navigation
                    .into_iter()
                    .map(move |entry| NavigationItem {
                        plugin: slug.clone(),
                        title: entry.title,
                        path: entry.path,
                        weight: entry.weight,
                    })
            })
            .collect();

        items.sort_by(|a, b| (a.weight, &a.title).cmp(&(b.weight, &b.title)));
        Ok(items)
    }
}
