//! Widget mount - resolves named widgets into instantiable components.
//!
//! A widget is a live `widget` fragment called with `(config, slot_data)`.
//! String results are treated as HTML and sanitized; any other value is
//! passed to the layout renderer as component data. Nothing a widget does
//! wrong escapes this module: compile errors, throws, timeouts and registry
//! failures all render as a neutral placeholder.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error};
use uuid::Uuid;

use crate::models::SourceFragment;
use crate::plugin::{Callable, ExtensionPoint, InvocationError, PluginRuntime};
use crate::report::{FailureCause, FailureKind, FailureReport};

/// Sanitize plugin-produced markup.
pub fn sanitize_html(input: &str) -> String {
    ammonia::clean(input)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum WidgetBody {
    Html(String),
    Component(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedWidget {
    pub name: String,
    pub plugin_id: Option<Uuid>,
    pub body: WidgetBody,
    pub placeholder: bool,
}

impl RenderedWidget {
    fn from_output(fragment: &SourceFragment, output: Value) -> Self {
        let body = match output {
            Value::String(html) => WidgetBody::Html(sanitize_html(&html)),
            other => WidgetBody::Component(other),
        };
        Self {
            name: fragment.name.clone(),
            plugin_id: Some(fragment.plugin_id),
            body,
            placeholder: false,
        }
    }
}

/// Stand-in rendered where a widget could not be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub name: String,
    pub plugin_id: Option<Uuid>,
}

impl Placeholder {
    pub fn render(&self) -> RenderedWidget {
        RenderedWidget {
            name: self.name.clone(),
            plugin_id: self.plugin_id,
            body: WidgetBody::Html(format!(
                r#"<div class="widget-placeholder" data-widget="{}"></div>"#,
                ammonia::clean_text(&self.name)
            )),
            placeholder: true,
        }
    }
}

/// A compiled widget, ready to be instantiated any number of times.
#[derive(Clone)]
pub struct ComponentFactory {
    runtime: Arc<PluginRuntime>,
    fragment: SourceFragment,
    unit: Callable,
}

impl ComponentFactory {
    pub fn name(&self) -> &str {
        &self.fragment.name
    }

    pub fn plugin_id(&self) -> Uuid {
        self.fragment.plugin_id
    }

    /// `default_config` shallow-merged with slot-provided overrides.
    pub fn config(&self, overrides: Map<String, Value>) -> Map<String, Value> {
        let mut config = self.fragment.default_config();
        config.extend(overrides);
        config
    }

    /// Run the widget. Failures are reported and render as a placeholder.
    pub async fn instantiate(&self, overrides: Map<String, Value>, slot_data: Value) -> RenderedWidget {
        let config = Value::Object(self.config(overrides));
        match self
            .runtime
            .run(&self.unit, ExtensionPoint::Widget, vec![config, slot_data])
            .await
        {
            Ok(output) => RenderedWidget::from_output(&self.fragment, output),
            Err(err) => {
                self.runtime
                    .report(FailureKind::WidgetRender, &self.fragment.name, &self.fragment, &err);
                placeholder_for(&self.fragment).render()
            }
        }
    }
}

impl std::fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentFactory")
            .field("name", &self.fragment.name)
            .field("plugin_id", &self.fragment.plugin_id)
            .field("body_hash", &self.unit.body_hash)
            .finish()
    }
}

#[derive(Debug)]
pub enum WidgetResolution {
    Component(ComponentFactory),
    Placeholder(Placeholder),
    NotFound,
}

fn placeholder_for(fragment: &SourceFragment) -> Placeholder {
    Placeholder {
        name: fragment.name.clone(),
        plugin_id: Some(fragment.plugin_id),
    }
}

#[derive(Clone)]
pub struct WidgetMount {
    runtime: Arc<PluginRuntime>,
}

impl WidgetMount {
    pub fn new(runtime: Arc<PluginRuntime>) -> Self {
        Self { runtime }
    }

    fn report_registry(&self, context: &str, e: &anyhow::Error) {
        error!(widget = %context, error = %e, "failed to load widgets");
        self.runtime.reporter().report(
            FailureReport::new(FailureKind::WidgetRender, FailureCause::Registry, context)
                .with_message(format!("{e:#}")),
        );
    }

    fn compile(&self, fragment: SourceFragment) -> Result<ComponentFactory, Placeholder> {
        match self.runtime.compiler().compile(&fragment) {
            Ok(unit) => Ok(ComponentFactory {
                runtime: self.runtime.clone(),
                fragment,
                unit,
            }),
            Err(e) => {
                let err = InvocationError::from(e);
                self.runtime
                    .report(FailureKind::WidgetRender, &fragment.name, &fragment, &err);
                Err(placeholder_for(&fragment))
            }
        }
    }

    /// Resolve a widget by name. When several plugins provide it, the first
    /// in binding order wins.
    pub async fn resolve(&self, name: &str) -> WidgetResolution {
        let candidates = match self.runtime.registry().list_enabled_widgets(name).await {
            Ok(candidates) => candidates,
            Err(e) => {
                self.report_registry(name, &e);
                return WidgetResolution::Placeholder(Placeholder {
                    name: name.to_string(),
                    plugin_id: None,
                });
            }
        };

        let Some(fragment) = candidates.into_iter().next() else {
            return WidgetResolution::NotFound;
        };

        match self.compile(fragment) {
            Ok(factory) => WidgetResolution::Component(factory),
            Err(placeholder) => WidgetResolution::Placeholder(placeholder),
        }
    }

    /// Resolve and instantiate in one step; `None` when no such widget.
    pub async fn render(
        &self,
        name: &str,
        overrides: Map<String, Value>,
        slot_data: Value,
    ) -> Option<RenderedWidget> {
        match self.resolve(name).await {
            WidgetResolution::Component(factory) => Some(factory.instantiate(overrides, slot_data).await),
            WidgetResolution::Placeholder(placeholder) => Some(placeholder.render()),
            WidgetResolution::NotFound => None,
        }
    }

    /// Render every live widget placed in `slot`, in binding order.
    pub async fn render_slot(&self, slot: &str, slot_data: Value) -> Vec<RenderedWidget> {
        let widgets = match self.runtime.registry().list_enabled_slot_widgets(slot).await {
            Ok(widgets) => widgets,
            Err(e) => {
                self.report_registry(slot, &e);
                return Vec::new();
            }
        };

        let mut rendered = Vec::with_capacity(widgets.len());
        for fragment in widgets {
            let widget = match self.compile(fragment) {
                Ok(factory) => factory.instantiate(Map::new(), slot_data.clone()).await,
                Err(placeholder) => placeholder.render(),
            };
            rendered.push(widget);
        }

        debug!(
            slot = %slot,
            widgets = rendered.len(),
            placeholders = rendered.iter().filter(|w| w.placeholder).count(),
            "slot rendered"
        );
        rendered
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_escapes_name() {
        let p = Placeholder {
            name: "<b>x</b>".into(),
            plugin_id: None,
        };
        let rendered = p.render();
        assert!(rendered.placeholder);
        let WidgetBody::Html(html) = rendered.body else {
            panic!("placeholder renders html");
        };
        assert!(!html.contains("<b>"));
        assert!(html.contains("widget-placeholder"));
    }

    #[test]
    fn sanitize_strips_scripts() {
        let out = sanitize_html(r#"<p>hi</p><script>alert(1)</script>"#);
        assert_eq!(out, "<p>hi</p>");
    }
}
