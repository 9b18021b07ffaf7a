//! Hook chain - filter-style pipelines over a threaded value.
//!
//! Handlers are live `script` fragments whose `extra.hook` names the hook.
//! Each handler receives the previous handler's output. The chain fails
//! open: when a handler cannot produce a value, the value it was given is
//! returned and no later handler runs.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use crate::plugin::{ExtensionPoint, InvocationError, PluginRuntime};
use crate::report::{FailureCause, FailureKind, FailureReport};

/// The handler that aborted a chain.
#[derive(Debug, Clone)]
pub struct HookFailure {
    pub plugin_id: Option<uuid::Uuid>,
    pub handler: Option<String>,
    pub error: InvocationError,
}

/// Full result of running a chain.
#[derive(Debug, Clone)]
pub struct HookRun {
    pub value: Value,
    /// Handlers whose output was accepted.
    pub applied: usize,
    pub failure: Option<HookFailure>,
}

#[derive(Clone)]
pub struct HookChain {
    runtime: Arc<PluginRuntime>,
}

impl HookChain {
    pub fn new(runtime: Arc<PluginRuntime>) -> Self {
        Self { runtime }
    }

    /// `Hn(...H1(value))`, or the input of the first handler that fails.
    pub async fn run(&self, hook_name: &str, value: Value) -> Value {
        self.run_traced(hook_name, value).await.value
    }

    pub async fn run_traced(&self, hook_name: &str, value: Value) -> HookRun {
        let handlers = match self
            .runtime
            .registry()
            .list_enabled_hook_handlers(hook_name)
            .await
        {
            Ok(handlers) => handlers,
            Err(e) => {
                error!(hook = %hook_name, error = %e, "failed to load hook handlers");
                let message = format!("{e:#}");
                self.runtime.reporter().report(
                    FailureReport::new(FailureKind::Hook, FailureCause::Registry, hook_name)
                        .with_message(message.clone()),
                );
                return HookRun {
                    value,
                    applied: 0,
                    failure: Some(HookFailure {
                        plugin_id: None,
                        handler: None,
                        error: InvocationError::Registry(message),
                    }),
                };
            }
        };

        let mut value = value;
        let mut applied = 0;
        for handler in &handlers {
            match self
                .runtime
                .invoke(handler, ExtensionPoint::Hook, vec![value.clone()])
                .await
            {
                Ok(next) => {
                    value = next;
                    applied += 1;
                }
                Err(err) => {
                    self.runtime
                        .report(FailureKind::Hook, hook_name, handler, &err);
                    return HookRun {
                        value,
                        applied,
                        failure: Some(HookFailure {
                            plugin_id: Some(handler.plugin_id),
                            handler: Some(handler.name.clone()),
                            error: err,
                        }),
                    };
                }
            }
        }

        debug!(hook = %hook_name, handlers = applied, "hook chain complete");
        HookRun {
            value,
            applied,
            failure: None,
        }
    }
}
