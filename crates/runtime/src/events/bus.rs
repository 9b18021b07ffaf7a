//! Event bus - dispatches lifecycle events to plugin listeners.
//!
//! Listeners run one at a time in binding order. A listener that fails to
//! compile, throws or times out is recorded as a failed outcome and reported;
//! the remaining listeners still run.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use crate::plugin::{ExtensionPoint, InvocationError, PluginRuntime};
use crate::report::{FailureCause, FailureKind, FailureReport};

/// Result of one listener invocation.
#[derive(Debug, Clone)]
pub struct ListenerOutcome {
    pub plugin_id: Uuid,
    pub fragment_id: Uuid,
    pub listener: String,
    pub priority: i32,
    /// The listener's return value (informational) or why it failed.
    pub result: Result<Value, InvocationError>,
}

impl ListenerOutcome {
    pub fn is_failure(&self) -> bool {
        self.result.is_err()
    }
}

#[derive(Clone)]
pub struct EventBus {
    runtime: Arc<PluginRuntime>,
}

impl EventBus {
    pub fn new(runtime: Arc<PluginRuntime>) -> Self {
        Self { runtime }
    }

    /// Dispatch an event to every live listener, in priority order.
    ///
    /// Returns one outcome per listener. A registry failure is reported and
    /// yields no outcomes.
    pub async fn dispatch(&self, event_name: &str, payload: Value) -> Vec<ListenerOutcome> {
        let listeners = match self.runtime.registry().list_enabled_listeners(event_name).await {
            Ok(listeners) => listeners,
            Err(e) => {
                error!(event = %event_name, error = %e, "failed to load event listeners");
                self.runtime.reporter().report(
                    FailureReport::new(FailureKind::Listener, FailureCause::Registry, event_name)
                        .with_message(format!("{e:#}")),
                );
                return Vec::new();
            }
        };

        if listeners.is_empty() {
            debug!(event = %event_name, "no listeners registered for event");
            return Vec::new();
        }

        let mut outcomes = Vec::with_capacity(listeners.len());
        for listener in &listeners {
            let result = self
                .runtime
                .invoke(listener, ExtensionPoint::Listener, vec![payload.clone()])
                .await;

            if let Err(err) = &result {
                self.runtime
                    .report(FailureKind::Listener, event_name, listener, err);
            }

            outcomes.push(ListenerOutcome {
                plugin_id: listener.plugin_id,
                fragment_id: listener.id,
                listener: listener.name.clone(),
                priority: listener.priority,
                result,
            });
        }

        debug!(
            event = %event_name,
            listeners = outcomes.len(),
            failed = outcomes.iter().filter(|o| o.is_failure()).count(),
            "dispatch complete"
        );

        outcomes
    }

    /// Dispatch on a background task so the triggering operation is never
    /// delayed by listeners. Failures still go through the reporter.
    pub fn dispatch_detached(
        &self,
        event_name: impl Into<String>,
        payload: Value,
    ) -> JoinHandle<Vec<ListenerOutcome>> {
        let bus = self.clone();
        let event_name = event_name.into();
        tokio::spawn(async move { bus.dispatch(&event_name, payload).await })
    }
}
