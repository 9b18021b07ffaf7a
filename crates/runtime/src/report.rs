//! Failure reporting channel.
//!
//! Every failure the runtime contains (a listener that threw, a hook that
//! aborted, a widget rendered as a placeholder...) is reported here: it is
//! logged, counted and broadcast to subscribers.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::plugin::InvocationError;
use crate::script::ExecError;

/// Capacity of the broadcast buffer; slow subscribers observe `Lagged`.
const CHANNEL_CAPACITY: usize = 256;

/// Where a failure was contained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Listener,
    Hook,
    Controller,
    WidgetRender,
    Script,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Listener => "listener",
            Self::Hook => "hook",
            Self::Controller => "controller",
            Self::WidgetRender => "widget_render",
            Self::Script => "script",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Compile,
    CapabilityViolation,
    Thrown,
    Runtime,
    Timeout,
    Registry,
}

impl FailureCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::CapabilityViolation => "capability_violation",
            Self::Thrown => "thrown",
            Self::Runtime => "runtime",
            Self::Timeout => "timeout",
            Self::Registry => "registry",
        }
    }

    pub fn of(err: &InvocationError) -> Self {
        match err {
            InvocationError::Compile(_) => Self::Compile,
            InvocationError::TimedOut(_) => Self::Timeout,
            InvocationError::Execution(ExecError::Thrown(_)) => Self::Thrown,
            InvocationError::Execution(ExecError::Capability(_)) => Self::CapabilityViolation,
            InvocationError::Execution(_) => Self::Runtime,
            InvocationError::NotFound(_) | InvocationError::Registry(_) => Self::Registry,
        }
    }
}

/// One contained failure.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub cause: FailureCause,
    pub plugin_id: Option<Uuid>,
    pub fragment: Option<String>,
    /// Event, hook, route or widget name the failure happened under.
    pub context: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl FailureReport {
    pub fn new(kind: FailureKind, cause: FailureCause, context: impl Into<String>) -> Self {
        Self {
            kind,
            cause,
            plugin_id: None,
            fragment: None,
            context: context.into(),
            message: String::new(),
            at: Utc::now(),
        }
    }

    /// Report for a failed fragment invocation.
    pub fn invocation(
        kind: FailureKind,
        context: impl Into<String>,
        plugin_id: Uuid,
        fragment: &str,
        err: &InvocationError,
    ) -> Self {
        Self {
            plugin_id: Some(plugin_id),
            fragment: Some(fragment.to_string()),
            message: err.to_string(),
            ..Self::new(kind, FailureCause::of(err), context)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

pub struct FailureReporter {
    sender: broadcast::Sender<FailureReport>,
    metrics: Arc<Metrics>,
}

impl FailureReporter {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender, metrics }
    }

    /// Receive every report sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<FailureReport> {
        self.sender.subscribe()
    }

    pub fn report(&self, report: FailureReport) {
        warn!(
            kind = %report.kind,
            cause = report.cause.as_str(),
            plugin = ?report.plugin_id,
            fragment = report.fragment.as_deref().unwrap_or("-"),
            context = %report.context,
            error = %report.message,
            "plugin failure contained"
        );
        self.metrics
            .record_failure(report.kind.as_str(), report.cause.as_str());
        // No subscribers is fine.
        let _ = self.sender.send(report);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn causes_classify_invocation_errors() {
        let thrown = InvocationError::Execution(ExecError::Thrown(json!("x")));
        assert_eq!(FailureCause::of(&thrown), FailureCause::Thrown);
        let timeout = InvocationError::TimedOut(Duration::from_millis(5));
        assert_eq!(FailureCause::of(&timeout), FailureCause::Timeout);
    }

    #[tokio::test]
    async fn reports_reach_subscribers_and_metrics() {
        let metrics = Arc::new(Metrics::new());
        let reporter = FailureReporter::new(metrics.clone());
        let mut rx = reporter.subscribe();

        reporter.report(
            FailureReport::new(FailureKind::Hook, FailureCause::Thrown, "order.total")
                .with_message("boom"),
        );

        let got = rx.recv().await.unwrap();
        assert_eq!(got.kind, FailureKind::Hook);
        assert_eq!(got.context, "order.total");
        assert!(metrics.encode().contains("kind=\"hook\""));
    }

    #[test]
    fn reporting_without_subscribers_is_fine() {
        let reporter = FailureReporter::new(Arc::new(Metrics::new()));
        reporter.report(FailureReport::new(
            FailureKind::Script,
            FailureCause::Registry,
            "x",
        ));
    }
}
