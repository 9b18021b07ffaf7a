//! Compiled, invocable fragments.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::error::InvocationError;
use crate::host::HostServices;
use crate::models::FragmentKind;
use crate::script::{self, Budget, ExecError, Function};

/// Execution bounds for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Interpreter steps before the run is aborted.
    pub step_budget: u64,
    /// Largest value the run may build.
    pub max_value_size: usize,
    /// Wall-clock bound.
    pub timeout: Duration,
}

/// A fragment compiled against the capability surface.
#[derive(Debug)]
pub struct CompiledUnit {
    pub source_fragment_id: Uuid,
    pub plugin_id: Uuid,
    pub kind: FragmentKind,
    pub name: String,
    pub compiled_at: DateTime<Utc>,
    /// Hex SHA-256 of the body this unit was compiled from.
    pub body_hash: String,
    function: Function,
}

/// Shared handle to a compiled unit. Cache hits hand out the same `Arc`.
pub type Callable = Arc<CompiledUnit>;

impl CompiledUnit {
    pub(crate) fn new(
        fragment: &crate::models::SourceFragment,
        body_hash: String,
        function: Function,
    ) -> Self {
        Self {
            source_fragment_id: fragment.id,
            plugin_id: fragment.plugin_id,
            kind: fragment.kind,
            name: fragment.name.clone(),
            compiled_at: Utc::now(),
            body_hash,
            function,
        }
    }

    /// Declared parameter names.
    pub fn params(&self) -> &[String] {
        &self.function.params
    }

    /// Run the unit with a capability record scoped to its plugin.
    pub async fn call(
        &self,
        args: Vec<Value>,
        services: &HostServices,
        budget: Budget,
    ) -> Result<Value, ExecError> {
        let capabilities = services.capabilities(self.plugin_id, &self.name);
        script::execute(&self.function, args, &capabilities, budget).await
    }

    /// Run the unit, abandoning it when `limits.timeout` elapses.
    pub async fn call_with_limits(
        &self,
        args: Vec<Value>,
        services: &HostServices,
        limits: Limits,
    ) -> Result<Value, InvocationError> {
        let budget = Budget {
            steps: limits.step_budget,
            value_size: limits.max_value_size,
        };
        match tokio::time::timeout(limits.timeout, self.call(args, services, budget)).await {
            Ok(result) => result.map_err(InvocationError::from),
            Err(_) => Err(InvocationError::TimedOut(limits.timeout)),
        }
    }
}
