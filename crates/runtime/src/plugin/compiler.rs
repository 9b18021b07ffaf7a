//! Fragment compiler with a content-addressed cache.
//!
//! Units are cached per (plugin, kind, name) together with the SHA-256 of the
//! body they were built from. A lookup whose body hash differs from the
//! cached one recompiles and replaces the entry, so an edited fragment is
//! never served from a stale unit. Compile failures are cached the same way:
//! a broken fragment is not reparsed until its body changes.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::CompileError;
use super::unit::{Callable, CompiledUnit};
use crate::host::CAPABILITY_SURFACE;
use crate::metrics::Metrics;
use crate::models::{FragmentKind, SourceFragment};
use crate::script::{self, SyntaxError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    plugin_id: Uuid,
    kind: FragmentKind,
    name: String,
}

impl CacheKey {
    fn of(fragment: &SourceFragment) -> Self {
        Self {
            plugin_id: fragment.plugin_id,
            kind: fragment.kind,
            name: fragment.name.clone(),
        }
    }
}

enum Slot {
    Compiled(Callable),
    Broken { body_hash: String, error: CompileError },
}

impl Slot {
    fn body_hash(&self) -> &str {
        match self {
            Slot::Compiled(unit) => &unit.body_hash,
            Slot::Broken { body_hash, .. } => body_hash,
        }
    }

    fn result(&self) -> Result<Callable, CompileError> {
        match self {
            Slot::Compiled(unit) => Ok(Arc::clone(unit)),
            Slot::Broken { error, .. } => Err(error.clone()),
        }
    }
}

/// Lifecycle state of a fragment as seen by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentState {
    /// Excluded from every binding.
    Disabled,
    /// Enabled but not compiled yet.
    Enabled,
    /// The body changed since the cached compile.
    Invalidated,
    Compiled,
    /// Failed to compile; stays broken until the body changes.
    Broken,
}

/// Hex SHA-256 of a fragment body.
pub fn body_hash(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

pub struct Compiler {
    cache: DashMap<CacheKey, Slot>,
    max_source_bytes: usize,
    metrics: Arc<Metrics>,
}

impl Compiler {
    pub fn new(max_source_bytes: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            cache: DashMap::new(),
            max_source_bytes,
            metrics,
        }
    }

    /// Compile a fragment, or return the cached unit for an unchanged body.
    ///
    /// Concurrent compiles of the same fragment are harmless: each produces
    /// an equivalent unit and the last insert wins.
    pub fn compile(&self, fragment: &SourceFragment) -> Result<Callable, CompileError> {
        let key = CacheKey::of(fragment);
        let hash = body_hash(&fragment.body);

        if let Some(slot) = self.cache.get(&key) {
            if slot.body_hash() == hash {
                self.metrics.record_cache_hit();
                return slot.result();
            }
        }

        self.metrics.record_cache_miss();
        let slot = self.build(fragment, hash);
        let result = slot.result();
        self.cache.insert(key, slot);
        result
    }

    fn build(&self, fragment: &SourceFragment, body_hash: String) -> Slot {
        let parsed = if fragment.body.len() > self.max_source_bytes {
            Err(SyntaxError::at_line(
                0,
                format!(
                    "source is {} bytes, the limit is {}",
                    fragment.body.len(),
                    self.max_source_bytes
                ),
            ))
        } else {
            script::compile(&fragment.body, CAPABILITY_SURFACE)
        };

        match parsed {
            Ok(function) => {
                debug!(
                    plugin = %fragment.plugin_id,
                    fragment = %fragment.name,
                    kind = %fragment.kind,
                    "compiled fragment"
                );
                Slot::Compiled(Arc::new(CompiledUnit::new(fragment, body_hash, function)))
            }
            Err(err) => {
                let error = CompileError::new(fragment, err);
                self.metrics.record_compile_error();
                warn!(
                    plugin = %fragment.plugin_id,
                    fragment = %fragment.name,
                    kind = %fragment.kind,
                    error = %error.diagnostic,
                    "fragment failed to compile"
                );
                Slot::Broken { body_hash, error }
            }
        }
    }

    /// Report where a fragment is in its lifecycle without compiling it.
    pub fn state_of(&self, fragment: &SourceFragment) -> FragmentState {
        if !fragment.is_enabled {
            return FragmentState::Disabled;
        }
        let Some(slot) = self.cache.get(&CacheKey::of(fragment)) else {
            return FragmentState::Enabled;
        };
        if slot.body_hash() != body_hash(&fragment.body) {
            return FragmentState::Invalidated;
        }
        match &*slot {
            Slot::Compiled(_) => FragmentState::Compiled,
            Slot::Broken { .. } => FragmentState::Broken,
        }
    }
}
