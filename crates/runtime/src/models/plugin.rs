//! Installed plugin records.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an installed plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Active,
    Inactive,
}

impl PluginStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => bail!("unknown plugin status '{other}'"),
        }
    }
}

/// Navigation entry a plugin contributes to the storefront admin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationEntry {
    pub title: String,
    pub path: String,
    /// Sort weight (lower sorts first).
    #[serde(default)]
    pub weight: i32,
}

/// What a plugin declares it provides.
///
/// Declarations are informational: bindings are derived from the source
/// fragments themselves, not from the manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginManifest {
    pub description: Option<String>,
    pub version: Option<String>,
    pub hooks: Vec<String>,
    pub events: Vec<String>,
    pub widgets: Vec<String>,
    pub navigation: Vec<NavigationEntry>,
}

/// An installed plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    /// Unique identifier (UUIDv7).
    pub id: Uuid,

    /// Human readable name.
    pub name: String,

    /// URL-safe machine name, unique across plugins.
    pub slug: String,

    pub manifest: PluginManifest,

    pub status: PluginStatus,

    /// Disabling is preferred over deletion.
    pub is_enabled: bool,
}

impl Plugin {
    /// Whether fragments of this plugin may participate in any binding.
    pub fn is_live(&self) -> bool {
        self.is_enabled && self.status == PluginStatus::Active
    }

    /// Match either the UUID or the slug.
    pub fn matches(&self, id_or_slug: &str) -> bool {
        self.slug == id_or_slug || Uuid::parse_str(id_or_slug).is_ok_and(|id| id == self.id)
    }
}
