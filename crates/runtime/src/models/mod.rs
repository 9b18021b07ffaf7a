//! Plugin metadata and source fragment models.

pub mod fragment;
pub mod plugin;

pub use fragment::{FragmentKind, SourceFragment, sort_bindings};
pub use plugin::{NavigationEntry, Plugin, PluginManifest, PluginStatus};
