//! Stored plugin source fragments.
//!
//! A fragment is one unit of plugin behavior: its `body` is script source
//! and its `extra` column carries the kind-specific binding metadata.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Extension point a fragment plugs into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Script,
    EventListener,
    Controller,
    Widget,
}

impl FragmentKind {
    pub const ALL: [FragmentKind; 4] = [
        Self::Script,
        Self::EventListener,
        Self::Controller,
        Self::Widget,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::EventListener => "event_listener",
            Self::Controller => "controller",
            Self::Widget => "widget",
        }
    }
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FragmentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "script" => Ok(Self::Script),
            "event_listener" => Ok(Self::EventListener),
            "controller" => Ok(Self::Controller),
            "widget" => Ok(Self::Widget),
            other => bail!("unknown fragment kind '{other}'"),
        }
    }
}

/// A stored source fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFragment {
    pub id: Uuid,
    pub plugin_id: Uuid,
    pub kind: FragmentKind,

    /// Unique per (plugin, kind).
    pub name: String,

    pub body: String,
    pub is_enabled: bool,

    /// Lower runs first.
    pub priority: i32,

    /// Kind-specific metadata.
    pub extra: Value,

    pub updated_at: DateTime<Utc>,
}

impl SourceFragment {
    fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// Event an `event_listener` fragment subscribes to.
    pub fn event_name(&self) -> Option<&str> {
        self.extra_str("event_name")
    }

    /// Hook a `script` fragment filters, if any.
    pub fn hook(&self) -> Option<&str> {
        self.extra_str("hook")
    }

    /// HTTP method (upper-cased) and path pattern of a `controller` fragment.
    pub fn route(&self) -> Option<(String, &str)> {
        let method = self.extra_str("method")?.trim();
        let path = self.extra_str("path")?;
        if method.is_empty() {
            return None;
        }
        Some((method.to_ascii_uppercase(), path))
    }

    /// Layout slot a `widget` fragment is placed in, if any.
    pub fn slot(&self) -> Option<&str> {
        self.extra_str("slot")
    }

    /// Widget defaults; non-object values are treated as empty.
    pub fn default_config(&self) -> Map<String, Value> {
        match self.extra.get("default_config") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    /// Deterministic ordering used by every binding list.
    pub fn binding_order(&self, other: &Self) -> std::cmp::Ordering {
        (self.priority, self.plugin_id, &self.name).cmp(&(other.priority, other.plugin_id, &other.name))
    }
}

/// Sort fragments by (priority, plugin_id, name).
pub fn sort_bindings(fragments: &mut [SourceFragment]) {
    fragments.sort_by(SourceFragment::binding_order);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fragment(name: &str, priority: i32, plugin_id: Uuid, extra: Value) -> SourceFragment {
        SourceFragment {
            id: Uuid::now_v7(),
            plugin_id,
            kind: FragmentKind::Controller,
            name: name.into(),
            body: "fn() {}".into(),
            is_enabled: true,
            priority,
            extra,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in FragmentKind::ALL {
            assert_eq!(kind.as_str().parse::<FragmentKind>().unwrap(), kind);
        }
        assert!("cron".parse::<FragmentKind>().is_err());
    }

    #[test]
    fn route_uppercases_method() {
        let f = fragment("list", 0, Uuid::nil(), json!({"method": "get", "path": "/emails"}));
        assert_eq!(f.route(), Some(("GET".to_string(), "/emails")));

        let missing = fragment("bad", 0, Uuid::nil(), json!({"path": "/emails"}));
        assert_eq!(missing.route(), None);
    }

    #[test]
    fn default_config_ignores_non_objects() {
        let f = fragment("w", 0, Uuid::nil(), json!({"default_config": [1, 2]}));
        assert!(f.default_config().is_empty());
    }

    #[test]
    fn bindings_sort_by_priority_then_plugin_then_name() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let mut list = vec![
            fragment("z", 5, a, Value::Null),
            fragment("b", 1, b, Value::Null),
            fragment("a", 1, b, Value::Null),
            fragment("c", 1, a, Value::Null),
        ];
        sort_bindings(&mut list);
        let names: Vec<_> = list.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["c", "a", "b", "z"]);
    }
}
