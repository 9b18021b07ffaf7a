//! The `log` capability: plugin messages become tracing events.

use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::script::value::to_display;

/// Longest message accepted from plugin code; longer ones are truncated.
const MAX_MESSAGE_CHARS: usize = 4096;

/// Emit a plugin log line at `level` (one of the `log` capability methods).
pub fn emit(plugin: Uuid, fragment: &str, level: &str, message: &Value, fields: Option<&Value>) {
    let mut message = to_display(message);
    if message.chars().count() > MAX_MESSAGE_CHARS {
        message = message.chars().take(MAX_MESSAGE_CHARS).collect();
        message.push('…');
    }
    let fields = fields.map(Value::to_string).unwrap_or_default();

    match level {
        "debug" => debug!(plugin = %plugin, fragment = %fragment, fields = %fields, "{}", message),
        "warn" => warn!(plugin = %plugin, fragment = %fragment, fields = %fields, "{}", message),
        "error" => error!(plugin = %plugin, fragment = %fragment, fields = %fields, "{}", message),
        _ => info!(plugin = %plugin, fragment = %fragment, fields = %fields, "{}", message),
    }
}
