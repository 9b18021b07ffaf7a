//! Capability record bound into every compiled fragment.
//!
//! Plugin code reaches the outside world only through three objects:
//! `db` (documents in the plugin's own namespace), `http` (allowlisted
//! outbound calls) and `log`. The record is the same for every extension
//! point; it is scoped to the plugin and fragment being invoked.

pub mod data;
pub mod http;
pub mod logging;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::script::value::{to_display, type_name};
use crate::script::{CapabilityViolation, ExecError, HostBridge, Surface};

pub use data::{DataStore, Document, MemoryDataStore, PgDataStore};
pub use http::{
    HostAllowlist, OutboundHttp, OutboundMethod, OutboundRequest, OutboundResponse, ReqwestHttp,
};

/// Capability objects and the methods fragments may call on them.
pub const CAPABILITY_SURFACE: &Surface = &[
    ("db", &["query", "get", "insert", "update", "delete", "count"]),
    ("http", &["get", "post"]),
    ("log", &["debug", "info", "warn", "error"]),
];

/// Default number of documents `db.query` returns.
const DEFAULT_QUERY_LIMIT: i64 = 100;

/// Identity of the caller of a controller, as asserted by the host's
/// authentication layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl CallerIdentity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "roles": self.roles,
            "authenticated": self.id.is_some(),
        })
    }
}

/// Backends shared by every capability record.
#[derive(Clone)]
pub struct HostServices {
    pub data: Arc<dyn DataStore>,
    pub http: Arc<dyn OutboundHttp>,
    pub allowlist: Arc<HostAllowlist>,
}

impl HostServices {
    pub fn new(
        data: Arc<dyn DataStore>,
        http: Arc<dyn OutboundHttp>,
        allowlist: HostAllowlist,
    ) -> Self {
        Self {
            data,
            http,
            allowlist: Arc::new(allowlist),
        }
    }

    /// Capability record for one invocation of one fragment.
    pub fn capabilities<'a>(&'a self, plugin_id: Uuid, fragment: &'a str) -> Capabilities<'a> {
        Capabilities {
            plugin_id,
            fragment,
            services: self,
        }
    }
}

/// The `db`/`http`/`log` objects as seen by one fragment invocation.
pub struct Capabilities<'a> {
    plugin_id: Uuid,
    fragment: &'a str,
    services: &'a HostServices,
}

fn arg(args: &[Value], index: usize) -> &Value {
    args.get(index).unwrap_or(&Value::Null)
}

fn expect_at_most(object: &str, method: &str, args: &[Value], max: usize) -> Result<(), ExecError> {
    if args.len() > max {
        return Err(ExecError::Type(format!(
            "{object}.{method} takes at most {max} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

fn collection(method: &str, value: &Value) -> Result<String, ExecError> {
    let Value::String(name) = value else {
        return Err(ExecError::Type(format!(
            "db.{method}: collection must be a string, got {}",
            type_name(value)
        )));
    };
    data::validate_collection(name)?;
    Ok(name.clone())
}

fn object(context: &str, value: &Value) -> Result<Map<String, Value>, ExecError> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        other => Err(ExecError::Type(format!(
            "{context} must be an object, got {}",
            type_name(other)
        ))),
    }
}

/// Document ids that do not parse cannot exist, so they resolve to "not found".
fn document_id(value: &Value) -> Option<Uuid> {
    value.as_str().and_then(|s| Uuid::parse_str(s).ok())
}

fn host_error(err: anyhow::Error) -> ExecError {
    ExecError::Host(format!("{err:#}"))
}

impl Capabilities<'_> {
    async fn db(&self, method: &str, args: Vec<Value>) -> Result<Value, ExecError> {
        let store = &self.services.data;
        let plugin = self.plugin_id;
        let name = collection(method, arg(&args, 0))?;

        match method {
            "query" => {
                expect_at_most("db", method, &args, 3)?;
                let filter = object("db.query filter", arg(&args, 1))?;
                let limit = arg(&args, 2)
                    .get("limit")
                    .and_then(Value::as_i64)
                    .unwrap_or(DEFAULT_QUERY_LIMIT);
                let docs = store
                    .query(plugin, &name, &filter, limit)
                    .await
                    .map_err(host_error)?;
                Ok(Value::Array(docs.into_iter().map(Document::into_value).collect()))
            }
            "get" => {
                expect_at_most("db", method, &args, 2)?;
                let Some(id) = document_id(arg(&args, 1)) else {
                    return Ok(Value::Null);
                };
                let doc = store.get(plugin, &name, id).await.map_err(host_error)?;
                Ok(doc.map_or(Value::Null, Document::into_value))
            }
            "insert" => {
                expect_at_most("db", method, &args, 2)?;
                let mut doc = object("db.insert document", arg(&args, 1))?;
                doc.remove("id");
                let doc = store.insert(plugin, &name, doc).await.map_err(host_error)?;
                Ok(doc.into_value())
            }
            "update" => {
                expect_at_most("db", method, &args, 3)?;
                let Some(id) = document_id(arg(&args, 1)) else {
                    return Ok(Value::Null);
                };
                let mut patch = object("db.update patch", arg(&args, 2))?;
                patch.remove("id");
                let doc = store
                    .update(plugin, &name, id, patch)
                    .await
                    .map_err(host_error)?;
                Ok(doc.map_or(Value::Null, Document::into_value))
            }
            "delete" => {
                expect_at_most("db", method, &args, 2)?;
                let Some(id) = document_id(arg(&args, 1)) else {
                    return Ok(Value::Bool(false));
                };
                let deleted = store.delete(plugin, &name, id).await.map_err(host_error)?;
                Ok(Value::Bool(deleted))
            }
            "count" => {
                expect_at_most("db", method, &args, 2)?;
                let filter = object("db.count filter", arg(&args, 1))?;
                let n = store
                    .count(plugin, &name, &filter)
                    .await
                    .map_err(host_error)?;
                Ok(Value::from(n))
            }
            other => Err(unknown_method("db", other)),
        }
    }

    async fn http(&self, method: &str, args: Vec<Value>) -> Result<Value, ExecError> {
        let (method, body, headers) = match method {
            "get" => {
                expect_at_most("http", method, &args, 2)?;
                (OutboundMethod::Get, None, arg(&args, 1))
            }
            "post" => {
                expect_at_most("http", method, &args, 3)?;
                (OutboundMethod::Post, Some(arg(&args, 1).clone()), arg(&args, 2))
            }
            other => return Err(unknown_method("http", other)),
        };

        let Value::String(raw) = arg(&args, 0) else {
            return Err(ExecError::Type("http: URL must be a string".to_string()));
        };
        let url = self.services.allowlist.check(raw)?;
        let headers: BTreeMap<String, String> = object("http headers", headers)?
            .into_iter()
            .map(|(k, v)| (k, to_display(&v)))
            .collect();

        let response = self
            .services
            .http
            .send(OutboundRequest {
                method,
                url,
                headers,
                body,
            })
            .await
            .map_err(host_error)?;
        Ok(response.into_value())
    }
}

fn unknown_method(object: &str, method: &str) -> ExecError {
    CapabilityViolation::new(object, format!("no method '{method}'")).into()
}

#[async_trait]
impl HostBridge for Capabilities<'_> {
    async fn invoke(
        &self,
        object: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ExecError> {
        match object {
            "db" => self.db(method, args).await,
            "http" => self.http(method, args).await,
            "log" => {
                expect_at_most("log", method, &args, 2)?;
                if !matches!(method, "debug" | "info" | "warn" | "error") {
                    return Err(unknown_method("log", method));
                }
                let fields = args.get(1);
                logging::emit(self.plugin_id, self.fragment, method, arg(&args, 0), fields);
                Ok(Value::Null)
            }
            other => Err(CapabilityViolation::new(other, "unknown capability").into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct EchoHttp {
        sent: Mutex<Vec<OutboundRequest>>,
    }

    #[async_trait]
    impl OutboundHttp for EchoHttp {
        async fn send(&self, request: OutboundRequest) -> anyhow::Result<OutboundResponse> {
            let body = request.body.clone().unwrap_or(Value::Null);
            self.sent.lock().push(request);
            Ok(OutboundResponse { status: 200, body })
        }
    }

    fn services(allow: &[&str]) -> (HostServices, Arc<MemoryDataStore>, Arc<EchoHttp>) {
        let data = Arc::new(MemoryDataStore::new());
        let http = Arc::new(EchoHttp::default());
        let services = HostServices::new(data.clone(), http.clone(), HostAllowlist::new(allow));
        (services, data, http)
    }

    #[tokio::test]
    async fn db_insert_then_query() {
        let (services, data, _) = services(&[]);
        let plugin = Uuid::now_v7();
        let caps = services.capabilities(plugin, "track");

        let inserted = caps
            .invoke("db", "insert", vec![json!("visits"), json!({"id": "spoofed", "total": 3})])
            .await
            .unwrap();
        assert_ne!(inserted["id"], json!("spoofed"));
        assert_eq!(inserted["total"], json!(3));

        let rows = caps
            .invoke("db", "query", vec![json!("visits"), json!({"total": 3})])
            .await
            .unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(data.snapshot(plugin, "visits").len(), 1);

        let count = caps.invoke("db", "count", vec![json!("visits")]).await.unwrap();
        assert_eq!(count, json!(1));
    }

    #[tokio::test]
    async fn db_rejects_bad_collection_names() {
        let (services, _, _) = services(&[]);
        let caps = services.capabilities(Uuid::now_v7(), "track");
        let err = caps
            .invoke("db", "insert", vec![json!("../other_plugin"), json!({})])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Capability(_)));
    }

    #[tokio::test]
    async fn db_get_with_malformed_id_is_null() {
        let (services, _, _) = services(&[]);
        let caps = services.capabilities(Uuid::now_v7(), "track");
        let v = caps
            .invoke("db", "get", vec![json!("visits"), json!("not-a-uuid")])
            .await
            .unwrap();
        assert_eq!(v, Value::Null);
    }

    #[tokio::test]
    async fn http_enforces_allowlist() {
        let (services, _, http) = services(&["rates.example.com"]);
        let caps = services.capabilities(Uuid::now_v7(), "quote");

        let ok = caps
            .invoke(
                "http",
                "post",
                vec![json!("https://rates.example.com/q"), json!({"zip": "10115"})],
            )
            .await
            .unwrap();
        assert_eq!(ok, json!({"status": 200, "body": {"zip": "10115"}}));

        let err = caps
            .invoke("http", "get", vec![json!("https://evil.example.net/")])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Capability(_)));
        assert_eq!(http.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn log_returns_null() {
        let (services, _, _) = services(&[]);
        let caps = services.capabilities(Uuid::now_v7(), "track");
        let v = caps
            .invoke("log", "info", vec![json!("hello"), json!({"n": 1})])
            .await
            .unwrap();
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn caller_identity_value() {
        let caller = CallerIdentity {
            id: Some("cust_42".into()),
            roles: vec!["customer".into()],
        };
        assert_eq!(
            caller.to_value(),
            json!({"id": "cust_42", "roles": ["customer"], "authenticated": true})
        );
        assert_eq!(CallerIdentity::anonymous().to_value()["authenticated"], json!(false));
    }
}
