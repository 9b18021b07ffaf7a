//! Plugin-namespaced document storage behind the `db` capability.
//!
//! Each plugin sees only its own documents. Documents live in named
//! collections; filters use JSON containment (a document matches when it
//! contains every key/value of the filter, recursively).

use std::collections::HashMap;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::script::CapabilityViolation;
use crate::script::value::loose_eq;

/// Regex for valid collection names.
///
/// # Panics
///
/// Panics if the hard-coded regex literal is invalid (impossible in practice).
#[allow(clippy::expect_used)]
static VALID_COLLECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").expect("valid regex literal"));

/// Hard cap on documents returned by one query.
pub const MAX_QUERY_LIMIT: i64 = 500;

/// Reject collection names outside `[a-z][a-z0-9_]*` (max 64 chars).
pub fn validate_collection(name: &str) -> Result<(), CapabilityViolation> {
    if VALID_COLLECTION.is_match(name) {
        Ok(())
    } else {
        Err(CapabilityViolation::new(
            "db",
            format!("invalid collection name '{name}'"),
        ))
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: Uuid,
    pub collection: String,
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// The value handed to plugin code: the document fields plus `id`.
    pub fn into_value(self) -> Value {
        let mut data = self.data;
        data.insert("id".to_string(), Value::String(self.id.to_string()));
        Value::Object(data)
    }
}

/// Storage backend for plugin documents.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Documents containing `filter`, oldest first.
    async fn query(
        &self,
        plugin_id: Uuid,
        collection: &str,
        filter: &Map<String, Value>,
        limit: i64,
    ) -> Result<Vec<Document>>;

    async fn get(&self, plugin_id: Uuid, collection: &str, id: Uuid) -> Result<Option<Document>>;

    async fn insert(
        &self,
        plugin_id: Uuid,
        collection: &str,
        data: Map<String, Value>,
    ) -> Result<Document>;

    /// Shallow-merge `patch` into an existing document.
    async fn update(
        &self,
        plugin_id: Uuid,
        collection: &str,
        id: Uuid,
        patch: Map<String, Value>,
    ) -> Result<Option<Document>>;

    async fn delete(&self, plugin_id: Uuid, collection: &str, id: Uuid) -> Result<bool>;

    async fn count(
        &self,
        plugin_id: Uuid,
        collection: &str,
        filter: &Map<String, Value>,
    ) -> Result<i64>;
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: Uuid,
    collection: String,
    doc: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        let data = match row.doc {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Document {
            id: row.id,
            collection: row.collection,
            data,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const DOCUMENT_COLUMNS: &str = "id, collection, doc, created_at, updated_at";

/// Documents in the `plugin_data` table, filtered with JSONB `@>`.
#[derive(Clone)]
pub struct PgDataStore {
    pool: PgPool,
}

impl PgDataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DataStore for PgDataStore {
    async fn query(
        &self,
        plugin_id: Uuid,
        collection: &str,
        filter: &Map<String, Value>,
        limit: i64,
    ) -> Result<Vec<Document>> {
        let rows = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM plugin_data \
             WHERE plugin_id = $1 AND collection = $2 AND doc @> $3 \
             ORDER BY created_at, id LIMIT $4"
        ))
        .bind(plugin_id)
        .bind(collection)
        .bind(Value::Object(filter.clone()))
        .bind(limit.clamp(0, MAX_QUERY_LIMIT))
        .fetch_all(&self.pool)
        .await
        .context("failed to query plugin documents")?;

        Ok(rows.into_iter().map(Document::from).collect())
    }

    async fn get(&self, plugin_id: Uuid, collection: &str, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM plugin_data \
             WHERE plugin_id = $1 AND collection = $2 AND id = $3"
        ))
        .bind(plugin_id)
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load plugin document")?;

        Ok(row.map(Document::from))
    }

    async fn insert(
        &self,
        plugin_id: Uuid,
        collection: &str,
        data: Map<String, Value>,
    ) -> Result<Document> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "INSERT INTO plugin_data (id, plugin_id, collection, doc) \
             VALUES ($1, $2, $3, $4) RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(plugin_id)
        .bind(collection)
        .bind(Value::Object(data))
        .fetch_one(&self.pool)
        .await
        .context("failed to insert plugin document")?;

        Ok(row.into())
    }

    async fn update(
        &self,
        plugin_id: Uuid,
        collection: &str,
        id: Uuid,
        patch: Map<String, Value>,
    ) -> Result<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "UPDATE plugin_data SET doc = doc || $4, updated_at = now() \
             WHERE plugin_id = $1 AND collection = $2 AND id = $3 \
             RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(plugin_id)
        .bind(collection)
        .bind(id)
        .bind(Value::Object(patch))
        .fetch_optional(&self.pool)
        .await
        .context("failed to update plugin document")?;

        Ok(row.map(Document::from))
    }

    async fn delete(&self, plugin_id: Uuid, collection: &str, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM plugin_data WHERE plugin_id = $1 AND collection = $2 AND id = $3",
        )
        .bind(plugin_id)
        .bind(collection)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to delete plugin document")?;

        Ok(result.rows_affected() > 0)
    }

    async fn count(
        &self,
        plugin_id: Uuid,
        collection: &str,
        filter: &Map<String, Value>,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM plugin_data \
             WHERE plugin_id = $1 AND collection = $2 AND doc @> $3",
        )
        .bind(plugin_id)
        .bind(collection)
        .bind(Value::Object(filter.clone()))
        .fetch_one(&self.pool)
        .await
        .context("failed to count plugin documents")?;

        Ok(count)
    }
}

/// JSON containment with the same semantics as PostgreSQL's `jsonb @> jsonb`.
pub fn contains(doc: &Value, filter: &Value) -> bool {
    match (doc, filter) {
        (Value::Object(d), Value::Object(f)) => f
            .iter()
            .all(|(k, fv)| d.get(k).is_some_and(|dv| contains(dv, fv))),
        (Value::Array(d), Value::Array(f)) => {
            f.iter().all(|fv| d.iter().any(|dv| contains(dv, fv)))
        }
        // An array contains a primitive it holds.
        (Value::Array(d), primitive) if !primitive.is_object() => {
            d.iter().any(|dv| loose_eq(dv, primitive))
        }
        (d, f) => loose_eq(d, f),
    }
}

/// Process-local document store.
#[derive(Default)]
pub struct MemoryDataStore {
    documents: RwLock<HashMap<(Uuid, String), Vec<Document>>>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every document in a collection, bypassing capability checks.
    pub fn snapshot(&self, plugin_id: Uuid, collection: &str) -> Vec<Document> {
        self.documents
            .read()
            .get(&(plugin_id, collection.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

fn matches(doc: &Document, filter: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(k, fv)| doc.data.get(k).is_some_and(|dv| contains(dv, fv)))
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn query(
        &self,
        plugin_id: Uuid,
        collection: &str,
        filter: &Map<String, Value>,
        limit: i64,
    ) -> Result<Vec<Document>> {
        let limit = usize::try_from(limit.clamp(0, MAX_QUERY_LIMIT)).unwrap_or(0);
        Ok(self
            .documents
            .read()
            .get(&(plugin_id, collection.to_string()))
            .map(|docs| {
                docs.iter()
                    .filter(|d| matches(d, filter))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, plugin_id: Uuid, collection: &str, id: Uuid) -> Result<Option<Document>> {
        Ok(self
            .documents
            .read()
            .get(&(plugin_id, collection.to_string()))
            .and_then(|docs| docs.iter().find(|d| d.id == id).cloned()))
    }

    async fn insert(
        &self,
        plugin_id: Uuid,
        collection: &str,
        data: Map<String, Value>,
    ) -> Result<Document> {
        let now = Utc::now();
        let doc = Document {
            id: Uuid::now_v7(),
            collection: collection.to_string(),
            data,
            created_at: now,
            updated_at: now,
        };
        self.documents
            .write()
            .entry((plugin_id, collection.to_string()))
            .or_default()
            .push(doc.clone());
        Ok(doc)
    }

    async fn update(
        &self,
        plugin_id: Uuid,
        collection: &str,
        id: Uuid,
        patch: Map<String, Value>,
    ) -> Result<Option<Document>> {
        let mut documents = self.documents.write();
        let Some(doc) = documents
            .get_mut(&(plugin_id, collection.to_string()))
            .and_then(|docs| docs.iter_mut().find(|d| d.id == id))
        else {
            return Ok(None);
        };
        doc.data.extend(patch);
        doc.updated_at = Utc::now();
        Ok(Some(doc.clone()))
    }

    async fn delete(&self, plugin_id: Uuid, collection: &str, id: Uuid) -> Result<bool> {
        let mut documents = self.documents.write();
        let Some(docs) = documents.get_mut(&(plugin_id, collection.to_string())) else {
            return Ok(false);
        };
        let before = docs.len();
        docs.retain(|d| d.id != id);
        Ok(docs.len() != before)
    }

    async fn count(
        &self,
        plugin_id: Uuid,
        collection: &str,
        filter: &Map<String, Value>,
    ) -> Result<i64> {
        let count = self
            .documents
            .read()
            .get(&(plugin_id, collection.to_string()))
            .map_or(0, |docs| docs.iter().filter(|d| matches(d, filter)).count());
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }
}
