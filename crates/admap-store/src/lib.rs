//! Store handle for admap: collection-level operations over the staging and
//! permanent listing collections, including the declarative identity-keyed
//! merge the commit step is built on.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{FindOptions, IndexOptions};
use mongodb::{Client, Database, IndexModel};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "admap-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] mongodb::error::Error),
    #[error("document not representable as BSON: {0}")]
    Serialization(#[from] mongodb::bson::ser::Error),
    #[error("{0}")]
    Message(String),
}

/// What the merge does when a staged document's key already exists in the
/// target collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchPolicy {
    KeepExisting,
    Overwrite,
}

impl MatchPolicy {
    fn as_merge_value(&self) -> &'static str {
        match self {
            MatchPolicy::KeepExisting => "keepExisting",
            MatchPolicy::Overwrite => "replace",
        }
    }
}

/// What the merge does when no target document carries the staged key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NoMatchPolicy {
    Insert,
    Discard,
}

impl NoMatchPolicy {
    fn as_merge_value(&self) -> &'static str {
        match self {
            NoMatchPolicy::Insert => "insert",
            NoMatchPolicy::Discard => "discard",
        }
    }
}

/// Parameters of one declarative merge from a staging collection into a
/// target collection, keyed on the identity path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSpec {
    pub into: String,
    pub on: String,
    pub when_matched: MatchPolicy,
    pub when_not_matched: NoMatchPolicy,
}

impl MergeSpec {
    /// The idempotent policy the sync pipeline always commits with: existing
    /// documents are kept untouched, unknown keys are inserted.
    pub fn insert_if_absent(into: impl Into<String>, on: impl Into<String>) -> Self {
        Self {
            into: into.into(),
            on: on.into(),
            when_matched: MatchPolicy::KeepExisting,
            when_not_matched: NoMatchPolicy::Insert,
        }
    }
}

/// Collection-level store operations the pipeline consumes. Implementations
/// must evaluate `merge` as one logical operation over the whole source
/// collection; callers never perform per-document existence checks around it.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Identity-field projection over a collection. Returns only the values at
    /// `id_path`; full documents are never materialized.
    async fn projected_ids(&self, collection: &str, id_path: &str)
        -> Result<Vec<String>, StoreError>;

    /// Bulk insert. Callers must not pass an empty batch.
    async fn insert_many(&self, collection: &str, docs: &[JsonValue]) -> Result<u64, StoreError>;

    async fn count_documents(&self, collection: &str) -> Result<u64, StoreError>;

    /// Delete every document in the collection. Returns the deleted count.
    async fn delete_all(&self, collection: &str) -> Result<u64, StoreError>;

    /// Declarative merge of every document in `source` into `spec.into`,
    /// joined on `spec.on`, atomic per matched key.
    async fn merge(&self, source: &str, spec: &MergeSpec) -> Result<(), StoreError>;

    /// Idempotently create the unique identity index the merge joins on.
    async fn ensure_identity_index(&self, collection: &str, id_path: &str)
        -> Result<(), StoreError>;
}

/// MongoDB-backed store. The merge maps directly onto an aggregation `$merge`
/// stage over the staging collection.
#[derive(Debug, Clone)]
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self {
            db: client.database(database),
        })
    }

    pub fn with_database(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ListingStore for MongoStore {
    async fn projected_ids(
        &self,
        collection: &str,
        id_path: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut projection = Document::new();
        projection.insert(id_path, 1_i32);
        let options = FindOptions::builder().projection(projection).build();

        let mut cursor = self
            .db
            .collection::<Document>(collection)
            .find(doc! {}, options)
            .await?;

        let mut ids = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            if let Some(id) = string_at_path(&document, id_path) {
                ids.push(id);
            }
        }
        debug!(collection, count = ids.len(), "loaded identity projection");
        Ok(ids)
    }

    async fn insert_many(&self, collection: &str, docs: &[JsonValue]) -> Result<u64, StoreError> {
        let rendered = docs
            .iter()
            .map(mongodb::bson::to_document)
            .collect::<Result<Vec<_>, _>>()?;
        let result = self
            .db
            .collection::<Document>(collection)
            .insert_many(rendered, None)
            .await?;
        Ok(result.inserted_ids.len() as u64)
    }

    async fn count_documents(&self, collection: &str) -> Result<u64, StoreError> {
        Ok(self
            .db
            .collection::<Document>(collection)
            .count_documents(doc! {}, None)
            .await?)
    }

    async fn delete_all(&self, collection: &str) -> Result<u64, StoreError> {
        let result = self
            .db
            .collection::<Document>(collection)
            .delete_many(doc! {}, None)
            .await?;
        Ok(result.deleted_count)
    }

    async fn merge(&self, source: &str, spec: &MergeSpec) -> Result<(), StoreError> {
        let stage = doc! {
            "$merge": {
                "into": spec.into.clone(),
                "on": spec.on.clone(),
                "whenMatched": spec.when_matched.as_merge_value(),
                "whenNotMatched": spec.when_not_matched.as_merge_value(),
            }
        };
        let mut cursor = self
            .db
            .collection::<Document>(source)
            .aggregate([stage], None)
            .await?;
        // $merge emits no documents; draining the cursor runs the stage to
        // completion on the server.
        while cursor.try_next().await?.is_some() {}
        debug!(source, into = spec.into.as_str(), on = spec.on.as_str(), "merge committed");
        Ok(())
    }

    async fn ensure_identity_index(
        &self,
        collection: &str,
        id_path: &str,
    ) -> Result<(), StoreError> {
        let mut keys = Document::new();
        keys.insert(id_path, 1_i32);
        let model = IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.db
            .collection::<Document>(collection)
            .create_index(model, None)
            .await?;
        Ok(())
    }
}

fn string_at_path(document: &Document, path: &str) -> Option<String> {
    let mut current = document;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            return match current.get(segment) {
                Some(Bson::String(value)) => Some(value.clone()),
                Some(Bson::Int32(value)) => Some(value.to_string()),
                Some(Bson::Int64(value)) => Some(value.to_string()),
                _ => None,
            };
        }
        current = current.get_document(segment).ok()?;
    }
    None
}

/// In-process store double with the same collection semantics as `MongoStore`,
/// including the insert-if-absent merge. Used by pipeline and router tests;
/// `insert_limit` injects a partially acknowledged bulk insert and
/// `failing_merge` a merge rejected by the store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<JsonValue>>>,
    insert_limit: Option<usize>,
    failing_merge: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_insert_limit(mut self, limit: usize) -> Self {
        self.insert_limit = Some(limit);
        self
    }

    pub fn with_failing_merge(mut self) -> Self {
        self.failing_merge = true;
        self
    }

    pub async fn seed(&self, collection: &str, docs: Vec<JsonValue>) {
        let mut collections = self.collections.lock().await;
        collections.entry(collection.to_string()).or_default().extend(docs);
    }

    pub async fn documents(&self, collection: &str) -> Vec<JsonValue> {
        let collections = self.collections.lock().await;
        collections.get(collection).cloned().unwrap_or_default()
    }
}

fn value_at_path<'a>(doc: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(doc, |current, segment| current.get(segment))
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn projected_ids(
        &self,
        collection: &str,
        id_path: &str,
    ) -> Result<Vec<String>, StoreError> {
        let collections = self.collections.lock().await;
        let docs = collections.get(collection).map(Vec::as_slice).unwrap_or(&[]);
        Ok(docs
            .iter()
            .filter_map(|doc| value_at_path(doc, id_path))
            .filter_map(|value| value.as_str().map(ToString::to_string))
            .collect())
    }

    async fn insert_many(&self, collection: &str, docs: &[JsonValue]) -> Result<u64, StoreError> {
        let accepted = match self.insert_limit {
            Some(limit) => &docs[..limit.min(docs.len())],
            None => docs,
        };
        let mut collections = self.collections.lock().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .extend(accepted.iter().cloned());
        Ok(accepted.len() as u64)
    }

    async fn count_documents(&self, collection: &str) -> Result<u64, StoreError> {
        let collections = self.collections.lock().await;
        Ok(collections.get(collection).map(Vec::len).unwrap_or(0) as u64)
    }

    async fn delete_all(&self, collection: &str) -> Result<u64, StoreError> {
        let mut collections = self.collections.lock().await;
        Ok(collections
            .get_mut(collection)
            .map(std::mem::take)
            .map(|docs| docs.len())
            .unwrap_or(0) as u64)
    }

    async fn merge(&self, source: &str, spec: &MergeSpec) -> Result<(), StoreError> {
        if self.failing_merge {
            return Err(StoreError::Message(
                "merge stage rejected by store".to_string(),
            ));
        }
        let mut collections = self.collections.lock().await;
        let staged = collections.get(source).cloned().unwrap_or_default();
        let target = collections.entry(spec.into.clone()).or_default();
        for doc in staged {
            let Some(key) = value_at_path(&doc, &spec.on).cloned() else {
                continue;
            };
            let existing = target
                .iter()
                .position(|candidate| value_at_path(candidate, &spec.on) == Some(&key));
            match existing {
                Some(index) => match spec.when_matched {
                    MatchPolicy::KeepExisting => {}
                    MatchPolicy::Overwrite => target[index] = doc,
                },
                None => match spec.when_not_matched {
                    NoMatchPolicy::Insert => target.push(doc),
                    NoMatchPolicy::Discard => {}
                },
            }
        }
        Ok(())
    }

    async fn ensure_identity_index(
        &self,
        _collection: &str,
        _id_path: &str,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flat_doc(id: &str, title: &str) -> JsonValue {
        json!({ "listingId": id, "title": title })
    }

    fn geo_doc(id: &str) -> JsonValue {
        json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [-79.4, 43.6] },
            "properties": { "listingId": id, "title": "geo" },
        })
    }

    #[tokio::test]
    async fn merge_inserts_absent_keys_and_keeps_existing() {
        let store = MemoryStore::new();
        store
            .seed("permanent", vec![flat_doc("a", "original title")])
            .await;
        store
            .seed(
                "staging",
                vec![flat_doc("a", "resubmitted title"), flat_doc("b", "new")],
            )
            .await;

        let spec = MergeSpec::insert_if_absent("permanent", "listingId");
        store.merge("staging", &spec).await.expect("merge");

        let permanent = store.documents("permanent").await;
        assert_eq!(permanent.len(), 2);
        assert_eq!(permanent[0]["title"], json!("original title"));
        assert_eq!(permanent[1]["listingId"], json!("b"));
    }

    #[tokio::test]
    async fn merge_is_idempotent_over_an_unchanged_staging_set() {
        let store = MemoryStore::new();
        store
            .seed("staging", vec![flat_doc("a", "t"), flat_doc("b", "u")])
            .await;

        let spec = MergeSpec::insert_if_absent("permanent", "listingId");
        store.merge("staging", &spec).await.expect("first merge");
        let after_first = store.documents("permanent").await;
        store.merge("staging", &spec).await.expect("second merge");
        let after_second = store.documents("permanent").await;

        assert_eq!(after_first, after_second);
        assert_eq!(after_second.len(), 2);
    }

    #[tokio::test]
    async fn merge_joins_on_nested_identity_paths() {
        let store = MemoryStore::new();
        store.seed("permanent", vec![geo_doc("a")]).await;
        store.seed("staging", vec![geo_doc("a"), geo_doc("b")]).await;

        let spec = MergeSpec::insert_if_absent("permanent", "properties.listingId");
        store.merge("staging", &spec).await.expect("merge");

        assert_eq!(store.count_documents("permanent").await.expect("count"), 2);
    }

    #[tokio::test]
    async fn discard_policy_drops_unmatched_documents() {
        let store = MemoryStore::new();
        store.seed("staging", vec![flat_doc("a", "t")]).await;

        let spec = MergeSpec {
            into: "permanent".to_string(),
            on: "listingId".to_string(),
            when_matched: MatchPolicy::KeepExisting,
            when_not_matched: NoMatchPolicy::Discard,
        };
        store.merge("staging", &spec).await.expect("merge");

        assert!(store.documents("permanent").await.is_empty());
    }

    #[tokio::test]
    async fn projected_ids_walks_the_shape_specific_path() {
        let store = MemoryStore::new();
        store.seed("geo", vec![geo_doc("g1"), geo_doc("g2")]).await;
        store.seed("flat", vec![flat_doc("f1", "t")]).await;

        let geo_ids = store
            .projected_ids("geo", "properties.listingId")
            .await
            .expect("geo ids");
        assert_eq!(geo_ids, vec!["g1".to_string(), "g2".to_string()]);

        let flat_ids = store.projected_ids("flat", "listingId").await.expect("flat ids");
        assert_eq!(flat_ids, vec!["f1".to_string()]);
    }

    #[tokio::test]
    async fn insert_limit_models_a_partially_acknowledged_bulk_write() {
        let store = MemoryStore::new().with_insert_limit(1);
        let inserted = store
            .insert_many("staging", &[flat_doc("a", "t"), flat_doc("b", "u")])
            .await
            .expect("insert");
        assert_eq!(inserted, 1);
        assert_eq!(store.count_documents("staging").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn delete_all_empties_the_collection() {
        let store = MemoryStore::new();
        store.seed("staging", vec![flat_doc("a", "t")]).await;
        let deleted = store.delete_all("staging").await.expect("delete");
        assert_eq!(deleted, 1);
        assert!(store.documents("staging").await.is_empty());
    }
}
