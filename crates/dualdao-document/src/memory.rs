use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use dualdao_core::{fields, Document};

use crate::engine::{
    AllDocsRow, DocHead, DocumentEngine, Selector, StoreError, StoreResult, WriteResult,
};

#[derive(Clone)]
struct StoredDoc {
    generation: u64,
    rev: String,
    deleted: bool,
    /// Body without `_id`, `_rev` and `_deleted`.
    body: Document,
}

impl StoredDoc {
    fn to_document(&self, id: &str) -> Document {
        let mut doc = self.body.clone();
        doc.insert(fields::ID, id);
        doc.insert(fields::REV, self.rev.as_str());
        doc
    }
}

/// field -> serialized value -> ids
type FieldIndex = BTreeMap<String, BTreeSet<String>>;

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, StoredDoc>,
    indexes: HashMap<String, FieldIndex>,
}

impl Inner {
    fn unindex(&mut self, id: &str) {
        let Some(stored) = self.docs.get(id) else {
            return;
        };
        if stored.deleted {
            return;
        }
        for (field, index) in self.indexes.iter_mut() {
            if let Some(value) = stored.body.get(field) {
                let key = index_key(value);
                if let Some(ids) = index.get_mut(&key) {
                    ids.remove(id);
                    if ids.is_empty() {
                        index.remove(&key);
                    }
                }
            }
        }
    }

    fn reindex(&mut self, id: &str) {
        let Some(stored) = self.docs.get(id) else {
            return;
        };
        if stored.deleted {
            return;
        }
        for (field, index) in self.indexes.iter_mut() {
            if let Some(value) = stored.body.get(field) {
                index
                    .entry(index_key(value))
                    .or_default()
                    .insert(id.to_string());
            }
        }
    }

    fn write(&mut self, mut doc: Document) -> StoreResult<WriteResult> {
        let id = doc
            .id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::InvalidDocument("document has no _id".into()))?;
        let rev = doc.rev().map(str::to_string);
        let deleting = doc.get(fields::DELETED) == Some(&Value::Bool(true));

        let generation = match self.docs.get(&id) {
            None if deleting => return Err(StoreError::NotFound(id)),
            None if rev.is_some() => return Err(StoreError::Conflict { id }),
            None => 1,
            Some(stored) if stored.deleted && deleting => return Err(StoreError::Deleted(id)),
            Some(stored) if stored.deleted => match rev {
                None => stored.generation + 1,
                Some(r) if r == stored.rev => stored.generation + 1,
                Some(_) => return Err(StoreError::Conflict { id }),
            },
            Some(stored) => match rev {
                Some(r) if r == stored.rev => stored.generation + 1,
                _ => return Err(StoreError::Conflict { id }),
            },
        };

        for reserved in [fields::ID, fields::REV, fields::DELETED] {
            doc.remove(reserved);
        }
        let body = if deleting { Document::new() } else { doc };
        let new_rev = format!("{}-{}", generation, Uuid::new_v4().simple());

        self.unindex(&id);
        self.docs.insert(
            id.clone(),
            StoredDoc {
                generation,
                rev: new_rev.clone(),
                deleted: deleting,
                body,
            },
        );
        self.reindex(&id);

        Ok(WriteResult { id, rev: new_rev })
    }
}

fn index_key(value: &Value) -> String {
    value.to_string()
}

/// In-process MVCC document store.
///
/// Clones share the same database, so two DAOs built over clones behave
/// like two processes talking to one server.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live documents.
    pub fn len(&self) -> usize {
        self.inner.read().docs.values().filter(|d| !d.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn indexed_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.inner.read().indexes.keys().cloned().collect();
        fields.sort();
        fields
    }
}

#[async_trait]
impl DocumentEngine for MemoryDocumentStore {
    async fn get(&self, id: &str) -> StoreResult<Document> {
        let inner = self.inner.read();
        match inner.docs.get(id) {
            None => Err(StoreError::NotFound(id.to_string())),
            Some(stored) if stored.deleted => Err(StoreError::Deleted(id.to_string())),
            Some(stored) => Ok(stored.to_document(id)),
        }
    }

    async fn head(&self, id: &str) -> StoreResult<DocHead> {
        let inner = self.inner.read();
        inner
            .docs
            .get(id)
            .map(|stored| DocHead {
                rev: stored.rev.clone(),
                deleted: stored.deleted,
            })
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn put(&self, doc: Document) -> StoreResult<WriteResult> {
        self.inner.write().write(doc)
    }

    async fn remove(&self, id: &str, rev: &str) -> StoreResult<WriteResult> {
        let tombstone = Document::new()
            .with(fields::ID, id)
            .with(fields::REV, rev)
            .with(fields::DELETED, true);
        self.inner.write().write(tombstone)
    }

    async fn bulk_docs(&self, docs: Vec<Document>) -> Vec<StoreResult<WriteResult>> {
        let mut inner = self.inner.write();
        docs.into_iter().map(|doc| inner.write(doc)).collect()
    }

    async fn all_docs(&self, keys: Option<&[String]>) -> StoreResult<Vec<AllDocsRow>> {
        let inner = self.inner.read();
        let live = |id: &str| {
            inner
                .docs
                .get(id)
                .filter(|stored| !stored.deleted)
                .map(|stored| stored.to_document(id))
        };
        let rows = match keys {
            Some(keys) => keys
                .iter()
                .map(|key| AllDocsRow {
                    key: key.clone(),
                    doc: live(key),
                })
                .collect(),
            None => inner
                .docs
                .keys()
                .filter_map(|id| {
                    live(id).map(|doc| AllDocsRow {
                        key: id.clone(),
                        doc: Some(doc),
                    })
                })
                .collect(),
        };
        Ok(rows)
    }

    async fn find(&self, selector: &Selector) -> StoreResult<Vec<Document>> {
        let inner = self.inner.read();

        // Narrow through the most selective indexed clause, if any.
        let candidates: Option<BTreeSet<String>> = selector
            .clauses()
            .iter()
            .filter_map(|(field, value)| {
                inner.indexes.get(field).map(|index| {
                    index.get(&index_key(value)).cloned().unwrap_or_default()
                })
            })
            .min_by_key(BTreeSet::len);

        let docs = match candidates {
            Some(ids) => ids
                .iter()
                .filter_map(|id| inner.docs.get(id).map(|stored| stored.to_document(id)))
                .filter(|doc| selector.matches(doc))
                .collect(),
            None => inner
                .docs
                .iter()
                .filter(|(_, stored)| !stored.deleted)
                .map(|(id, stored)| stored.to_document(id))
                .filter(|doc| selector.matches(doc))
                .collect(),
        };
        Ok(docs)
    }

    async fn create_index(&self, fields: &[String]) -> StoreResult<()> {
        let mut inner = self.inner.write();
        for field in fields {
            if field.is_empty() || field.starts_with('_') {
                return Err(StoreError::InvalidDocument(format!(
                    "cannot index field '{}'",
                    field
                )));
            }
            if inner.indexes.contains_key(field) {
                continue;
            }
            let mut index = FieldIndex::new();
            for (id, stored) in inner.docs.iter().filter(|(_, s)| !s.deleted) {
                if let Some(value) = stored.body.get(field) {
                    index.entry(index_key(value)).or_default().insert(id.clone());
                }
            }
            tracing::debug!(field = %field, entries = index.len(), "created index");
            inner.indexes.insert(field.clone(), index);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::try_from(value).unwrap()
    }

    #[tokio::test]
    async fn writes_require_current_revision() {
        let store = MemoryDocumentStore::new();
        let first = store.put(doc(json!({"_id": "a", "n": 1}))).await.unwrap();
        assert!(first.rev.starts_with("1-"));

        let stale = store.put(doc(json!({"_id": "a", "n": 2}))).await.unwrap_err();
        assert_eq!(stale, StoreError::Conflict { id: "a".into() });

        let second = store
            .put(doc(json!({"_id": "a", "_rev": first.rev, "n": 2})))
            .await
            .unwrap();
        assert!(second.rev.starts_with("2-"));
        assert_eq!(store.get("a").await.unwrap().get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn new_ids_must_not_carry_a_revision() {
        let store = MemoryDocumentStore::new();
        let err = store
            .put(doc(json!({"_id": "ghost", "_rev": "1-abc"})))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Conflict { id: "ghost".into() });
    }

    #[tokio::test]
    async fn tombstones_bump_generation_and_can_be_revived() {
        let store = MemoryDocumentStore::new();
        let created = store.put(doc(json!({"_id": "a", "n": 1}))).await.unwrap();
        let removed = store.remove("a", &created.rev).await.unwrap();
        assert!(removed.rev.starts_with("2-"));
        assert_eq!(store.get("a").await.unwrap_err(), StoreError::Deleted("a".into()));

        let head = store.head("a").await.unwrap();
        assert!(head.deleted);
        assert_eq!(head.rev, removed.rev);

        let revived = store
            .put(doc(json!({"_id": "a", "_rev": removed.rev, "n": 1})))
            .await
            .unwrap();
        assert!(revived.rev.starts_with("3-"));
    }

    #[tokio::test]
    async fn bulk_docs_reports_each_item() {
        let store = MemoryDocumentStore::new();
        let results = store
            .bulk_docs(vec![
                doc(json!({"_id": "a"})),
                doc(json!({"_id": "b", "_rev": "9-zzz"})),
                doc(json!({"_id": "c"})),
            ])
            .await;
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(StoreError::Conflict { .. })));
        assert!(results[2].is_ok());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn all_docs_marks_missing_keys() {
        let store = MemoryDocumentStore::new();
        store.put(doc(json!({"_id": "a"}))).await.unwrap();
        let rows = store
            .all_docs(Some(&["a".to_string(), "b".to_string()][..]))
            .await
            .unwrap();
        assert!(rows[0].doc.is_some());
        assert_eq!(rows[1].key, "b");
        assert!(rows[1].doc.is_none());
    }

    #[tokio::test]
    async fn indexed_and_scanned_finds_agree() {
        let store = MemoryDocumentStore::new();
        for (id, color) in [("a", "red"), ("b", "blue"), ("c", "red")] {
            store
                .put(doc(json!({"_id": id, "entityType": "Widget|", "color": color})))
                .await
                .unwrap();
        }
        let selector = Selector::new().eq("entityType", "Widget|").eq("color", "red");
        let scanned = store.find(&selector).await.unwrap();

        store
            .create_index(&["entityType".to_string(), "color".to_string()])
            .await
            .unwrap();
        let indexed = store.find(&selector).await.unwrap();
        assert_eq!(scanned, indexed);
        assert_eq!(indexed.len(), 2);

        // index follows later writes
        let c = store.get("c").await.unwrap();
        let mut recolored = c.clone();
        recolored.insert("color", "green");
        store.put(recolored).await.unwrap();
        assert_eq!(store.find(&selector).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clones_share_one_database() {
        let store = MemoryDocumentStore::new();
        let other = store.clone();
        store.put(doc(json!({"_id": "a"}))).await.unwrap();
        assert!(other.get("a").await.is_ok());
    }
}
