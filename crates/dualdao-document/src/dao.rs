use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use dualdao_core::{
    ensure_open, fields, missing_ids_error, timestamp, BulkFailure, CompensatingTransactionFactory,
    Counter, CounterError, CounterStore, DaoError, DaoResult, DaoSettings, Document, ErrorKind,
    ExpandingDocumentMapper, GenericDao, Mapper, Revision, SequenceGenerator, Transaction,
    TransactionFactory, UndoAction,
};

use crate::engine::{DocumentEngine, Selector, StoreError};

/// Discriminator stored on counter documents.
const COUNTER_TYPE: &str = "counter";
const COUNTER_VALUE: &str = "seq";

/// `GenericDao` over a revisioned document store.
///
/// One physical database holds many logical types; every query is scoped
/// by the `entityType` discriminator. All-or-nothing behaviour is emulated
/// by registering compensations on the supplied transaction.
pub struct DocumentDao {
    engine: Arc<dyn DocumentEngine>,
    settings: DaoSettings,
    mapper: Arc<dyn Mapper>,
    tx_factory: Arc<dyn TransactionFactory>,
    sequence: SequenceGenerator,
}

impl DocumentDao {
    pub fn new(engine: Arc<dyn DocumentEngine>, settings: DaoSettings) -> Self {
        let sequence = SequenceGenerator::new(settings.max_sequence_retries);
        Self {
            engine,
            settings,
            mapper: Arc::new(ExpandingDocumentMapper),
            tx_factory: Arc::new(CompensatingTransactionFactory),
            sequence,
        }
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn Mapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_transaction_factory(mut self, factory: Arc<dyn TransactionFactory>) -> Self {
        self.tx_factory = factory;
        self
    }

    pub fn engine(&self) -> &Arc<dyn DocumentEngine> {
        &self.engine
    }

    pub fn settings(&self) -> &DaoSettings {
        &self.settings
    }

    /// Fills the envelope fields a caller may leave out.
    fn with_defaults(&self, mut doc: Document) -> Document {
        let entity_type = self.settings.entity_type.as_str();
        doc.set_if_empty(fields::ID, || format!("{}{}", entity_type, Uuid::new_v4()));
        doc.set_if_empty(fields::ENTITY_TYPE, || entity_type.to_string());
        doc.set_if_empty(fields::APP_VERSION, || self.settings.app_version.clone());
        doc
    }

    fn owns(&self, doc: &Document) -> bool {
        doc.entity_type() == Some(self.settings.entity_type.as_str())
    }

    async fn fetch_owned(&self, id: &str, kind: ErrorKind) -> DaoResult<Document> {
        let doc = self
            .engine
            .get(id)
            .await
            .map_err(|e| DaoError::wrap(kind, format!("could not read document '{}'", id), e))?;
        if !self.owns(&doc) {
            return Err(DaoError::new(
                kind,
                format!(
                    "document '{}' is not of type '{}'",
                    id, self.settings.entity_type
                ),
            ));
        }
        Ok(doc)
    }

    /// Removes whatever revision of `id` is current when the undo runs.
    fn undo_create(&self, id: String) -> UndoAction {
        let engine = self.engine.clone();
        UndoAction::new(format!("undo create {}", id), move || async move {
            let head = engine.head(&id).await?;
            if !head.deleted {
                engine.remove(&id, &head.rev).await?;
            }
            Ok::<(), DaoError>(())
        })
    }

    /// Writes `prior` back over the current revision (live or tombstone).
    fn undo_restore(&self, label: &str, prior: Document) -> DaoResult<UndoAction> {
        let id = prior
            .id()
            .map(str::to_string)
            .ok_or_else(|| DaoError::generic("cannot restore a document without _id"))?;
        let engine = self.engine.clone();
        Ok(UndoAction::new(
            format!("undo {} {}", label, id),
            move || async move {
                let head = engine.head(&id).await?;
                let mut restored = prior;
                restored.remove(fields::DELETED);
                restored.insert(fields::REV, head.rev);
                engine.put(restored).await?;
                Ok::<(), DaoError>(())
            },
        ))
    }

    fn counters(&self) -> EngineCounters<'_> {
        EngineCounters {
            engine: self.engine.as_ref(),
        }
    }
}

#[async_trait]
impl GenericDao for DocumentDao {
    fn entity_type(&self) -> &str {
        &self.settings.entity_type
    }

    fn mapper(&self) -> Arc<dyn Mapper> {
        self.mapper.clone()
    }

    fn begin_transaction(&self) -> DaoResult<Arc<dyn Transaction>> {
        self.tx_factory.begin()
    }

    async fn create(&self, doc: Document, tx: Option<&dyn Transaction>) -> DaoResult<Document> {
        ensure_open(tx)?;
        let mut doc = self.with_defaults(doc);
        doc.insert(fields::CREATED_DATE, timestamp::now_string());
        let id = doc.id().unwrap_or_default().to_string();

        let written = self.engine.put(doc).await.map_err(|e| {
            DaoError::wrap(ErrorKind::Create, format!("could not create document '{}'", id), e)
        })?;
        tracing::debug!(entity_type = %self.settings.entity_type, id = %written.id, rev = %written.rev, "created document");

        if let Some(tx) = tx {
            tx.register_undo(self.undo_create(written.id.clone()))?;
        }

        self.engine.get(&written.id).await.map_err(|e| {
            DaoError::wrap(
                ErrorKind::Create,
                format!("created document '{}' could not be read back", written.id),
                e,
            )
        })
    }

    async fn get_one(&self, id: &str) -> DaoResult<Document> {
        self.fetch_owned(id, ErrorKind::Get).await
    }

    async fn get_all(&self) -> DaoResult<Vec<Document>> {
        let selector = Selector::new().eq(fields::ENTITY_TYPE, self.settings.entity_type.as_str());
        self.engine.find(&selector).await.map_err(|e| {
            DaoError::wrap(
                ErrorKind::Get,
                format!("could not list '{}' documents", self.settings.entity_type),
                e,
            )
        })
    }

    async fn get_many(&self, ids: &[String]) -> DaoResult<Vec<Document>> {
        let rows = self
            .engine
            .all_docs(Some(ids))
            .await
            .map_err(|e| DaoError::wrap(ErrorKind::Get, "could not read documents", e))?;

        let mut found = Vec::with_capacity(rows.len());
        let mut missing = Vec::new();
        for row in rows {
            match row.doc {
                Some(doc) if self.owns(&doc) => found.push(doc),
                _ => missing.push(row.key),
            }
        }
        if !missing.is_empty() {
            return Err(missing_ids_error(&missing));
        }
        Ok(found)
    }

    async fn update(&self, doc: Document, tx: Option<&dyn Transaction>) -> DaoResult<Document> {
        let id = doc
            .id()
            .map(str::to_string)
            .ok_or_else(|| DaoError::validation("update requires an _id"))?;
        let rev = doc
            .rev()
            .map(str::to_string)
            .ok_or_else(|| DaoError::validation(format!("update of '{}' requires a _rev", id)))?;
        ensure_open(tx)?;

        // Not atomic: another writer may slip in between this read and the
        // conditional write below, in which case the write conflicts.
        let prior = self.fetch_owned(&id, ErrorKind::Update).await?;
        let mut merged = prior.clone();
        merged.merge_from(doc);
        merged.insert(fields::REV, rev.as_str());
        merged.insert(fields::UPDATED_DATE, timestamp::now_string());

        let written = match self.engine.put(merged).await {
            Ok(written) => written,
            Err(e @ StoreError::Conflict { .. }) => {
                tracing::debug!(entity_type = %self.settings.entity_type, id = %id, rev = %rev, "stale revision on update");
                return Err(DaoError::conflict(
                    format!("document '{}' was modified since revision {}", id, rev),
                    Some(e),
                ));
            }
            Err(e) => {
                return Err(DaoError::wrap(
                    ErrorKind::Update,
                    format!("could not update document '{}'", id),
                    e,
                ))
            }
        };
        tracing::debug!(entity_type = %self.settings.entity_type, id = %id, rev = %written.rev, "updated document");

        if let Some(tx) = tx {
            tx.register_undo(self.undo_restore("update", prior)?)?;
        }

        self.engine.get(&written.id).await.map_err(|e| {
            DaoError::wrap(
                ErrorKind::Update,
                format!("updated document '{}' could not be read back", id),
                e,
            )
        })
    }

    async fn delete(&self, id: &str, tx: Option<&dyn Transaction>) -> DaoResult<String> {
        ensure_open(tx)?;
        let prior = self.fetch_owned(id, ErrorKind::Delete).await?;
        let rev = prior.rev().unwrap_or_default().to_string();

        let removed = self.engine.remove(id, &rev).await.map_err(|e| {
            DaoError::wrap(ErrorKind::Delete, format!("could not delete document '{}'", id), e)
        })?;
        tracing::debug!(entity_type = %self.settings.entity_type, id = %id, rev = %removed.rev, "deleted document");

        if let Some(tx) = tx {
            tx.register_undo(self.undo_restore("delete", prior)?)?;
        }
        Ok(removed.rev)
    }

    async fn bulk_save(
        &self,
        docs: Vec<Document>,
        tx: Option<&dyn Transaction>,
    ) -> DaoResult<Vec<Document>> {
        ensure_open(tx)?;
        let now = timestamp::now_string();
        let docs: Vec<Document> = docs
            .into_iter()
            .map(|doc| {
                let mut doc = self.with_defaults(doc);
                if doc.rev().is_some() {
                    doc.insert(fields::UPDATED_DATE, now.as_str());
                } else {
                    doc.set_if_empty(fields::CREATED_DATE, || now.clone());
                }
                doc
            })
            .collect();

        // Prior bodies of the items being overwritten, for compensation.
        let mut priors: HashMap<String, Document> = HashMap::new();
        if tx.is_some() {
            for doc in docs.iter().filter(|d| d.rev().is_some()) {
                if let Some(id) = doc.id() {
                    if let Ok(prior) = self.engine.get(id).await {
                        priors.insert(id.to_string(), prior);
                    }
                }
            }
        }

        let ids: Vec<Option<String>> = docs.iter().map(|d| d.id().map(str::to_string)).collect();
        let total = ids.len();
        let results = self.engine.bulk_docs(docs).await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(written) => {
                    if let Some(tx) = tx {
                        let undo = match priors.remove(&written.id) {
                            Some(prior) => self.undo_restore("update", prior)?,
                            None => self.undo_create(written.id.clone()),
                        };
                        tx.register_undo(undo)?;
                    }
                    succeeded.push(written.id);
                }
                Err(e) => failed.push(BulkFailure {
                    id,
                    reason: e.to_string(),
                }),
            }
        }

        if !failed.is_empty() {
            metrics::increment_counter!("dualdao_bulk_save_failures_total");
            if tx.is_none() {
                tracing::warn!(
                    entity_type = %self.settings.entity_type,
                    failed = failed.len(),
                    persisted = succeeded.len(),
                    "bulk save partially applied outside a transaction; successful writes remain"
                );
            }
            return Err(DaoError::bulk_save(
                format!("{} of {} documents failed", failed.len(), total),
                failed,
                succeeded,
            ));
        }

        let rows = self
            .engine
            .all_docs(Some(succeeded.as_slice()))
            .await
            .map_err(|e| DaoError::wrap(ErrorKind::BulkSave, "could not read back saved documents", e))?;
        Ok(rows.into_iter().filter_map(|row| row.doc).collect())
    }

    async fn find_by_field(&self, field: &str, value: &Value) -> DaoResult<Vec<Document>> {
        let selector = Selector::new()
            .eq(fields::ENTITY_TYPE, self.settings.entity_type.as_str())
            .eq(field, value.clone());
        self.engine.find(&selector).await.map_err(|e| {
            DaoError::wrap(
                ErrorKind::Get,
                format!("could not query '{}' by '{}'", self.settings.entity_type, field),
                e,
            )
        })
    }

    async fn get_next_sequence_id(&self, name: &str) -> DaoResult<u64> {
        self.sequence.next(&self.counters(), name).await
    }

    async fn create_index(&self, field: &str) -> DaoResult<()> {
        self.engine
            .create_index(&[fields::ENTITY_TYPE.to_string(), field.to_string()])
            .await
            .map_err(|e| DaoError::wrap(ErrorKind::Generic, format!("could not index '{}'", field), e))
    }
}

/// Counters stored as ordinary documents keyed by counter name.
struct EngineCounters<'a> {
    engine: &'a dyn DocumentEngine,
}

impl<'a> EngineCounters<'a> {
    fn counter_doc(name: &str, value: u64, rev: Option<&str>) -> Document {
        let mut doc = Document::new()
            .with(fields::ID, name)
            .with(fields::ENTITY_TYPE, COUNTER_TYPE)
            .with(COUNTER_VALUE, value);
        if let Some(rev) = rev {
            doc.insert(fields::REV, rev);
        }
        doc
    }
}

fn counter_write_error(name: &str, e: StoreError) -> CounterError {
    match e {
        StoreError::Conflict { .. } => CounterError::Conflict,
        other => CounterError::Backend(DaoError::wrap(
            ErrorKind::Generic,
            format!("could not write counter '{}'", name),
            other,
        )),
    }
}

#[async_trait]
impl<'a> CounterStore for EngineCounters<'a> {
    async fn load_counter(&self, name: &str) -> Result<Option<Counter>, CounterError> {
        match self.engine.get(name).await {
            Ok(doc) if doc.entity_type() != Some(COUNTER_TYPE) => {
                Err(CounterError::Backend(DaoError::generic(format!(
                    "document '{}' exists and is not a counter",
                    name
                ))))
            }
            Ok(doc) => Ok(Some(Counter {
                name: name.to_string(),
                value: doc.get(COUNTER_VALUE).and_then(Value::as_u64).unwrap_or(0),
                revision: doc.rev().map(|r| Revision::Token(r.to_string())),
            })),
            Err(e) if e.is_missing() => Ok(None),
            Err(e) => Err(CounterError::Backend(DaoError::wrap(
                ErrorKind::Generic,
                format!("could not read counter '{}'", name),
                e,
            ))),
        }
    }

    async fn insert_counter(&self, name: &str, value: u64) -> Result<Counter, CounterError> {
        let written = self
            .engine
            .put(Self::counter_doc(name, value, None))
            .await
            .map_err(|e| counter_write_error(name, e))?;
        Ok(Counter {
            name: name.to_string(),
            value,
            revision: Some(Revision::Token(written.rev)),
        })
    }

    async fn save_counter(&self, counter: &Counter) -> Result<Counter, CounterError> {
        let rev = counter.revision.as_ref().and_then(Revision::as_token);
        let written = self
            .engine
            .put(Self::counter_doc(&counter.name, counter.value, rev))
            .await
            .map_err(|e| counter_write_error(&counter.name, e))?;
        Ok(Counter {
            revision: Some(Revision::Token(written.rev)),
            ..counter.clone()
        })
    }
}
