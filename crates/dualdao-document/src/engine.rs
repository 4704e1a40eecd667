use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use dualdao_core::{DaoError, Document, ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("document '{0}' not found")]
    NotFound(String),
    #[error("document '{0}' is deleted")]
    Deleted(String),
    #[error("document update conflict on '{id}'")]
    Conflict { id: String },
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

impl StoreError {
    pub fn is_missing(&self) -> bool {
        matches!(self, StoreError::NotFound(_) | StoreError::Deleted(_))
    }
}

impl From<StoreError> for DaoError {
    fn from(err: StoreError) -> Self {
        DaoError::wrap(ErrorKind::Generic, "document store error", err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a single accepted write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub id: String,
    pub rev: String,
}

/// Current revision of a document, tombstones included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocHead {
    pub rev: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllDocsRow {
    pub key: String,
    /// `None` when the key is unknown or tombstoned.
    pub doc: Option<Document>,
}

/// Conjunction of field-equality clauses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    clauses: Vec<(String, Value)>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses
            .iter()
            .all(|(field, value)| doc.get(field) == Some(value))
    }
}

/// A revisioned document database without multi-document transactions.
///
/// Every write is conditional on `_rev`: creating a new id needs none,
/// changing a live document needs its current revision. Deletes leave a
/// tombstone whose revision may be used to bring the id back.
#[async_trait]
pub trait DocumentEngine: Send + Sync {
    /// Live document with `_id` and `_rev`; `Deleted` for tombstones.
    async fn get(&self, id: &str) -> StoreResult<Document>;

    async fn head(&self, id: &str) -> StoreResult<DocHead>;

    /// Writes `doc`; `_deleted: true` turns the write into a delete.
    async fn put(&self, doc: Document) -> StoreResult<WriteResult>;

    async fn remove(&self, id: &str, rev: &str) -> StoreResult<WriteResult>;

    /// Attempts every document independently.
    async fn bulk_docs(&self, docs: Vec<Document>) -> Vec<StoreResult<WriteResult>>;

    /// All live documents ordered by id, or one row per requested key.
    async fn all_docs(&self, keys: Option<&[String]>) -> StoreResult<Vec<AllDocsRow>>;

    async fn find(&self, selector: &Selector) -> StoreResult<Vec<Document>>;

    async fn create_index(&self, fields: &[String]) -> StoreResult<()>;
}
