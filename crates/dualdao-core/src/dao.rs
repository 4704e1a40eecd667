use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    document::Document,
    error::{DaoError, DaoResult},
    mapper::Mapper,
    transaction::Transaction,
};

/// Uniform data-access contract implemented by every backend.
///
/// Writes take an optional transaction. When one is supplied the backend
/// registers a compensation for the write so that a later rollback can
/// invert it.
#[async_trait]
pub trait GenericDao: Send + Sync {
    /// The logical type served by this DAO.
    fn entity_type(&self) -> &str;

    fn mapper(&self) -> Arc<dyn Mapper>;

    /// Opens a transaction through the factory this DAO was built with.
    fn begin_transaction(&self) -> DaoResult<Arc<dyn Transaction>>;

    async fn create(&self, doc: Document, tx: Option<&dyn Transaction>) -> DaoResult<Document>;

    async fn get_one(&self, id: &str) -> DaoResult<Document>;

    async fn get_all(&self) -> DaoResult<Vec<Document>>;

    /// Fails if any id is missing; the error names every missing id.
    async fn get_many(&self, ids: &[String]) -> DaoResult<Vec<Document>>;

    async fn update(&self, doc: Document, tx: Option<&dyn Transaction>) -> DaoResult<Document>;

    /// Returns the tombstone revision (document store) or the affected row
    /// count (relational store).
    async fn delete(&self, id: &str, tx: Option<&dyn Transaction>) -> DaoResult<String>;

    async fn bulk_save(
        &self,
        docs: Vec<Document>,
        tx: Option<&dyn Transaction>,
    ) -> DaoResult<Vec<Document>>;

    async fn find_by_field(&self, field: &str, value: &Value) -> DaoResult<Vec<Document>>;

    async fn get_next_sequence_id(&self, name: &str) -> DaoResult<u64>;

    async fn create_index(&self, field: &str) -> DaoResult<()>;
}

/// The error `get_many` raises when some ids could not be resolved.
pub fn missing_ids_error(missing: &[String]) -> DaoError {
    DaoError::get(format!("documents not found: {}", missing.join(", ")))
}
