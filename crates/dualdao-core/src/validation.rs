use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    dao::GenericDao,
    document::Document,
    error::{DaoError, DaoResult},
    mapper::Mapper,
    transaction::Transaction,
};

/// Checks a record before it is written. Returns every problem found.
pub trait Validator: Send + Sync {
    fn validate(&self, doc: &Document) -> Result<(), Vec<String>>;
}

impl<F> Validator for F
where
    F: Fn(&Document) -> Result<(), Vec<String>> + Send + Sync,
{
    fn validate(&self, doc: &Document) -> Result<(), Vec<String>> {
        self(doc)
    }
}

/// Rejects records where any listed field is missing, null or an empty
/// string.
#[derive(Debug, Clone, Default)]
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl Validator for RequiredFields {
    fn validate(&self, doc: &Document) -> Result<(), Vec<String>> {
        let problems: Vec<String> = self
            .fields
            .iter()
            .filter(|field| match doc.get(field) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            })
            .map(|field| format!("'{}' is required", field))
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Decorator that validates records before `create` and `update` reach
/// the wrapped DAO.
pub struct ValidatingDao {
    inner: Arc<dyn GenericDao>,
    validator: Arc<dyn Validator>,
}

impl ValidatingDao {
    pub fn new(inner: Arc<dyn GenericDao>, validator: Arc<dyn Validator>) -> Self {
        Self { inner, validator }
    }

    pub fn inner(&self) -> &Arc<dyn GenericDao> {
        &self.inner
    }

    fn check(&self, doc: &Document) -> DaoResult<()> {
        self.validator.validate(doc).map_err(|problems| {
            tracing::debug!(
                entity_type = self.inner.entity_type(),
                problems = problems.len(),
                "record rejected by validator"
            );
            DaoError::validation(problems.join("; "))
        })
    }
}

#[async_trait]
impl GenericDao for ValidatingDao {
    fn entity_type(&self) -> &str {
        self.inner.entity_type()
    }

    fn mapper(&self) -> Arc<dyn Mapper> {
        self.inner.mapper()
    }

    fn begin_transaction(&self) -> DaoResult<Arc<dyn Transaction>> {
        self.inner.begin_transaction()
    }

    async fn create(&self, doc: Document, tx: Option<&dyn Transaction>) -> DaoResult<Document> {
        self.check(&doc)?;
        self.inner.create(doc, tx).await
    }

    async fn get_one(&self, id: &str) -> DaoResult<Document> {
        self.inner.get_one(id).await
    }

    async fn get_all(&self) -> DaoResult<Vec<Document>> {
        self.inner.get_all().await
    }

    async fn get_many(&self, ids: &[String]) -> DaoResult<Vec<Document>> {
        self.inner.get_many(ids).await
    }

    async fn update(&self, doc: Document, tx: Option<&dyn Transaction>) -> DaoResult<Document> {
        self.check(&doc)?;
        self.inner.update(doc, tx).await
    }

    async fn delete(&self, id: &str, tx: Option<&dyn Transaction>) -> DaoResult<String> {
        self.inner.delete(id, tx).await
    }

    async fn bulk_save(
        &self,
        docs: Vec<Document>,
        tx: Option<&dyn Transaction>,
    ) -> DaoResult<Vec<Document>> {
        self.inner.bulk_save(docs, tx).await
    }

    async fn find_by_field(&self, field: &str, value: &Value) -> DaoResult<Vec<Document>> {
        self.inner.find_by_field(field, value).await
    }

    async fn get_next_sequence_id(&self, name: &str) -> DaoResult<u64> {
        self.inner.get_next_sequence_id(name).await
    }

    async fn create_index(&self, field: &str) -> DaoResult<()> {
        self.inner.create_index(field).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn required_fields_reports_every_gap() {
        let validator = RequiredFields::new(["name", "sku", "qty"]);
        let doc = Document::try_from(json!({"name": "", "qty": 0})).unwrap();
        let problems = validator.validate(&doc).unwrap_err();
        assert_eq!(problems, vec!["'name' is required", "'sku' is required"]);
    }

    #[test]
    fn closures_are_validators() {
        let positive = |doc: &Document| match doc.get("qty").and_then(Value::as_i64) {
            Some(q) if q > 0 => Ok(()),
            _ => Err(vec!["qty must be positive".to_string()]),
        };
        assert!(positive.validate(&Document::new().with("qty", 3)).is_ok());
        assert!(positive.validate(&Document::new().with("qty", -1)).is_err());
    }
}
