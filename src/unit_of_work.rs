use std::{future::Future, sync::Arc};

use dualdao_core::{DaoError, DaoResult, ErrorKind, GenericDao, Transaction};

/// Runs units of work inside transactions opened by one DAO.
#[derive(Clone)]
pub struct UnitOfWork {
    dao: Arc<dyn GenericDao>,
}

impl UnitOfWork {
    pub fn new(dao: Arc<dyn GenericDao>) -> Self {
        Self { dao }
    }

    pub fn dao(&self) -> &Arc<dyn GenericDao> {
        &self.dao
    }

    /// Commits when `action` succeeds and rolls back when it fails.
    ///
    /// A failed action surfaces as `Generic` with the action's error as
    /// its source. If the rollback itself fails, that `Rollback` error is
    /// returned instead.
    pub async fn run<T, F, Fut>(&self, action: F) -> DaoResult<T>
    where
        F: FnOnce(Arc<dyn Transaction>) -> Fut,
        Fut: Future<Output = DaoResult<T>>,
    {
        let tx = self.dao.begin_transaction()?;
        let tx_id = tx.id();

        match action(tx.clone()).await {
            Ok(value) => {
                tx.commit().await?;
                tracing::debug!(tx_id, entity_type = self.dao.entity_type(), "unit of work committed");
                Ok(value)
            }
            Err(cause) => {
                tracing::warn!(tx_id, error = %cause, "unit of work failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(tx_id, error = %rollback, "rollback failed");
                    return Err(rollback);
                }
                Err(DaoError::wrap(
                    ErrorKind::Generic,
                    "transaction failed and rollback was performed",
                    cause,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dualdao_core::{DaoSettings, Document};
    use dualdao_document::{DocumentDao, MemoryDocumentStore};
    use std::error::Error as _;

    fn unit() -> UnitOfWork {
        UnitOfWork::new(Arc::new(DocumentDao::new(
            Arc::new(MemoryDocumentStore::new()),
            DaoSettings::new("Widget|"),
        )))
    }

    #[tokio::test]
    async fn success_commits() {
        let uow = unit();
        let dao = uow.dao().clone();
        let created = uow
            .run(|tx| async move {
                dao.create(Document::new().with("name", "a"), Some(tx.as_ref()))
                    .await
            })
            .await
            .unwrap();
        assert!(uow.dao().get_one(created.id().unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn failure_rolls_back_and_chains_the_cause() {
        let uow = unit();
        let dao = uow.dao().clone();
        let err = uow
            .run(|tx| async move {
                dao.create(Document::new().with("name", "a"), Some(tx.as_ref()))
                    .await?;
                Err::<(), _>(DaoError::validation("second step refused"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Generic);
        assert_eq!(err.to_string(), "transaction failed and rollback was performed");
        let source = err.source().map(|s| s.to_string()).unwrap_or_default();
        assert!(source.contains("second step refused"));
        assert!(uow.dao().get_all().await.unwrap().is_empty());
    }
}
