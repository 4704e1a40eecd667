use std::sync::Arc;

use async_trait::async_trait;

use dualdao_core::{
    next_transaction_id, DaoResult, Transaction, TransactionFactory, TransactionId,
    TransactionState, UndoAction, UndoLog,
};

use crate::connection::SqliteConnection;

/// Native SQLite transaction plus a compensation log for the writes the
/// native rollback does not cover.
pub struct SqliteTransaction {
    conn: Arc<SqliteConnection>,
    log: UndoLog,
}

impl SqliteTransaction {
    /// Issues `BEGIN` on `conn`.
    pub fn begin(conn: Arc<SqliteConnection>) -> DaoResult<Self> {
        let id = next_transaction_id();
        conn.begin(id)?;
        Ok(Self {
            conn,
            log: UndoLog::new(id),
        })
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    fn id(&self) -> TransactionId {
        self.log.id()
    }

    fn state(&self) -> TransactionState {
        self.log.state()
    }

    fn is_released(&self) -> bool {
        self.log.is_released()
    }

    fn register_undo(&self, action: UndoAction) -> DaoResult<()> {
        self.log.register(action)
    }

    fn undo_labels(&self) -> Vec<String> {
        self.log.labels()
    }

    async fn commit(&self) -> DaoResult<()> {
        self.log.finish(TransactionState::Committed)?;
        let result = self.conn.commit(self.id());
        // A failed COMMIT leaves the native transaction open; release
        // rolls it back.
        self.release().await?;
        result
    }

    async fn rollback(&self) -> DaoResult<()> {
        self.log.finish(TransactionState::RolledBack)?;
        metrics::increment_counter!("dualdao_transaction_rollbacks_total");
        tracing::info!(tx_id = self.id(), pending = self.log.labels().len(), "rolling back");

        let native = self.conn.rollback(self.id());
        let compensations = self.log.run_undo().await;
        self.release().await?;
        native.and(compensations)
    }

    async fn release(&self) -> DaoResult<()> {
        if !self.log.release() {
            return Ok(());
        }
        if self.conn.active_transaction() == Some(self.id()) {
            // Released while still open: discard without compensations.
            if let Err(e) = self.conn.rollback(self.id()) {
                tracing::warn!(tx_id = self.id(), error = %e, "native rollback on release failed");
            }
        }
        tracing::debug!(tx_id = self.id(), "released sqlite transaction");
        Ok(())
    }
}

/// Opens transactions on one shared connection.
#[derive(Clone)]
pub struct SqliteTransactionFactory {
    conn: Arc<SqliteConnection>,
}

impl SqliteTransactionFactory {
    pub fn new(conn: Arc<SqliteConnection>) -> Self {
        Self { conn }
    }
}

impl TransactionFactory for SqliteTransactionFactory {
    fn begin(&self) -> DaoResult<Arc<dyn Transaction>> {
        Ok(Arc::new(SqliteTransaction::begin(self.conn.clone())?))
    }
}
