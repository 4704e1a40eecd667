use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{DaoError, DaoResult, ErrorKind};

pub type TransactionId = u64;

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide transaction ids, shared by every backend.
pub fn next_transaction_id() -> TransactionId {
    NEXT_TX_ID.fetch_add(1, Ordering::SeqCst)
}

pub type UndoFuture = Pin<Box<dyn Future<Output = DaoResult<()>> + Send>>;

/// A labelled compensation that inverts exactly one write.
pub struct UndoAction {
    label: String,
    run: Box<dyn FnOnce() -> UndoFuture + Send>,
}

impl UndoAction {
    pub fn new<F, Fut>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DaoResult<()>> + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Box::new(move || Box::pin(f())),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn run(self) -> DaoResult<()> {
        (self.run)().await
    }
}

impl fmt::Debug for UndoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoAction").field("label", &self.label).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionState::Open => "open",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
        })
    }
}

/// Unit-of-work handle passed to DAO writes.
///
/// A transaction moves from `Open` to exactly one of `Committed` or
/// `RolledBack` and is then released. `release` may be called any number
/// of times.
#[async_trait]
pub trait Transaction: Send + Sync {
    fn id(&self) -> TransactionId;
    fn state(&self) -> TransactionState;
    fn is_released(&self) -> bool;
    fn register_undo(&self, action: UndoAction) -> DaoResult<()>;
    /// Labels of the pending compensations, oldest first.
    fn undo_labels(&self) -> Vec<String>;
    async fn commit(&self) -> DaoResult<()>;
    async fn rollback(&self) -> DaoResult<()>;
    async fn release(&self) -> DaoResult<()>;
}

/// Rejects writes against a transaction that can no longer take undo
/// registrations, before any I/O happens.
pub fn ensure_open(tx: Option<&dyn Transaction>) -> DaoResult<()> {
    match tx {
        Some(tx) if tx.is_released() || tx.state() != TransactionState::Open => {
            Err(DaoError::generic(format!(
                "transaction {} is {} and cannot take further writes",
                tx.id(),
                tx.state()
            )))
        }
        _ => Ok(()),
    }
}

pub trait TransactionFactory: Send + Sync {
    fn begin(&self) -> DaoResult<Arc<dyn Transaction>>;
}

struct LogState {
    state: TransactionState,
    released: bool,
    actions: Vec<UndoAction>,
}

/// Ordered compensation log plus the lifecycle bookkeeping every
/// transaction implementation shares.
pub struct UndoLog {
    id: TransactionId,
    inner: Mutex<LogState>,
}

impl UndoLog {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            inner: Mutex::new(LogState {
                state: TransactionState::Open,
                released: false,
                actions: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }

    pub fn register(&self, action: UndoAction) -> DaoResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Open || inner.released {
            return Err(DaoError::generic(format!(
                "cannot register undo '{}' on transaction {} which is {}",
                action.label(),
                self.id,
                inner.state
            )));
        }
        tracing::debug!(tx_id = self.id, label = action.label(), "registered undo action");
        inner.actions.push(action);
        Ok(())
    }

    /// Moves an open transaction into its terminal state. Fails if it has
    /// already been committed or rolled back.
    pub fn finish(&self, target: TransactionState) -> DaoResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Open {
            return Err(DaoError::generic(format!(
                "transaction {} is already {}",
                self.id, inner.state
            )));
        }
        inner.state = target;
        Ok(())
    }

    /// Drains the pending compensations, newest first.
    pub fn take_reversed(&self) -> Vec<UndoAction> {
        let mut actions = std::mem::take(&mut self.inner.lock().actions);
        actions.reverse();
        actions
    }

    pub fn clear(&self) {
        self.inner.lock().actions.clear();
    }

    pub fn labels(&self) -> Vec<String> {
        self.inner
            .lock()
            .actions
            .iter()
            .map(|a| a.label().to_string())
            .collect()
    }

    /// Returns `true` only for the call that actually released.
    pub fn release(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.released {
            return false;
        }
        inner.released = true;
        inner.actions.clear();
        true
    }

    /// Runs every pending compensation in LIFO order, stopping at the first
    /// failure.
    pub async fn run_undo(&self) -> DaoResult<()> {
        for action in self.take_reversed() {
            let label = action.label().to_string();
            tracing::debug!(tx_id = self.id, label = %label, "running undo action");
            if let Err(e) = action.run().await {
                tracing::warn!(tx_id = self.id, label = %label, error = %e, "undo action failed");
                return Err(DaoError::wrap(
                    ErrorKind::Rollback,
                    format!("undo '{}' failed in transaction {}", label, self.id),
                    e,
                ));
            }
        }
        Ok(())
    }
}

/// Transaction over a store without native transactions: all-or-nothing
/// is emulated purely by compensations.
pub struct CompensatingTransaction {
    log: UndoLog,
}

impl CompensatingTransaction {
    pub fn new() -> Self {
        let id = next_transaction_id();
        tracing::debug!(tx_id = id, "begin compensating transaction");
        Self {
            log: UndoLog::new(id),
        }
    }
}

impl Default for CompensatingTransaction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transaction for CompensatingTransaction {
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
        tracing::debug!(tx_id = self.id(), "commit compensating transaction");
        self.release().await
    }

    async fn rollback(&self) -> DaoResult<()> {
        self.log.finish(TransactionState::RolledBack)?;
        metrics::increment_counter!("dualdao_transaction_rollbacks_total");
        tracing::info!(tx_id = self.id(), pending = self.log.labels().len(), "rolling back");
        let result = self.log.run_undo().await;
        self.release().await?;
        result
    }

    async fn release(&self) -> DaoResult<()> {
        if self.log.release() {
            tracing::debug!(tx_id = self.id(), "released compensating transaction");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompensatingTransactionFactory;

impl TransactionFactory for CompensatingTransactionFactory {
    fn begin(&self) -> DaoResult<Arc<dyn Transaction>> {
        Ok(Arc::new(CompensatingTransaction::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(log: &Arc<Mutex<Vec<String>>>, label: &str) -> UndoAction {
        let log = log.clone();
        let name = label.to_string();
        UndoAction::new(label, move || async move {
            log.lock().push(name);
            Ok::<(), DaoError>(())
        })
    }

    #[tokio::test]
    async fn rollback_runs_undo_in_reverse_order() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let tx = CompensatingTransaction::new();
        for label in ["create", "update", "delete"] {
            tx.register_undo(recording(&ran, label)).unwrap();
        }
        assert_eq!(tx.undo_labels(), vec!["create", "update", "delete"]);

        tx.rollback().await.unwrap();
        assert_eq!(*ran.lock(), vec!["delete", "update", "create"]);
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(tx.is_released());
    }

    #[tokio::test]
    async fn commit_discards_pending_undo() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let tx = CompensatingTransaction::new();
        tx.register_undo(recording(&ran, "create")).unwrap();
        tx.commit().await.unwrap();
        assert!(ran.lock().is_empty());
        assert!(tx.undo_labels().is_empty());
    }

    #[tokio::test]
    async fn terminal_transitions_happen_once() {
        let tx = CompensatingTransaction::new();
        tx.commit().await.unwrap();
        assert_eq!(tx.commit().await.unwrap_err().kind(), ErrorKind::Generic);
        assert_eq!(tx.rollback().await.unwrap_err().kind(), ErrorKind::Generic);
        assert_eq!(tx.state(), TransactionState::Committed);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let tx = CompensatingTransaction::new();
        tx.release().await.unwrap();
        tx.release().await.unwrap();
        assert!(tx.is_released());
    }

    #[tokio::test]
    async fn no_registration_after_commit() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let tx = CompensatingTransaction::new();
        tx.commit().await.unwrap();
        let err = tx.register_undo(recording(&ran, "late")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Generic);
    }

    #[tokio::test]
    async fn failing_undo_surfaces_as_rollback_error_and_still_releases() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let tx = CompensatingTransaction::new();
        tx.register_undo(recording(&ran, "create")).unwrap();
        tx.register_undo(UndoAction::new("update", || async {
            Err::<(), DaoError>(DaoError::generic("store unreachable"))
        }))
        .unwrap();

        let err = tx.rollback().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rollback);
        assert!(err.message().contains("update"));
        assert!(tx.is_released());
        // LIFO stops at the failure, so the older undo never ran.
        assert!(ran.lock().is_empty());
    }

    #[test]
    fn factory_hands_out_distinct_ids() {
        let factory = CompensatingTransactionFactory;
        let a = factory.begin().unwrap();
        let b = factory.begin().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), TransactionState::Open);
    }
}
