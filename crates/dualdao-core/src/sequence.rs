use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    entity::Revision,
    error::{DaoError, DaoResult},
};

pub const DEFAULT_MAX_RETRIES: u32 = 200;

/// A named integer sequence as persisted by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    pub name: String,
    pub value: u64,
    /// Guard for the conditional save; `None` only before first insert.
    pub revision: Option<Revision>,
}

#[derive(Debug, Error)]
pub enum CounterError {
    /// The stored revision moved, or another writer created the counter
    /// first.
    #[error("counter revision conflict")]
    Conflict,
    #[error(transparent)]
    Backend(#[from] DaoError),
}

/// Backend half of the sequence algorithm.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn load_counter(&self, name: &str) -> Result<Option<Counter>, CounterError>;

    /// Creates the counter; `Conflict` if it already exists.
    async fn insert_counter(&self, name: &str, value: u64) -> Result<Counter, CounterError>;

    /// Writes `counter.value` only if the stored revision still equals
    /// `counter.revision`.
    async fn save_counter(&self, counter: &Counter) -> Result<Counter, CounterError>;
}

/// Increment-and-conditional-save loop over a [`CounterStore`].
///
/// The local FIFO lock only serialises callers within this process;
/// contention with other processes is settled by the conditional save
/// and a bounded number of retries.
#[derive(Debug)]
pub struct SequenceGenerator {
    lock: Mutex<()>,
    max_retries: u32,
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl SequenceGenerator {
    pub fn new(max_retries: u32) -> Self {
        Self {
            lock: Mutex::new(()),
            max_retries: max_retries.max(1),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub async fn next<S>(&self, store: &S, name: &str) -> DaoResult<u64>
    where
        S: CounterStore + ?Sized,
    {
        for attempt in 1..=self.max_retries {
            let _guard = self.lock.lock().await;

            let current = match store.load_counter(name).await {
                Ok(Some(counter)) => counter,
                Ok(None) => match store.insert_counter(name, 0).await {
                    Ok(counter) => counter,
                    Err(CounterError::Conflict) => {
                        tracing::debug!(counter = name, attempt, "counter created concurrently, retrying");
                        metrics::increment_counter!("dualdao_sequence_conflicts_total");
                        continue;
                    }
                    Err(CounterError::Backend(e)) => return Err(e),
                },
                Err(CounterError::Conflict) => continue,
                Err(CounterError::Backend(e)) => return Err(e),
            };

            let next = Counter {
                value: current.value + 1,
                ..current
            };
            match store.save_counter(&next).await {
                Ok(saved) => {
                    tracing::debug!(counter = name, value = saved.value, attempt, "sequence advanced");
                    return Ok(saved.value);
                }
                Err(CounterError::Conflict) => {
                    tracing::debug!(counter = name, attempt, "counter revision moved, retrying");
                    metrics::increment_counter!("dualdao_sequence_conflicts_total");
                }
                Err(CounterError::Backend(e)) => return Err(e),
            }
        }

        tracing::warn!(counter = name, retries = self.max_retries, "sequence retries exhausted");
        Err(DaoError::generic(format!(
            "could not advance counter '{}' after {} attempts",
            name, self.max_retries
        )))
    }
}
