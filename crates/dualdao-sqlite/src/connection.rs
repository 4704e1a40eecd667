use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::{sync::Notify, time::Instant};

use dualdao_core::{DaoError, DaoResult, ErrorKind, TransactionId};

use crate::schema::COUNTERS_DDL;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sidecar database holding the `counters` table of a file database.
pub fn counters_path(path: &str) -> String {
    format!("{}-counters", path)
}

fn open_raw(path: &str) -> DaoResult<Connection> {
    let conn = if path == ":memory:" {
        Connection::open_in_memory()
    } else {
        Connection::open(path)
    }
    .map_err(|e| DaoError::wrap(ErrorKind::Generic, format!("could not open sqlite database '{}'", path), e))?;

    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| DaoError::wrap(ErrorKind::Generic, "could not configure sqlite", e))?;
    if path != ":memory:" {
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| DaoError::wrap(ErrorKind::Generic, "could not configure sqlite", e))?;
    }
    Ok(conn)
}

/// A SQLite data connection shared by every DAO and transaction built on
/// it, plus a separate connection for the `counters` table.
///
/// At most one native transaction may be open on the data connection.
/// Writes that do not belong to it wait (asynchronously, up to the lock
/// timeout) until it commits or rolls back. Counter increments never wait:
/// they run on their own connection, which no transaction can own, so a
/// rollback never hands a sequence value out twice.
///
/// Statements run inline on the calling task. In-process contention is
/// resolved by the async wait above; the 5 s SQLite busy handler only
/// blocks when another process holds the file lock.
pub struct SqliteConnection {
    conn: Mutex<Connection>,
    counters: Mutex<Connection>,
    active_tx: Mutex<Option<TransactionId>>,
    released: Notify,
    lock_timeout: Duration,
}

impl SqliteConnection {
    /// Opens `path`, or a private in-memory database for `":memory:"`.
    /// Counters of a file database live in [`counters_path`].
    pub fn open(path: &str) -> DaoResult<Self> {
        let conn = open_raw(path)?;
        let counters = if path == ":memory:" {
            open_raw(path)?
        } else {
            open_raw(&counters_path(path))?
        };
        counters
            .execute_batch(COUNTERS_DDL)
            .map_err(|e| DaoError::wrap(ErrorKind::Generic, "could not create counters table", e))?;

        tracing::debug!(path, "opened sqlite database");
        Ok(Self {
            conn: Mutex::new(conn),
            counters: Mutex::new(counters),
            active_tx: Mutex::new(None),
            released: Notify::new(),
            lock_timeout: BUSY_TIMEOUT,
        })
    }

    pub fn open_in_memory() -> DaoResult<Self> {
        Self::open(":memory:")
    }

    /// How long a write waits for a foreign transaction before failing.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Runs `f` on the data connection. Reads issued here see the writes
    /// of an open transaction; use [`SqliteConnection::write`] for changes.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Runs `f` on the counters connection.
    pub fn with_counters<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let conn = self.counters.lock();
        f(&conn)
    }

    pub fn active_transaction(&self) -> Option<TransactionId> {
        *self.active_tx.lock()
    }

    /// Runs `f` when the connection is free or owned by `owner`, handing
    /// `f` back with the holder's id otherwise.
    fn claim<T, F>(&self, owner: Option<TransactionId>, f: F) -> Result<DaoResult<T>, (TransactionId, F)>
    where
        F: FnOnce(&Connection) -> DaoResult<T>,
    {
        let active = self.active_tx.lock();
        match *active {
            Some(open) if Some(open) != owner => Err((open, f)),
            _ => {
                let conn = self.conn.lock();
                Ok(f(&conn))
            }
        }
    }

    fn held_by(&self, holder: TransactionId) -> DaoError {
        DaoError::generic(format!(
            "sqlite connection is held by transaction {} and was not released within {:?}",
            holder, self.lock_timeout
        ))
    }

    /// Runs the write `f` on behalf of `owner` (`None` for writes outside
    /// any transaction), waiting while another transaction is open.
    pub async fn write<T, F>(&self, owner: Option<TransactionId>, f: F) -> DaoResult<T>
    where
        F: FnOnce(&Connection) -> DaoResult<T>,
    {
        let deadline = Instant::now() + self.lock_timeout;
        let mut pending = f;
        loop {
            let released = self.released.notified();
            let holder = match self.claim(owner, pending) {
                Ok(result) => return result,
                Err((holder, f)) => {
                    pending = f;
                    holder
                }
            };
            tracing::debug!(tx_id = holder, "write waiting for sqlite transaction");
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(self.held_by(holder));
            }
        }
    }

    /// Non-waiting [`SqliteConnection::write`].
    pub fn try_write<T, F>(&self, owner: Option<TransactionId>, f: F) -> DaoResult<T>
    where
        F: FnOnce(&Connection) -> DaoResult<T>,
    {
        self.claim(owner, f)
            .unwrap_or_else(|(holder, _)| Err(self.held_by(holder)))
    }

    pub fn begin(&self, tx_id: TransactionId) -> DaoResult<()> {
        let mut active = self.active_tx.lock();
        if let Some(open) = *active {
            return Err(DaoError::generic(format!(
                "cannot begin transaction {}: transaction {} is still open on this connection",
                tx_id, open
            )));
        }
        self.conn
            .lock()
            .execute_batch("BEGIN")
            .map_err(|e| DaoError::wrap(ErrorKind::Generic, "could not begin sqlite transaction", e))?;
        *active = Some(tx_id);
        tracing::debug!(tx_id, "SQLite transaction started");
        Ok(())
    }

    pub fn commit(&self, tx_id: TransactionId) -> DaoResult<()> {
        let mut active = self.active_tx.lock();
        if *active != Some(tx_id) {
            return Err(DaoError::generic(format!(
                "transaction {} is not the active transaction",
                tx_id
            )));
        }
        self.conn
            .lock()
            .execute_batch("COMMIT")
            .map_err(|e| DaoError::wrap(ErrorKind::Generic, format!("could not commit transaction {}", tx_id), e))?;
        *active = None;
        self.released.notify_waiters();
        tracing::debug!(tx_id, "SQLite transaction committed");
        Ok(())
    }

    pub fn rollback(&self, tx_id: TransactionId) -> DaoResult<()> {
        let mut active = self.active_tx.lock();
        if *active != Some(tx_id) {
            return Err(DaoError::generic(format!(
                "transaction {} is not the active transaction",
                tx_id
            )));
        }
        // Whatever ROLLBACK reports, SQLite no longer considers the
        // transaction open once autocommit is back on.
        let result = {
            let conn = self.conn.lock();
            let result = conn.execute_batch("ROLLBACK");
            if result.is_ok() || conn.is_autocommit() {
                *active = None;
                self.released.notify_waiters();
            }
            result
        };
        result.map_err(|e| {
            DaoError::wrap(ErrorKind::Rollback, format!("could not roll back transaction {}", tx_id), e)
        })?;
        tracing::debug!(tx_id, "SQLite transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn scratch() -> SqliteConnection {
        let conn = SqliteConnection::open_in_memory().unwrap();
        conn.with_conn(|c| c.execute_batch("CREATE TABLE scratch (name TEXT)"))
            .unwrap();
        conn
    }

    fn insert_scratch(c: &Connection, name: &str) -> DaoResult<()> {
        c.execute("INSERT INTO scratch (name) VALUES (?1)", [name])
            .map(|_| ())
            .map_err(|e| DaoError::wrap(ErrorKind::Create, "scratch insert", e))
    }

    fn scratch_count(conn: &SqliteConnection) -> i64 {
        conn.with_conn(|c| c.query_row("SELECT COUNT(*) FROM scratch", [], |r| r.get(0)))
            .unwrap()
    }

    #[test]
    fn only_one_native_transaction_per_connection() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        conn.begin(1).unwrap();
        let err = conn.begin(2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Generic);
        conn.rollback(1).unwrap();
        conn.begin(2).unwrap();
        conn.commit(2).unwrap();
        assert_eq!(conn.active_transaction(), None);
    }

    #[test]
    fn commit_of_unknown_transaction_fails() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        conn.begin(7).unwrap();
        assert!(conn.commit(8).is_err());
        assert_eq!(conn.active_transaction(), Some(7));
    }

    #[test]
    fn file_databases_share_counters_between_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let path = path.to_str().unwrap();
        let a = SqliteConnection::open(path).unwrap();
        let b = SqliteConnection::open(path).unwrap();
        a.with_counters(|c| c.execute("INSERT INTO counters (_id, name, seq, version) VALUES ('x', 'n', 3, 1)", []))
            .unwrap();
        let seq: i64 = b
            .with_counters(|c| c.query_row("SELECT seq FROM counters WHERE name = 'n'", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(seq, 3);
        assert!(std::path::Path::new(&counters_path(path)).exists());
    }

    #[test]
    fn counters_ignore_the_open_transaction() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        conn.begin(1).unwrap();
        conn.with_counters(|c| c.execute("INSERT INTO counters (_id, name, seq, version) VALUES ('x', 'n', 1, 1)", []))
            .unwrap();
        conn.rollback(1).unwrap();
        let kept: i64 = conn
            .with_counters(|c| c.query_row("SELECT COUNT(*) FROM counters", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(kept, 1);
    }

    #[tokio::test]
    async fn owner_writes_join_its_transaction() {
        let conn = scratch();
        conn.begin(1).unwrap();
        conn.write(Some(1), |c| insert_scratch(c, "inside")).await.unwrap();
        conn.rollback(1).unwrap();
        assert_eq!(scratch_count(&conn), 0);
    }

    #[tokio::test]
    async fn outside_writes_wait_for_the_open_transaction() {
        let conn = Arc::new(scratch());
        conn.begin(1).unwrap();
        conn.write(Some(1), |c| insert_scratch(c, "inside")).await.unwrap();

        let writer = conn.clone();
        let outside = tokio::spawn(async move {
            writer.write(None, |c| insert_scratch(c, "outside")).await
        });
        tokio::task::yield_now().await;
        assert_eq!(scratch_count(&conn), 1);

        conn.rollback(1).unwrap();
        outside.await.unwrap().unwrap();
        let names: Vec<String> = conn
            .with_conn(|c| {
                let mut stmt = c.prepare("SELECT name FROM scratch")?;
                let rows = stmt.query_map([], |r| r.get(0))?;
                rows.collect()
            })
            .unwrap();
        assert_eq!(names, vec!["outside"]);
    }

    #[tokio::test]
    async fn outside_writes_give_up_after_the_lock_timeout() {
        let conn = scratch().with_lock_timeout(Duration::from_millis(20));
        conn.begin(1).unwrap();
        let err = conn.write(None, |c| insert_scratch(c, "late")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Generic);
        assert!(conn.try_write(None, |c| insert_scratch(c, "late")).is_err());
        conn.commit(1).unwrap();
        assert_eq!(scratch_count(&conn), 0);
        conn.try_write(None, |c| insert_scratch(c, "now")).unwrap();
        assert_eq!(scratch_count(&conn), 1);
    }
}
