use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use rusqlite::{
    params_from_iter, types::Value as SqlValue, Connection, ErrorCode, OptionalExtension, Row,
};
use serde_json::Value;
use uuid::Uuid;

use dualdao_core::{
    ensure_open, fields, missing_ids_error, timestamp, BulkFailure, Counter, CounterError,
    CounterStore, DaoError, DaoResult, DaoSettings, Document, ErrorKind, GenericDao, Mapper,
    RelationalMapper, Revision, SequenceGenerator, Transaction, TransactionFactory,
    TransactionId, UndoAction,
};

use crate::{
    connection::SqliteConnection,
    schema::{quote, TableSchema},
    transaction::SqliteTransactionFactory,
    values::{from_sql, to_sql},
};

/// `GenericDao` over one SQLite table.
pub struct SqliteDao {
    conn: Arc<SqliteConnection>,
    schema: TableSchema,
    settings: DaoSettings,
    mapper: Arc<dyn Mapper>,
    tx_factory: Arc<dyn TransactionFactory>,
    sequence: SequenceGenerator,
}

impl SqliteDao {
    /// Creates the table if needed. Transactions default to native ones
    /// on the same connection.
    pub fn new(
        conn: Arc<SqliteConnection>,
        schema: TableSchema,
        settings: DaoSettings,
    ) -> DaoResult<Self> {
        conn.try_write(None, |c| {
            c.execute_batch(&schema.create_table_sql()).map_err(|e| {
                DaoError::wrap(
                    ErrorKind::Generic,
                    format!("could not create table '{}'", schema.table()),
                    e,
                )
            })
        })?;
        tracing::debug!(table = schema.table(), entity_type = %settings.entity_type, "sqlite dao ready");

        Ok(Self {
            mapper: Arc::new(RelationalMapper::new(settings.entity_type.clone())),
            tx_factory: Arc::new(SqliteTransactionFactory::new(conn.clone())),
            sequence: SequenceGenerator::new(settings.max_sequence_retries),
            conn,
            schema,
            settings,
        })
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn Mapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_transaction_factory(mut self, factory: Arc<dyn TransactionFactory>) -> Self {
        self.tx_factory = factory;
        self
    }

    pub fn connection(&self) -> &Arc<SqliteConnection> {
        &self.conn
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Strips keys the table has no column for by design and rejects
    /// everything else the schema does not know.
    fn columns_of(&self, mut doc: Document) -> DaoResult<Vec<(String, Value)>> {
        doc.remove(fields::ENTITY_TYPE);
        doc.remove(fields::REV);
        let unknown: Vec<&String> = doc.keys().filter(|k| !self.schema.has_column(k)).collect();
        if !unknown.is_empty() {
            let names: Vec<&str> = unknown.iter().map(|k| k.as_str()).collect();
            return Err(DaoError::validation(format!(
                "table '{}' has no column(s): {}",
                self.schema.table(),
                names.join(", ")
            )));
        }
        Ok(doc.into_inner().into_iter().collect())
    }

    fn row_to_document(&self, row: &Row<'_>) -> rusqlite::Result<Document> {
        let mut doc = Document::new();
        for (i, column) in self.schema.all_columns().enumerate() {
            let value = from_sql(row.get_ref(i)?);
            if !value.is_null() {
                doc.insert(column, value);
            }
        }
        Ok(doc)
    }

    fn select_where(&self, clause: &str, params: Vec<SqlValue>) -> rusqlite::Result<Vec<Document>> {
        let sql = format!(
            "SELECT {} FROM {} {} ORDER BY rowid",
            self.schema.select_list(),
            self.schema.quoted_table(),
            clause
        );
        self.conn.with_conn(|c| {
            let mut stmt = c.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params.iter()), |row| self.row_to_document(row))?;
            rows.collect()
        })
    }

    fn fetch_on(&self, c: &Connection, id: &str) -> rusqlite::Result<Option<Document>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE \"_id\" = ?1",
            self.schema.select_list(),
            self.schema.quoted_table()
        );
        c.query_row(&sql, [id], |row| self.row_to_document(row))
            .optional()
    }

    fn fetch(&self, id: &str) -> rusqlite::Result<Option<Document>> {
        self.conn.with_conn(|c| self.fetch_on(c, id))
    }

    fn fetch_required(&self, id: &str, kind: ErrorKind) -> DaoResult<Document> {
        self.require(self.fetch(id), id, kind)
    }

    fn require(
        &self,
        found: rusqlite::Result<Option<Document>>,
        id: &str,
        kind: ErrorKind,
    ) -> DaoResult<Document> {
        found
            .map_err(|e| DaoError::wrap(kind, format!("could not read '{}'", id), e))?
            .ok_or_else(|| {
                DaoError::new(
                    kind,
                    format!("no entity found with id '{}' in '{}'", id, self.schema.table()),
                )
            })
    }

    fn insert_sql(&self, columns: &[(String, Value)], or_ignore: bool) -> String {
        let names: Vec<String> = columns.iter().map(|(k, _)| quote(k)).collect();
        let slots: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        format!(
            "INSERT {}INTO {} ({}) VALUES ({})",
            if or_ignore { "OR IGNORE " } else { "" },
            self.schema.quoted_table(),
            names.join(", "),
            slots.join(", ")
        )
    }

    /// Deletes the row when run; a no-op if the native rollback already
    /// removed it.
    fn undo_insert(&self, id: String, owner: Option<TransactionId>) -> UndoAction {
        let conn = self.conn.clone();
        let sql = format!("DELETE FROM {} WHERE \"_id\" = ?1", self.schema.quoted_table());
        UndoAction::new(format!("undo create {}", id), move || async move {
            conn.write(owner, |c| {
                c.execute(&sql, [&id]).map_err(|e| {
                    DaoError::wrap(ErrorKind::Rollback, format!("could not remove '{}'", id), e)
                })
            })
            .await?;
            Ok::<(), DaoError>(())
        })
    }

    /// Puts every column of `prior` back, but only while the row still
    /// carries the version this update wrote.
    fn undo_update(&self, prior: Document, written: i64, owner: Option<TransactionId>) -> UndoAction {
        let id = prior.id().unwrap_or_default().to_string();
        let columns: Vec<&str> = self
            .schema
            .all_columns()
            .filter(|c| *c != fields::ID)
            .collect();
        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", quote(c), i + 1))
            .collect();
        let n = columns.len();
        let sql = format!(
            "UPDATE {} SET {} WHERE \"_id\" = ?{} AND \"version\" = ?{}",
            self.schema.quoted_table(),
            assignments.join(", "),
            n + 1,
            n + 2
        );
        let mut values: Vec<SqlValue> = columns
            .iter()
            .map(|c| prior.get(c).map(to_sql).unwrap_or(SqlValue::Null))
            .collect();
        values.push(SqlValue::Text(id.clone()));
        values.push(SqlValue::Integer(written));
        let conn = self.conn.clone();
        UndoAction::new(format!("undo update {}", id), move || async move {
            conn.write(owner, |c| {
                c.execute(&sql, params_from_iter(values.iter())).map_err(|e| {
                    DaoError::wrap(ErrorKind::Rollback, format!("could not revert '{}'", id), e)
                })
            })
            .await?;
            Ok::<(), DaoError>(())
        })
    }

    /// Re-inserts `prior` unless a row with its id exists again.
    fn undo_delete(&self, prior: Document, owner: Option<TransactionId>) -> UndoAction {
        let id = prior.id().unwrap_or_default().to_string();
        let columns: Vec<(String, Value)> = prior.into_inner().into_iter().collect();
        let sql = self.insert_sql(&columns, true);
        let values: Vec<SqlValue> = columns.iter().map(|(_, v)| to_sql(v)).collect();
        let conn = self.conn.clone();
        UndoAction::new(format!("undo delete {}", id), move || async move {
            conn.write(owner, |c| {
                c.execute(&sql, params_from_iter(values.iter())).map_err(|e| {
                    DaoError::wrap(ErrorKind::Rollback, format!("could not restore '{}'", id), e)
                })
            })
            .await?;
            Ok::<(), DaoError>(())
        })
    }

    fn counters(&self) -> TableCounters<'_> {
        TableCounters { conn: &self.conn }
    }
}

#[async_trait]
impl GenericDao for SqliteDao {
    fn entity_type(&self) -> &str {
        &self.settings.entity_type
    }

    fn mapper(&self) -> Arc<dyn Mapper> {
        self.mapper.clone()
    }

    fn begin_transaction(&self) -> DaoResult<Arc<dyn Transaction>> {
        self.tx_factory.begin()
    }

    async fn create(&self, mut doc: Document, tx: Option<&dyn Transaction>) -> DaoResult<Document> {
        ensure_open(tx)?;
        let owner = tx.map(|t| t.id());
        doc.set_if_empty(fields::ID, || Uuid::new_v4().to_string());
        doc.set_if_empty(fields::APP_VERSION, || self.settings.app_version.clone());
        doc.insert(fields::CREATED_DATE, timestamp::now_string());
        doc.insert(fields::VERSION, 1);
        doc.remove(fields::UPDATED_DATE);
        let id = doc.id().unwrap_or_default().to_string();

        let columns = self.columns_of(doc)?;
        let sql = self.insert_sql(&columns, false);
        let values: Vec<SqlValue> = columns.iter().map(|(_, v)| to_sql(v)).collect();
        self.conn
            .write(owner, |c| {
                c.execute(&sql, params_from_iter(values.iter())).map_err(|e| {
                    DaoError::wrap(ErrorKind::Create, format!("could not insert '{}'", id), e)
                })
            })
            .await?;
        tracing::debug!(table = self.schema.table(), id = %id, "inserted row");

        if let Some(tx) = tx {
            tx.register_undo(self.undo_insert(id.clone(), owner))?;
        }
        self.fetch_required(&id, ErrorKind::Create)
    }

    async fn get_one(&self, id: &str) -> DaoResult<Document> {
        self.fetch_required(id, ErrorKind::Get)
    }

    async fn get_all(&self) -> DaoResult<Vec<Document>> {
        self.select_where("", Vec::new()).map_err(|e| {
            DaoError::wrap(
                ErrorKind::Get,
                format!("could not list '{}'", self.schema.table()),
                e,
            )
        })
    }

    async fn get_many(&self, ids: &[String]) -> DaoResult<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let slots: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
        let clause = format!("WHERE \"_id\" IN ({})", slots.join(", "));
        let params = ids.iter().map(|id| SqlValue::Text(id.clone())).collect();
        let rows = self
            .select_where(&clause, params)
            .map_err(|e| DaoError::wrap(ErrorKind::Get, "could not read rows", e))?;

        let mut by_id: HashMap<String, Document> = rows
            .into_iter()
            .filter_map(|doc| doc.id().map(str::to_string).map(|id| (id, doc)))
            .collect();
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match by_id.remove(id) {
                Some(doc) => found.push(doc),
                None => missing.push(id.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(missing_ids_error(&missing));
        }
        Ok(found)
    }

    async fn update(&self, mut doc: Document, tx: Option<&dyn Transaction>) -> DaoResult<Document> {
        let id = doc
            .id()
            .map(str::to_string)
            .ok_or_else(|| DaoError::validation("update requires an _id"))?;
        let version = doc.version().ok_or_else(|| {
            DaoError::validation(format!("update of '{}' requires its current version", id))
        })?;
        ensure_open(tx)?;
        let owner = tx.map(|t| t.id());

        for immutable in [fields::ID, fields::VERSION, fields::CREATED_DATE, fields::UPDATED_DATE] {
            doc.remove(immutable);
        }
        let columns = self.columns_of(doc)?;

        let mut assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, (k, _))| format!("{} = ?{}", quote(k), i + 1))
            .collect();
        let n = columns.len();
        assignments.push("\"version\" = \"version\" + 1".to_string());
        assignments.push(format!("\"updatedDate\" = ?{}", n + 1));
        let sql = format!(
            "UPDATE {} SET {} WHERE \"_id\" = ?{} AND \"version\" = ?{}",
            self.schema.quoted_table(),
            assignments.join(", "),
            n + 2,
            n + 3
        );
        let mut values: Vec<SqlValue> = columns.iter().map(|(_, v)| to_sql(v)).collect();
        values.push(SqlValue::Text(timestamp::now_string()));
        values.push(SqlValue::Text(id.clone()));
        values.push(SqlValue::Integer(version));

        // The prior row is read under the same claim as the write.
        let (prior, changed) = self
            .conn
            .write(owner, |c| {
                let prior = match tx {
                    Some(_) => Some(self.require(self.fetch_on(c, &id), &id, ErrorKind::Update)?),
                    None => None,
                };
                let changed = c.execute(&sql, params_from_iter(values.iter())).map_err(|e| {
                    DaoError::wrap(ErrorKind::Update, format!("could not update '{}'", id), e)
                })?;
                Ok((prior, changed))
            })
            .await?;

        if changed == 0 {
            let exists = self
                .fetch(&id)
                .map_err(|e| DaoError::wrap(ErrorKind::Update, format!("could not read '{}'", id), e))?;
            return Err(match exists {
                Some(current) => {
                    tracing::debug!(table = self.schema.table(), id = %id, expected = version, "stale version on update");
                    DaoError::conflict::<DaoError>(
                        format!(
                            "row '{}' is at version {} but update expected {}",
                            id,
                            current.version().unwrap_or_default(),
                            version
                        ),
                        None,
                    )
                }
                None => DaoError::new(
                    ErrorKind::Update,
                    format!("no entity found with id '{}' in '{}'", id, self.schema.table()),
                ),
            });
        }
        tracing::debug!(table = self.schema.table(), id = %id, version = version + 1, "updated row");
        if let (Some(tx), Some(prior)) = (tx, prior) {
            tx.register_undo(self.undo_update(prior, version + 1, owner))?;
        }
        self.fetch_required(&id, ErrorKind::Update)
    }

    async fn delete(&self, id: &str, tx: Option<&dyn Transaction>) -> DaoResult<String> {
        ensure_open(tx)?;
        let owner = tx.map(|t| t.id());
        let sql = format!("DELETE FROM {} WHERE \"_id\" = ?1", self.schema.quoted_table());
        let removed = self
            .conn
            .write(owner, |c| {
                if let Some(tx) = tx {
                    let prior = self.require(self.fetch_on(c, id), id, ErrorKind::Delete)?;
                    tx.register_undo(self.undo_delete(prior, owner))?;
                }
                c.execute(&sql, [id]).map_err(|e| {
                    DaoError::wrap(ErrorKind::Delete, format!("could not delete '{}'", id), e)
                })
            })
            .await?;
        if removed == 0 {
            return Err(DaoError::new(
                ErrorKind::Delete,
                format!("no entity found with id '{}' in '{}'", id, self.schema.table()),
            ));
        }
        tracing::debug!(table = self.schema.table(), id, "deleted row");
        Ok(removed.to_string())
    }

    async fn bulk_save(
        &self,
        docs: Vec<Document>,
        tx: Option<&dyn Transaction>,
    ) -> DaoResult<Vec<Document>> {
        ensure_open(tx)?;
        let total = docs.len();
        let mut saved = Vec::with_capacity(total);
        let mut failed = Vec::new();

        for doc in docs {
            let id = doc.id().map(str::to_string);
            let result = if doc.version().is_some() {
                self.update(doc, tx).await
            } else {
                self.create(doc, tx).await
            };
            match result {
                Ok(doc) => saved.push(doc),
                Err(e) => failed.push(BulkFailure {
                    id,
                    reason: e.to_string(),
                }),
            }
        }

        if !failed.is_empty() {
            metrics::increment_counter!("dualdao_bulk_save_failures_total");
            let succeeded: Vec<String> = saved
                .iter()
                .filter_map(|d| d.id().map(str::to_string))
                .collect();
            if tx.is_none() {
                tracing::warn!(
                    table = self.schema.table(),
                    failed = failed.len(),
                    persisted = succeeded.len(),
                    "bulk save partially applied outside a transaction; successful writes remain"
                );
            }
            return Err(DaoError::bulk_save(
                format!("{} of {} rows failed", failed.len(), total),
                failed,
                succeeded,
            ));
        }
        Ok(saved)
    }

    async fn find_by_field(&self, field: &str, value: &Value) -> DaoResult<Vec<Document>> {
        if !self.schema.has_column(field) {
            return Err(DaoError::get(format!(
                "cannot query '{}' by unknown column '{}'",
                self.schema.table(),
                field
            )));
        }
        let clause = format!("WHERE {} IS ?1", quote(field));
        self.select_where(&clause, vec![to_sql(value)]).map_err(|e| {
            DaoError::wrap(
                ErrorKind::Get,
                format!("could not query '{}' by '{}'", self.schema.table(), field),
                e,
            )
        })
    }

    async fn get_next_sequence_id(&self, name: &str) -> DaoResult<u64> {
        self.sequence.next(&self.counters(), name).await
    }

    async fn create_index(&self, field: &str) -> DaoResult<()> {
        if !self.schema.has_column(field) {
            return Err(DaoError::generic(format!(
                "cannot index unknown column '{}' of '{}'",
                field,
                self.schema.table()
            )));
        }
        let sql = self.schema.index_sql(field);
        self.conn
            .write(None, |c| {
                c.execute_batch(&sql).map_err(|e| {
                    DaoError::wrap(ErrorKind::Generic, format!("could not index '{}'", field), e)
                })
            })
            .await
    }
}

/// Counters in the `counters` table, guarded by its `version`. They run on
/// the connection's counters handle so no transaction can roll them back.
struct TableCounters<'a> {
    conn: &'a SqliteConnection,
}

fn counter_backend_error(name: &str, e: rusqlite::Error) -> CounterError {
    CounterError::Backend(DaoError::wrap(
        ErrorKind::Generic,
        format!("counter '{}' could not be accessed", name),
        e,
    ))
}

#[async_trait]
impl<'a> CounterStore for TableCounters<'a> {
    async fn load_counter(&self, name: &str) -> Result<Option<Counter>, CounterError> {
        let row = self
            .conn
            .with_counters(|c| {
                c.query_row(
                    "SELECT seq, version FROM counters WHERE name = ?1",
                    [name],
                    |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
                )
                .optional()
            })
            .map_err(|e| counter_backend_error(name, e))?;
        Ok(row.map(|(seq, version)| Counter {
            name: name.to_string(),
            value: u64::try_from(seq).unwrap_or_default(),
            revision: Some(Revision::Version(version)),
        }))
    }

    async fn insert_counter(&self, name: &str, value: u64) -> Result<Counter, CounterError> {
        let seq = i64::try_from(value).map_err(|_| {
            CounterError::Backend(DaoError::generic(format!("counter '{}' overflowed", name)))
        })?;
        let inserted = self.conn.with_counters(|c| {
            c.execute(
                "INSERT INTO counters (_id, name, seq, version) VALUES (?1, ?2, ?3, 1)",
                rusqlite::params![Uuid::new_v4().to_string(), name, seq],
            )
        });
        match inserted {
            Ok(_) => Ok(Counter {
                name: name.to_string(),
                value,
                revision: Some(Revision::Version(1)),
            }),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(CounterError::Conflict)
            }
            Err(e) => Err(counter_backend_error(name, e)),
        }
    }

    async fn save_counter(&self, counter: &Counter) -> Result<Counter, CounterError> {
        let expected = counter
            .revision
            .as_ref()
            .and_then(Revision::as_version)
            .ok_or(CounterError::Conflict)?;
        let seq = i64::try_from(counter.value).map_err(|_| {
            CounterError::Backend(DaoError::generic(format!("counter '{}' overflowed", counter.name)))
        })?;
        let changed = self
            .conn
            .with_counters(|c| {
                c.execute(
                    "UPDATE counters SET seq = ?1, version = version + 1 WHERE name = ?2 AND version = ?3",
                    rusqlite::params![seq, counter.name, expected],
                )
            })
            .map_err(|e| counter_backend_error(&counter.name, e))?;
        if changed == 0 {
            return Err(CounterError::Conflict);
        }
        Ok(Counter {
            revision: Some(Revision::Version(expected + 1)),
            ..counter.clone()
        })
    }
}
