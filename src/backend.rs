//! Backend selection by configuration.

use std::sync::Arc;

use dualdao_core::{DaoError, DaoResult, ErrorKind, GenericDao};
use dualdao_document::{DocumentDao, DocumentEngine, MemoryDocumentStore};
use dualdao_sqlite::{SqliteConnection, SqliteDao, TableSchema};

use crate::config::{BackendKind, Config};

/// Builds the DAO named by `config.store.backend` over a fresh store.
pub fn build_dao(config: &Config) -> DaoResult<Arc<dyn GenericDao>> {
    match config.store.backend {
        BackendKind::Document => build_document_dao(config, Arc::new(MemoryDocumentStore::new())),
        BackendKind::Sqlite => {
            let conn = SqliteConnection::open(&config.store.sqlite_path).map_err(|e| {
                DaoError::wrap(ErrorKind::Generic, "could not select sqlite backend", e)
            })?;
            build_sqlite_dao(config, Arc::new(conn))
        }
    }
}

/// Document backend over an existing engine, so several DAOs can share
/// one database.
pub fn build_document_dao(
    config: &Config,
    engine: Arc<dyn DocumentEngine>,
) -> DaoResult<Arc<dyn GenericDao>> {
    require_entity_type(config)?;
    tracing::info!(backend = "document", entity_type = %config.dao.entity_type, "building dao");
    Ok(Arc::new(DocumentDao::new(engine, config.dao.clone())))
}

/// SQLite backend over an existing connection.
pub fn build_sqlite_dao(
    config: &Config,
    conn: Arc<SqliteConnection>,
) -> DaoResult<Arc<dyn GenericDao>> {
    require_entity_type(config)?;
    let schema = TableSchema::new(config.store.table.as_str(), config.store.columns.iter().cloned())
        .map_err(|e| DaoError::wrap(ErrorKind::Generic, "invalid sqlite table configuration", e))?;
    tracing::info!(
        backend = "sqlite",
        entity_type = %config.dao.entity_type,
        table = schema.table(),
        "building dao"
    );
    Ok(Arc::new(SqliteDao::new(conn, schema, config.dao.clone())?))
}

fn require_entity_type(config: &Config) -> DaoResult<()> {
    if config.dao.entity_type.is_empty() {
        return Err(DaoError::generic("dao.entity_type must be configured"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml: &str) -> Config {
        Config::from_toml_str(toml).unwrap()
    }

    #[test]
    fn selects_backend_from_config() {
        let doc = build_dao(&config("[dao]\nentity_type = \"Widget|\"")).unwrap();
        assert_eq!(doc.entity_type(), "Widget|");

        let sql = build_dao(&config(
            "[dao]\nentity_type = \"Widget|\"\n[store]\nbackend = \"sqlite\"\ntable = \"widgets\"\ncolumns = [\"name\"]",
        ))
        .unwrap();
        assert_eq!(sql.entity_type(), "Widget|");
    }

    #[test]
    fn missing_entity_type_is_rejected() {
        let err = build_dao(&Config::default()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Generic);
    }

    #[test]
    fn bad_table_name_is_a_selection_failure() {
        let err = build_dao(&config(
            "[dao]\nentity_type = \"Widget|\"\n[store]\nbackend = \"sqlite\"\ntable = \"drop table\"",
        ))
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::Generic);
    }
}
