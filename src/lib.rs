//! dualdao: one data-access contract over two persistence engines.
//!
//! The backend crates are re-exported; this crate adds configuration,
//! logging bootstrap, backend selection and the unit-of-work helper.

pub mod backend;
pub mod config;
pub mod logging;
pub mod unit_of_work;

pub use dualdao_core;
pub use dualdao_document;
pub use dualdao_sqlite;

pub use backend::{build_dao, build_document_dao, build_sqlite_dao};
pub use config::{BackendKind, Config, ConfigError, LoggingConfig, StoreConfig};
pub use dualdao_core::{DaoError, DaoResult, Document, ErrorKind, GenericDao, Transaction};
pub use logging::init_logging;
pub use unit_of_work::UnitOfWork;
