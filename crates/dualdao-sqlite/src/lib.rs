//! SQLite storage backend for dualdao.
//!
//! One table per logical type, optimistic locking through a `version`
//! column and native transactions backed up by compensations.

pub mod connection;
pub mod dao;
pub mod schema;
pub mod transaction;
mod values;

pub use connection::SqliteConnection;
pub use dao::SqliteDao;
pub use schema::{TableSchema, RESERVED_COLUMNS};
pub use transaction::{SqliteTransaction, SqliteTransactionFactory};
