//! Core types and traits for dualdao storage backends.
//!
//! This crate provides the `GenericDao` trait and all associated types
//! (records, canonical entities, errors, transactions, the sequence
//! generator and mappers), enabling pluggable backends in separate crates.

pub mod dao;
pub mod document;
pub mod entity;
pub mod error;
pub mod mapper;
pub mod sequence;
pub mod settings;
pub mod timestamp;
pub mod transaction;
pub mod validation;

// Re-export key types at crate root for convenience
pub use dao::{missing_ids_error, GenericDao};
pub use document::{fields, Document};
pub use entity::{Entity, Revision};
pub use error::{BoxError, BulkFailure, DaoError, DaoResult, ErrorKind};
pub use mapper::{DocumentMapper, ExpandingDocumentMapper, Mapper, RelationalMapper};
pub use sequence::{Counter, CounterError, CounterStore, SequenceGenerator, DEFAULT_MAX_RETRIES};
pub use settings::DaoSettings;
pub use transaction::{
    ensure_open, next_transaction_id, CompensatingTransaction, CompensatingTransactionFactory,
    Transaction, TransactionFactory, TransactionId, TransactionState, UndoAction, UndoLog,
};
pub use validation::{RequiredFields, ValidatingDao, Validator};
