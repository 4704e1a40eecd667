//! MVCC document-store backend for dualdao.
//!
//! `DocumentEngine` abstracts a revisioned, schemaless store;
//! `MemoryDocumentStore` is the in-process implementation and
//! `DocumentDao` implements `GenericDao` on top of any engine.

pub mod dao;
pub mod engine;
pub mod memory;

pub use dao::DocumentDao;
pub use engine::{AllDocsRow, DocHead, DocumentEngine, Selector, StoreError, StoreResult, WriteResult};
pub use memory::MemoryDocumentStore;
