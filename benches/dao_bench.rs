use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

use dualdao::dualdao_core::{DaoSettings, Document, GenericDao};
use dualdao::dualdao_document::{DocumentDao, MemoryDocumentStore};
use dualdao::dualdao_sqlite::{SqliteConnection, SqliteDao, TableSchema};

fn document_dao() -> Arc<dyn GenericDao> {
    Arc::new(DocumentDao::new(
        Arc::new(MemoryDocumentStore::new()),
        DaoSettings::new("Bench|"),
    ))
}

fn sqlite_dao() -> Arc<dyn GenericDao> {
    let conn = Arc::new(SqliteConnection::open_in_memory().unwrap());
    let schema = TableSchema::new("bench", ["name", "qty"]).unwrap();
    Arc::new(SqliteDao::new(conn, schema, DaoSettings::new("Bench|")).unwrap())
}

fn seed(rt: &Runtime, dao: &Arc<dyn GenericDao>, count: usize) -> Vec<Document> {
    rt.block_on(async {
        let mut docs = Vec::with_capacity(count);
        for i in 0..count {
            let doc = Document::new().with("name", format!("item-{}", i)).with("qty", i);
            docs.push(dao.create(doc, None).await.unwrap());
        }
        docs
    })
}

fn bench_create(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    for (name, dao) in [("document", document_dao()), ("sqlite", sqlite_dao())] {
        c.bench_function(&format!("{}_create", name), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let doc = Document::new().with("name", "bench").with("qty", 1);
                    black_box(dao.create(doc, None).await.unwrap());
                })
            })
        });
    }
}

fn bench_get_one(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    for (name, dao) in [("document", document_dao()), ("sqlite", sqlite_dao())] {
        let docs = seed(&rt, &dao, 1_000);
        let id = docs[500].id().unwrap().to_string();
        c.bench_function(&format!("{}_get_one", name), |b| {
            b.iter(|| rt.block_on(async { black_box(dao.get_one(&id).await.unwrap()) }))
        });
    }
}

fn bench_find_by_field(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    for (name, dao) in [("document", document_dao()), ("sqlite", sqlite_dao())] {
        seed(&rt, &dao, 1_000);
        rt.block_on(dao.create_index("name")).unwrap();
        let value = serde_json::json!("item-750");
        c.bench_function(&format!("{}_find_by_field_indexed", name), |b| {
            b.iter(|| {
                rt.block_on(async { black_box(dao.find_by_field("name", &value).await.unwrap()) })
            })
        });
    }
}

fn bench_rollback(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    for (name, dao) in [("document", document_dao()), ("sqlite", sqlite_dao())] {
        c.bench_function(&format!("{}_transaction_rollback_10", name), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let tx = dao.begin_transaction().unwrap();
                    for i in 0..10 {
                        let doc = Document::new().with("name", format!("tx-{}", i));
                        dao.create(doc, Some(tx.as_ref())).await.unwrap();
                    }
                    tx.rollback().await.unwrap();
                })
            })
        });
    }
}

fn bench_sequence(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    for (name, dao) in [("document", document_dao()), ("sqlite", sqlite_dao())] {
        c.bench_function(&format!("{}_next_sequence_id", name), |b| {
            b.iter(|| rt.block_on(async { black_box(dao.get_next_sequence_id("bench").await.unwrap()) }))
        });
    }
}

criterion_group!(
    benches,
    bench_create,
    bench_get_one,
    bench_find_by_field,
    bench_rollback,
    bench_sequence
);
criterion_main!(benches);
