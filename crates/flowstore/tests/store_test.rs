use flowcore::{status, Context, Output};
use flowstore::{
    NamespaceConfig, NamespaceKind, SearchQuery, Store, StoreConfig, StoreError, StoreNamespace,
    Update,
};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn sql_store(path: Option<&std::path::Path>) -> Store {
    let mut config = StoreConfig::default()
        .with_namespace("counters", NamespaceConfig::new(NamespaceKind::Sql))
        .with_namespace("history", NamespaceConfig::new(NamespaceKind::Sql));
    config.sqlite_path = path.map(|p| p.to_path_buf());
    Store::new(config).unwrap()
}

fn increment(ns: &Arc<dyn StoreNamespace>, ctx: &Context) {
    ns.transaction("count", ctx, |entry| {
        let current = entry
            .map(|e| e.data().to_text().parse::<i64>().unwrap_or(0))
            .unwrap_or(0);
        Ok(Update::Write(Output::integer(current + 1)))
    })
    .unwrap();
}

async fn assert_concurrent_increments(ns: Arc<dyn StoreNamespace>) {
    let mut tasks = Vec::new();
    for worker in 0..8 {
        let ns = Arc::clone(&ns);
        tasks.push(tokio::task::spawn_blocking(move || {
            let ctx = Context::new(format!("worker {}", worker));
            for _ in 0..25 {
                increment(&ns, &ctx);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    let entry = ns.get("count").unwrap().unwrap();
    assert_eq!(entry.data().to_text(), "200");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transactions_apply_every_update() {
    init_tracing();
    let store = Store::in_memory();
    assert_concurrent_increments(store.namespace("counters").unwrap()).await;

    let store = sql_store(None);
    assert_concurrent_increments(store.namespace("counters").unwrap()).await;
}

#[tokio::test]
async fn test_aborted_transaction_returns_its_output() {
    let store = Store::in_memory();
    let ns = store.namespace("test").unwrap();
    let ctx = Context::new("test");
    ns.set("door", Output::plain("closed"), &ctx).unwrap();

    let err = ns
        .transaction("door", &ctx, |_| {
            Err(Output::error(status::EXPECTATION_FAILED, "door is locked"))
        })
        .unwrap_err();
    assert_eq!(err.status_code(), status::EXPECTATION_FAILED);
    let output: Output = err.into();
    assert_eq!(output.error_message(), Some("door is locked"));
    assert_eq!(ns.get("door").unwrap().unwrap().data().to_text(), "closed");

    let kept = ns
        .transaction("door", &ctx, |_| Ok(Update::Unchanged))
        .unwrap()
        .unwrap();
    assert_eq!(kept.data().to_text(), "closed");
}

#[tokio::test]
async fn test_compare_and_swap() {
    let store = sql_store(None);
    for name in ["memory", "history"] {
        let ns = store.namespace(name).unwrap();
        let ctx = Context::new("cas");

        let err = ns
            .compare_and_swap("mode", "day", Output::plain("night"), &ctx)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        ns.set("mode", Output::plain("day"), &ctx).unwrap();
        let err = ns
            .compare_and_swap("mode", "evening", Output::plain("night"), &ctx)
            .unwrap_err();
        assert_eq!(err.status_code(), status::CONFLICT);
        assert_eq!(ns.get("mode").unwrap().unwrap().data().to_text(), "day");

        ns.compare_and_swap("mode", "day", Output::plain("night"), &ctx)
            .unwrap();
        assert_eq!(ns.get("mode").unwrap().unwrap().data().to_text(), "night");
    }
}

#[tokio::test]
async fn test_max_age_reads_and_claims() {
    let store = sql_store(None);
    for name in ["memory", "history"] {
        let ns = store.namespace(name).unwrap();
        let ctx = Context::new("age");
        ns.set("motion", Output::plain("detected"), &ctx).unwrap();

        let err = ns
            .set_if_absent_or_older("motion", Output::plain("again"), Duration::from_secs(60), &ctx)
            .unwrap_err();
        assert_eq!(err.status_code(), status::CONFLICT);
        assert!(err.to_string().contains("already exists"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let err = ns
            .get_if_younger("motion", Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.status_code(), status::GONE);
        assert!(ns.get("motion").unwrap().is_some());
        assert!(ns.get_if_younger("motion", Duration::from_secs(60)).unwrap().is_some());

        ns.set_if_absent_or_older("motion", Output::plain("again"), Duration::from_millis(10), &ctx)
            .unwrap();
        assert_eq!(ns.get("motion").unwrap().unwrap().data().to_text(), "again");
    }
}

#[tokio::test]
async fn test_sql_keeps_payload_kinds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    let ctx = Context::new("kinds");
    let values = [
        ("empty", Output::empty()),
        ("plain", Output::plain("on")),
        ("integer", Output::integer(42)),
        ("float", Output::float(21.5)),
        ("bytes", Output::bytes_with_content_type(vec![1, 2, 3], "image/png")),
        ("object", Output::object(&serde_json::json!({"temperature": 21}))),
        ("error", Output::error(status::NOT_FOUND, "sensor missing")),
    ];
    {
        let store = sql_store(Some(&path));
        let ns = store.namespace("history").unwrap();
        for (key, value) in &values {
            ns.set(key, value.clone(), &ctx).unwrap();
        }
    }

    let store = sql_store(Some(&path));
    let ns = store.namespace("history").unwrap();
    for (key, value) in &values {
        let entry = ns.get(key).unwrap().unwrap();
        assert_eq!(entry.data(), value, "{}", key);
        assert_eq!(entry.modified_by_id(), ctx.id().to_string());
    }
    assert_eq!(ns.len().unwrap(), values.len());
}

#[tokio::test]
async fn test_trim_and_delete_older() {
    let store = sql_store(None);
    for name in ["memory", "history"] {
        let ns = store.namespace(name).unwrap();
        let ctx = Context::new("trim");
        for i in 0..5 {
            ns.set(&format!("k{}", i), Output::integer(i), &ctx).unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(ns.trim(3).unwrap(), 2);
        assert_eq!(ns.keys().unwrap(), vec!["k2", "k3", "k4"]);

        tokio::time::sleep(Duration::from_millis(30)).await;
        ns.set("fresh", Output::plain("x"), &ctx).unwrap();
        assert_eq!(ns.delete_older(Duration::from_millis(20)).unwrap(), 3);
        assert_eq!(ns.keys().unwrap(), vec!["fresh"]);
    }
}

#[tokio::test]
async fn test_search() {
    let store = Store::in_memory();
    let ns = store.namespace("devices").unwrap();
    let kitchen = Context::new("kitchen");
    let hall = Context::new("hall");
    ns.set("KitchenLamp", Output::plain("on"), &kitchen).unwrap();
    ns.set("HallLamp", Output::plain("off"), &hall).unwrap();
    ns.set("Thermostat", Output::plain("21"), &hall).unwrap();

    let query = SearchQuery {
        key: Some("lamp".to_string()),
        ..Default::default()
    };
    let found = ns.search(&query).unwrap();
    assert_eq!(found.keys().collect::<Vec<_>>(), vec!["HallLamp", "KitchenLamp"]);

    let query = SearchQuery {
        modified_by: Some(hall.id().to_string()),
        value: Some("OFF".to_string()),
        ..Default::default()
    };
    let found = ns.search(&query).unwrap();
    assert_eq!(found.keys().collect::<Vec<_>>(), vec!["HallLamp"]);
}

#[tokio::test]
async fn test_configured_backends() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::default()
        .with_namespace(
            "docs",
            NamespaceConfig {
                kind: NamespaceKind::Files,
                directory: Some(dir.path().join("docs")),
                ..Default::default()
            },
        )
        .with_namespace(
            "events",
            NamespaceConfig {
                kind: NamespaceKind::Log,
                auto_trim: 10,
                ..Default::default()
            },
        )
        .with_namespace("void", NamespaceConfig::new(NamespaceKind::Null));
    let store = Store::new(config).unwrap();
    let ctx = Context::new("backends");

    let docs = store.namespace("docs").unwrap();
    docs.set("readme", Output::plain("hello"), &ctx).unwrap();
    assert_eq!(docs.get("readme").unwrap().unwrap().data().to_bytes(), b"hello");
    let err = docs.set("../escape", Output::plain("x"), &ctx).unwrap_err();
    assert_eq!(err.status_code(), status::BAD_REQUEST);
    let err = docs.trim(1).unwrap_err();
    assert_eq!(err.status_code(), status::NOT_IMPLEMENTED);

    let events = store.namespace("events").unwrap();
    for i in 0..25 {
        events.set("", Output::integer(i), &ctx).unwrap();
    }
    assert!(events.len().unwrap() <= 10);
    assert_eq!(events.delete("20").unwrap_err().status_code(), status::NOT_IMPLEMENTED);

    let void = store.namespace("void").unwrap();
    void.set("k", Output::plain("v"), &ctx).unwrap();
    assert!(void.get("k").unwrap().is_none());

    let names = store.namespace_names();
    for name in ["docs", "events", "void"] {
        assert!(names.contains(&name.to_string()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_reads_never_see_partial_writes() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::default().with_namespace(
        "docs",
        NamespaceConfig {
            kind: NamespaceKind::Files,
            directory: Some(dir.path().join("docs")),
            ..Default::default()
        },
    );
    let store = Store::new(config).unwrap();
    let docs = store.namespace("docs").unwrap();
    let long_a = "a".repeat(64 * 1024);
    let long_b = "b".repeat(64 * 1024);
    docs.set("page", Output::plain(long_a.clone()), &Context::new("seed")).unwrap();

    let writer = {
        let docs = Arc::clone(&docs);
        let (long_a, long_b) = (long_a.clone(), long_b.clone());
        tokio::task::spawn_blocking(move || {
            let ctx = Context::new("writer");
            for i in 0..200 {
                let value = if i % 2 == 0 { &long_b } else { &long_a };
                docs.set("page", Output::plain(value.clone()), &ctx).unwrap();
            }
        })
    };
    let mut readers = Vec::new();
    for _ in 0..3 {
        let docs = Arc::clone(&docs);
        let (long_a, long_b) = (long_a.clone(), long_b.clone());
        readers.push(tokio::task::spawn_blocking(move || {
            for _ in 0..200 {
                let entry = docs.get("page").unwrap().unwrap();
                let data = entry.data().to_bytes();
                assert!(
                    data == long_a.as_bytes() || data == long_b.as_bytes(),
                    "read {} bytes",
                    data.len()
                );
            }
        }));
    }
    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sql_namespaces_do_not_block_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let store = sql_store(Some(&dir.path().join("store.db")));
    let counters = store.namespace("counters").unwrap();
    let history = store.namespace("history").unwrap();
    history.set("last", Output::plain("seen"), &Context::new("seed")).unwrap();

    let (inside_tx, inside_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let holder = tokio::task::spawn_blocking(move || {
        counters
            .transaction("count", &Context::new("slow"), |_| {
                inside_tx.send(()).unwrap();
                let released = release_rx.recv_timeout(Duration::from_secs(5)).is_ok();
                Ok(Update::Write(Output::plain(if released { "released" } else { "timed out" })))
            })
            .unwrap();
        counters
    });
    inside_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // a read in another namespace completes while the transaction is open
    let reader = tokio::task::spawn_blocking(move || history.get("last").unwrap().unwrap().data().to_text());
    assert_eq!(reader.await.unwrap(), "seen");
    release_tx.send(()).unwrap();

    let counters = holder.await.unwrap();
    assert_eq!(counters.get("count").unwrap().unwrap().data().to_text(), "released");
}
