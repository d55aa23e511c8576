use std::{fs, sync::Arc, thread};

use bytes::Bytes;
use wpr_archive::{
    check_writable, Archive, ArchiveError, ArchiveOptions, ArchiveStore, Exchange, Recorded,
    RecordedResponse, Scheme, Signature,
};

fn get(host: &str, target: &str) -> Signature {
    Signature::builder("GET", Scheme::Http, host, target).build()
}

fn exchange(host: &str, target: &str, body: &'static str) -> Exchange {
    Exchange::new(get(host, target), RecordedResponse::new(200).with_chunk(body))
}

#[test]
fn record_persist_load_lookup() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.wpr");

    let store = ArchiveStore::recording(ArchiveOptions::default());
    store.record(exchange("example.com", "/", "index")).unwrap();
    store.record(exchange("example.com", "/app.js", "js")).unwrap();
    store.persist(&path).unwrap();

    let replay = ArchiveStore::load(&path).unwrap();
    assert!(!replay.is_recording());
    assert_eq!(replay.len(), 2);

    let hit = replay.lookup(&get("EXAMPLE.com:80", "/app.js")).unwrap();
    assert_eq!(hit.response.body(), Bytes::from_static(b"js"));
    assert!(replay.lookup(&get("example.com", "/missing")).is_none());
}

#[test]
fn duplicates_keep_the_first_capture() {
    let store = ArchiveStore::recording(ArchiveOptions::default());

    assert!(matches!(store.record(exchange("a.test", "/", "first")), Ok(Recorded::Inserted(_))));
    let second = store.record(exchange("a.test", "/", "second")).unwrap();

    assert!(matches!(second, Recorded::Duplicate(_)));
    assert_eq!(second.exchange().response.body(), Bytes::from_static(b"first"));
    assert_eq!(store.len(), 1);
}

#[test]
fn fallback_ignores_query_order_and_prefers_earliest() {
    let mut archive = Archive::new();
    archive.insert(exchange("a.test", "/s?b=2&a=1", "earliest"));
    archive.insert(exchange("a.test", "/s?a=1&b=2", "exact"));

    let exact = archive.get(&get("a.test", "/s?a=1&b=2")).unwrap();
    assert_eq!(exact.response.body(), Bytes::from_static(b"exact"));

    let loose = archive.get(&get("a.test", "/s?b=2&&a=1&")).unwrap();
    assert_eq!(loose.response.body(), Bytes::from_static(b"earliest"));

    assert!(archive.get(&get("a.test", "/s?a=1")).is_none());
}

#[test]
fn frozen_store_rejects_writes() {
    let store = ArchiveStore::frozen(Archive::new());

    assert!(matches!(store.record(exchange("a.test", "/", "x")), Err(ArchiveError::ReadOnly)));
    assert!(matches!(store.persist("unused.wpr"), Err(ArchiveError::ReadOnly)));
}

#[test]
fn persist_happens_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("once.wpr");

    let store = ArchiveStore::recording(ArchiveOptions::default());
    store.record(exchange("a.test", "/", "x")).unwrap();
    store.persist(&path).unwrap();

    assert!(matches!(store.persist(&path), Err(ArchiveError::AlreadyPersisted)));
    assert!(matches!(
        store.record(exchange("a.test", "/late", "y")),
        Err(ArchiveError::AlreadyPersisted)
    ));
}

#[test]
fn failed_persist_leaves_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keep.wpr");
    fs::write(&path, b"previous").unwrap();

    let store = ArchiveStore::recording(ArchiveOptions::default());
    store.record(exchange("a.test", "/", "x")).unwrap();

    // The target directory does not exist, so the temporary file cannot be created.
    let missing = dir.path().join("nope").join("keep.wpr");
    assert!(store.persist(&missing).is_err());
    assert_eq!(fs::read(&path).unwrap(), b"previous");

    // The failed attempt does not count.
    store.persist(&path).unwrap();
    assert_eq!(Archive::load(&path).unwrap().len(), 1);
}

#[test]
fn size_limit_is_enforced() {
    let store = ArchiveStore::recording(ArchiveOptions::default().max_bytes(8));
    store.record(exchange("a.test", "/", "12345")).unwrap();

    let err = store.record(exchange("a.test", "/2", "12345")).unwrap_err();
    assert!(matches!(err, ArchiveError::CapacityExceeded { limit: 8 }));
}

#[test]
fn load_errors() {
    let dir = tempfile::tempdir().unwrap();

    let missing = dir.path().join("missing.wpr");
    assert!(matches!(Archive::load(&missing), Err(ArchiveError::NotFound(_))));

    let garbage = dir.path().join("garbage.wpr");
    fs::write(&garbage, b"not an archive").unwrap();
    assert!(matches!(Archive::load(&garbage), Err(ArchiveError::Corrupt(_))));
}

#[test]
fn writable_check() {
    let dir = tempfile::tempdir().unwrap();
    check_writable(dir.path().join("new.wpr")).unwrap();

    let err = check_writable(dir.path().join("missing-dir").join("new.wpr")).unwrap_err();
    assert!(matches!(err, ArchiveError::NotWritable { .. }));

    assert!(check_writable(dir.path()).is_err());
}

#[test]
fn closest_prefers_longest_common_prefix_on_same_host() {
    let mut archive = Archive::new();
    archive.insert(exchange("a.test", "/static/app.js", "x"));
    archive.insert(exchange("a.test", "/static/app.css", "x"));
    archive.insert(exchange("b.test", "/static/app.js?v=2", "x"));

    let closest = archive.closest(&get("a.test", "/static/app.js?v=2")).unwrap();
    assert_eq!(closest.path(), "/static/app.js");

    assert!(archive.closest(&get("c.test", "/")).is_none());
}

#[test]
fn concurrent_recording_is_serialized() {
    let store = Arc::new(ArchiveStore::recording(ArchiveOptions::default()));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..50 {
                    let target = format!("/{t}/{i}");
                    let sig = get("a.test", &target);
                    store.record(Exchange::new(sig, RecordedResponse::new(200))).unwrap();
                    assert!(store.lookup(&get("a.test", &target)).is_some());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.len(), 400);
}
