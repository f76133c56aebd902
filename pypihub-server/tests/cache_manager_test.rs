//! Cache manager behavior under repetition, concurrency and upstream failure.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{create_core_setup, fast_settings, file_url, package, storage_in, FakeUpstream};
use pypihub_server::{
    AppError, CacheManager, CacheSettings, DiskRecordStore, Origin, RecordStore,
};

#[tokio::test]
async fn test_resolve_twice_within_ttl_fetches_once() {
    let setup = create_core_setup(fast_settings());
    setup.upstream.publish("foo", &[("foo-1.0.whl", "one")]);
    let foo = package("foo");

    let first = setup.cache.resolve(&foo).await.unwrap();
    let second = setup.cache.resolve(&foo).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first[0].href, file_url("foo", "foo-1.0.whl"));
    assert_eq!(setup.upstream.index_calls(), 1);
}

#[tokio::test]
async fn test_upstream_order_is_preserved() {
    let setup = create_core_setup(fast_settings());
    setup.upstream.publish(
        "foo",
        &[("foo-0.9.tar.gz", "a"), ("foo-1.0.tar.gz", ""), ("foo-0.1.tar.gz", "c")],
    );

    let entries = setup.cache.resolve(&package("foo")).await.unwrap();
    let filenames: Vec<_> = entries.iter().map(|e| e.filename.as_str()).collect();
    assert_eq!(filenames, ["foo-0.9.tar.gz", "foo-1.0.tar.gz", "foo-0.1.tar.gz"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolves_share_one_fetch() {
    let setup = create_core_setup(fast_settings());
    setup.upstream.publish("foo", &[("foo-1.0.whl", "one"), ("foo-2.0.whl", "two")]);
    setup.upstream.set_delay(Duration::from_millis(200));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let cache = setup.cache.clone();
        handles.push(tokio::spawn(async move { cache.resolve(&package("Foo")).await }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(setup.upstream.index_calls(), 1);
    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(results[0].len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_packages_fetch_in_parallel() {
    let setup = create_core_setup(fast_settings());
    setup.upstream.publish("foo", &[("foo-1.0.whl", "f")]);
    setup.upstream.publish("bar", &[("bar-1.0.whl", "")]);
    setup.upstream.set_delay(Duration::from_millis(300));

    let started = Instant::now();
    let foo = package("foo");
    let bar = package("bar");
    let (a, b) = tokio::join!(setup.cache.resolve(&foo), setup.cache.resolve(&bar));

    assert!(a.is_ok() && b.is_ok());
    assert_eq!(setup.upstream.index_calls(), 2);
    assert!(started.elapsed() < Duration::from_millis(550));
}

#[tokio::test]
async fn test_stale_record_survives_upstream_failure() {
    let setup = create_core_setup(CacheSettings {
        ttl: Duration::ZERO,
        ..fast_settings()
    });
    setup.upstream.publish("foo", &[("foo-1.0.whl", "one")]);
    let foo = package("foo");

    let fresh = setup.cache.resolve(&foo).await.unwrap();
    setup.upstream.set_failing(true);
    let stale = setup.cache.resolve(&foo).await.unwrap();

    assert_eq!(fresh, stale);
    assert_eq!(setup.upstream.index_calls(), 2);
}

#[tokio::test]
async fn test_upstream_timeout_counts_as_failure() {
    let setup = create_core_setup(CacheSettings {
        ttl: Duration::ZERO,
        upstream_timeout: Duration::from_millis(50),
        ..fast_settings()
    });
    setup.upstream.publish("foo", &[("foo-1.0.whl", "one")]);
    let foo = package("foo");
    let fresh = setup.cache.resolve(&foo).await.unwrap();

    setup.upstream.set_delay(Duration::from_millis(500));
    let started = Instant::now();
    let stale = setup.cache.resolve(&foo).await.unwrap();

    assert_eq!(fresh, stale);
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn test_unknown_package_with_failing_upstream_is_empty() {
    let setup = create_core_setup(fast_settings());
    setup.upstream.set_failing(true);
    let entries = setup.cache.resolve(&package("nothing")).await.unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn test_disk_records_survive_restart() {
    let setup = create_core_setup(fast_settings());
    let storage = storage_in(setup.temp_dir.path());
    let foo = package("foo");

    let upstream = FakeUpstream::new();
    upstream.publish("foo", &[("foo-1.0.whl", "one")]);
    let open = || {
        let records: Arc<dyn RecordStore> = Arc::new(DiskRecordStore::new(storage.clone()));
        CacheManager::new(storage.clone(), records, upstream.clone(), fast_settings())
    };

    let before = open().resolve(&foo).await.unwrap();
    let after = open().resolve(&foo).await.unwrap();

    assert_eq!(before, after);
    assert_eq!(upstream.index_calls(), 1);
}

#[tokio::test]
async fn test_artifact_is_downloaded_once_and_then_served_from_cache() {
    let setup = create_core_setup(fast_settings());
    setup.upstream.publish("foo", &[("foo-1.0.whl", "wheel payload")]);
    let foo = package("foo");

    let artifact = setup.cache.ensure_artifact_cached(&foo, "foo-1.0.whl").await.unwrap();
    assert_eq!(artifact.origin, Origin::Cache);
    assert_eq!(std::fs::read(&artifact.path).unwrap(), b"wheel payload");

    setup.cache.ensure_artifact_cached(&foo, "foo-1.0.whl").await.unwrap();
    assert_eq!(setup.upstream.download_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_artifact_requests_share_one_download() {
    let setup = create_core_setup(fast_settings());
    setup.upstream.publish("foo", &[("foo-1.0.whl", "wheel payload")]);
    setup.upstream.set_delay(Duration::from_millis(150));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = setup.cache.clone();
        handles.push(tokio::spawn(async move {
            cache.ensure_artifact_cached(&package("foo"), "foo-1.0.whl").await
        }));
    }
    for handle in handles {
        let artifact = handle.await.unwrap().unwrap();
        assert_eq!(artifact.size_bytes, 13);
    }

    assert_eq!(setup.upstream.download_calls(), 1);
    assert_eq!(setup.upstream.index_calls(), 1);
}

#[tokio::test]
async fn test_truncated_download_leaves_nothing_behind() {
    let setup = create_core_setup(fast_settings());
    setup.upstream.publish("foo", &[("foo-1.0.whl", "0123456789abcdef")]);
    setup.upstream.set_truncated(true);
    let foo = package("foo");

    let err = setup.cache.ensure_artifact_cached(&foo, "foo-1.0.whl").await.unwrap_err();
    assert!(matches!(err, AppError::Upstream(_)), "{err}");

    let read = setup.storage.read_artifact(&foo, "foo-1.0.whl", Origin::Cache).await;
    assert!(matches!(read, Err(AppError::NotFound(_))));
    assert!(setup.storage.list_cached(&foo).await.unwrap().is_empty());

    setup.upstream.set_truncated(false);
    let artifact = setup.cache.ensure_artifact_cached(&foo, "foo-1.0.whl").await.unwrap();
    assert_eq!(std::fs::read(&artifact.path).unwrap(), b"0123456789abcdef");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_waiter_does_not_cancel_download() {
    let setup = create_core_setup(fast_settings());
    setup.upstream.publish("foo", &[("foo-1.0.whl", "wheel payload")]);
    setup.upstream.set_delay(Duration::from_millis(200));

    let first = {
        let cache = setup.cache.clone();
        tokio::spawn(async move { cache.ensure_artifact_cached(&package("foo"), "foo-1.0.whl").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    first.abort();

    let artifact = setup
        .cache
        .ensure_artifact_cached(&package("foo"), "foo-1.0.whl")
        .await
        .unwrap();
    assert_eq!(std::fs::read(&artifact.path).unwrap(), b"wheel payload");
    assert_eq!(setup.upstream.download_calls(), 1);
}

#[tokio::test]
async fn test_unlisted_artifact_is_not_found() {
    let setup = create_core_setup(fast_settings());
    setup.upstream.publish("foo", &[("foo-1.0.whl", "one")]);

    let err = setup
        .cache
        .ensure_artifact_cached(&package("foo"), "foo-9.9.whl")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(setup.upstream.download_calls(), 0);
}

#[tokio::test]
async fn test_artifact_of_unseen_package_during_outage_is_upstream_error() {
    let setup = create_core_setup(fast_settings());
    setup.upstream.publish("foo", &[("foo-1.0.whl", "one")]);
    setup.upstream.set_failing(true);

    let err = setup
        .cache
        .ensure_artifact_cached(&package("foo"), "foo-1.0.whl")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Upstream(_)), "{err}");
    assert_eq!(setup.upstream.download_calls(), 0);

    setup.upstream.set_failing(false);
    let artifact = setup
        .cache
        .ensure_artifact_cached(&package("foo"), "foo-1.0.whl")
        .await
        .unwrap();
    assert_eq!(std::fs::read(&artifact.path).unwrap(), b"one");
}

#[tokio::test]
async fn test_artifact_missing_from_stale_listing_during_outage_is_upstream_error() {
    let setup = create_core_setup(CacheSettings {
        ttl: Duration::ZERO,
        ..fast_settings()
    });
    setup.upstream.publish("foo", &[("foo-1.0.whl", "one")]);
    let foo = package("foo");
    setup.cache.resolve(&foo).await.unwrap();

    setup.upstream.set_failing(true);
    let err = setup.cache.ensure_artifact_cached(&foo, "foo-2.0.whl").await.unwrap_err();
    assert!(matches!(err, AppError::Upstream(_)), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_waiters_all_see_upstream_error_during_outage() {
    let setup = create_core_setup(fast_settings());
    setup.upstream.set_failing(true);
    setup.upstream.set_delay(Duration::from_millis(150));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = setup.cache.clone();
        handles.push(tokio::spawn(async move {
            cache.ensure_artifact_cached(&package("foo"), "foo-1.0.whl").await
        }));
    }
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::Upstream(_)), "{err}");
    }

    assert_eq!(setup.upstream.index_calls(), 1);
    assert_eq!(setup.upstream.download_calls(), 0);
}
