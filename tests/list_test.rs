//! End-to-end tests for the parallel listing engine
//!
//! Every scenario runs against the in-memory store, which mirrors the
//! observable listing semantics of the network backend.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use swiftfetch::storage::memory::MemoryStore;
use swiftfetch::{
    list_bucket, Error, ListOptions, ObjectDescriptor, RetryPolicy, StorageClass, COMPOSED_PREFIX,
};

const BUCKET: &str = "test-bucket";

/// Opt into worker/controller logs with RUST_LOG=swiftfetch=debug.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn seed_numbered(store: &MemoryStore, count: usize, size: usize) {
    for i in 0..count {
        store
            .put_object(BUCKET, &i.to_string(), Bytes::from(vec![b'a'; size]))
            .await;
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(1),
        multiplier: 1.2,
        max_delay: Duration::from_millis(5),
        deadline: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn test_list_filters_composites() {
    let store = MemoryStore::new();
    seed_numbered(&store, 10_000, 10).await;
    store
        .put_object(
            BUCKET,
            &format!("{COMPOSED_PREFIX}x.tar"),
            Bytes::from_static(b"aaaaaaaaaa"),
        )
        .await;

    let results = list_bucket(Arc::new(store), BUCKET, ListOptions::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 10_000);
    assert!(results.iter().all(|d| !d.name.starts_with(COMPOSED_PREFIX)));
    let total_size: u64 = results.iter().map(|d| d.size).sum();
    assert_eq!(total_size, 10_000 * 10);
}

#[tokio::test]
async fn test_list_includes_composites_on_opt_in() {
    let store = MemoryStore::new();
    seed_numbered(&store, 100, 10).await;
    store
        .put_object(
            BUCKET,
            &format!("{COMPOSED_PREFIX}x.tar"),
            Bytes::from_static(b"aaaaaaaaaa"),
        )
        .await;

    let options = ListOptions {
        skip_composites: false,
        ..ListOptions::default()
    };
    let results = list_bucket(Arc::new(store), BUCKET, options).await.unwrap();
    assert_eq!(results.len(), 101);
}

#[tokio::test]
async fn test_list_skips_non_allowed_storage_classes() {
    let store = MemoryStore::new();
    seed_numbered(&store, 10_000, 10).await;
    for i in 0..1_000 {
        store
            .put_object_with_class(
                BUCKET,
                &format!("archive_{i}"),
                Bytes::from_static(b"aaaaaaaaaa"),
                StorageClass::Archive,
            )
            .await;
    }

    let results = list_bucket(Arc::new(store), BUCKET, ListOptions::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 10_000);
    assert!(results.iter().all(|d| !d.name.starts_with("archive_")));
}

#[tokio::test]
async fn test_list_prefix_returns_full_names() {
    let store = MemoryStore::new();
    seed_numbered(&store, 500, 10).await;
    for i in 0..200 {
        store
            .put_object(
                BUCKET,
                &format!("data/file{i}.txt"),
                Bytes::from_static(b"aaaaaaaaaa"),
            )
            .await;
    }

    let options = ListOptions {
        prefix: "data/".to_string(),
        sort: true,
        ..ListOptions::default()
    };
    let results = list_bucket(Arc::new(store), BUCKET, options).await.unwrap();
    assert_eq!(results.len(), 200);
    assert!(results.iter().all(|d| d.name.starts_with("data/")));
}

#[tokio::test]
async fn test_list_directory_objects_flag() {
    let store = MemoryStore::new();
    seed_numbered(&store, 100, 10).await;
    for i in 0..10 {
        store
            .put_object(BUCKET, &format!("dir{i}/"), Bytes::new())
            .await;
    }

    let store = Arc::new(store);
    let default_results = list_bucket(store.clone(), BUCKET, ListOptions::default())
        .await
        .unwrap();
    assert_eq!(default_results.len(), 100);

    let options = ListOptions {
        include_directories: true,
        ..ListOptions::default()
    };
    let results = list_bucket(store, BUCKET, options).await.unwrap();
    assert_eq!(results.len(), 110);
}

#[tokio::test]
async fn test_list_sorted_output() {
    let store = MemoryStore::new();
    seed_numbered(&store, 1_000, 10).await;

    let options = ListOptions {
        sort: true,
        ..ListOptions::default()
    };
    let results = list_bucket(Arc::new(store), BUCKET, options).await.unwrap();
    assert_eq!(results.len(), 1_000);
    assert!(results.windows(2).all(|pair| pair[0] < pair[1]));
}

// Completeness must not depend on the worker count: every fan-out returns
// exactly the same set of descriptors.
#[tokio::test]
async fn test_list_completeness_across_worker_counts() {
    init_tracing();
    let store = MemoryStore::new();
    // Enough objects that workers paginate and steal from each other.
    seed_numbered(&store, 12_000, 10).await;
    let store = Arc::new(store);

    let mut expected: Vec<ObjectDescriptor> =
        (0..12_000).map(|i| ObjectDescriptor::new(i.to_string(), 10)).collect();
    expected.sort();

    for workers in [1, 2, 4] {
        let options = ListOptions {
            workers,
            sort: true,
            ..ListOptions::default()
        };
        let results = list_bucket(store.clone(), BUCKET, options).await.unwrap();
        assert_eq!(results, expected, "workers={workers}");
    }
}

#[tokio::test]
async fn test_list_empty_bucket() {
    let store = MemoryStore::new();
    store.put_object(BUCKET, "only", Bytes::from_static(b"x")).await;
    let store = Arc::new(store);

    // Remove the only object so the bucket exists but holds nothing.
    use swiftfetch::ObjectStore;
    store.delete(BUCKET, "only").await.unwrap();

    let results = list_bucket(store, BUCKET, ListOptions::default())
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_list_surfaces_worker_failure() {
    init_tracing();
    // The bucket was never created, so every list call fails until the
    // worker's retry budget runs out and the controller terminates.
    let options = ListOptions {
        retry: fast_retry(),
        ..ListOptions::default()
    };
    let result = list_bucket(Arc::new(MemoryStore::new()), "missing-bucket", options).await;
    assert!(matches!(result, Err(Error::Listing(_))));
}
