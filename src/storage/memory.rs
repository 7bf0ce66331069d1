//! In-memory object store
//!
//! Backs unit and integration tests and local experimentation, mirroring
//! the observable semantics of the network backend: sorted listing with
//! inclusive/exclusive offsets, page caps, prefix filtering, and
//! server-side compose.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::RwLock;

use crate::download::MAX_COMPOSE_MEMBERS;
use crate::storage::{ObjectMeta, ObjectStore};
use crate::types::StorageClass;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    storage_class: StorageClass,
}

/// In-memory object store with sorted-key listing.
#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, StoredObject>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object with the `Standard` storage class, creating the
    /// bucket if needed.
    pub async fn put_object(&self, bucket: &str, name: &str, data: impl Into<Bytes>) {
        self.put_object_with_class(bucket, name, data, StorageClass::Standard)
            .await;
    }

    pub async fn put_object_with_class(
        &self,
        bucket: &str,
        name: &str,
        data: impl Into<Bytes>,
        storage_class: StorageClass,
    ) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket.to_string()).or_default().insert(
            name.to_string(),
            StoredObject {
                data: data.into(),
                storage_class,
            },
        );
    }

    /// Number of objects currently in `bucket`.
    pub async fn object_count(&self, bucket: &str) -> usize {
        let buckets = self.buckets.read().await;
        buckets.get(bucket).map_or(0, BTreeMap::len)
    }

    /// Names currently in `bucket`, in key order.
    pub async fn object_names(&self, bucket: &str) -> Vec<String> {
        let buckets = self.buckets.read().await;
        buckets
            .get(bucket)
            .map_or_else(Vec::new, |objects| objects.keys().cloned().collect())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_page(
        &self,
        bucket: &str,
        start: &str,
        end: &str,
        prefix: &str,
        max_results: usize,
    ) -> Result<Vec<ObjectMeta>> {
        let buckets = self.buckets.read().await;
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| Error::storage(format!("bucket {bucket:?} not found")))?;

        let mut page = Vec::new();
        for (name, object) in objects {
            if max_results > 0 && page.len() == max_results {
                break;
            }
            if !start.is_empty() && name.as_str() < start {
                continue;
            }
            if !end.is_empty() && name.as_str() >= end {
                continue;
            }
            if !name.starts_with(prefix) {
                continue;
            }
            page.push(ObjectMeta {
                name: name.clone(),
                size: object.data.len() as u64,
                storage_class: object.storage_class.clone(),
            });
        }
        Ok(page)
    }

    async fn download(&self, bucket: &str, object: &str) -> Result<Bytes> {
        let buckets = self.buckets.read().await;
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| Error::storage(format!("bucket {bucket:?} not found")))?;
        objects
            .get(object)
            .map(|stored| stored.data.clone())
            .ok_or_else(|| Error::storage(format!("object {object:?} not found")))
    }

    async fn compose(&self, bucket: &str, destination: &str, sources: &[String]) -> Result<()> {
        if sources.len() > MAX_COMPOSE_MEMBERS {
            return Err(Error::invalid_argument(format!(
                "at most {MAX_COMPOSE_MEMBERS} objects can be composed, got {}",
                sources.len()
            )));
        }

        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| Error::storage(format!("bucket {bucket:?} not found")))?;

        let mut combined = BytesMut::new();
        for source in sources {
            let object = objects
                .get(source)
                .ok_or_else(|| Error::storage(format!("source object {source:?} not found")))?;
            combined.extend_from_slice(&object.data);
        }
        objects.insert(
            destination.to_string(),
            StoredObject {
                data: combined.freeze(),
                storage_class: StorageClass::Standard,
            },
        );
        Ok(())
    }

    async fn delete(&self, bucket: &str, object: &str) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| Error::storage(format!("bucket {bucket:?} not found")))?;
        objects
            .remove(object)
            .map(|_| ())
            .ok_or_else(|| Error::storage(format!("object {object:?} not found")))
    }
}
